//! Per-session key/value cache.
//!
//! The model returns, for every transformer layer, a key and a value tensor.
//! This module keeps them together and provides the few shape operations the
//! batch aligner needs: left padding, keeping the most recent positions,
//! stacking sessions into a batch and selecting one row back out.
//!
//! ## Memory Layout
//!
//! Every key and value tensor has shape
//! `[batch, num_kv_heads, seq_len, head_dim]`:
//!
//! ```text
//!             dim 0      dim 1         dim 2      dim 3
//!  key/value: [batch, num_kv_heads, seq_len, head_dim]
//!               ▲                     ▲
//!          BATCH_DIM               SEQ_DIM
//! ```
//!
//! A single session's cache always has `batch == 1`. `seq_len` trails the
//! session's token count by one: the most recently emitted token has not been
//! fed through the model yet.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Batch axis of every cache tensor.
pub const BATCH_DIM: usize = 0;

/// Sequence axis of every cache tensor.
pub const SEQ_DIM: usize = 2;

const CACHE_RANK: usize = 4;

/// Key and value tensors of one transformer layer.
#[derive(Debug, Clone)]
pub struct LayerKv {
    key: Tensor,
    value: Tensor,
}

impl LayerKv {
    /// Pair a key and value tensor.
    ///
    /// # Errors
    ///
    /// Returns error if either tensor is not rank 4, or if key and value
    /// disagree on batch size, sequence length, dtype or device.
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        if key.rank() != CACHE_RANK || value.rank() != CACHE_RANK {
            return Err(Error::CacheLayout(format!(
                "expected rank {CACHE_RANK} key/value, got {:?} and {:?}",
                key.dims(),
                value.dims()
            )));
        }
        if key.dims()[BATCH_DIM] != value.dims()[BATCH_DIM]
            || key.dims()[SEQ_DIM] != value.dims()[SEQ_DIM]
        {
            return Err(Error::CacheLayout(format!(
                "key {:?} and value {:?} disagree on batch or sequence length",
                key.dims(),
                value.dims()
            )));
        }
        if key.dtype() != value.dtype() || !key.device().same_device(value.device()) {
            return Err(Error::CacheLayout(
                "key and value live on different dtypes or devices".into(),
            ));
        }
        Ok(Self { key, value })
    }

    /// Get the key tensor.
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    /// Get the value tensor.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.dims()[SEQ_DIM]
    }

    /// Number of rows in the batch axis.
    pub fn batch_size(&self) -> usize {
        self.key.dims()[BATCH_DIM]
    }

    fn map<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor>,
    {
        Ok(Self {
            key: f(&self.key)?,
            value: f(&self.value)?,
        })
    }
}

/// Shape signature of a cache, ignoring batch and sequence axes.
///
/// Two caches can only be merged into one batch when their layouts match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    /// Element type.
    pub dtype: DType,
    /// Per layer: key heads, key head_dim, value heads, value head_dim.
    pub layers: Vec<[usize; 4]>,
}

/// Key/value cache for all layers of one session (or one batch).
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKv>,
}

impl KvCache {
    /// Create a cache from per-layer tensors.
    ///
    /// # Errors
    ///
    /// Returns error if there are no layers or the layers disagree on batch
    /// size, sequence length or dtype.
    pub fn new(layers: Vec<LayerKv>) -> Result<Self> {
        let first = layers
            .first()
            .ok_or_else(|| Error::CacheLayout("cache has no layers".into()))?;

        for (idx, layer) in layers.iter().enumerate().skip(1) {
            if layer.seq_len() != first.seq_len()
                || layer.batch_size() != first.batch_size()
                || layer.key.dtype() != first.key.dtype()
            {
                return Err(Error::CacheLayout(format!(
                    "layer {idx} has shape {:?}, layer 0 has {:?}",
                    layer.key.dims(),
                    first.key.dims()
                )));
            }
        }

        Ok(Self { layers })
    }

    /// Create a cache from `(key, value)` pairs.
    pub fn from_pairs(pairs: Vec<(Tensor, Tensor)>) -> Result<Self> {
        let layers = pairs
            .into_iter()
            .map(|(k, v)| LayerKv::new(k, v))
            .collect::<Result<Vec<_>>>()?;
        Self::new(layers)
    }

    /// Get the per-layer tensors.
    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    /// Get the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.layers[0].seq_len()
    }

    /// Number of rows in the batch axis.
    pub fn batch_size(&self) -> usize {
        self.layers[0].batch_size()
    }

    /// Element type of the cache tensors.
    pub fn dtype(&self) -> DType {
        self.layers[0].key.dtype()
    }

    /// Device holding the cache tensors.
    pub fn device(&self) -> &Device {
        self.layers[0].key.device()
    }

    /// Shape signature used to check merge compatibility.
    pub fn layout(&self) -> CacheLayout {
        let layers = self
            .layers
            .iter()
            .map(|l| {
                let k = l.key.dims();
                let v = l.value.dims();
                [k[1], k[3], v[1], v[3]]
            })
            .collect();
        CacheLayout {
            dtype: self.dtype(),
            layers,
        }
    }

    /// Prepend `n` zero positions along the sequence axis.
    pub fn left_pad(&self, n: usize) -> Result<Self> {
        if n == 0 {
            return Ok(self.clone());
        }
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                layer.map(|t| {
                    let mut shape = t.dims().to_vec();
                    shape[SEQ_DIM] = n;
                    let zeros = Tensor::zeros(shape, t.dtype(), t.device())?;
                    Tensor::cat(&[&zeros, t], SEQ_DIM)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Keep only the most recent `n` positions along the sequence axis.
    pub fn keep_last(&self, n: usize) -> Result<Self> {
        let len = self.seq_len();
        if n >= len {
            return Ok(self.clone());
        }
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.map(|t| t.narrow(SEQ_DIM, len - n, n)?.contiguous()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Concatenate caches along the batch axis.
    ///
    /// # Errors
    ///
    /// Returns error if `caches` is empty or the caches differ in layout or
    /// sequence length.
    pub fn stack(caches: &[KvCache]) -> Result<Self> {
        let first = caches
            .first()
            .ok_or_else(|| Error::CacheLayout("cannot stack zero caches".into()))?;
        let layout = first.layout();
        for cache in &caches[1..] {
            if cache.layout() != layout || cache.seq_len() != first.seq_len() {
                return Err(Error::CacheLayout(
                    "caches in one batch must share layout and length".into(),
                ));
            }
        }

        let mut layers = Vec::with_capacity(first.num_layers());
        for layer_idx in 0..first.num_layers() {
            let keys: Vec<&Tensor> = caches.iter().map(|c| &c.layers[layer_idx].key).collect();
            let values: Vec<&Tensor> =
                caches.iter().map(|c| &c.layers[layer_idx].value).collect();
            layers.push(LayerKv {
                key: Tensor::cat(&keys, BATCH_DIM)?,
                value: Tensor::cat(&values, BATCH_DIM)?,
            });
        }
        Ok(Self { layers })
    }

    /// Extract one batch row as a single-row cache.
    pub fn select(&self, row: usize) -> Result<Self> {
        if row >= self.batch_size() {
            return Err(Error::CacheLayout(format!(
                "row {row} out of bounds for batch of {}",
                self.batch_size()
            )));
        }
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.map(|t| t.narrow(BATCH_DIM, row, 1)?.contiguous()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}
