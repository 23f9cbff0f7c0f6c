//! Model collaborator interface.
//!
//! The scheduler never looks inside the model. It hands over a rectangular
//! batch of token ids, the matching attention mask and (for decode) the
//! stacked key/value cache, and expects back one next token per row together
//! with the updated cache.
//!
//! ```text
//!  prefill:  ids [1, P]  mask [1, P]  cache None            ──► 1 token, cache seq P
//!  decode:   ids [k, L]  mask [k, L]  cache seq L-1 (k rows) ──► k tokens, cache seq L
//! ```
//!
//! With a cache present the model only needs the last column of `input_ids`;
//! the full rows are passed so position ids can be derived from the mask.

use candle_core::Tensor;

use crate::core::kv_cache::KvCache;
use crate::error::{Error, Result};

/// Inputs of one forward step.
#[derive(Debug, Clone)]
pub struct ForwardInput {
    /// Token ids, `[batch, seq_len]`, `u32`.
    pub input_ids: Tensor,
    /// Attention mask, `[batch, seq_len]`, `u32` of 0/1.
    pub attention_mask: Tensor,
    /// Cache covering `seq_len - 1` positions, or `None` for prefill.
    pub cache: Option<KvCache>,
}

impl ForwardInput {
    /// Number of rows in the batch.
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    /// Length of every row.
    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }
}

/// Outputs of one forward step.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// One generated token per batch row.
    pub next_token_ids: Vec<u32>,
    /// Updated cache covering every input position.
    pub cache: KvCache,
}

impl ForwardOutput {
    /// Check the output against the input it answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Model`] when the row count or cache length is off.
    pub fn check_against(&self, input: &ForwardInput) -> Result<()> {
        let rows = input.batch_size();
        if self.next_token_ids.len() != rows {
            return Err(Error::Model(format!(
                "model returned {} tokens for {rows} rows",
                self.next_token_ids.len()
            )));
        }
        if self.cache.batch_size() != rows || self.cache.seq_len() != input.seq_len() {
            return Err(Error::Model(format!(
                "model returned a cache of {} rows x {} positions, expected {rows} x {}",
                self.cache.batch_size(),
                self.cache.seq_len(),
                input.seq_len()
            )));
        }
        Ok(())
    }
}

/// An autoregressive model that exposes its key/value cache.
///
/// Sampling is the implementation's business: `forward` returns chosen token
/// ids, not logits.
pub trait CausalLm {
    /// Run one forward step over a batch.
    fn forward(&mut self, input: ForwardInput) -> Result<ForwardOutput>;
}

impl<M: CausalLm + ?Sized> CausalLm for Box<M> {
    fn forward(&mut self, input: ForwardInput) -> Result<ForwardOutput> {
        (**self).forward(input)
    }
}
