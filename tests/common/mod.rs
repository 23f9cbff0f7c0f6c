//! Test doubles shared by the integration tests.
//!
//! `MockModel` writes each token id into the cache position it occupies, so
//! a session's cache can be read back and compared with its token history.
//! `MockTokenizer` is byte-level: id = byte + 3, with 0 = pad and 1 = EOS.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use nano_stream::{
    CausalLm, Error, ForwardInput, ForwardOutput, KvCache, LayerKv, Result, Scheduler,
    SchedulerConfig, Session, TextCodec,
};

pub const PAD: u32 = 0;
pub const EOS: u32 = 1;
const BYTE_OFFSET: u32 = 3;

#[derive(Debug, Default, Clone)]
pub struct MockTokenizer;

impl TextCodec for MockTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + BYTE_OFFSET).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut text = String::new();
        for &id in ids {
            match id {
                PAD | EOS if skip_special_tokens => {}
                PAD => text.push_str("<pad>"),
                EOS => text.push_str("<eos>"),
                id if id >= BYTE_OFFSET && id < 256 + BYTE_OFFSET => {
                    text.push((id - BYTE_OFFSET) as u8 as char)
                }
                _ => return Err(Error::Tokenization(format!("unknown id {id}"))),
            }
        }
        Ok(text)
    }

    fn pad_token_id(&self) -> u32 {
        PAD
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// Deterministic model: the next token is a letter derived from the sum of
/// the attended ids in the row.
#[derive(Debug)]
pub struct MockModel {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// `(batch, seq_len)` of every forward call.
    pub calls: Vec<(usize, usize)>,
    /// Token ids of every forward call.
    pub inputs: Vec<Vec<Vec<u32>>>,
    /// Attention masks of every forward call.
    pub masks: Vec<Vec<Vec<u32>>>,
    /// Fail the next forward call.
    pub fail_next: bool,
    /// Emit EOS once a row attends to at least this many tokens.
    pub eos_at_len: Option<usize>,
    /// Replace the token of one batch row on the next forward call.
    pub override_next: Option<(usize, u32)>,
}

impl Default for MockModel {
    fn default() -> Self {
        Self {
            num_layers: 2,
            num_heads: 2,
            head_dim: 3,
            calls: Vec::new(),
            inputs: Vec::new(),
            masks: Vec::new(),
            fail_next: false,
            eos_at_len: None,
            override_next: None,
        }
    }
}

/// Token the mock model emits for a row.
pub fn expected_next(ids: &[u32], mask: &[u32]) -> u32 {
    let sum: u32 = ids
        .iter()
        .zip(mask)
        .filter(|(_, m)| **m != 0)
        .map(|(t, _)| *t)
        .sum();
    b'a' as u32 + sum % 26 + BYTE_OFFSET
}

impl MockModel {
    fn positions(&self, values: Tensor) -> candle_core::Result<Tensor> {
        let (b, n) = values.dims2()?;
        values
            .to_dtype(DType::F32)?
            .reshape((b, 1, n, 1))?
            .broadcast_as((b, self.num_heads, n, self.head_dim))?
            .contiguous()
    }
}

impl CausalLm for MockModel {
    fn forward(&mut self, input: ForwardInput) -> Result<ForwardOutput> {
        if self.fail_next {
            self.fail_next = false;
            return Err(Error::Model("injected failure".into()));
        }

        let ids = input.input_ids.to_vec2::<u32>()?;
        let mask = input.attention_mask.to_vec2::<u32>()?;
        let (b, l) = (ids.len(), ids[0].len());
        self.calls.push((b, l));
        self.inputs.push(ids.clone());
        self.masks.push(mask.clone());

        let fresh = match &input.cache {
            None => self.positions(input.input_ids.clone())?,
            Some(_) => self.positions(input.input_ids.narrow(1, l - 1, 1)?)?,
        };

        let mut layers = Vec::with_capacity(self.num_layers);
        for layer_idx in 0..self.num_layers {
            let (key, value) = match &input.cache {
                None => (fresh.clone(), fresh.clone()),
                Some(cache) => {
                    let layer = &cache.layers()[layer_idx];
                    (
                        Tensor::cat(&[layer.key(), &fresh], 2)?,
                        Tensor::cat(&[layer.value(), &fresh], 2)?,
                    )
                }
            };
            layers.push(LayerKv::new(key, value)?);
        }

        let mut next_token_ids: Vec<u32> = ids
            .iter()
            .zip(&mask)
            .map(|(row, row_mask)| {
                let attended = row_mask.iter().filter(|&&m| m != 0).count();
                match self.eos_at_len {
                    Some(n) if attended >= n => EOS,
                    _ => expected_next(row, row_mask),
                }
            })
            .collect();
        if let Some((row, token)) = self.override_next.take() {
            next_token_ids[row] = token;
        }

        Ok(ForwardOutput {
            next_token_ids,
            cache: KvCache::new(layers)?,
        })
    }
}

pub fn scheduler(config: SchedulerConfig) -> Scheduler<MockModel, MockTokenizer> {
    Scheduler::new(config, MockModel::default(), MockTokenizer, Device::Cpu).unwrap()
}

pub fn body(prompt: &str, max_new_tokens: usize) -> nano_stream::RawRequest {
    nano_stream::RawRequest::new(format!(
        r#"{{"prompt": "{prompt}", "max_new_tokens": {max_new_tokens}}}"#
    ))
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// Token id stored at each cache position (layer 0 key, head 0, dim 0).
pub fn cached_token_ids(cache: &KvCache) -> Vec<u32> {
    cache.layers()[0]
        .key()
        .narrow(1, 0, 1)
        .unwrap()
        .narrow(3, 0, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .map(|v| v as u32)
        .collect()
}

/// Assert the cache holds exactly the session's tokens minus the last one.
pub fn assert_cache_matches(session: &Session) {
    let cache = session.cache().expect("session has a cache");
    let tokens = session.token_ids();
    assert_eq!(session.attention_mask().len(), tokens.len());
    assert_eq!(cached_token_ids(cache), tokens[..tokens.len() - 1].to_vec());
}

/// Session prefilled through the mock model.
pub fn prefilled_session(id: &str, prompt: &[u32]) -> Session {
    prefill(id, prompt, None)
}

/// Session prefilled through the mock model, with a chosen first token.
pub fn prefilled_session_with_next(id: &str, prompt: &[u32], next: u32) -> Session {
    prefill(id, prompt, Some(next))
}

fn prefill(id: &str, prompt: &[u32], next: Option<u32>) -> Session {
    let mut model = MockModel::default();
    let len = prompt.len();
    let input = ForwardInput {
        input_ids: Tensor::from_slice(prompt, (1, len), &Device::Cpu).unwrap(),
        attention_mask: Tensor::ones((1, len), DType::U32, &Device::Cpu).unwrap(),
        cache: None,
    };
    let output = model.forward(input).unwrap();
    let mut session = Session::new(
        id.to_string(),
        prompt.to_vec(),
        nano_stream::StoppingCriteria::new(100, EOS),
    );
    session
        .complete_prefill(next.unwrap_or(output.next_token_ids[0]), output.cache)
        .unwrap();
    session
}
