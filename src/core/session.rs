//! Session tracking for streaming generation requests.
//!
//! A session represents one in-flight generation request. It owns the token
//! history in the frame of the last batch it was part of (possibly
//! left-padded), the attention mask over that history, the model's key/value
//! cache and the stopping criteria.
//!
//! ## Lifecycle
//!
//! ```text
//!   first request ──► prefill ──► decode ──► decode ──► ... ──► removed
//!                     (cache       (cache grows by one position per tick,
//!                      created)     or is realigned by a batch merge)
//! ```

use crate::core::kv_cache::KvCache;
use crate::core::stopping::{FinishReason, StoppingCriteria};
use crate::error::{Error, Result};

/// External identifier of a request, unique while its session is alive.
pub type RequestId = String;

/// One in-flight generation request.
///
/// # Example
///
/// ```
/// use nano_stream::core::session::Session;
/// use nano_stream::core::stopping::StoppingCriteria;
///
/// let session = Session::new("req-1".into(), vec![5, 6, 7], StoppingCriteria::new(4, 0));
/// assert_eq!(session.prompt_len(), 3);
/// assert_eq!(session.attended_len(), 3);
/// assert!(!session.has_cache());
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    /// External request identifier.
    request_id: RequestId,
    /// Token history, left-padded when the last batch required it.
    token_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding. Same length as `token_ids`.
    attention_mask: Vec<u32>,
    /// Key/value cache, absent until prefill completes.
    cache: Option<KvCache>,
    /// Length of the original prompt.
    prompt_len: usize,
    /// Remaining budget and stop token.
    stopping: StoppingCriteria,
    /// Number of tokens generated so far.
    num_generated: usize,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
}

impl Session {
    /// Create a session from freshly tokenized prompt tokens.
    pub fn new(request_id: RequestId, prompt_token_ids: Vec<u32>, stopping: StoppingCriteria) -> Self {
        let prompt_len = prompt_token_ids.len();
        Self {
            request_id,
            attention_mask: vec![1; prompt_len],
            token_ids: prompt_token_ids,
            cache: None,
            prompt_len,
            stopping,
            num_generated: 0,
            finish_reason: None,
        }
    }

    // ========== Getters ==========

    /// Get the request ID.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Get the token history in the session's current frame.
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Get the attention mask.
    pub fn attention_mask(&self) -> &[u32] {
        &self.attention_mask
    }

    /// Get the key/value cache.
    pub fn cache(&self) -> Option<&KvCache> {
        self.cache.as_ref()
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Get the stopping criteria.
    pub fn stopping(&self) -> &StoppingCriteria {
        &self.stopping
    }

    pub(crate) fn stopping_mut(&mut self) -> &mut StoppingCriteria {
        &mut self.stopping
    }

    /// Tokens the session may still generate.
    pub fn remaining_budget(&self) -> usize {
        self.stopping.remaining_budget()
    }

    /// Number of tokens generated so far.
    pub fn num_generated(&self) -> usize {
        self.num_generated
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    // ========== Length queries ==========

    /// Physical length, padding included.
    pub fn physical_len(&self) -> usize {
        self.token_ids.len()
    }

    /// Number of real (unmasked) positions.
    pub fn attended_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }

    /// Number of padding positions in the current frame.
    pub fn num_padding(&self) -> usize {
        self.physical_len() - self.attended_len()
    }

    /// Check if prefill has completed.
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    /// Token history with padding removed.
    pub fn real_token_ids(&self) -> Vec<u32> {
        self.token_ids
            .iter()
            .zip(&self.attention_mask)
            .filter(|(_, m)| **m != 0)
            .map(|(t, _)| *t)
            .collect()
    }

    // ========== Step updates ==========

    /// Record the outcome of the prefill step.
    ///
    /// # Errors
    ///
    /// Returns error if the session already has a cache or the cache does not
    /// cover exactly the prompt.
    pub fn complete_prefill(&mut self, next_token: u32, cache: KvCache) -> Result<()> {
        if self.cache.is_some() {
            return Err(Error::CacheLayout(format!(
                "session {} was already prefilled",
                self.request_id
            )));
        }
        if cache.seq_len() != self.token_ids.len() || cache.batch_size() != 1 {
            return Err(Error::CacheLayout(format!(
                "prefill cache covers {} positions in a batch of {}, prompt has {}",
                cache.seq_len(),
                cache.batch_size(),
                self.token_ids.len()
            )));
        }
        self.cache = Some(cache);
        self.push_token(next_token);
        Ok(())
    }

    /// Replace the session frame with a decode row and append its new token.
    ///
    /// `token_ids` and `attention_mask` are the aligned row the model saw;
    /// `cache` must cover exactly that row.
    pub fn complete_decode(
        &mut self,
        token_ids: Vec<u32>,
        attention_mask: Vec<u32>,
        cache: KvCache,
        next_token: u32,
    ) {
        self.token_ids = token_ids;
        self.attention_mask = attention_mask;
        self.cache = Some(cache);
        self.push_token(next_token);
    }

    fn push_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
        self.attention_mask.push(1);
        self.num_generated += 1;
    }

    /// Mark the session as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }

    /// Check the structural invariants of a prefilled session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheLayout`] describing the first broken invariant.
    pub fn check_invariants(&self) -> Result<()> {
        if self.token_ids.len() != self.attention_mask.len() {
            return Err(Error::CacheLayout(format!(
                "{} tokens but {} mask entries",
                self.token_ids.len(),
                self.attention_mask.len()
            )));
        }
        let Some(cache) = &self.cache else {
            return Err(Error::CacheLayout(
                "no key/value cache on a continuing session".into(),
            ));
        };
        if cache.batch_size() != 1 {
            return Err(Error::CacheLayout(format!(
                "cache holds {} rows",
                cache.batch_size()
            )));
        }
        if cache.seq_len() + 1 != self.token_ids.len() {
            return Err(Error::CacheLayout(format!(
                "cache covers {} positions for {} tokens",
                cache.seq_len(),
                self.token_ids.len()
            )));
        }
        Ok(())
    }
}
