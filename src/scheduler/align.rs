//! Batch alignment for the decode path.
//!
//! Sessions that continue on the same tick have different lengths. Before
//! they can share one forward pass, every session is brought to a common
//! length and stacked into a rectangular batch; after the pass the batch is
//! split back into per-session state.
//!
//! ## Merge
//!
//! ```text
//!   target = max(attended_len_i), capped by the context window
//!
//!   s1:        [a b c]      ──► [P P P P a b c]   mask 0 0 0 0 1 1 1
//!   s2:    [d e f g h]      ──► [P P d e f g h]   mask 0 0 1 1 1 1 1
//!   s3:  [i j k l m n o]    ──► [i j k l m n o]   mask 1 1 1 1 1 1 1
//!                                            ▲
//!                        last real token of every row at the same index
//! ```
//!
//! Rows shorter than the target are left-padded (pad ids, zero mask, zero
//! cache positions). Rows longer than the target keep their most recent
//! positions: `target` tokens and `target - 1` cache positions, since the
//! cache never contains the last emitted token. Under a context window this
//! drops the oldest real tokens, prompt included.
//!
//! ## Split
//!
//! Row `j` of the model output becomes the session's new cache; the aligned
//! row plus the new token becomes its new history.

use candle_core::Tensor;
use tracing::debug;

use crate::core::kv_cache::{CacheLayout, KvCache};
use crate::core::session::{RequestId, Session};
use crate::engine::model::{ForwardInput, ForwardOutput};
use crate::error::{Error, Result};

/// One session brought to the batch length.
#[derive(Debug, Clone)]
pub struct AlignedRow {
    /// Session the row belongs to.
    pub request_id: RequestId,
    /// Padded or truncated token ids.
    pub token_ids: Vec<u32>,
    /// Matching attention mask.
    pub attention_mask: Vec<u32>,
    /// Cache covering all but the last position of the row.
    pub cache: KvCache,
}

/// One session's state after a decode step.
#[derive(Debug, Clone)]
pub struct SplitRow {
    /// Session the row belongs to.
    pub request_id: RequestId,
    /// Aligned token ids the model saw.
    pub token_ids: Vec<u32>,
    /// Aligned attention mask the model saw.
    pub attention_mask: Vec<u32>,
    /// Updated single-row cache covering `token_ids`.
    pub cache: KvCache,
    /// Token generated for this row.
    pub next_token: u32,
}

/// Sessions merged into one rectangular batch.
#[derive(Debug, Clone)]
pub struct AlignedBatch {
    rows: Vec<AlignedRow>,
    seq_len: usize,
}

impl AlignedBatch {
    /// Get the rows in batch order.
    pub fn rows(&self) -> &[AlignedRow] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Common row length.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Request ids in batch order.
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.rows.iter().map(|r| r.request_id.clone()).collect()
    }

    /// Stack the rows into model inputs.
    pub fn to_forward_input(&self) -> Result<ForwardInput> {
        let first = self
            .rows
            .first()
            .ok_or_else(|| Error::CacheLayout("cannot build input for an empty batch".into()))?;
        let device = first.cache.device();
        let shape = (self.rows.len(), self.seq_len);

        let ids: Vec<u32> = self.rows.iter().flat_map(|r| r.token_ids.iter().copied()).collect();
        let mask: Vec<u32> = self
            .rows
            .iter()
            .flat_map(|r| r.attention_mask.iter().copied())
            .collect();
        let caches: Vec<KvCache> = self.rows.iter().map(|r| r.cache.clone()).collect();

        Ok(ForwardInput {
            input_ids: Tensor::from_vec(ids, shape, device)?,
            attention_mask: Tensor::from_vec(mask, shape, device)?,
            cache: Some(KvCache::stack(&caches)?),
        })
    }

    /// Split the model output back into per-session rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Model`] if the output does not have one row per
    /// session or its cache does not cover the batch length.
    pub fn split(self, output: ForwardOutput) -> Result<Vec<SplitRow>> {
        if output.next_token_ids.len() != self.rows.len()
            || output.cache.batch_size() != self.rows.len()
            || output.cache.seq_len() != self.seq_len
        {
            return Err(Error::Model(format!(
                "decode output has {} tokens and a {}x{} cache for a {}x{} batch",
                output.next_token_ids.len(),
                output.cache.batch_size(),
                output.cache.seq_len(),
                self.rows.len(),
                self.seq_len
            )));
        }

        self.rows
            .into_iter()
            .zip(output.next_token_ids)
            .enumerate()
            .map(|(j, (row, next_token))| {
                Ok(SplitRow {
                    request_id: row.request_id,
                    token_ids: row.token_ids,
                    attention_mask: row.attention_mask,
                    cache: output.cache.select(j)?,
                    next_token,
                })
            })
            .collect()
    }
}

/// Result of merging a decode set.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Batch of accepted sessions, `None` when nothing could be merged.
    pub batch: Option<AlignedBatch>,
    /// Sessions refused with the reason.
    pub rejected: Vec<(RequestId, String)>,
}

/// Pads and truncates sessions into a common frame.
#[derive(Debug, Clone, Copy)]
pub struct BatchAligner {
    pad_token_id: u32,
    context_window: Option<usize>,
}

impl BatchAligner {
    /// Create an aligner.
    ///
    /// # Arguments
    ///
    /// * `pad_token_id` - Token id written into padding positions
    /// * `context_window` - Optional cap on the aligned length
    pub fn new(pad_token_id: u32, context_window: Option<usize>) -> Self {
        Self {
            pad_token_id,
            context_window,
        }
    }

    /// Get the pad token id.
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Length every row is aligned to.
    pub fn target_len<'a>(&self, sessions: impl IntoIterator<Item = &'a Session>) -> usize {
        let longest = sessions
            .into_iter()
            .map(Session::attended_len)
            .max()
            .unwrap_or(0);
        match self.context_window {
            Some(window) => longest.min(window),
            None => longest,
        }
    }

    /// Bring one session to `target_len` positions.
    ///
    /// # Errors
    ///
    /// Returns error if the session has no cache or its lengths do not line
    /// up after alignment.
    pub fn align(&self, session: &Session, target_len: usize) -> Result<AlignedRow> {
        let cache = session
            .cache()
            .ok_or_else(|| Error::CacheLayout("session has no key/value cache".into()))?;
        let physical = session.physical_len();

        let (token_ids, attention_mask, cache) = if physical < target_len {
            let n = target_len - physical;
            let mut ids = vec![self.pad_token_id; n];
            ids.extend_from_slice(session.token_ids());
            let mut mask = vec![0; n];
            mask.extend_from_slice(session.attention_mask());
            (ids, mask, cache.left_pad(n)?)
        } else if physical > target_len {
            let start = physical - target_len;
            let dropped = session.attention_mask()[..start].iter().filter(|&&m| m != 0).count();
            if dropped > 0 {
                debug!(
                    request_id = session.request_id(),
                    dropped, "context window drops oldest tokens"
                );
            }
            (
                session.token_ids()[start..].to_vec(),
                session.attention_mask()[start..].to_vec(),
                cache.keep_last(target_len.saturating_sub(1))?,
            )
        } else {
            (
                session.token_ids().to_vec(),
                session.attention_mask().to_vec(),
                cache.clone(),
            )
        };

        if token_ids.len() != target_len
            || attention_mask.len() != target_len
            || cache.seq_len() + 1 != target_len
        {
            return Err(Error::CacheLayout(format!(
                "aligned row has {} tokens, {} mask entries and {} cache positions for length {target_len}",
                token_ids.len(),
                attention_mask.len(),
                cache.seq_len()
            )));
        }

        Ok(AlignedRow {
            request_id: session.request_id().to_string(),
            token_ids,
            attention_mask,
            cache,
        })
    }

    /// Merge continuing sessions into one batch.
    ///
    /// Sessions that break their invariants are rejected. The batch takes the
    /// cache layout shared by most remaining sessions (the earliest one on a
    /// tie); sessions with any other layout are rejected rather than merged.
    pub fn merge<'a>(&self, sessions: impl IntoIterator<Item = &'a Session>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut candidates: Vec<(&Session, CacheLayout)> = Vec::new();

        for session in sessions {
            if let Err(e) = session.check_invariants() {
                outcome
                    .rejected
                    .push((session.request_id().to_string(), e.to_string()));
                continue;
            }
            if let Some(cache) = session.cache() {
                candidates.push((session, cache.layout()));
            }
        }

        let Some(layout) = majority_layout(&candidates) else {
            return outcome;
        };

        let mut accepted: Vec<&Session> = Vec::with_capacity(candidates.len());
        for (session, session_layout) in &candidates {
            if *session_layout == layout {
                accepted.push(*session);
            } else {
                outcome.rejected.push((
                    session.request_id().to_string(),
                    format!("cache layout {session_layout:?} does not match batch {layout:?}"),
                ));
            }
        }

        let target_len = self.target_len(accepted.iter().copied());
        let mut rows = Vec::with_capacity(accepted.len());
        for session in accepted {
            match self.align(session, target_len) {
                Ok(row) => rows.push(row),
                Err(e) => outcome
                    .rejected
                    .push((session.request_id().to_string(), e.to_string())),
            }
        }

        if !rows.is_empty() {
            debug!(rows = rows.len(), seq_len = target_len, "merged decode batch");
            outcome.batch = Some(AlignedBatch {
                rows,
                seq_len: target_len,
            });
        }
        outcome
    }
}

/// Most common layout among `candidates`, the earliest one on a tie.
fn majority_layout(candidates: &[(&Session, CacheLayout)]) -> Option<CacheLayout> {
    let mut counts: Vec<(&CacheLayout, usize)> = Vec::new();
    for (_, layout) in candidates {
        match counts.iter().position(|(seen, _)| *seen == layout) {
            Some(idx) => counts[idx].1 += 1,
            None => counts.push((layout, 1)),
        }
    }

    let mut best: Option<(&CacheLayout, usize)> = None;
    for (layout, count) in counts {
        if best.is_none_or(|(_, best_count)| count > best_count) {
            best = Some((layout, count));
        }
    }
    best.map(|(layout, _)| layout.clone())
}
