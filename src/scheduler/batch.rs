//! Continuous batching scheduler.
//!
//! The scheduler is invoked once per serving tick with the micro-batch the
//! transport collected. It decides which requests need a prefill and which
//! continue decoding, runs the model accordingly, updates the session store
//! and answers every request id in the order it was given.
//!
//! ## Tick Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           step()                                    │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   known_ids ──► plan() ──┬── unknown id + body ──► prefill (one at a time)
//!                          ├── live id ────────────► decode (one merged batch)
//!                          └── duplicate / no body ► protocol error
//!
//!   prefill + decode results ──► stopping criteria ──► remove finished
//!                            ──► results in known_ids order
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use candle_core::Device;
//! use nano_stream::engine::{CausalLm, HfTokenizer, RawRequest};
//! use nano_stream::scheduler::Scheduler;
//! use nano_stream::SchedulerConfig;
//!
//! fn serve<M: CausalLm>(model: M) -> nano_stream::Result<()> {
//!     let tokenizer = HfTokenizer::from_pretrained("openai-community/gpt2", "main")?;
//!     let mut scheduler = Scheduler::new(SchedulerConfig::default(), model, tokenizer, Device::Cpu)?;
//!
//!     let ids = vec!["a".to_string()];
//!     let first = scheduler.step(&[RawRequest::new(r#"{"prompt": "hi"}"#)], &ids)?;
//!     let next = scheduler.step(&[RawRequest::empty()], &ids)?;
//!     # let _ = (first, next);
//!     Ok(())
//! }
//! ```

use std::collections::{HashMap, HashSet};

use candle_core::{Device, Tensor};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::core::session::{RequestId, Session};
use crate::core::session_store::SessionStore;
use crate::core::stopping::{self, StoppingCriteria};
use crate::engine::model::{CausalLm, ForwardInput};
use crate::engine::request::{GenerationRequest, RawRequest, RequestOutcome, StepOutput};
use crate::engine::tokenizer::TextCodec;
use crate::error::{Error, RequestError, Result};
use crate::scheduler::align::BatchAligner;

type SlotResult = std::result::Result<StepOutput, RequestError>;

/// Partition of one tick's request ids.
///
/// Entries are slots, i.e. indices into the tick's `known_ids`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// New requests, in arrival order.
    pub prefill_slots: Vec<usize>,
    /// Continuing requests.
    pub decode_slots: Vec<usize>,
    /// Requests refused before any model call.
    pub rejected: Vec<(usize, RequestError)>,
}

impl TickPlan {
    /// Check if the tick needs no model call.
    pub fn is_empty(&self) -> bool {
        self.prefill_slots.is_empty() && self.decode_slots.is_empty()
    }

    /// Number of requests that reach the model.
    pub fn num_scheduled(&self) -> usize {
        self.prefill_slots.len() + self.decode_slots.len()
    }
}

/// Continuous batching scheduler.
///
/// Owns the session store across ticks. `step` takes `&mut self`, so one
/// scheduler only ever runs one tick at a time; hosts that share it between
/// threads must put it behind their own lock.
pub struct Scheduler<M, T> {
    /// Configuration.
    config: SchedulerConfig,
    /// Model collaborator.
    model: M,
    /// Tokenizer collaborator.
    tokenizer: T,
    /// Live sessions.
    sessions: SessionStore,
    /// Decode batch alignment.
    aligner: BatchAligner,
    /// Device for prefill inputs.
    device: Device,
}

impl<M: CausalLm, T: TextCodec> Scheduler<M, T> {
    /// Create a new scheduler.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: SchedulerConfig, model: M, tokenizer: T, device: Device) -> Result<Self> {
        config.validate()?;
        let aligner = BatchAligner::new(tokenizer.pad_token_id(), config.context_window);
        Ok(Self {
            config,
            model,
            tokenizer,
            sessions: SessionStore::new(),
            aligner,
            device,
        })
    }

    /// Partition request ids into prefill, decode and rejected slots.
    ///
    /// `raw_requests[i]` is the request delivered for `known_ids[i]`; a
    /// shorter `raw_requests` means the trailing ids came without a body.
    pub fn plan(&self, raw_requests: &[RawRequest], known_ids: &[RequestId]) -> TickPlan {
        let mut plan = TickPlan::default();
        let mut seen: HashSet<&str> = HashSet::with_capacity(known_ids.len());

        for (slot, id) in known_ids.iter().enumerate() {
            if !seen.insert(id.as_str()) {
                plan.rejected.push((slot, RequestError::DuplicateId(id.clone())));
            } else if self.sessions.contains(id) {
                plan.decode_slots.push(slot);
            } else if raw_requests.get(slot).is_some_and(|r| r.body.is_some()) {
                plan.prefill_slots.push(slot);
            } else {
                plan.rejected.push((slot, RequestError::MissingBody(id.clone())));
            }
        }

        plan
    }

    /// Run one serving tick.
    ///
    /// Returns one outcome per entry of `known_ids`, in the same order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchTooLarge`] if the tick carries more ids than
    /// `max_batch_size`; nothing is run in that case. All other failures are
    /// reported per request.
    #[instrument(skip_all, fields(tick_size = known_ids.len()))]
    pub fn step(
        &mut self,
        raw_requests: &[RawRequest],
        known_ids: &[RequestId],
    ) -> Result<Vec<RequestOutcome>> {
        if known_ids.len() > self.config.max_batch_size {
            return Err(Error::BatchTooLarge {
                got: known_ids.len(),
                limit: self.config.max_batch_size,
            });
        }

        let plan = self.plan(raw_requests, known_ids);
        debug!(
            prefill = plan.prefill_slots.len(),
            decode = plan.decode_slots.len(),
            rejected = plan.rejected.len(),
            "tick plan"
        );

        let mut results: Vec<Option<SlotResult>> = vec![None; known_ids.len()];
        let mut touched: Vec<(usize, u32)> = Vec::with_capacity(plan.num_scheduled());

        for (slot, err) in plan.rejected {
            warn!(slot, error = %err, "rejected request");
            results[slot] = Some(Err(err));
        }

        // Step 1: prefill new sessions one at a time
        for &slot in &plan.prefill_slots {
            let id = &known_ids[slot];
            let body = raw_requests[slot].body.as_deref().unwrap_or_default();
            let result = self.run_prefill(id, body);
            if let Ok((_, token)) = &result {
                touched.push((slot, *token));
            }
            results[slot] = Some(result.map(|(output, _)| output));
        }

        // Step 2: one merged decode for every continuing session
        if !plan.decode_slots.is_empty() {
            let ids: Vec<RequestId> = plan
                .decode_slots
                .iter()
                .map(|&slot| known_ids[slot].clone())
                .collect();
            let mut decoded = self.run_decode(&ids);
            for &slot in &plan.decode_slots {
                let result = decoded.remove(&known_ids[slot]).unwrap_or_else(|| {
                    Err(RequestError::InvariantViolation {
                        id: known_ids[slot].clone(),
                        reason: "no decode result".into(),
                    })
                });
                if let Ok((_, token)) = &result {
                    touched.push((slot, *token));
                }
                results[slot] = Some(result.map(|(output, _)| output));
            }
        }

        // Step 3: stopping criteria for every session that produced a token
        for (slot, token) in touched {
            let id = &known_ids[slot];
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            if stopping::evaluate(session, token) {
                let reason = session.finish_reason();
                self.sessions.remove(id);
                debug!(request_id = %id, ?reason, "session finished");
                if let Some(Ok(output)) = &mut results[slot] {
                    output.finish_reason = reason;
                }
            }
        }

        Ok(known_ids
            .iter()
            .zip(results)
            .map(|(id, result)| RequestOutcome {
                request_id: id.clone(),
                result: result.unwrap_or_else(|| {
                    Err(RequestError::InvariantViolation {
                        id: id.clone(),
                        reason: "request was not scheduled".into(),
                    })
                }),
            })
            .collect())
    }

    /// Tokenize a new request, run its prefill and store the session.
    ///
    /// Nothing is stored unless every step succeeds.
    #[instrument(skip(self, body))]
    fn run_prefill(
        &mut self,
        id: &RequestId,
        body: &[u8],
    ) -> std::result::Result<(StepOutput, u32), RequestError> {
        let request = GenerationRequest::from_body(body).map_err(|reason| {
            warn!(request_id = %id, %reason, "invalid request body");
            RequestError::InvalidBody {
                id: id.clone(),
                reason,
            }
        })?;

        let mut prompt = self
            .tokenizer
            .encode(&request.prompt)
            .map_err(RequestError::collaborator)?;
        if let Some(limit) = self.config.max_prompt_tokens {
            prompt.truncate(limit);
        }
        if prompt.is_empty() {
            return Err(RequestError::InvalidBody {
                id: id.clone(),
                reason: "prompt encodes to no tokens".into(),
            });
        }

        let budget = request
            .max_new_tokens
            .unwrap_or(self.config.default_max_new_tokens);
        let stopping = StoppingCriteria::new(budget, self.tokenizer.eos_token_id());
        let mut session = Session::new(id.clone(), prompt, stopping);

        let (token, output) = self.prefill_session(&mut session).map_err(|e| {
            error!(request_id = %id, error = %e, "prefill failed");
            RequestError::collaborator(e)
        })?;

        self.sessions
            .insert(session)
            .map_err(|e| RequestError::InvariantViolation {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        Ok((output, token))
    }

    fn prefill_session(&mut self, session: &mut Session) -> Result<(u32, StepOutput)> {
        let len = session.physical_len();
        let input = ForwardInput {
            input_ids: Tensor::from_slice(session.token_ids(), (1, len), &self.device)?,
            attention_mask: Tensor::from_slice(session.attention_mask(), (1, len), &self.device)?,
            cache: None,
        };

        let output = self.model.forward(input.clone())?;
        output.check_against(&input)?;
        let token = output.next_token_ids[0];
        session.complete_prefill(token, output.cache)?;

        let ids = if self.config.echo_prompt {
            session.token_ids().to_vec()
        } else {
            vec![token]
        };
        let text = self.tokenizer.decode(&ids, self.config.skip_special_tokens)?;
        Ok((
            token,
            StepOutput {
                text,
                ids,
                finish_reason: None,
            },
        ))
    }

    /// Merge, step and split every continuing session.
    ///
    /// A model failure leaves every session in the batch untouched.
    #[instrument(skip_all, fields(batch = ids.len()))]
    fn run_decode(
        &mut self,
        ids: &[RequestId],
    ) -> HashMap<RequestId, std::result::Result<(StepOutput, u32), RequestError>> {
        let mut results = HashMap::with_capacity(ids.len());

        let outcome = self
            .aligner
            .merge(ids.iter().filter_map(|id| self.sessions.get(id)));

        for (id, reason) in outcome.rejected {
            error!(request_id = %id, %reason, "evicting session");
            self.sessions.remove(&id);
            results.insert(id.clone(), Err(RequestError::InvariantViolation { id, reason }));
        }

        let Some(batch) = outcome.batch else {
            return results;
        };
        let batch_ids = batch.request_ids();

        let split = batch
            .to_forward_input()
            .and_then(|input| self.model.forward(input))
            .and_then(|output| batch.split(output));
        let rows = match split {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "decode step failed");
                let err = RequestError::collaborator(e);
                for id in batch_ids {
                    results.insert(id, Err(err.clone()));
                }
                return results;
            }
        };

        for row in rows {
            let text = match self
                .tokenizer
                .decode(&[row.next_token], self.config.skip_special_tokens)
            {
                Ok(text) => text,
                Err(e) => {
                    results.insert(row.request_id, Err(RequestError::collaborator(e)));
                    continue;
                }
            };
            let Some(session) = self.sessions.get_mut(&row.request_id) else {
                continue;
            };
            session.complete_decode(row.token_ids, row.attention_mask, row.cache, row.next_token);
            results.insert(
                row.request_id,
                Ok((
                    StepOutput {
                        text,
                        ids: vec![row.next_token],
                        finish_reason: None,
                    },
                    row.next_token,
                )),
            );
        }

        results
    }

    /// Remove a session on behalf of the transport (e.g. client disconnect).
    pub fn evict(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id);
        if session.is_some() {
            info!(request_id = id, "session evicted");
        }
        session
    }

    /// Get the session store.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Get a reference to a live session.
    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Number of live sessions.
    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Check if any session is live.
    pub fn has_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Get mutable access to the model.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Get the tokenizer.
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Drop every live session.
    pub fn reset(&mut self) {
        self.sessions.clear();
    }
}
