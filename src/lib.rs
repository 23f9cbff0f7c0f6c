//! nano-stream: continuous batching for streaming generation in Rust.
//!
//! This crate implements the serving-side core of token streaming:
//! - A session store holding per-request token history and key/value cache
//! - Prefill of new requests and merged decode of continuing ones per tick
//! - Left-padding batch alignment with an optional context window
//! - Per-session stopping criteria (token budget and stop token)
//!
//! The model and tokenizer are collaborators behind the [`CausalLm`] and
//! [`TextCodec`] traits.
//!
//! ## Features
//!
//! - `cuda`, `metal`: enable the matching `candle-core` backend so the
//!   scheduler can build its input and cache tensors on that device.

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use crate::core::kv_cache::{KvCache, LayerKv};
pub use crate::core::session::{RequestId, Session};
pub use crate::core::session_store::SessionStore;
pub use crate::core::stopping::{FinishReason, StoppingCriteria};
pub use engine::{
    CausalLm, ForwardInput, ForwardOutput, GenerationRequest, HfTokenizer, RawRequest,
    RequestOutcome, StepOutput, TextCodec,
};
pub use error::{Error, ErrorKind, RequestError, Result};
pub use scheduler::{BatchAligner, Scheduler, TickPlan};
