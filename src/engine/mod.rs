//! Collaborator interfaces.
//!
//! This module contains:
//! - CausalLm, the model step the scheduler drives
//! - TextCodec and its HuggingFace tokenizer implementation
//! - Request and result records exchanged with the transport

pub mod model;
pub mod request;
pub mod tokenizer;

pub use model::{CausalLm, ForwardInput, ForwardOutput};
pub use request::{GenerationRequest, RawRequest, RequestOutcome, StepOutput};
pub use tokenizer::{HfTokenizer, TextCodec};
