//! Error types for nano-stream.
//!
//! Two layers of errors exist:
//! - [`Error`] for crate-level operations (tensor math, config loading,
//!   collaborator calls), propagated with `?`.
//! - [`RequestError`] for per-request outcomes of a tick. These are cloned
//!   into every affected slot of a tick's result list, so they carry only
//!   rendered messages.

use thiserror::Error;

use crate::core::session::RequestId;

/// Result type alias for nano-stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-stream.
#[derive(Error, Debug)]
pub enum Error {
    /// A session with this id is already live.
    #[error("session {0} already exists")]
    DuplicateSession(RequestId),

    /// More request ids in one tick than the scheduler admits.
    #[error("tick carries {got} requests, limit is {limit}")]
    BatchTooLarge { got: usize, limit: usize },

    /// Key/value cache shape or layout is inconsistent.
    #[error("cache layout error: {0}")]
    CacheLayout(String),

    /// The model collaborator failed or returned malformed output.
    #[error("model error: {0}")]
    Model(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Broad class of a per-request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The transport sent something inconsistent for this id.
    Protocol,
    /// A session broke one of its own invariants and was evicted.
    Invariant,
    /// The model or tokenizer failed. Not retried.
    Collaborator,
}

/// Failure of a single request within a tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// New request id without a body to prefill from.
    #[error("request {0} is unknown and carries no body")]
    MissingBody(RequestId),

    /// Same id listed more than once in one tick.
    #[error("request {0} appears more than once in this tick")]
    DuplicateId(RequestId),

    /// Body could not be turned into a generation request.
    #[error("request {id} has an invalid body: {reason}")]
    InvalidBody { id: RequestId, reason: String },

    /// Session state was inconsistent; the session has been evicted.
    #[error("session {id} evicted: {reason}")]
    InvariantViolation { id: RequestId, reason: String },

    /// Model step failed.
    #[error("model step failed: {0}")]
    Model(String),

    /// Tokenizer failed.
    #[error("tokenizer failed: {0}")]
    Tokenizer(String),
}

impl RequestError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingBody(_) | Self::DuplicateId(_) | Self::InvalidBody { .. } => {
                ErrorKind::Protocol
            }
            Self::InvariantViolation { .. } => ErrorKind::Invariant,
            Self::Model(_) | Self::Tokenizer(_) => ErrorKind::Collaborator,
        }
    }

    /// Wrap a crate error raised while talking to a collaborator.
    pub(crate) fn collaborator(err: Error) -> Self {
        match err {
            Error::Tokenization(msg) => Self::Tokenizer(msg),
            Error::Model(msg) => Self::Model(msg),
            other => Self::Model(other.to_string()),
        }
    }
}
