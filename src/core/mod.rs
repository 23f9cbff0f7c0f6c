//! Core infrastructure for nano-stream.
//!
//! This module contains the per-session building blocks:
//! - Session for request tracking
//! - SessionStore for ownership across ticks
//! - KvCache for key/value state and its shape operations
//! - StoppingCriteria for completion detection

pub mod kv_cache;
pub mod session;
pub mod session_store;
pub mod stopping;
