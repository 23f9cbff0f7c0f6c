//! Tick scheduling for continuous batching.
//!
//! This module handles:
//! - Partitioning each tick into prefill and decode requests
//! - Aligning continuing sessions into one padded decode batch
//! - Completion detection and session removal

pub mod align;
pub mod batch;

pub use align::{AlignedBatch, AlignedRow, BatchAligner, MergeOutcome, SplitRow};
pub use batch::{Scheduler, TickPlan};
