//! Stopping criteria for generation sessions.
//!
//! Every session carries a small state machine: a remaining token budget and
//! the stop token of its vocabulary. After each generated token the evaluator
//! spends one unit of budget and reports whether the session is done.
//!
//! ```text
//!   budget > 0, token != stop ──► live (next tick)
//!   token == stop             ──► EndOfSequence
//!   budget == 0               ──► MaxTokens
//! ```

use crate::core::session::Session;

/// Reason for session completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// Stop token generated.
    EndOfSequence,
    /// Token budget exhausted.
    MaxTokens,
}

impl FinishReason {
    /// Get the reason name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "eos",
            Self::MaxTokens => "length",
        }
    }
}

/// Budget and stop token of one session.
///
/// # Example
///
/// ```
/// use nano_stream::core::stopping::{FinishReason, StoppingCriteria};
///
/// let mut criteria = StoppingCriteria::new(2, 50256);
/// assert_eq!(criteria.evaluate(7), None);
/// assert_eq!(criteria.evaluate(8), Some(FinishReason::MaxTokens));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppingCriteria {
    remaining_budget: usize,
    stop_token: u32,
}

impl StoppingCriteria {
    /// Create criteria allowing `max_new_tokens` generated tokens.
    pub fn new(max_new_tokens: usize, stop_token: u32) -> Self {
        Self {
            remaining_budget: max_new_tokens,
            stop_token,
        }
    }

    /// Tokens the session may still generate.
    pub fn remaining_budget(&self) -> usize {
        self.remaining_budget
    }

    /// Terminal token id.
    pub fn stop_token(&self) -> u32 {
        self.stop_token
    }

    /// Spend one token of budget and decide whether generation is complete.
    pub fn evaluate(&mut self, last_token: u32) -> Option<FinishReason> {
        self.remaining_budget = self.remaining_budget.saturating_sub(1);

        if last_token == self.stop_token {
            Some(FinishReason::EndOfSequence)
        } else if self.remaining_budget == 0 {
            Some(FinishReason::MaxTokens)
        } else {
            None
        }
    }
}

/// Run the session's stopping criteria against its last generated token.
///
/// Returns `true` when the session is complete; the caller is expected to
/// remove it from the store.
pub fn evaluate(session: &mut Session, last_token: u32) -> bool {
    let reason = session.stopping_mut().evaluate(last_token);
    if let Some(reason) = reason {
        session.set_finished(reason);
    }
    reason.is_some()
}
