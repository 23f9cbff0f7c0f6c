//! Configuration types for nano-stream.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheduler configuration.
///
/// Usually read from the model's `setup_config.json`; every field has a
/// default so partial files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of request ids accepted in one tick.
    pub max_batch_size: usize,
    /// Generation budget for requests that do not name one.
    pub default_max_new_tokens: usize,
    /// Keep at most this many leading prompt tokens.
    pub max_prompt_tokens: Option<usize>,
    /// Upper bound on the aligned decode length. Longer sessions lose their
    /// oldest context.
    pub context_window: Option<usize>,
    /// Return the prompt together with the first token from prefill.
    pub echo_prompt: bool,
    /// Drop special tokens when decoding text.
    pub skip_special_tokens: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            default_max_new_tokens: 25,
            max_prompt_tokens: None,
            context_window: None,
            echo_prompt: true,
            skip_special_tokens: true,
        }
    }
}

impl SchedulerConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values describe a usable scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".into()));
        }
        if self.default_max_new_tokens == 0 {
            return Err(Error::Config(
                "default_max_new_tokens must be at least 1".into(),
            ));
        }
        if self.max_prompt_tokens == Some(0) {
            return Err(Error::Config("max_prompt_tokens must be at least 1".into()));
        }
        // One cached position plus the token being decoded.
        if let Some(window) = self.context_window {
            if window < 2 {
                return Err(Error::Config(format!(
                    "context_window must be at least 2, got {window}"
                )));
            }
        }
        Ok(())
    }
}
