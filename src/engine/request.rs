//! Request and result records exchanged with the transport.
//!
//! Each tick the transport delivers, for every request id owed a result, a
//! [`RawRequest`] whose body is only meaningful the first time the id is
//! seen. Bodies are JSON objects (`{"prompt": ..., "max_new_tokens": ...}`);
//! anything that is not a JSON object is taken as a plain UTF-8 prompt.

use serde::{Deserialize, Serialize};

use crate::core::session::RequestId;
use crate::core::stopping::FinishReason;
use crate::error::RequestError;

/// Raw request as handed over by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRequest {
    /// Request body, if the transport carried one.
    pub body: Option<Vec<u8>>,
}

impl RawRequest {
    /// Create a request with a body.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
        }
    }

    /// Create a request without a body.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Parsed generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Input prompt text.
    #[serde(alias = "data", alias = "text")]
    pub prompt: String,
    /// Maximum tokens to generate (scheduler default if absent).
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
}

impl GenerationRequest {
    /// Create a request with the scheduler's default budget.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_new_tokens: None,
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    /// Parse a request body.
    ///
    /// Returns a human readable reason on failure.
    pub fn from_body(body: &[u8]) -> std::result::Result<Self, String> {
        let text = std::str::from_utf8(body).map_err(|e| format!("body is not UTF-8: {e}"))?;

        let request = if text.trim_start().starts_with('{') {
            serde_json::from_str::<Self>(text).map_err(|e| format!("malformed JSON body: {e}"))?
        } else {
            Self::new(text)
        };

        if request.max_new_tokens == Some(0) {
            return Err("max_new_tokens must be at least 1".into());
        }
        Ok(request)
    }
}

/// Result of one tick for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutput {
    /// Decoded text of `ids`.
    pub text: String,
    /// Token ids produced this tick (the whole sequence for an echoed prefill).
    pub ids: Vec<u32>,
    /// Set on the tick the session completed.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "finish_reason_str")]
    pub finish_reason: Option<FinishReason>,
}

impl StepOutput {
    /// Check whether the session finished on this tick.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

fn finish_reason_str<S>(reason: &Option<FinishReason>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match reason {
        Some(r) => serializer.serialize_str(r.as_str()),
        None => serializer.serialize_none(),
    }
}

/// Outcome for one slot of a tick, in the order the ids were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Request this slot answers.
    pub request_id: RequestId,
    /// Step output or the reason there is none.
    pub result: std::result::Result<StepOutput, RequestError>,
}

impl RequestOutcome {
    /// Get the step output, if the request succeeded.
    pub fn output(&self) -> Option<&StepOutput> {
        self.result.as_ref().ok()
    }

    /// Get the error, if the request failed.
    pub fn error(&self) -> Option<&RequestError> {
        self.result.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_body() {
        let request =
            GenerationRequest::from_body(br#"{"prompt": "hi", "max_new_tokens": 2}"#).unwrap();
        assert_eq!(request, GenerationRequest::new("hi").max_new_tokens(2));
    }

    #[test]
    fn test_parse_aliases_and_defaults() {
        let request = GenerationRequest::from_body(br#"{"data": "hello"}"#).unwrap();
        assert_eq!(request.prompt, "hello");
        assert_eq!(request.max_new_tokens, None);
    }

    #[test]
    fn test_parse_plain_text_body() {
        let request = GenerationRequest::from_body(b"once upon a time").unwrap();
        assert_eq!(request.prompt, "once upon a time");
    }

    #[test]
    fn test_parse_rejects_bad_bodies() {
        assert!(GenerationRequest::from_body(br#"{"prompt": "#).is_err());
        assert!(GenerationRequest::from_body(br#"{"max_new_tokens": 3}"#).is_err());
        assert!(GenerationRequest::from_body(br#"{"prompt": "a", "max_new_tokens": 0}"#).is_err());
        assert!(GenerationRequest::from_body(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_step_output_serialization() {
        let output = StepOutput {
            text: "x".into(),
            ids: vec![7],
            finish_reason: Some(FinishReason::MaxTokens),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json, serde_json::json!({"text": "x", "ids": [7], "finish_reason": "length"}));

        let output = StepOutput {
            finish_reason: None,
            ..output
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json, serde_json::json!({"text": "x", "ids": [7]}));
    }
}
