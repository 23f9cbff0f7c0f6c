//! Tokenizer collaborator interface.

use std::path::Path;

use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::error::{Error, Result};

/// Text ↔ token id mapping with the special ids the scheduler relies on.
pub trait TextCodec {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids into text.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Id used for left padding.
    fn pad_token_id(&self) -> u32;

    /// Id that ends generation.
    fn eos_token_id(&self) -> u32;
}

/// End-of-sequence markers tried in order.
const EOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "</s>", "<|im_end|>", "<eos>"];

/// [`TextCodec`] backed by a HuggingFace `tokenizers` tokenizer.
#[derive(Debug, Clone)]
pub struct HfTokenizer {
    inner: Tokenizer,
    eos_token_id: u32,
    pad_token_id: u32,
}

impl HfTokenizer {
    /// Wrap a tokenizer, discovering its EOS id.
    ///
    /// The pad id comes from the tokenizer's padding settings and falls back
    /// to the EOS id when none are configured.
    ///
    /// # Errors
    ///
    /// Returns error if the vocabulary has none of the known EOS markers.
    pub fn new(inner: Tokenizer) -> Result<Self> {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| inner.token_to_id(token))
            .ok_or_else(|| Error::Tokenization("no end-of-sequence token in vocabulary".into()))?;
        let pad_token_id = inner
            .get_padding()
            .map(|p| p.pad_id)
            .unwrap_or(eos_token_id);

        debug!(eos_token_id, pad_token_id, "tokenizer special tokens");
        Ok(Self {
            inner,
            eos_token_id,
            pad_token_id,
        })
    }

    /// Load a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref())
            .map_err(|e| Error::Tokenization(format!("failed to load tokenizer: {e}")))?;
        Self::new(inner)
    }

    /// Download `tokenizer.json` from the HuggingFace Hub and load it.
    ///
    /// # Arguments
    ///
    /// * `model_id` - HuggingFace model ID (e.g., "openai-community/gpt2")
    /// * `revision` - Git revision. Use "main" for latest.
    pub fn from_pretrained(model_id: &str, revision: &str) -> Result<Self> {
        let api = Api::new()
            .map_err(|e| Error::Tokenization(format!("failed to create HF API: {e}")))?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let path = repo
            .get("tokenizer.json")
            .map_err(|e| Error::Tokenization(format!("failed to download tokenizer.json: {e}")))?;
        Self::from_file(path)
    }

    /// Override the padding id.
    pub fn with_pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    /// Get the wrapped tokenizer.
    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

impl TextCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}
