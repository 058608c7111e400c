// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer collaborator seam.
//!
//! The decode loop only needs three things from a tokenizer: encode, decode,
//! and the end-of-sequence id. [`Tokenizer`] captures exactly that;
//! [`HfTokenizer`] implements it over the `HuggingFace` `tokenizers` crate.

use crate::error::{InferError, Result};

/// EOS token strings checked, in order, when loading a tokenizer file
/// without an explicit id.
const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<eos>",
    "<end_of_turn>",
];

/// Minimal tokenizer interface consumed by the generation engine.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Tokenizer`] if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids back to text.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Tokenizer`] if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// The end-of-sequence token id recognized by the decode loop.
    fn eos_id(&self) -> u32;
}

/// `HuggingFace` tokenizer with a resolved end-of-sequence id.
pub struct HfTokenizer {
    /// The wrapped `tokenizers` instance.
    inner: Box<tokenizers::Tokenizer>,
    /// End-of-sequence token id.
    eos_id: u32,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file, resolving `eos_id` from a list of
    /// conventional EOS token strings.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Tokenizer`] if the file cannot be loaded or no
    /// known EOS token exists in the vocabulary (use
    /// [`from_hf`](Self::from_hf) to supply the id explicitly).
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            InferError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let eos_id = EOS_CANDIDATES
            .iter()
            .find_map(|s| tok.token_to_id(s))
            .ok_or_else(|| {
                InferError::Tokenizer("no known EOS token found in vocabulary".into())
            })?;
        Ok(Self {
            inner: Box::new(tok),
            eos_id,
        })
    }

    /// Wrap an already-loaded tokenizer with an explicit EOS id.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer, eos_id: u32) -> Self {
        Self {
            inner: Box::new(tokenizer),
            eos_id,
        }
    }

    /// Vocabulary size, including added special tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| InferError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| InferError::Tokenizer(format!("decode failed: {e}")))
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("eos_id", &self.eos_id)
            .finish_non_exhaustive()
    }
}
