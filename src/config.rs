// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model description and `HuggingFace` `config.json` parsing.
//!
//! [`ModelSpec`] captures the handful of fields the inference core needs to
//! size its per-layer KV buffers: layer count, KV head count, head dimension,
//! and vocabulary size. The neural network itself lives behind the
//! [`CausalModel`](crate::CausalModel) trait; this module only describes it.
//!
//! # Usage
//!
//! ```
//! use candle_infer::ModelSpec;
//!
//! let config_str = r#"{"model_type": "llama", "hidden_size": 2048,
//!     "num_hidden_layers": 16, "num_attention_heads": 32,
//!     "num_key_value_heads": 8, "vocab_size": 32000}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let spec = ModelSpec::from_hf_config(&json).unwrap();
//! assert_eq!(spec.num_layers, 16);
//! assert_eq!(spec.head_dim.key_dim(), 64);
//! ```

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use crate::error::{InferError, Result};

// ---------------------------------------------------------------------------
// ModelFamily
// ---------------------------------------------------------------------------

/// Supported decoder-only model families.
///
/// Any other `model_type` fails fast at parse time with
/// [`InferError::Config`]; no partial state is retained.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// `LLaMA` 1/2/3 and Code-LLaMA.
    Llama,
    /// Mistral (architecturally a `LLaMA` variant with sliding window).
    Mistral,
    /// Mixtral sparse mixture-of-experts.
    Mixtral,
    /// Gemma (explicit `head_dim`, tied embeddings).
    Gemma,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llama => write!(f, "llama"),
            Self::Mistral => write!(f, "mistral"),
            Self::Mixtral => write!(f, "mixtral"),
            Self::Gemma => write!(f, "gemma"),
        }
    }
}

// ---------------------------------------------------------------------------
// HeadDim
// ---------------------------------------------------------------------------

/// Per-head dimension of the key and value projections.
///
/// Most models use one dimension for both; some (e.g. MLA-style attention)
/// split them. The variant is resolved once at construction and never
/// inspected per append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDim {
    /// Same dimension for keys and values.
    Uniform(usize),
    /// Distinct key and value dimensions.
    Split {
        /// Key head dimension.
        key: usize,
        /// Value head dimension.
        value: usize,
    },
}

impl HeadDim {
    /// Key head dimension.
    #[must_use]
    pub const fn key_dim(&self) -> usize {
        match self {
            Self::Uniform(d) => *d,
            Self::Split { key, .. } => *key,
        }
    }

    /// Value head dimension.
    #[must_use]
    pub const fn value_dim(&self) -> usize {
        match self {
            Self::Uniform(d) => *d,
            Self::Split { value, .. } => *value,
        }
    }

    /// Parse a `head_dim` JSON value: either a single integer or a
    /// two-element `[key, value]` array.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Config`] for any other shape. This is the
    /// construction-time check; appends never re-validate.
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(d) = value.as_u64() {
            let d = usize::try_from(d)
                .map_err(|_| InferError::Config("head_dim overflows usize".into()))?;
            return Ok(Self::Uniform(d));
        }
        if let Some(pair) = value.as_array() {
            if let [k, v] = pair.as_slice() {
                if let (Some(k), Some(v)) = (k.as_u64(), v.as_u64()) {
                    let key = usize::try_from(k)
                        .map_err(|_| InferError::Config("head_dim overflows usize".into()))?;
                    let value = usize::try_from(v)
                        .map_err(|_| InferError::Config("head_dim overflows usize".into()))?;
                    return Ok(Self::Split { key, value });
                }
            }
        }
        Err(InferError::Config(
            "head_dim must be an integer or a two-element integer array".into(),
        ))
    }
}

impl fmt::Display for HeadDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform(d) => write!(f, "{d}"),
            Self::Split { key, value } => write!(f, "k={key}/v={value}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelSpec
// ---------------------------------------------------------------------------

/// Dimensions the inference core needs from a model.
///
/// Everything required to create a correctly shaped
/// [`SequenceCache`](crate::SequenceCache) for a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    /// Model family (dispatch happens once, at parse time).
    pub family: ModelFamily,
    /// Number of decoder layers.
    pub num_layers: usize,
    /// Number of key/value heads per layer.
    pub num_kv_heads: usize,
    /// Per-head key/value dimension.
    pub head_dim: HeadDim,
    /// Vocabulary size.
    pub vocab_size: usize,
}

impl ModelSpec {
    /// Parse a `HuggingFace`-style `config.json` value.
    ///
    /// Dispatches on `model_type`; the supported families share the same
    /// dimension fields, so family only affects acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Config`] for an unsupported `model_type`, a
    /// malformed `head_dim`, or missing dimension fields.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| InferError::Config("missing 'model_type' field".into()))?;

        let family = match model_type {
            "llama" => ModelFamily::Llama,
            "mistral" => ModelFamily::Mistral,
            "mixtral" => ModelFamily::Mixtral,
            "gemma" => ModelFamily::Gemma,
            other => {
                return Err(InferError::Config(format!(
                    "unsupported model_type: '{other}'"
                )))
            }
        };

        let num_attention_heads = get_usize(config, "num_attention_heads")?;

        let head_dim = match config.get("head_dim") {
            Some(value) => HeadDim::from_value(value)?,
            None => {
                let hidden_size = get_usize(config, "hidden_size")?;
                if num_attention_heads == 0 {
                    return Err(InferError::Config(
                        "num_attention_heads is 0, cannot compute head_dim".into(),
                    ));
                }
                HeadDim::Uniform(hidden_size / num_attention_heads)
            }
        };

        Ok(Self {
            family,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_kv_heads: get_usize_or(config, "num_key_value_heads", num_attention_heads),
            head_dim,
            vocab_size: get_usize(config, "vocab_size")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Weight key verification
// ---------------------------------------------------------------------------

/// Verify that every expected weight key is present in a loaded checkpoint.
///
/// Missing keys are a data-integrity *warning*, not an error: each one is
/// logged via `tracing::warn!` and loading proceeds with whatever parameters
/// are available. Returns `true` when nothing was missing.
pub fn verify_weight_keys<'a, I>(expected: I, present: &HashSet<String>) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let mut complete = true;
    for key in expected {
        if !present.contains(key) {
            tracing::warn!("key {key} not found in weights");
            complete = false;
        }
    }
    complete
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| InferError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| InferError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
