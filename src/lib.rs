// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-infer
//!
//! Inference-time state management for local LLM serving, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! candle-infer provides the three pieces a decode loop needs beyond the
//! model's forward pass:
//!
//! - **KV caching** — [`SequenceCache`] holds one growable, step-quantized
//!   key/value buffer per decoder layer, so prefill runs once and each
//!   subsequent step forwards a single token.
//! - **Prompt reuse** — [`PromptCache`] is a bounded, content-addressed LRU
//!   cache of prefill results, letting repeated prompts (shared system
//!   prompts, retried requests) skip prefill entirely.
//! - **Generation** — [`GenerationEngine`] drives the prefill → sample →
//!   decode state machine and yields text incrementally through
//!   [`TextGenerator`], with temperature and repetition-penalty sampling,
//!   batched flushing, and cooperative cancellation.
//!
//! Models plug in through the [`CausalModel`] trait; tokenizers through
//! [`Tokenizer`], with [`HfTokenizer`] covering `tokenizer.json` files.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod generate;
pub mod tokenizer;

pub use cache::{DEFAULT_MAX_SIZE, DEFAULT_STEP, LayerCache, PromptCache, SequenceCache};
pub use config::{HeadDim, ModelFamily, ModelSpec, verify_weight_keys};
pub use error::{InferError, Result};
pub use generate::{
    CausalModel, GenerateOptions, GenerationEngine, GenerationResult, TextGenerator,
    apply_repetition_penalty, sample_token, sample_token_with_rng,
};
pub use tokenizer::{HfTokenizer, Tokenizer};
