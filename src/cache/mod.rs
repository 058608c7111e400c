// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inference-time caching: per-session KV state and cross-request prompt
//! reuse.
//!
//! - [`LayerCache`] — growable per-layer key/value buffer.
//! - [`SequenceCache`] — one [`LayerCache`] per decoder layer, owned by a
//!   single generation session.
//! - [`PromptCache`] — process-wide, bounded LRU cache of prefill results.

mod kv;
mod prompt;

pub use kv::{DEFAULT_STEP, LayerCache, SequenceCache};
pub use prompt::{DEFAULT_MAX_SIZE, PromptCache};
