// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content-addressed LRU cache for prompt prefill results.
//!
//! Repeated prompts (or conversations sharing a byte-identical system
//! prompt) skip the prefill forward pass entirely: the cache stores the
//! last-position logits and a deep [`SequenceCache`] snapshot keyed by a
//! SHA-256 digest of the token ids. Entries are bounded by `max_size` with
//! strict least-recently-used eviction.
//!
//! Content-addressing by the full token sequence only benefits exact-prefix
//! reuse; there is no partial or fuzzy prefix matching.
//!
//! The cache is **not** internally synchronized. It is process-wide state:
//! callers sharing it across simultaneous sessions wrap it in a single
//! `std::sync::Mutex` (the granularity the engine assumes, see
//! [`GenerationEngine`](crate::GenerationEngine)).

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;

use candle_core::Tensor;
use sha2::{Digest, Sha256};

use crate::cache::SequenceCache;
use crate::error::Result;

/// Default maximum number of cached prompts.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// One saved prefill result.
#[derive(Debug)]
struct Entry {
    /// Last-position logits after the prompt forward pass.
    logits: Tensor,
    /// Deep snapshot of the sequence state after the prompt.
    cache: SequenceCache,
    /// Number of times this entry has been retrieved.
    hits: u64,
}

/// Bounded LRU mapping from token-sequence digest to saved prefill state.
#[derive(Debug)]
pub struct PromptCache {
    /// Digest → saved state.
    entries: HashMap<String, Entry>,
    /// Keys in recency order: front is least recently used.
    recency: VecDeque<String>,
    /// Entry bound; the LRU entry is evicted when exceeded.
    max_size: usize,
}

impl PromptCache {
    /// Create a cache holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size),
            recency: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Deterministic content digest of a token sequence.
    ///
    /// SHA-256 over the little-endian bytes of the ids, hex-encoded. The
    /// same tokens always produce the same key.
    #[must_use]
    pub fn digest(tokens: &[u32]) -> String {
        let mut hasher = Sha256::new();
        for &t in tokens {
            hasher.update(t.to_le_bytes());
        }
        let bytes = hasher.finalize();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(out, "{b:02x}");
        }
        out
    }

    /// Store a prefill result for `tokens`.
    ///
    /// The sequence cache is deep-copied, so the caller's ongoing mutation of
    /// its live cache cannot corrupt the stored snapshot. If the key already
    /// exists the call is a no-op: no overwrite and no recency bump.
    /// After insertion, if the entry count exceeds `max_size`, exactly the
    /// least-recently-used entry is evicted, regardless of its hit count.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`](crate::InferError::Model) if the
    /// snapshot copy fails.
    pub fn put(&mut self, tokens: &[u32], logits: &Tensor, cache: &SequenceCache) -> Result<()> {
        let key = Self::digest(tokens);
        if self.entries.contains_key(&key) {
            return Ok(());
        }
        tracing::debug!("adding prompt cache entry for key {key}");

        self.entries.insert(
            key.clone(),
            Entry {
                logits: logits.clone(),
                cache: cache.copy()?,
                hits: 0,
            },
        );
        self.recency.push_back(key);

        if self.entries.len() > self.max_size {
            if let Some(oldest) = self.recency.pop_front() {
                tracing::debug!("evicting prompt cache entry for key {oldest}");
                self.entries.remove(&oldest);
            }
        }
        Ok(())
    }

    /// Look up a prefill result by token sequence.
    ///
    /// On hit: bumps the entry to most-recently-used, increments its hit
    /// counter, and returns the logits plus an independent copy of the saved
    /// sequence cache — the caller may mutate it freely. On miss: `Ok(None)`
    /// with no side effects.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`](crate::InferError::Model) if the
    /// snapshot copy fails.
    pub fn get(&mut self, tokens: &[u32]) -> Result<Option<(Tensor, SequenceCache)>> {
        self.get_by_key(&Self::digest(tokens))
    }

    /// Look up a prefill result by an already-computed digest.
    ///
    /// Same semantics as [`get`](Self::get).
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`](crate::InferError::Model) if the
    /// snapshot copy fails.
    pub fn get_by_key(&mut self, key: &str) -> Result<Option<(Tensor, SequenceCache)>> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        entry.hits += 1;
        let logits = entry.logits.clone();
        let cache = entry.cache.copy()?;

        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            if let Some(k) = self.recency.remove(pos) {
                self.recency.push_back(k);
            }
        }
        tracing::debug!("retrieving prompt cache entry for key {key}");
        Ok(Some((logits, cache)))
    }

    /// Number of cached prompts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry bound.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whether a prefill result is cached for `tokens` (no recency bump).
    #[must_use]
    pub fn contains(&self, tokens: &[u32]) -> bool {
        self.entries.contains_key(&Self::digest(tokens))
    }

    /// Hit count for the entry keyed by `tokens`, if present.
    #[must_use]
    pub fn hits(&self, tokens: &[u32]) -> Option<u64> {
        self.entries.get(&Self::digest(tokens)).map(|e| e.hits)
    }
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
