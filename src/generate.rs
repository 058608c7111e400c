// SPDX-License-Identifier: MIT OR Apache-2.0

//! Autoregressive decode loop: prefill, sampling, and incremental flushing.
//!
//! [`GenerationEngine`] ties the collaborators together: it probes the
//! [`PromptCache`] for a saved prefill, runs the prompt through the
//! [`CausalModel`] on a miss, then hands off to [`TextGenerator`] — a finite,
//! non-restartable iterator that samples one token per step, feeds it back
//! through the model, and emits decoded text in `flush`-sized batches.
//! Decoding fewer, larger batches amortizes detokenization overhead and
//! avoids emitting incomplete multi-token fragments.
//!
//! Multi-turn sessions hand their attention state back through
//! [`TextGenerator::into_cache`] and resume with
//! [`GenerationEngine::generate_with_cache`], which prefills only the
//! tokens the cache has not seen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cache::{PromptCache, SequenceCache};
use crate::config::HeadDim;
use crate::error::{InferError, Result};
use crate::tokenizer::Tokenizer;

// ---------------------------------------------------------------------------
// CausalModel trait
// ---------------------------------------------------------------------------

/// Stateless-per-call forward function of a decoder-only model.
///
/// Implementing this trait is the only requirement for plugging a model into
/// the generation engine. The metadata methods size the per-session
/// [`SequenceCache`]; [`forward`](Self::forward) consumes a token batch and
/// advances each layer's cache by the number of new positions.
pub trait CausalModel: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of decoder layers.
    fn num_layers(&self) -> usize;

    /// Number of key/value heads per layer.
    fn num_kv_heads(&self) -> usize;

    /// Per-head key/value dimension.
    fn head_dim(&self) -> HeadDim;

    /// The device input tensors must live on.
    fn device(&self) -> &Device;

    // --- Forward pass ----------------------------------------------------

    /// Forward a token batch, optionally reading and extending a cache.
    ///
    /// With a cache, attention covers the cached history plus `tokens`; the
    /// cache comes back advanced by `seq` positions. Without one, this is a
    /// plain cache-less pass over `tokens` alone.
    ///
    /// # Shapes
    /// - `tokens`: `[batch, seq]` -- token IDs
    /// - returns: logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`] on tensor operation failures.
    fn forward(&self, tokens: &Tensor, cache: Option<&mut SequenceCache>) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Sample a token from logits using the given temperature.
///
/// When `temperature <= 0.0`, performs greedy (argmax) decoding; ties break
/// toward the lowest token id, so identical logits always produce the same
/// choice. Otherwise draws from the categorical distribution of the logits
/// scaled by `1/temperature`.
///
/// # Shapes
/// - `logits`: `[vocab_size]` -- logit scores for each vocabulary token
///
/// # Errors
///
/// Returns [`InferError::Model`] if the logits tensor is empty or cannot be
/// converted to `f32`.
pub fn sample_token(logits: &Tensor, temperature: f32) -> Result<u32> {
    sample_token_with_rng(logits, temperature, &mut rand::thread_rng())
}

/// Like [`sample_token`], drawing randomness from a caller-supplied RNG.
///
/// Seeding the RNG makes temperature sampling reproducible; greedy decoding
/// never consults it.
///
/// # Errors
///
/// Returns [`InferError::Model`] if the logits tensor is empty or cannot be
/// converted to `f32`.
pub fn sample_token_with_rng<R: rand::Rng>(
    logits: &Tensor,
    temperature: f32,
    rng: &mut R,
) -> Result<u32> {
    if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature, rng)
    }
}

/// Divide the logits of recently produced token ids by `penalty`.
///
/// Ids outside the vocabulary range are ignored. A penalty of 1 leaves the
/// logits unchanged; values above 1 discourage repetition without forbidding
/// it outright.
///
/// # Shapes
/// - `logits`: `[vocab_size]`
/// - returns: `[vocab_size]`
///
/// # Errors
///
/// Returns [`InferError::Model`] if the logits cannot be converted to `f32`.
pub fn apply_repetition_penalty(logits: &Tensor, recent: &[u32], penalty: f32) -> Result<Tensor> {
    let mut vals: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    for &id in recent {
        if let Some(v) = vals.get_mut(id as usize) {
            *v /= penalty;
        }
    }
    let len = vals.len();
    Ok(Tensor::from_vec(vals, len, logits.device())?)
}

/// Greedy (argmax) sampling, first-maximum tie-break.
fn argmax(logits: &Tensor) -> Result<u32> {
    let vals: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let mut best: Option<(usize, f32)> = None;
    for (idx, &v) in vals.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((idx, v)),
        }
    }
    let (idx, _) = best
        .ok_or_else(|| InferError::Model(candle_core::Error::Msg("empty logits".into())))?;
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let idx = idx as u32;
    Ok(idx)
}

/// Temperature-scaled categorical sampling.
fn sample_with_temperature<R: rand::Rng>(
    logits: &Tensor,
    temperature: f32,
    rng: &mut R,
) -> Result<u32> {
    let scaled = (logits.to_dtype(DType::F32)? / f64::from(temperature))?;
    let probs: Vec<f32> = candle_nn::ops::softmax_last_dim(&scaled)?
        .flatten_all()?
        .to_vec1()?;
    if probs.is_empty() {
        return Err(InferError::Model(candle_core::Error::Msg(
            "empty logits".into(),
        )));
    }

    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (idx, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            return Ok(idx as u32);
        }
    }

    // Fallback to last token (floating-point rounding edge case).
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let last = (probs.len() - 1) as u32;
    Ok(last)
}

/// Extract the last position's logits as a flat `[vocab_size]` tensor.
fn last_position_logits(logits: &Tensor) -> Result<Tensor> {
    let seq = logits.dim(1)?;
    Ok(logits.narrow(1, seq - 1, 1)?.squeeze(1)?.squeeze(0)?)
}

// ---------------------------------------------------------------------------
// GenerateOptions
// ---------------------------------------------------------------------------

/// Knobs for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    /// Sampling temperature; `0.0` selects greedily.
    pub temperature: f32,
    /// Maximum number of tokens to produce.
    pub max_tokens: usize,
    /// Decode and emit buffered tokens every `flush` tokens.
    pub flush: usize,
    /// Repetition penalty factor; `None` disables the penalty.
    pub repetition_penalty: Option<f32>,
    /// Lookback window (in produced tokens) for the repetition penalty.
    pub repetition_window: usize,
    /// RNG seed for temperature sampling; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 256,
            flush: 5,
            repetition_penalty: None,
            repetition_window: 100,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationResult
// ---------------------------------------------------------------------------

/// Output of a completed generation run.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Token ids of the prompt.
    pub prompt_tokens: Vec<u32>,
    /// Token ids that were generated (EOS excluded).
    pub generated_tokens: Vec<u32>,
    /// The generated text.
    pub text: String,
    /// Total token count (prompt + generated).
    pub total_tokens: usize,
}

// ---------------------------------------------------------------------------
// GenerationEngine
// ---------------------------------------------------------------------------

/// Drives the prefill → decode → flush state machine.
///
/// Holds the model and tokenizer collaborators plus an optional shared
/// [`PromptCache`]. The cache is guarded by a single `Mutex` — one lock
/// around the whole structure, held only for the probe and the store, never
/// across a forward pass.
pub struct GenerationEngine<'a, M: CausalModel, T: Tokenizer> {
    /// The model collaborator.
    model: &'a M,
    /// The tokenizer collaborator.
    tokenizer: &'a T,
    /// Shared prefill cache, if prompt reuse is enabled.
    prompt_cache: Option<&'a Mutex<PromptCache>>,
}

impl<'a, M: CausalModel, T: Tokenizer> GenerationEngine<'a, M, T> {
    /// Create an engine without prompt reuse.
    #[must_use]
    pub fn new(model: &'a M, tokenizer: &'a T) -> Self {
        Self {
            model,
            tokenizer,
            prompt_cache: None,
        }
    }

    /// Create an engine that shares `prompt_cache` across sessions.
    #[must_use]
    pub fn with_prompt_cache(
        model: &'a M,
        tokenizer: &'a T,
        prompt_cache: &'a Mutex<PromptCache>,
    ) -> Self {
        Self {
            model,
            tokenizer,
            prompt_cache: Some(prompt_cache),
        }
    }

    /// Start generating from rendered prompt token ids.
    ///
    /// Probes the prompt cache by content digest; on a hit the saved logits
    /// and sequence state are cloned and prefill is skipped entirely. On a
    /// miss the full prompt runs through the model with a fresh
    /// [`SequenceCache`] and the result is stored back for future sessions.
    /// A miss is invisible to the caller except as latency.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Config`] for an empty prompt and propagates
    /// model failures from the prefill pass.
    pub fn generate(
        &self,
        prompt: &[u32],
        options: GenerateOptions,
    ) -> Result<TextGenerator<'a, M, T>> {
        if prompt.is_empty() {
            return Err(InferError::Config(
                "prompt must contain at least one token".into(),
            ));
        }
        tracing::debug!(
            "generating up to {} tokens with temperature {} and flushing every {} tokens",
            options.max_tokens,
            options.temperature,
            options.flush
        );

        let digest = PromptCache::digest(prompt);
        let reused = match self.prompt_cache {
            Some(shared) => self.lock_cache(shared)?.get_by_key(&digest)?,
            None => None,
        };

        let (logits, cache) = match reused {
            Some((logits, cache)) => (logits, cache),
            None => {
                let mut cache = SequenceCache::new(
                    self.model.num_layers(),
                    self.model.num_kv_heads(),
                    self.model.head_dim(),
                );
                let logits = self.prefill(prompt, &mut cache)?;
                if let Some(shared) = self.prompt_cache {
                    self.lock_cache(shared)?.put(prompt, &logits, &cache)?;
                }
                (logits, cache)
            }
        };

        Ok(self.session(logits, cache, options))
    }

    /// Start generating on top of existing attention state.
    ///
    /// `prompt` is the full conversation so far and `cache` must hold the
    /// attention state for its first [`seq_len`](SequenceCache::seq_len)
    /// tokens — typically recovered from a previous turn via
    /// [`TextGenerator::into_cache`]. Only the unseen suffix is forwarded,
    /// so a chat turn costs one prefill over the new tokens instead of the
    /// whole history. An empty cache degrades to a whole-prompt prefill.
    ///
    /// The shared prompt cache is not consulted here; this reuse path is
    /// per-session.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Config`] for an empty prompt and
    /// [`InferError::Cache`] when the cache already covers the whole prompt,
    /// leaving no position to sample from.
    pub fn generate_with_cache(
        &self,
        prompt: &[u32],
        mut cache: SequenceCache,
        options: GenerateOptions,
    ) -> Result<TextGenerator<'a, M, T>> {
        if prompt.is_empty() {
            return Err(InferError::Config(
                "prompt must contain at least one token".into(),
            ));
        }
        let seen = cache.seq_len();
        if seen >= prompt.len() {
            return Err(InferError::Cache(format!(
                "cache already holds {seen} positions but the prompt has only {} tokens",
                prompt.len()
            )));
        }
        tracing::debug!(
            "resuming from {seen} cached positions, prefilling {} new prompt tokens",
            prompt.len() - seen
        );

        let suffix = prompt.get(seen..).unwrap_or_default();
        let logits = self.prefill(suffix, &mut cache)?;
        Ok(self.session(logits, cache, options))
    }

    /// Run a generation to completion and collect the output.
    ///
    /// # Errors
    ///
    /// Propagates the first error from the underlying generator.
    pub fn complete(&self, prompt: &[u32], options: GenerateOptions) -> Result<GenerationResult> {
        let mut generator = self.generate(prompt, options)?;
        let mut text = String::new();
        for chunk in generator.by_ref() {
            text.push_str(&chunk?);
        }
        let generated_tokens = generator.generated.clone();
        Ok(GenerationResult {
            prompt_tokens: prompt.to_vec(),
            total_tokens: prompt.len() + generated_tokens.len(),
            generated_tokens,
            text,
        })
    }

    /// Forward `tokens` into `cache` and extract the last position's logits.
    fn prefill(&self, tokens: &[u32], cache: &mut SequenceCache) -> Result<Tensor> {
        let input = Tensor::from_vec(tokens.to_vec(), (1, tokens.len()), self.model.device())?;
        let logits = self.model.forward(&input, Some(cache))?;
        last_position_logits(&logits)
    }

    /// Assemble a generator around prefilled state.
    fn session(
        &self,
        logits: Tensor,
        cache: SequenceCache,
        options: GenerateOptions,
    ) -> TextGenerator<'a, M, T> {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        TextGenerator {
            model: self.model,
            tokenizer: self.tokenizer,
            cache,
            logits,
            options,
            rng,
            pending: Vec::new(),
            recent: std::collections::VecDeque::new(),
            generated: Vec::new(),
            produced: 0,
            finished: false,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock_cache(
        &self,
        shared: &'a Mutex<PromptCache>,
    ) -> Result<std::sync::MutexGuard<'a, PromptCache>> {
        shared
            .lock()
            .map_err(|_| InferError::Cache("prompt cache mutex poisoned".into()))
    }
}

// ---------------------------------------------------------------------------
// TextGenerator
// ---------------------------------------------------------------------------

/// Lazy producer of decoded text chunks for one generation session.
///
/// Finite and non-restartable: a fresh call to
/// [`GenerationEngine::generate`] is required to regenerate. Each iteration
/// samples at least one token, so sampling decisions are materialized
/// host-side before the loop can branch. The session exclusively owns its
/// [`SequenceCache`]; [`into_cache`](Self::into_cache) recovers it for the
/// next turn.
pub struct TextGenerator<'a, M: CausalModel, T: Tokenizer> {
    /// The model collaborator.
    model: &'a M,
    /// The tokenizer collaborator.
    tokenizer: &'a T,
    /// This session's attention state.
    cache: SequenceCache,
    /// Logits for the next sampling decision, shape `[vocab_size]`.
    logits: Tensor,
    /// Generation knobs.
    options: GenerateOptions,
    /// Sampling RNG, seeded from `options.seed` when set.
    rng: StdRng,
    /// Tokens sampled but not yet decoded to text.
    pending: Vec<u32>,
    /// Lookback window for the repetition penalty.
    recent: std::collections::VecDeque<u32>,
    /// All generated tokens, in order (EOS excluded).
    generated: Vec<u32>,
    /// Produced-token counter.
    produced: usize,
    /// Set once the terminal state is reached.
    finished: bool,
    /// Cooperative cancellation flag, checked between iterations.
    abort: Arc<AtomicBool>,
}

impl<M: CausalModel, T: Tokenizer> TextGenerator<'_, M, T> {
    /// Handle for aborting the generation between decode iterations.
    ///
    /// Setting the flag ends the sequence at the next iteration boundary,
    /// after flushing whatever text is still pending, so callers can bound
    /// worst-case latency without waiting for EOS or `max_tokens`.
    #[must_use]
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Tokens generated so far (EOS excluded).
    #[must_use]
    pub fn generated_tokens(&self) -> &[u32] {
        &self.generated
    }

    /// Number of tokens produced so far.
    #[must_use]
    pub const fn produced(&self) -> usize {
        self.produced
    }

    /// Consume the generator and recover its attention state.
    ///
    /// The returned cache covers the prompt plus every generated token that
    /// was fed back through the model. Pass it to
    /// [`GenerationEngine::generate_with_cache`] along with the extended
    /// conversation to continue a session without re-running prefill over
    /// the shared history.
    #[must_use]
    pub fn into_cache(self) -> SequenceCache {
        self.cache
    }

    /// Sample the next token from the current logits, applying the
    /// repetition penalty over the lookback window when configured.
    fn sample_next(&mut self) -> Result<u32> {
        match self.options.repetition_penalty {
            Some(penalty) => {
                let recent: Vec<u32> = self.recent.iter().copied().collect();
                let penalized = apply_repetition_penalty(&self.logits, &recent, penalty)?;
                sample_token_with_rng(&penalized, self.options.temperature, &mut self.rng)
            }
            None => {
                sample_token_with_rng(&self.logits, self.options.temperature, &mut self.rng)
            }
        }
    }

    /// Feed one sampled token back through the model.
    fn step(&mut self, token: u32) -> Result<()> {
        let input = Tensor::from_vec(vec![token], (1, 1), self.model.device())?;
        let logits = self.model.forward(&input, Some(&mut self.cache))?;
        self.logits = last_position_logits(&logits)?;
        Ok(())
    }

    /// Record a produced token in the lookback window.
    fn push_recent(&mut self, token: u32) {
        if self.options.repetition_window == 0 {
            return;
        }
        self.recent.push_back(token);
        while self.recent.len() > self.options.repetition_window {
            self.recent.pop_front();
        }
    }

    /// Decode and clear the pending buffer; `None` when nothing is pending.
    fn flush_pending(&mut self) -> Option<Result<String>> {
        if self.pending.is_empty() {
            return None;
        }
        let chunk = self.tokenizer.decode(&self.pending);
        self.pending.clear();
        Some(chunk.map_err(Into::into))
    }
}

impl<M: CausalModel, T: Tokenizer> Iterator for TextGenerator<'_, M, T> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            // Cancellation point: between iterations, before the next
            // model invocation.
            if self.abort.load(Ordering::Relaxed) || self.produced >= self.options.max_tokens {
                self.finished = true;
                return self.flush_pending();
            }

            let token = match self.sample_next() {
                Ok(token) => token,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            // EOS terminates without being emitted.
            if token == self.tokenizer.eos_id() {
                self.finished = true;
                return self.flush_pending();
            }

            self.pending.push(token);
            self.generated.push(token);
            self.push_recent(token);
            self.produced += 1;

            if self.produced >= self.options.max_tokens {
                self.finished = true;
                return self.flush_pending();
            }

            if let Err(e) = self.step(token) {
                self.finished = true;
                return Some(Err(e));
            }

            if self.pending.len() >= self.options.flush.max(1) {
                return self.flush_pending();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
