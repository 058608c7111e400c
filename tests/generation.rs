// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: drive the full generation pipeline through the public
//! API with a small scripted model, covering cache growth, prompt reuse
//! across sessions and threads, flush batching, and cancellation.
//!
//! Run with:
//!   `cargo test --test generation`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use candle_infer::{
    CausalModel, GenerateOptions, GenerationEngine, HeadDim, PromptCache, Result, SequenceCache,
    Tokenizer,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const VOCAB: usize = 32;
const EOS: u32 = 0;

/// Decoder stub whose next token is a pure function of the number of
/// positions its cache has consumed. Greedy decoding therefore walks a
/// fixed, predictable script; position `eos_at` scripts EOS.
struct ScriptedModel {
    eos_at: usize,
    device: Device,
    forwards: AtomicUsize,
}

impl ScriptedModel {
    fn new(eos_at: usize) -> Self {
        Self {
            eos_at,
            device: Device::Cpu,
            forwards: AtomicUsize::new(0),
        }
    }

    fn forward_count(&self) -> usize {
        self.forwards.load(Ordering::Relaxed)
    }

    fn scripted(&self, total: usize) -> u32 {
        if total >= self.eos_at {
            EOS
        } else {
            (total % 9 + 1) as u32
        }
    }
}

impl CausalModel for ScriptedModel {
    fn num_layers(&self) -> usize {
        4
    }

    fn num_kv_heads(&self) -> usize {
        2
    }

    fn head_dim(&self) -> HeadDim {
        HeadDim::Uniform(8)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, tokens: &Tensor, cache: Option<&mut SequenceCache>) -> Result<Tensor> {
        self.forwards.fetch_add(1, Ordering::Relaxed);
        let (batch, seq) = tokens.dims2()?;
        let total = match cache {
            Some(cache) => {
                let kv = Tensor::zeros((batch, 2, seq, 8), DType::F32, &self.device)?;
                for layer in cache.layers_mut() {
                    layer.append(&kv, &kv)?;
                }
                cache.seq_len()
            }
            None => seq,
        };

        let mut vals = vec![0.0_f32; batch * seq * VOCAB];
        let next = self.scripted(total) as usize;
        vals[(seq - 1) * VOCAB + next] = 10.0;
        Ok(Tensor::from_vec(vals, (batch, seq, VOCAB), &self.device)?)
    }
}

/// Tokenizer rendering each id as "<id> ".
struct NumberTokenizer;

impl Tokenizer for NumberTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        use std::fmt::Write as _;
        let mut out = String::new();
        for id in ids {
            let _ = write!(out, "{id} ");
        }
        Ok(out)
    }

    fn eos_id(&self) -> u32 {
        EOS
    }
}

fn greedy(max_tokens: usize, flush: usize) -> GenerateOptions {
    GenerateOptions {
        temperature: 0.0,
        max_tokens,
        flush,
        ..GenerateOptions::default()
    }
}

// ---------------------------------------------------------------------------
// End-to-end decode
// ---------------------------------------------------------------------------

#[test]
fn full_pipeline_follows_the_script() {
    let model = ScriptedModel::new(8);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    // Prompt covers positions 0..3; tokens are scripted for totals 3..8.
    let result = engine.complete(&[1, 2, 3], greedy(100, 5)).unwrap();
    assert_eq!(result.generated_tokens, vec![4, 5, 6, 7, 8]);
    assert_eq!(result.text, "4 5 6 7 8 ");
    assert_eq!(result.prompt_tokens, vec![1, 2, 3]);
    assert_eq!(result.total_tokens, 8);
}

#[test]
fn greedy_runs_are_reproducible() {
    let model = ScriptedModel::new(20);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    let a = engine.complete(&[5, 6], greedy(10, 3)).unwrap();
    let b = engine.complete(&[5, 6], greedy(10, 3)).unwrap();
    assert_eq!(a.text, b.text);
    assert_eq!(a.generated_tokens, b.generated_tokens);
}

#[test]
fn flush_controls_chunk_boundaries() {
    let model = ScriptedModel::new(1000);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    let chunks: Vec<String> = engine
        .generate(&[1], greedy(10, 4))
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    let sizes: Vec<usize> = chunks.iter().map(|c| c.split_whitespace().count()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
}

#[test]
fn streamed_and_collected_output_agree() {
    let model = ScriptedModel::new(15);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    let streamed: String = engine
        .generate(&[2, 3], greedy(100, 3))
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    let collected = engine.complete(&[2, 3], greedy(100, 3)).unwrap();
    assert_eq!(streamed, collected.text);
}

#[test]
fn abort_stops_a_long_generation() {
    let model = ScriptedModel::new(usize::MAX);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    let mut generator = engine.generate(&[1], greedy(1_000_000, 8)).unwrap();
    let handle = generator.abort_handle();
    assert!(generator.next().is_some());
    handle.store(true, Ordering::Relaxed);
    assert!(generator.next().is_none());
    assert_eq!(generator.produced(), 8);
}

// ---------------------------------------------------------------------------
// Multi-turn sessions
// ---------------------------------------------------------------------------

#[test]
fn chat_turns_extend_prior_attention_state() {
    let model = ScriptedModel::new(usize::MAX);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    // Turn 1: cold start over the opening prompt.
    let mut turn = engine.generate(&[1, 2, 3, 4], greedy(6, 5)).unwrap();
    let mut history = vec![1, 2, 3, 4];
    for chunk in turn.by_ref() {
        chunk.unwrap();
    }
    history.extend_from_slice(turn.generated_tokens());
    let mut cache = turn.into_cache();

    // Turns 2 and 3: append user tokens and resume from the saved state.
    for user in [[7, 8], [5, 6]] {
        history.extend_from_slice(&user);
        let before = model.forward_count();
        let mut turn = engine
            .generate_with_cache(&history, cache, greedy(6, 5))
            .unwrap();
        for chunk in turn.by_ref() {
            chunk.unwrap();
        }
        // Suffix prefill plus one forward per fed-back token; never a
        // re-prefill over the whole history.
        assert!(model.forward_count() - before <= 1 + turn.produced());
        history.extend_from_slice(turn.generated_tokens());
        cache = turn.into_cache();
    }

    // The resumed session matches a cold run over the same history.
    let final_turn_start = history.len() - 6;
    let cold = engine
        .complete(&history[..final_turn_start], greedy(6, 5))
        .unwrap();
    assert_eq!(&history[final_turn_start..], cold.generated_tokens.as_slice());
}

// ---------------------------------------------------------------------------
// KV cache growth through the pipeline
// ---------------------------------------------------------------------------

#[test]
fn session_cache_grows_in_step_multiples() {
    let model = ScriptedModel::new(usize::MAX);
    let tokenizer = NumberTokenizer;
    let engine = GenerationEngine::new(&model, &tokenizer);

    // 200 prompt positions + 100 decode steps crosses the 256 boundary.
    let prompt: Vec<u32> = (0..200).map(|i| (i % 9 + 1) as u32).collect();
    let result = engine.complete(&prompt, greedy(100, 10)).unwrap();
    assert_eq!(result.total_tokens, 300);
}

#[test]
fn layer_capacity_is_quantized_after_long_appends() {
    let device = Device::Cpu;
    let mut cache = SequenceCache::new(2, 2, HeadDim::Uniform(8));

    // Three uneven appends land the offset at 300.
    for len in [200_usize, 60, 40] {
        let kv = Tensor::zeros((1, 2, len, 8), DType::F32, &device).unwrap();
        for layer in cache.layers_mut() {
            layer.append(&kv, &kv).unwrap();
        }
    }
    assert_eq!(cache.seq_len(), 300);
    for layer in cache.layers_mut() {
        assert_eq!(layer.capacity().unwrap(), 512);
        assert_eq!(layer.capacity().unwrap() % layer.step(), 0);
    }
}

// ---------------------------------------------------------------------------
// Prompt reuse
// ---------------------------------------------------------------------------

#[test]
fn repeated_prompt_skips_prefill() {
    let model = ScriptedModel::new(10);
    let tokenizer = NumberTokenizer;
    let shared = Mutex::new(PromptCache::new(4));
    let engine = GenerationEngine::with_prompt_cache(&model, &tokenizer, &shared);

    let first = engine.complete(&[1, 2, 3, 4], greedy(100, 5)).unwrap();
    let after_first = model.forward_count();

    let second = engine.complete(&[1, 2, 3, 4], greedy(100, 5)).unwrap();
    assert_eq!(second.text, first.text);
    // Second run: no prefill pass, only one forward per sampled token
    // (the terminal EOS sample reuses the last step's logits).
    let decode_only = model.forward_count() - after_first;
    assert_eq!(decode_only, second.generated_tokens.len());

    let cache = shared.lock().unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.hits(&[1, 2, 3, 4]), Some(1));
}

#[test]
fn hit_state_is_isolated_between_sessions() {
    let model = ScriptedModel::new(12);
    let tokenizer = NumberTokenizer;
    let shared = Mutex::new(PromptCache::new(4));
    let engine = GenerationEngine::with_prompt_cache(&model, &tokenizer, &shared);

    // Two full generations from the same cached prompt must not
    // contaminate each other's sequence state.
    let a = engine.complete(&[7, 8], greedy(100, 5)).unwrap();
    let b = engine.complete(&[7, 8], greedy(100, 5)).unwrap();
    let c = engine.complete(&[7, 8], greedy(100, 5)).unwrap();
    assert_eq!(a.text, b.text);
    assert_eq!(b.text, c.text);
}

#[test]
fn prompt_cache_is_shared_across_threads() {
    let model = ScriptedModel::new(10);
    let tokenizer = NumberTokenizer;
    let shared = Mutex::new(PromptCache::new(8));

    let baseline = {
        let engine = GenerationEngine::with_prompt_cache(&model, &tokenizer, &shared);
        engine.complete(&[1, 2, 3], greedy(100, 5)).unwrap().text
    };

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let engine = GenerationEngine::with_prompt_cache(&model, &tokenizer, &shared);
                let result = engine.complete(&[1, 2, 3], greedy(100, 5)).unwrap();
                assert_eq!(result.text, baseline);
            });
        }
    });

    let cache = shared.lock().unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.hits(&[1, 2, 3]), Some(4));
}

#[test]
fn eviction_falls_back_to_prefill() {
    let model = ScriptedModel::new(6);
    let tokenizer = NumberTokenizer;
    let shared = Mutex::new(PromptCache::new(1));
    let engine = GenerationEngine::with_prompt_cache(&model, &tokenizer, &shared);

    let first = engine.complete(&[1, 2], greedy(100, 5)).unwrap();
    // A second distinct prompt evicts the first.
    engine.complete(&[3, 4], greedy(100, 5)).unwrap();
    assert!(!shared.lock().unwrap().contains(&[1, 2]));

    // The evicted prompt still works, just without reuse.
    let again = engine.complete(&[1, 2], greedy(100, 5)).unwrap();
    assert_eq!(again.text, first.text);
}
