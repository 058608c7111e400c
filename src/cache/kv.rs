// SPDX-License-Identifier: MIT OR Apache-2.0

//! Growable KV-cache for autoregressive generation.
//!
//! Stores key and value tensors from previous positions so they don't need
//! to be recomputed at each generation step. Buffers grow in `step`-sized
//! increments: appends that fit the reserved capacity write in place, and
//! reallocation cost is amortized to O(1) per token.
//!
//! ## Memory Layout
//!
//! Each layer stores:
//! - keys: `[batch, n_kv_heads, capacity, k_head_dim]`
//! - values: `[batch, n_kv_heads, capacity, v_head_dim]`
//!
//! Positions `[0, offset)` hold valid decoded history; `[offset, capacity)`
//! is zero-filled reserved space.

use candle_core::Tensor;

use crate::config::HeadDim;
use crate::error::{InferError, Result};

/// Default growth increment, in positions.
pub const DEFAULT_STEP: usize = 256;

// ---------------------------------------------------------------------------
// LayerCache
// ---------------------------------------------------------------------------

/// KV buffer for a single decoder layer.
///
/// Owned by exactly one generation session at a time; use [`copy`](Self::copy)
/// to snapshot it. Capacity is always a multiple of `step` and
/// `offset <= capacity` holds after every operation.
#[derive(Debug)]
pub struct LayerCache {
    /// Cached keys: `[batch, n_kv_heads, capacity, k_head_dim]`.
    keys: Option<Tensor>,
    /// Cached values: `[batch, n_kv_heads, capacity, v_head_dim]`.
    values: Option<Tensor>,
    /// Number of valid positions.
    offset: usize,
    /// Growth increment.
    step: usize,
    /// Number of key/value heads.
    n_kv_heads: usize,
    /// Key/value head dimension, resolved at construction.
    head_dim: HeadDim,
}

impl LayerCache {
    /// Create an empty cache with the default growth increment.
    #[must_use]
    pub fn new(n_kv_heads: usize, head_dim: HeadDim) -> Self {
        Self::with_step(n_kv_heads, head_dim, DEFAULT_STEP)
    }

    /// Create an empty cache with an explicit growth increment.
    #[must_use]
    pub fn with_step(n_kv_heads: usize, head_dim: HeadDim, step: usize) -> Self {
        Self {
            keys: None,
            values: None,
            offset: 0,
            step,
            n_kv_heads,
            head_dim,
        }
    }

    /// Append new key/value positions and return the full valid prefix.
    ///
    /// The incoming tensors must match the configured head count and
    /// dimensions; their sequence-length axis (dim 2) is the number of new
    /// positions. The returned pair is the contiguous history
    /// `[..., ..offset, ..]` *after* the append, ready to attend over.
    ///
    /// Growth: when the span exceeds capacity, the buffer is extended with
    /// zeros to the next multiple of `step` that fits `offset + new_len`.
    /// A prior buffer holding trailing reserved space (offset not itself a
    /// multiple of `step`) is first truncated to exactly `offset` valid
    /// positions so no stale padding enters the valid region.
    ///
    /// # Shapes
    /// - `new_keys`: `[batch, n_kv_heads, new_len, k_head_dim]`
    /// - `new_values`: `[batch, n_kv_heads, new_len, v_head_dim]`
    /// - returns: `([batch, n_kv_heads, offset, k_head_dim]`,
    ///   `[batch, n_kv_heads, offset, v_head_dim])`
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`] if allocation or a tensor operation
    /// fails; allocation failure is fatal and not retried.
    pub fn append(&mut self, new_keys: &Tensor, new_values: &Tensor) -> Result<(Tensor, Tensor)> {
        let prev = self.offset;
        let new_len = new_keys.dim(2)?;
        let batch = new_keys.dim(0)?;
        let capacity = match &self.keys {
            Some(k) => k.dim(2)?,
            None => 0,
        };

        let (mut keys, mut values) = match (self.keys.take(), self.values.take()) {
            // Fits the reserved space: no reallocation.
            (Some(k), Some(v)) if prev + new_len <= capacity => (k, v),
            // Grow an existing buffer.
            (Some(mut k), Some(mut v)) => {
                if prev % self.step != 0 {
                    k = k.narrow(2, 0, prev)?;
                    v = v.narrow(2, 0, prev)?;
                }
                let target = (prev + new_len).div_ceil(self.step) * self.step;
                let grow = target - k.dim(2)?;
                let zk = Tensor::zeros(
                    (batch, self.n_kv_heads, grow, self.head_dim.key_dim()),
                    new_keys.dtype(),
                    new_keys.device(),
                )?;
                let zv = Tensor::zeros(
                    (batch, self.n_kv_heads, grow, self.head_dim.value_dim()),
                    new_values.dtype(),
                    new_values.device(),
                )?;
                (Tensor::cat(&[&k, &zk], 2)?, Tensor::cat(&[&v, &zv], 2)?)
            }
            // First append: allocate fresh.
            _ => {
                let target = new_len.div_ceil(self.step) * self.step;
                let k = Tensor::zeros(
                    (batch, self.n_kv_heads, target, self.head_dim.key_dim()),
                    new_keys.dtype(),
                    new_keys.device(),
                )?;
                let v = Tensor::zeros(
                    (batch, self.n_kv_heads, target, self.head_dim.value_dim()),
                    new_values.dtype(),
                    new_values.device(),
                )?;
                (k, v)
            }
        };

        keys = keys.slice_assign(
            &[
                0..batch,
                0..self.n_kv_heads,
                prev..prev + new_len,
                0..self.head_dim.key_dim(),
            ],
            new_keys,
        )?;
        values = values.slice_assign(
            &[
                0..batch,
                0..self.n_kv_heads,
                prev..prev + new_len,
                0..self.head_dim.value_dim(),
            ],
            new_values,
        )?;
        self.offset = prev + new_len;

        let key_view = keys.narrow(2, 0, self.offset)?;
        let value_view = values.narrow(2, 0, self.offset)?;
        self.keys = Some(keys);
        self.values = Some(values);
        Ok((key_view, value_view))
    }

    /// Deep, independent snapshot of this layer's buffers.
    ///
    /// Appends to either the original or the copy never affect the other.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`] if the tensor copy fails.
    pub fn copy(&self) -> Result<Self> {
        Ok(Self {
            keys: self.keys.as_ref().map(Tensor::copy).transpose()?,
            values: self.values.as_ref().map(Tensor::copy).transpose()?,
            offset: self.offset,
            step: self.step,
            n_kv_heads: self.n_kv_heads,
            head_dim: self.head_dim,
        })
    }

    /// Number of valid positions.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Allocated positions (0 before the first append).
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`] if a buffer has an unexpected shape.
    pub fn capacity(&self) -> Result<usize> {
        match &self.keys {
            Some(k) => Ok(k.dim(2)?),
            None => Ok(0),
        }
    }

    /// Whether no positions have been appended yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Growth increment.
    #[must_use]
    pub const fn step(&self) -> usize {
        self.step
    }

    /// Raw key/value buffers, including trailing reserved zero space.
    ///
    /// `None` before the first append.
    #[must_use]
    pub fn state(&self) -> Option<(&Tensor, &Tensor)> {
        self.keys.as_ref().zip(self.values.as_ref())
    }

    /// Reset to empty, releasing the buffers.
    pub fn clear(&mut self) {
        self.keys = None;
        self.values = None;
        self.offset = 0;
    }

    /// Memory used by this layer's buffers, in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        let tensor_bytes =
            |t: &Tensor| t.elem_count() * t.dtype().size_in_bytes();
        self.keys.as_ref().map_or(0, tensor_bytes) + self.values.as_ref().map_or(0, tensor_bytes)
    }
}

// ---------------------------------------------------------------------------
// SequenceCache
// ---------------------------------------------------------------------------

/// Per-session attention state: one [`LayerCache`] per decoder layer,
/// index-aligned to layer order.
///
/// Exclusively owned by one in-flight generation at a time; concurrent
/// appends from two callers are undefined and must be prevented by the
/// caller. Use [`copy`](Self::copy) to snapshot the whole sequence.
#[derive(Debug)]
pub struct SequenceCache {
    /// One KV buffer per layer.
    layers: Vec<LayerCache>,
}

impl SequenceCache {
    /// Create an empty cache for `n_layers` layers with the default step.
    #[must_use]
    pub fn new(n_layers: usize, n_kv_heads: usize, head_dim: HeadDim) -> Self {
        Self::with_step(n_layers, n_kv_heads, head_dim, DEFAULT_STEP)
    }

    /// Create an empty cache with an explicit growth increment.
    #[must_use]
    pub fn with_step(n_layers: usize, n_kv_heads: usize, head_dim: HeadDim, step: usize) -> Self {
        let layers = (0..n_layers)
            .map(|_| LayerCache::with_step(n_kv_heads, head_dim, step))
            .collect();
        Self { layers }
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Valid sequence length (0 if nothing has been appended).
    ///
    /// All layers advance in lockstep; the first layer's offset is
    /// authoritative.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.layers.first().map_or(0, LayerCache::offset)
    }

    /// Whether no layer holds any positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(LayerCache::is_empty)
    }

    /// Mutable access to one layer's buffer.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Cache`] if `layer` is out of range.
    pub fn layer_mut(&mut self, layer: usize) -> Result<&mut LayerCache> {
        let n_layers = self.layers.len();
        self.layers.get_mut(layer).ok_or_else(|| {
            InferError::Cache(format!(
                "layer {layer} out of range for sequence cache with {n_layers} layers"
            ))
        })
    }

    /// Iterate over all layers mutably, in layer order.
    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut LayerCache> {
        self.layers.iter_mut()
    }

    /// Deep, independent snapshot of the whole sequence state.
    ///
    /// # Errors
    ///
    /// Returns [`InferError::Model`] if a tensor copy fails.
    pub fn copy(&self) -> Result<Self> {
        let layers = self
            .layers
            .iter()
            .map(LayerCache::copy)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Reset all layers to empty.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Total memory used by all layers, in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.layers.iter().map(LayerCache::memory_usage).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
