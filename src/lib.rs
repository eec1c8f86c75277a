//! # Atender
//!
//! Fused single-token decode attention kernel: given one query vector per
//! head and a growing key/value cache, computes the attention output for
//! every head with fused rotary positional embedding and a numerically
//! stable online-softmax ("flash attention") formulation.
//!
//! This crate is the inner compute kernel invoked once per generated token
//! by a serving system. The caller owns memory allocation, batching across
//! requests, cache growth/eviction and data-type selection.
//!
//! ## Algorithm
//!
//! The key/value sequence is split into contiguous chunks, one parallel
//! group per chunk. Each group streams its chunk through a quad-buffered
//! tile pipeline ([`pipeline::TileRing`]), scoring key tiles against the
//! rotated query and folding value tiles into rescalable
//! [`RunningState`] accumulators. Per-chunk partials are published to a
//! caller-owned [`DecodeScratch`] buffer and merged per head in a second
//! phase; the merge rule is associative and commutative, so any chunking of
//! the sequence produces the same output up to floating-point rounding.
//!
//! ## Example
//!
//! ```rust
//! use atender::{CacheLayout, DecodeConfig, DecodeKernel, DecodeScratch, DeviceLimits};
//!
//! let config = DecodeConfig::new(2, 64);
//! let kernel = DecodeKernel::new(config).unwrap();
//!
//! let seq_len = 10;
//! let q = vec![0.1f32; 2 * 64];
//! let k = vec![0.2f32; seq_len * 2 * 64];
//! let v = vec![0.3f32; seq_len * 2 * 64];
//! let mut out = vec![0.0f32; 2 * 64];
//!
//! let limits = DeviceLimits { compute_units: 4, max_groups_per_unit: 16 };
//! let plan = kernel.plan(seq_len, &limits).unwrap();
//! let mut scratch = DecodeScratch::new(2, plan.num_chunks, 64);
//! kernel.run(&q, &k, &v, seq_len, &mut out, &mut scratch, &plan).unwrap();
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]

pub mod error;
mod kernel;
pub mod launch;
pub mod layout;
pub mod pipeline;
pub mod rope;
pub mod scratch;
pub mod state;
pub mod vector;

pub use error::{AtenderError, Result};
pub use launch::{choose, chunk_ceiling, DeviceLimits, LaunchConfig, CHUNK_FLOOR};
pub use layout::{CacheLayout, KvCacheView};
pub use rope::{RotaryEmbedding, RotaryMode};
pub use scratch::DecodeScratch;
pub use state::RunningState;
pub use vector::{Element, LaneVec};

use serde::{Deserialize, Serialize};

/// Head dimensions with a compile-time specialized kernel
pub const SUPPORTED_HEAD_DIMS: [usize; 3] = [64, 128, 256];

/// Static configuration of a decode kernel instance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Number of attention heads
    pub num_heads: usize,
    /// Feature lanes per head (64, 128 or 256)
    pub head_dim: usize,
    /// Memory layout of the key/value caches
    pub layout: CacheLayout,
    /// Whether query/keys are rotated before scoring
    pub rotary_mode: RotaryMode,
    /// Rotary base frequency
    pub rope_theta: f32,
    /// Rotary position scale divisor
    pub rope_scale: f32,
    /// Score scale factor; `None` means `1 / sqrt(head_dim)`
    pub softmax_scale: Option<f32>,
}

impl DecodeConfig {
    /// Configuration with NHD layout, no rotary embedding and the default
    /// score scale
    #[must_use]
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            head_dim,
            layout: CacheLayout::Nhd,
            rotary_mode: RotaryMode::None,
            rope_theta: 10000.0,
            rope_scale: 1.0,
            softmax_scale: None,
        }
    }

    /// Set the cache layout
    #[must_use]
    pub fn with_layout(mut self, layout: CacheLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Enable rotary embedding with the given theta and position scale
    #[must_use]
    pub fn with_rotary(mut self, theta: f32, scale: f32) -> Self {
        self.rotary_mode = RotaryMode::Interleaved;
        self.rope_theta = theta;
        self.rope_scale = scale;
        self
    }
}

/// Decode attention kernel, specialized at construction for one
/// configuration
#[derive(Debug, Clone)]
pub struct DecodeKernel {
    config: DecodeConfig,
    scale: f32,
    rotary: Option<RotaryEmbedding>,
}

impl DecodeKernel {
    /// Validate the configuration and precompute rotary state.
    ///
    /// # Errors
    ///
    /// [`AtenderError::UnsupportedHeadDim`] unless
    /// `head_dim` is in [`SUPPORTED_HEAD_DIMS`];
    /// [`AtenderError::InvalidShape`] for zero heads or bad rotary
    /// parameters.
    pub fn new(config: DecodeConfig) -> Result<Self> {
        if !SUPPORTED_HEAD_DIMS.contains(&config.head_dim) {
            return Err(AtenderError::UnsupportedHeadDim {
                head_dim: config.head_dim,
            });
        }
        if config.num_heads == 0 {
            return Err(AtenderError::InvalidShape {
                reason: "num_heads must be > 0".to_string(),
            });
        }

        let rotary = match config.rotary_mode {
            RotaryMode::None => None,
            RotaryMode::Interleaved => Some(RotaryEmbedding::new(
                config.head_dim,
                config.rope_theta,
                config.rope_scale,
            )?),
        };
        let scale = config
            .softmax_scale
            .unwrap_or_else(|| (config.head_dim as f32).sqrt().recip());

        Ok(Self {
            config,
            scale,
            rotary,
        })
    }

    /// Kernel configuration
    #[must_use]
    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// Score scale factor in effect
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Choose the chunk grid for a sequence length on a device.
    ///
    /// # Errors
    ///
    /// Propagates launch-precondition and device-query failures from
    /// [`launch::choose`].
    pub fn plan(&self, seq_len: usize, limits: &DeviceLimits) -> Result<LaunchConfig> {
        launch::choose(
            seq_len,
            self.config.num_heads,
            self.config.head_dim,
            self.config.layout,
            limits,
        )
    }

    /// Run one decode step.
    ///
    /// `q` and `out` are `[num_heads, head_dim]`; `k_cache`/`v_cache` hold
    /// `seq_len` positions in the configured layout. `scratch` must match
    /// the plan's chunk count (see [`DecodeScratch::new`]).
    ///
    /// # Errors
    ///
    /// [`AtenderError::InvalidShape`] on any buffer-shape mismatch.
    pub fn run<T: Element>(
        &self,
        q: &[T],
        k_cache: &[T],
        v_cache: &[T],
        seq_len: usize,
        out: &mut [T],
        scratch: &mut DecodeScratch,
        plan: &LaunchConfig,
    ) -> Result<()> {
        let (num_heads, head_dim) = (self.config.num_heads, self.config.head_dim);

        if seq_len == 0 {
            return Err(AtenderError::InvalidShape {
                reason: "seq_len must be > 0".to_string(),
            });
        }
        let expected_q = num_heads * head_dim;
        if q.len() != expected_q || out.len() != expected_q {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "q has {} and out has {} elements, expected num_heads {num_heads} x \
                     head_dim {head_dim} = {expected_q}",
                    q.len(),
                    out.len()
                ),
            });
        }
        let keys = KvCacheView::new(k_cache, seq_len, num_heads, head_dim, self.config.layout)?;
        let values = KvCacheView::new(v_cache, seq_len, num_heads, head_dim, self.config.layout)?;
        scratch.check_shape(num_heads, plan.num_chunks, head_dim)?;
        if plan.chunk_size == 0 || plan.num_chunks != seq_len.div_ceil(plan.chunk_size) {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "plan has {} chunks of {} positions, sequence of {seq_len} needs a \
                     covering grid",
                    plan.num_chunks, plan.chunk_size
                ),
            });
        }

        tracing::debug!(
            num_heads,
            head_dim,
            seq_len,
            chunk_size = plan.chunk_size,
            num_chunks = plan.num_chunks,
            rotary = ?self.config.rotary_mode,
            "running decode attention"
        );

        let rotary = self.rotary.as_ref();
        match head_dim {
            64 => kernel::run_kernel::<T, 64>(
                q, &keys, &values, out, scratch, rotary, self.scale, plan,
            ),
            128 => kernel::run_kernel::<T, 128>(
                q, &keys, &values, out, scratch, rotary, self.scale, plan,
            ),
            256 => kernel::run_kernel::<T, 256>(
                q, &keys, &values, out, scratch, rotary, self.scale, plan,
            ),
            other => Err(AtenderError::UnsupportedHeadDim { head_dim: other }),
        }
    }

    /// Convenience wrapper: plan the launch, allocate matching scratch and
    /// run. Callers on a hot path should hold their own scratch and use
    /// [`Self::run`].
    ///
    /// # Errors
    ///
    /// Propagates planning and shape errors from [`Self::plan`] and
    /// [`Self::run`].
    pub fn forward<T: Element>(
        &self,
        q: &[T],
        k_cache: &[T],
        v_cache: &[T],
        seq_len: usize,
        out: &mut [T],
        limits: &DeviceLimits,
    ) -> Result<LaunchConfig> {
        let plan = self.plan(seq_len, limits)?;
        let mut scratch =
            DecodeScratch::new(self.config.num_heads, plan.num_chunks, self.config.head_dim);
        self.run(q, k_cache, v_cache, seq_len, out, &mut scratch, &plan)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_head_dim() {
        let config = DecodeConfig::new(4, 96);
        assert!(matches!(
            DecodeKernel::new(config),
            Err(AtenderError::UnsupportedHeadDim { head_dim: 96 })
        ));
    }

    #[test]
    fn test_rejects_zero_heads() {
        assert!(DecodeKernel::new(DecodeConfig::new(0, 64)).is_err());
    }

    #[test]
    fn test_default_scale_is_rsqrt_head_dim() {
        let kernel = DecodeKernel::new(DecodeConfig::new(1, 64)).unwrap();
        assert!((kernel.scale() - 0.125).abs() < 1e-7);
    }

    #[test]
    fn test_run_rejects_wrong_query_shape() {
        let kernel = DecodeKernel::new(DecodeConfig::new(2, 64)).unwrap();
        let limits = DeviceLimits {
            compute_units: 2,
            max_groups_per_unit: 8,
        };
        let plan = kernel.plan(4, &limits).unwrap();
        let q = vec![0.0f32; 64]; // one head short
        let k = vec![0.0f32; 4 * 2 * 64];
        let v = vec![0.0f32; 4 * 2 * 64];
        let mut out = vec![0.0f32; 2 * 64];
        let mut scratch = DecodeScratch::new(2, plan.num_chunks, 64);
        assert!(kernel
            .run(&q, &k, &v, 4, &mut out, &mut scratch, &plan)
            .is_err());
    }

    #[test]
    fn test_scratch_shape_mismatch_rejected() {
        let kernel = DecodeKernel::new(DecodeConfig::new(2, 64)).unwrap();
        let limits = DeviceLimits {
            compute_units: 2,
            max_groups_per_unit: 8,
        };
        let seq_len = 200; // floor chunks -> 4 chunks
        let plan = kernel.plan(seq_len, &limits).unwrap();
        let q = vec![0.0f32; 2 * 64];
        let k = vec![0.0f32; seq_len * 2 * 64];
        let v = vec![0.0f32; seq_len * 2 * 64];
        let mut out = vec![0.0f32; 2 * 64];
        let mut wrong = DecodeScratch::new(2, plan.num_chunks + 1, 64);
        assert!(kernel
            .run(&q, &k, &v, seq_len, &mut out, &mut wrong, &plan)
            .is_err());
    }

    #[test]
    fn test_forward_smoke() {
        let kernel = DecodeKernel::new(DecodeConfig::new(2, 64)).unwrap();
        let seq_len = 5;
        let q = vec![0.5f32; 2 * 64];
        let k: Vec<f32> = (0..seq_len * 2 * 64)
            .map(|i| (i as f32 * 0.01).sin())
            .collect();
        let v: Vec<f32> = (0..seq_len * 2 * 64)
            .map(|i| (i as f32 * 0.02).cos())
            .collect();
        let mut out = vec![0.0f32; 2 * 64];
        let limits = DeviceLimits {
            compute_units: 2,
            max_groups_per_unit: 8,
        };
        kernel
            .forward(&q, &k, &v, seq_len, &mut out, &limits)
            .unwrap();
        assert!(out.iter().all(|x| x.is_finite()));
    }
}
