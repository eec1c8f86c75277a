//! Rotary position embedding (RoPE) applicator
//!
//! Rotates adjacent lane pairs of a query or key vector by a
//! position-dependent angle, encoding relative position into the dot
//! product. Inverse frequencies are precomputed once per kernel; only the
//! position-dependent sin/cos is evaluated per row.
//!
//! The rotation is fused into the score stage: keys are rotated at their
//! *absolute* cache position as their tile is consumed, the query once at
//! `seq_len - 1`.

use serde::{Deserialize, Serialize};

use crate::error::{AtenderError, Result};

/// Whether rotary embedding is applied before scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotaryMode {
    /// Raw query/key vectors are scored as stored
    None,
    /// Adjacent-pair (LLaMA-style) rotation of query and keys before scoring
    Interleaved,
}

/// Precomputed rotary embedding state for one head dimension
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    /// Position scale divisor (1.0 = no NTK/linear scaling)
    scale: f32,
    /// theta^(-2i/head_dim) for each lane pair i
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    /// Precompute the per-lane-pair frequency table.
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::InvalidShape`] if `head_dim` is zero or odd,
    /// or if `theta` / `scale` are not positive.
    pub fn new(head_dim: usize, theta: f32, scale: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(AtenderError::InvalidShape {
                reason: format!("head_dim must be even and > 0 for RoPE, got {head_dim}"),
            });
        }
        if theta <= 0.0 || scale <= 0.0 {
            return Err(AtenderError::InvalidShape {
                reason: format!("rope theta/scale must be > 0, got theta={theta} scale={scale}"),
            });
        }

        let half_dim = head_dim / 2;
        #[allow(clippy::cast_precision_loss)]
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| theta.powf(-2.0 * i as f32 / head_dim as f32))
            .collect();

        Ok(Self {
            head_dim,
            scale,
            inv_freq,
        })
    }

    /// Head dimension this table was built for
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotate `x` in place for the given absolute sequence position.
    ///
    /// `x.len()` must equal `head_dim`. Lane pairs `(x[2i], x[2i+1])` are
    /// rotated by `angle_i = (position / scale) * inv_freq[i]`.
    pub fn apply(&self, x: &mut [f32], position: usize) {
        debug_assert_eq!(x.len(), self.head_dim);

        #[allow(clippy::cast_precision_loss)]
        let pos = position as f32 / self.scale;

        for (i, &freq) in self.inv_freq.iter().enumerate() {
            let (sin_v, cos_v) = (pos * freq).sin_cos();
            let x0 = x[2 * i];
            let x1 = x[2 * i + 1];
            x[2 * i] = x0 * cos_v - x1 * sin_v;
            x[2 * i + 1] = x0 * sin_v + x1 * cos_v;
        }
    }
}
