//! Caller-owned scratch buffer for cross-group communication
//!
//! The scratch buffer is the only channel between parallel groups: each
//! group writes its converged per-chunk `(o, m, d)` to a disjoint
//! `(head, chunk)` region during phase A, and the per-head merge of phase B
//! re-reads all of them. The final per-head `(m, d)` pair lives in dedicated
//! `final_m`/`final_d` fields rather than aliasing chunk 0's partial slots.
//!
//! No zero-initialization is required: every element is written before it is
//! read.

use crate::error::{AtenderError, Result};
use crate::state::RunningState;
use crate::vector::LaneVec;

/// Partial-state storage for one decode launch
#[derive(Debug, Clone)]
pub struct DecodeScratch {
    num_heads: usize,
    num_chunks: usize,
    head_dim: usize,
    /// Partial outputs, chunk-major: `[chunk][head][feature]`
    pub(crate) partial_o: Vec<f32>,
    /// Partial running maxima: `[chunk][head]`
    pub(crate) partial_m: Vec<f32>,
    /// Partial exp-sums: `[chunk][head]`
    pub(crate) partial_d: Vec<f32>,
    /// Final per-head running maximum, written once in phase B
    pub(crate) final_m: Vec<f32>,
    /// Final per-head exp-sum, written once in phase B
    pub(crate) final_d: Vec<f32>,
}

impl DecodeScratch {
    /// Allocate scratch for a `(heads, chunks, head_dim)` launch shape
    #[must_use]
    pub fn new(num_heads: usize, num_chunks: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_chunks,
            head_dim,
            partial_o: vec![0.0; num_chunks * num_heads * head_dim],
            partial_m: vec![0.0; num_chunks * num_heads],
            partial_d: vec![0.0; num_chunks * num_heads],
            final_m: vec![0.0; num_heads],
            final_d: vec![0.0; num_heads],
        }
    }

    /// Flat float count a caller sizing a raw buffer would need:
    /// `heads * chunks * head_dim` partial outputs, `2 * heads * chunks`
    /// partial `(m, d)` pairs, plus `2 * heads` finals.
    #[must_use]
    pub fn required_floats(num_heads: usize, num_chunks: usize, head_dim: usize) -> usize {
        num_heads * num_chunks * head_dim + 2 * num_heads * num_chunks + 2 * num_heads
    }

    /// Verify this scratch matches a launch shape.
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::InvalidShape`] on any dimension mismatch.
    pub fn check_shape(&self, num_heads: usize, num_chunks: usize, head_dim: usize) -> Result<()> {
        if (self.num_heads, self.num_chunks, self.head_dim) != (num_heads, num_chunks, head_dim) {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "scratch sized for (heads={}, chunks={}, head_dim={}), launch needs \
                     (heads={num_heads}, chunks={num_chunks}, head_dim={head_dim})",
                    self.num_heads, self.num_chunks, self.head_dim
                ),
            });
        }
        Ok(())
    }

    /// Split borrows for the two kernel phases:
    /// `(partial_o, partial_m, partial_d, final_m, final_d)`
    pub(crate) fn views_mut(
        &mut self,
    ) -> (
        &mut [f32],
        &mut [f32],
        &mut [f32],
        &mut [f32],
        &mut [f32],
    ) {
        (
            &mut self.partial_o,
            &mut self.partial_m,
            &mut self.partial_d,
            &mut self.final_m,
            &mut self.final_d,
        )
    }

    /// Re-read one chunk's published partial state
    #[must_use]
    pub(crate) fn read_partial<const D: usize>(&self, head: usize, chunk: usize) -> RunningState<D> {
        debug_assert_eq!(D, self.head_dim);
        let md = chunk * self.num_heads + head;
        RunningState {
            o: LaneVec::load(&self.partial_o, md * D),
            m: self.partial_m[md],
            d: self.partial_d[md],
        }
    }

    /// Final per-head `(m, d)` pairs, valid after a kernel run
    #[must_use]
    pub fn finals(&self) -> (&[f32], &[f32]) {
        (&self.final_m, &self.final_d)
    }

    /// Number of heads this scratch was sized for
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Number of chunks this scratch was sized for
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }
}
