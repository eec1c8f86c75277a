//! Online-softmax running state
//!
//! The `(o, m, d)` triple of flash attention: `o` is the not-yet-normalized
//! weighted output, `m` the running score maximum, `d` the running sum of
//! `exp(score - m)`. The invariant is that `o` and `d` are always expressed
//! relative to the *current* `m`; any operation that raises `m` rescales
//! them by `exp(old_m - new_m)` first. That rescaling is what makes
//! [`RunningState::merge`] associative and commutative, so a key/value
//! sequence may be chunked and reduced in any order.

use crate::vector::LaneVec;

/// Rescalable partial softmax-weighted sum over `D` feature lanes
#[derive(Debug, Clone, Copy)]
pub struct RunningState<const D: usize> {
    /// Accumulated weighted output, relative to `m`
    pub o: LaneVec<D>,
    /// Running maximum of folded-in scores
    pub m: f32,
    /// Running sum of `exp(score - m)`
    pub d: f32,
}

impl<const D: usize> RunningState<D> {
    /// Fresh empty state: no element has been folded in
    #[must_use]
    pub fn new() -> Self {
        Self {
            o: LaneVec::zero(),
            m: f32::NEG_INFINITY,
            d: 0.0,
        }
    }

    /// Fold one `(score, value)` element into the state.
    ///
    /// Equivalent to merging with a one-element state
    /// `(o = value, m = score, d = 1)`.
    pub fn fold(&mut self, score: f32, value: &LaneVec<D>) {
        let m_new = self.m.max(score);
        let rescale = (self.m - m_new).exp();
        let weight = (score - m_new).exp();

        self.o.scale(rescale);
        self.o.scaled_add(value, weight);
        self.d = self.d * rescale + weight;
        self.m = m_new;
    }

    /// Merge another independently accumulated state into this one.
    ///
    /// Associative and commutative; an empty state is the identity.
    pub fn merge(&mut self, other: &Self) {
        if other.d == 0.0 && other.m == f32::NEG_INFINITY {
            return;
        }
        let m_new = self.m.max(other.m);
        let scale_self = (self.m - m_new).exp();
        let scale_other = (other.m - m_new).exp();

        self.o.scale(scale_self);
        self.o.scaled_add(&other.o, scale_other);
        self.d = self.d * scale_self + other.d * scale_other;
        self.m = m_new;
    }

    /// Final normalization `o / d`. Must be applied exactly once, after all
    /// merges; partial states handed between groups are never pre-divided.
    /// An empty state normalizes to all zeros.
    #[must_use]
    pub fn normalized(&self) -> LaneVec<D> {
        if self.d == 0.0 {
            return LaneVec::zero();
        }
        let mut out = self.o;
        out.scale(1.0 / self.d);
        out
    }
}

impl<const D: usize> Default for RunningState<D> {
    fn default() -> Self {
        Self::new()
    }
}
