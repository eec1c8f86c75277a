//! Fixed-width per-lane vector register
//!
//! [`LaneVec`] is a plain value type over a statically sized f32 array: no
//! heap, `Copy`, sized at compile time by the head dimension. All widening
//! and narrowing between storage element types (f16/bf16/f32) happens at the
//! load/store boundary through the [`Element`] trait; arithmetic is always
//! f32.

use half::{bf16, f16};

/// Storage element type of the query/cache/output tensors.
///
/// Implementations widen to f32 on load and narrow on store. Accumulation
/// inside the kernel never happens at reduced precision.
pub trait Element: Copy + Send + Sync + 'static {
    /// Widen to f32
    fn to_f32(self) -> f32;
    /// Narrow from f32
    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// Fixed-width vector register holding one row of `N` feature lanes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneVec<const N: usize> {
    data: [f32; N],
}

impl<const N: usize> LaneVec<N> {
    /// All-zero register
    #[must_use]
    pub fn zero() -> Self {
        Self { data: [0.0; N] }
    }

    /// Load `N` contiguous f32 lanes from `src` starting at `offset`
    #[must_use]
    pub fn load(src: &[f32], offset: usize) -> Self {
        let mut data = [0.0; N];
        data.copy_from_slice(&src[offset..offset + N]);
        Self { data }
    }

    /// Load `N` lanes with stride `stride` between consecutive lanes
    #[must_use]
    pub fn load_strided(src: &[f32], offset: usize, stride: usize) -> Self {
        let mut data = [0.0; N];
        for (i, lane) in data.iter_mut().enumerate() {
            *lane = src[offset + i * stride];
        }
        Self { data }
    }

    /// Load `N` contiguous lanes of a narrower element type, widening to f32
    #[must_use]
    pub fn load_cast<T: Element>(src: &[T], offset: usize) -> Self {
        let mut data = [0.0; N];
        for (i, lane) in data.iter_mut().enumerate() {
            *lane = src[offset + i].to_f32();
        }
        Self { data }
    }

    /// Store all lanes contiguously into `dst` starting at `offset`
    pub fn store(&self, dst: &mut [f32], offset: usize) {
        dst[offset..offset + N].copy_from_slice(&self.data);
    }

    /// Store all lanes, narrowing to the destination element type
    pub fn store_cast<T: Element>(&self, dst: &mut [T], offset: usize) {
        for (i, &lane) in self.data.iter().enumerate() {
            dst[offset + i] = T::from_f32(lane);
        }
    }

    /// `self += weight * other`, lane-wise
    pub fn scaled_add(&mut self, other: &Self, weight: f32) {
        for (o, &v) in self.data.iter_mut().zip(other.data.iter()) {
            *o += weight * v;
        }
    }

    /// `self *= factor`, lane-wise
    pub fn scale(&mut self, factor: f32) {
        for lane in &mut self.data {
            *lane *= factor;
        }
    }

    /// Lane array view
    #[must_use]
    pub fn as_array(&self) -> &[f32; N] {
        &self.data
    }

    /// Mutable lane array view
    pub fn as_array_mut(&mut self) -> &mut [f32; N] {
        &mut self.data
    }

    /// Dot product of two registers, reduced by successive halving.
    ///
    /// The tree shape matches the lane-subgroup reduction a SIMT target
    /// performs, so partial-sum rounding is deterministic and independent of
    /// how lanes are scheduled. `N` must be a power of two.
    #[must_use]
    pub fn dot_tree(&self, other: &Self) -> f32 {
        let mut partial = [0.0f32; N];
        for i in 0..N {
            partial[i] = self.data[i] * other.data[i];
        }
        let mut width = N / 2;
        while width > 0 {
            for i in 0..width {
                partial[i] += partial[i + width];
            }
            width /= 2;
        }
        partial[0]
    }
}

impl<const N: usize> Default for LaneVec<N> {
    fn default() -> Self {
        Self::zero()
    }
}
