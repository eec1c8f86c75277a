//! Key/value cache layouts and coordinate mapping
//!
//! The cache is logically `(position, head, feature)`; physically it is
//! stored position-major (NHD) or head-major (HND). The layout changes two
//! things only: the stride arithmetic used by the staged pipeline, and how
//! heads are distributed across parallel groups. All stride math lives here
//! so the score/accumulation/reduction stages are shared verbatim between
//! the two variants.

use serde::{Deserialize, Serialize};

use crate::error::{AtenderError, Result};
use crate::vector::Element;

/// Memory order of the key/value cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLayout {
    /// Position-major `[seq_len, num_heads, head_dim]`: several heads share
    /// one group per chunk
    Nhd,
    /// Head-major `[num_heads, seq_len, head_dim]`: one group is dedicated
    /// to exactly one head
    Hnd,
}

impl CacheLayout {
    /// Heads processed by a single group.
    ///
    /// NHD spreads a block of heads over one group's extra parallel
    /// dimension; the block shrinks as the head dimension grows so the
    /// group's local-memory footprint stays level. HND pins one head per
    /// group, with the whole group cooperating on the sequence chunk.
    #[must_use]
    pub fn heads_per_group(&self, head_dim: usize) -> usize {
        match self {
            Self::Nhd => (512 / head_dim).max(1),
            Self::Hnd => 1,
        }
    }

    /// Number of groups needed per chunk for `num_heads` heads
    #[must_use]
    pub fn groups_per_chunk(&self, num_heads: usize, head_dim: usize) -> usize {
        num_heads.div_ceil(self.heads_per_group(head_dim))
    }
}

/// Read-only view over one cache tensor with centralized stride arithmetic
#[derive(Debug, Clone, Copy)]
pub struct KvCacheView<'a, T> {
    data: &'a [T],
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
    layout: CacheLayout,
}

impl<'a, T: Element> KvCacheView<'a, T> {
    /// Wrap a cache slice.
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::InvalidShape`] if the slice length does not
    /// equal `seq_len * num_heads * head_dim`.
    pub fn new(
        data: &'a [T],
        seq_len: usize,
        num_heads: usize,
        head_dim: usize,
        layout: CacheLayout,
    ) -> Result<Self> {
        let expected = seq_len * num_heads * head_dim;
        if data.len() != expected {
            return Err(AtenderError::InvalidShape {
                reason: format!(
                    "cache slice has {} elements, expected seq_len {seq_len} x heads \
                     {num_heads} x head_dim {head_dim} = {expected}",
                    data.len()
                ),
            });
        }
        Ok(Self {
            data,
            seq_len,
            num_heads,
            head_dim,
            layout,
        })
    }

    /// Start offset of the `head_dim`-length row at `(pos, head)`.
    ///
    /// The only place cache strides are computed.
    #[must_use]
    pub fn row_offset(&self, pos: usize, head: usize) -> usize {
        debug_assert!(pos < self.seq_len && head < self.num_heads);
        match self.layout {
            CacheLayout::Nhd => (pos * self.num_heads + head) * self.head_dim,
            CacheLayout::Hnd => (head * self.seq_len + pos) * self.head_dim,
        }
    }

    /// Underlying element slice
    #[must_use]
    pub fn data(&self) -> &'a [T] {
        self.data
    }

    /// Sequence length of the cache
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Number of heads in the cache
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Feature lanes per row
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Declared memory layout of the cache
    #[must_use]
    pub fn layout(&self) -> CacheLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_length() {
        let data = vec![0.0f32; 10];
        assert!(KvCacheView::new(&data, 2, 2, 4, CacheLayout::Nhd).is_err());
    }

    #[test]
    fn test_nhd_row_offsets() {
        // seq=3, heads=2, dim=4: pos-major
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let view = KvCacheView::new(&data, 3, 2, 4, CacheLayout::Nhd).unwrap();
        assert_eq!(view.row_offset(0, 0), 0);
        assert_eq!(view.row_offset(0, 1), 4);
        assert_eq!(view.row_offset(1, 0), 8);
        assert_eq!(view.row_offset(2, 1), 20);
    }

    #[test]
    fn test_hnd_row_offsets() {
        // seq=3, heads=2, dim=4: head-major
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let view = KvCacheView::new(&data, 3, 2, 4, CacheLayout::Hnd).unwrap();
        assert_eq!(view.row_offset(0, 0), 0);
        assert_eq!(view.row_offset(1, 0), 4);
        assert_eq!(view.row_offset(0, 1), 12);
        assert_eq!(view.row_offset(2, 1), 20);
    }

    #[test]
    fn test_layouts_address_same_logical_row() {
        // Fill both layouts from the same logical (pos, head, feat) tensor
        // and check the views agree.
        let (s, h, d) = (4, 3, 2);
        let logical = |pos: usize, head: usize, feat: usize| (pos * 100 + head * 10 + feat) as f32;

        let mut nhd = vec![0.0f32; s * h * d];
        let mut hnd = vec![0.0f32; s * h * d];
        for pos in 0..s {
            for head in 0..h {
                for feat in 0..d {
                    nhd[(pos * h + head) * d + feat] = logical(pos, head, feat);
                    hnd[(head * s + pos) * d + feat] = logical(pos, head, feat);
                }
            }
        }

        let vn = KvCacheView::new(&nhd, s, h, d, CacheLayout::Nhd).unwrap();
        let vh = KvCacheView::new(&hnd, s, h, d, CacheLayout::Hnd).unwrap();
        for pos in 0..s {
            for head in 0..h {
                let on = vn.row_offset(pos, head);
                let oh = vh.row_offset(pos, head);
                assert_eq!(vn.data()[on..on + d], vh.data()[oh..oh + d]);
            }
        }
    }

    #[test]
    fn test_heads_per_group_scaling() {
        assert_eq!(CacheLayout::Nhd.heads_per_group(64), 8);
        assert_eq!(CacheLayout::Nhd.heads_per_group(128), 4);
        assert_eq!(CacheLayout::Nhd.heads_per_group(256), 2);
        assert_eq!(CacheLayout::Hnd.heads_per_group(64), 1);
        assert_eq!(CacheLayout::Hnd.heads_per_group(256), 1);
    }

    #[test]
    fn test_groups_per_chunk_ragged_heads() {
        // 10 heads at dim 128 under NHD: blocks of 4 -> 3 groups
        assert_eq!(CacheLayout::Nhd.groups_per_chunk(10, 128), 3);
        assert_eq!(CacheLayout::Hnd.groups_per_chunk(10, 128), 10);
    }
}
