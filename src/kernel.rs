//! Fused decode attention kernel
//!
//! One launch computes attention for a single generated token: per head,
//! the scaled dot products between the (rotated) query and every cached key,
//! an online-softmax reduction over them, and the weighted sum of cached
//! values. The sequence is split into contiguous chunks, one parallel group
//! per chunk (per head block); each group streams its chunk through the
//! staged tile pipeline and publishes one converged running state to the
//! scratch buffer.
//!
//! Cross-group reduction runs as two dependent phases with the scratch
//! buffer as the hand-off (the message-passing redesign of a device-wide
//! barrier): phase A produces every `(head, chunk)` partial in parallel,
//! phase B merges each head's partials in chunk order — the merge rule is
//! associative and commutative, so the order is observationally irrelevant —
//! normalizes exactly once and writes the output row.

use rayon::prelude::*;

use crate::error::Result;
use crate::layout::KvCacheView;
use crate::pipeline::{TileRing, TILE_ROWS};
use crate::rope::RotaryEmbedding;
use crate::scratch::DecodeScratch;
use crate::state::RunningState;
use crate::vector::{Element, LaneVec};
use crate::LaunchConfig;

/// Lane-subgroups cooperating on one chunk. Each holds an independent
/// running state over an interleaved share of the chunk's rows; the
/// intra-group merge folds them back together.
pub(crate) const NUM_SUBGROUPS: usize = 4;

/// Stream one chunk of the key/value sequence for one head.
///
/// Implements the score and accumulation stages over the staged pipeline,
/// then the intra-group synchronization that merges the per-subgroup states
/// into the group's converged state.
fn process_chunk<T: Element, const D: usize>(
    q: &LaneVec<D>,
    keys: &KvCacheView<'_, T>,
    values: &KvCacheView<'_, T>,
    head: usize,
    start: usize,
    end: usize,
    rotary: Option<&RotaryEmbedding>,
    scale: f32,
) -> RunningState<D> {
    let mut ring = TileRing::<D>::new();
    let mut states = [RunningState::<D>::new(); NUM_SUBGROUPS];
    let num_tiles = (end - start).div_ceil(TILE_ROWS);

    let mut k_tokens = std::collections::VecDeque::with_capacity(2);
    let mut v_tokens = std::collections::VecDeque::with_capacity(2);

    // Prime the pipeline: two key/value tile pairs in flight fills all four
    // slots, keeping the producer one tile ahead of the consumer.
    for t in 0..num_tiles.min(2) {
        let kt = ring.acquire();
        ring.issue_fetch(kt, keys, head, start + t * TILE_ROWS, end);
        ring.commit(kt);
        k_tokens.push_back(kt);

        let vt = ring.acquire();
        ring.issue_fetch(vt, values, head, start + t * TILE_ROWS, end);
        ring.commit(vt);
        v_tokens.push_back(vt);
    }

    let mut scores = [0.0f32; TILE_ROWS];
    for t in 0..num_tiles {
        // Score stage: wait for the key tile, rotate each key row at its
        // absolute position, scaled dot product with tree reduction.
        let kt = k_tokens.pop_front().expect("key tile in flight");
        ring.wait(kt);
        let base = ring.base_pos(kt);
        let valid = ring.valid_rows(kt);
        {
            let rows = ring.rows_mut(kt);
            for r in 0..valid {
                if let Some(rope) = rotary {
                    rope.apply(rows[r].as_array_mut(), base + r);
                }
                scores[r] = rows[r].dot_tree(q) * scale;
            }
        }
        ring.release(kt);
        if t + 2 < num_tiles {
            let next = ring.acquire();
            ring.issue_fetch(next, keys, head, start + (t + 2) * TILE_ROWS, end);
            ring.commit(next);
            k_tokens.push_back(next);
        }

        // Accumulation stage: fold each valid (score, value) pair into the
        // owning subgroup's state. Rows past `valid` are the ragged tail;
        // the predicate leaves every state untouched for them.
        let vt = v_tokens.pop_front().expect("value tile in flight");
        ring.wait(vt);
        {
            let rows = ring.rows(vt);
            for r in 0..valid {
                let subgroup = (t * TILE_ROWS + r) % NUM_SUBGROUPS;
                states[subgroup].fold(scores[r], &rows[r]);
            }
        }
        ring.release(vt);
        if t + 2 < num_tiles {
            let next = ring.acquire();
            ring.issue_fetch(next, values, head, start + (t + 2) * TILE_ROWS, end);
            ring.commit(next);
            v_tokens.push_back(next);
        }
    }

    // Intra-group synchronization: publish all subgroup states and merge
    // them into one converged state for the group.
    let mut converged = RunningState::<D>::new();
    for state in &states {
        converged.merge(state);
    }
    converged
}

/// Run the full two-phase decode kernel for one head dimension.
///
/// Caller guarantees (checked upstream): `q` and `out` are
/// `[num_heads, D]`, both caches are `[seq_len, num_heads, D]` in their
/// declared layout, and `scratch` matches the launch shape.
pub(crate) fn run_kernel<T: Element, const D: usize>(
    q: &[T],
    keys: &KvCacheView<'_, T>,
    values: &KvCacheView<'_, T>,
    out: &mut [T],
    scratch: &mut DecodeScratch,
    rotary: Option<&RotaryEmbedding>,
    scale: f32,
    config: &LaunchConfig,
) -> Result<()> {
    let num_heads = keys.num_heads();
    let seq_len = keys.seq_len();
    let chunk_size = config.chunk_size;
    let num_chunks = config.num_chunks;
    let heads_per_group = keys.layout().heads_per_group(D);

    // Query load + rotation happens once per head, at the position of the
    // token being generated (the last cache entry).
    let q_rot: Vec<LaneVec<D>> = (0..num_heads)
        .map(|head| {
            let mut qv = LaneVec::<D>::load_cast(q, head * D);
            if let Some(rope) = rotary {
                rope.apply(qv.as_array_mut(), seq_len - 1);
            }
            qv
        })
        .collect();

    let (partial_o, partial_m, partial_d, final_m, final_d) = scratch.views_mut();

    // Phase A: one group per (chunk, head block); every group writes its
    // converged state to a disjoint (head, chunk) scratch region. Disjointness
    // comes from index arithmetic alone — no locks.
    partial_o
        .par_chunks_mut(num_heads * D)
        .zip(partial_m.par_chunks_mut(num_heads))
        .zip(partial_d.par_chunks_mut(num_heads))
        .enumerate()
        .for_each(|(chunk_idx, ((o_row, m_row), d_row))| {
            let start = chunk_idx * chunk_size;
            let end = (start + chunk_size).min(seq_len);
            for block_start in (0..num_heads).step_by(heads_per_group) {
                let block_end = (block_start + heads_per_group).min(num_heads);
                for head in block_start..block_end {
                    let state = process_chunk::<T, D>(
                        &q_rot[head],
                        keys,
                        values,
                        head,
                        start,
                        end,
                        rotary,
                        scale,
                    );
                    state.o.store(o_row, head * D);
                    m_row[head] = state.m;
                    d_row[head] = state.d;
                }
            }
        });

    // Phase B: the consume phase. Per head, re-read every chunk's partial,
    // merge iteratively, normalize exactly once (partials are never
    // pre-divided) and write the output row plus the final (m, d).
    let partial_o = &partial_o[..];
    let partial_m = &partial_m[..];
    let partial_d = &partial_d[..];
    out.par_chunks_mut(D)
        .zip(final_m.par_iter_mut())
        .zip(final_d.par_iter_mut())
        .enumerate()
        .for_each(|(head, ((out_row, fm), fd))| {
            let mut acc = RunningState::<D>::new();
            for chunk in 0..num_chunks {
                let md = chunk * num_heads + head;
                let partial = RunningState::<D> {
                    o: LaneVec::load(partial_o, md * D),
                    m: partial_m[md],
                    d: partial_d[md],
                };
                acc.merge(&partial);
            }
            acc.normalized().store_cast(out_row, 0);
            *fm = acc.m;
            *fd = acc.d;
        });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CacheLayout;

    fn fill(n: usize, f: impl Fn(usize) -> f32) -> Vec<f32> {
        (0..n).map(f).collect()
    }

    /// Unchunked, unstaged reference fold over the whole sequence
    fn reference_head<const D: usize>(
        q: &LaneVec<D>,
        keys: &KvCacheView<'_, f32>,
        values: &KvCacheView<'_, f32>,
        head: usize,
        scale: f32,
    ) -> Vec<f32> {
        let mut state = RunningState::<D>::new();
        for pos in 0..keys.seq_len() {
            let k = LaneVec::<D>::load(keys.data(), keys.row_offset(pos, head));
            let v = LaneVec::<D>::load(values.data(), values.row_offset(pos, head));
            let score = k.dot_tree(q) * scale;
            state.fold(score, &v);
        }
        state.normalized().as_array().to_vec()
    }

    #[test]
    fn test_single_position_returns_value_row() {
        // seq_len = 1: softmax of one element is 1, output == value row
        let q = fill(64, |i| (i as f32 * 0.1).sin());
        let k = fill(64, |i| (i as f32 * 0.2).cos());
        let v = fill(64, |i| i as f32 * 0.25 - 3.0);

        let keys = KvCacheView::new(&k, 1, 1, 64, CacheLayout::Nhd).unwrap();
        let values = KvCacheView::new(&v, 1, 1, 64, CacheLayout::Nhd).unwrap();
        let mut out = vec![0.0f32; 64];
        let mut scratch = DecodeScratch::new(1, 1, 64);
        let config = LaunchConfig {
            chunk_size: 64,
            num_chunks: 1,
            total_groups: 1,
        };

        run_kernel::<f32, 64>(
            &q,
            &keys,
            &values,
            &mut out,
            &mut scratch,
            None,
            0.125,
            &config,
        )
        .unwrap();

        for (o, expected) in out.iter().zip(v.iter()) {
            assert!((o - expected).abs() < 1e-6, "out={o} expected={expected}");
        }
    }

    #[test]
    fn test_chunked_matches_reference_129() {
        // 129 positions at chunk 64 -> chunks of 64, 64, 1
        let seq_len = 129;
        let q_data = fill(64, |i| ((i as f32) * 0.3).sin());
        let k_data = fill(seq_len * 64, |i| ((i as f32) * 0.017).cos());
        let v_data = fill(seq_len * 64, |i| ((i as f32) * 0.011 + 0.4).sin());

        let keys = KvCacheView::new(&k_data, seq_len, 1, 64, CacheLayout::Nhd).unwrap();
        let values = KvCacheView::new(&v_data, seq_len, 1, 64, CacheLayout::Nhd).unwrap();
        let scale = (64.0f32).sqrt().recip();

        let mut out = vec![0.0f32; 64];
        let mut scratch = DecodeScratch::new(1, 3, 64);
        let config = LaunchConfig {
            chunk_size: 64,
            num_chunks: 3,
            total_groups: 3,
        };
        run_kernel::<f32, 64>(
            &q_data,
            &keys,
            &values,
            &mut out,
            &mut scratch,
            None,
            scale,
            &config,
        )
        .unwrap();

        let q = LaneVec::<64>::load(&q_data, 0);
        let expected = reference_head(&q, &keys, &values, 0, scale);
        for (o, e) in out.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-5, "out={o} expected={e}");
        }
    }

    #[test]
    fn test_finals_published_once() {
        // d must equal the true exp-sum, not a renormalized one
        let seq_len = 40;
        let q = fill(64, |_| 0.1);
        let k = fill(seq_len * 64, |i| (i % 5) as f32 * 0.02);
        let v = fill(seq_len * 64, |_| 1.0);

        let keys = KvCacheView::new(&k, seq_len, 1, 64, CacheLayout::Nhd).unwrap();
        let values = KvCacheView::new(&v, seq_len, 1, 64, CacheLayout::Nhd).unwrap();
        let mut out = vec![0.0f32; 64];
        let mut scratch = DecodeScratch::new(1, 1, 64);
        let config = LaunchConfig {
            chunk_size: 64,
            num_chunks: 1,
            total_groups: 1,
        };
        run_kernel::<f32, 64>(&q, &keys, &values, &mut out, &mut scratch, None, 0.125, &config)
            .unwrap();

        let (final_m, final_d) = scratch.finals();
        assert!(final_m[0].is_finite());
        // All values are 1.0, so the normalized output is exactly 1.0
        // regardless of d; d itself reflects seq_len-many exp terms.
        assert!(final_d[0] > 1.0);
        for o in &out {
            assert!((o - 1.0).abs() < 1e-5);
        }
    }
}
