//! Launch configuration chooser
//!
//! Host-side policy that turns `(seq_len, num_heads, head_dim, layout)` and
//! the device's occupancy limits into a chunk grid. The whole grid must be
//! co-resident: the cross-group reduction is one-shot, so no chunk may be
//! scheduled after another has already finished. A grid that cannot fit is a
//! hard launch-precondition failure, not a soft preference.

use serde::{Deserialize, Serialize};

use crate::error::{AtenderError, Result};
use crate::layout::CacheLayout;

/// Smallest chunk the pipeline is worth spinning up for
pub const CHUNK_FLOOR: usize = 64;

/// Device occupancy limits, as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Number of compute units on the device
    pub compute_units: usize,
    /// Maximum groups resident per compute unit
    pub max_groups_per_unit: usize,
}

impl DeviceLimits {
    /// Total groups the device can host simultaneously
    #[must_use]
    pub fn max_resident_groups(&self) -> usize {
        self.compute_units * self.max_groups_per_unit
    }

    /// Limits derived from the host's available parallelism, for running the
    /// kernel on CPU threads.
    ///
    /// # Errors
    ///
    /// Returns [`AtenderError::DeviceQuery`] if the parallelism query fails.
    pub fn host() -> Result<Self> {
        let units = std::thread::available_parallelism()
            .map_err(|e| AtenderError::DeviceQuery {
                reason: format!("available_parallelism: {e}"),
            })?
            .get();
        Ok(Self {
            compute_units: units,
            max_groups_per_unit: 16,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.compute_units == 0 || self.max_groups_per_unit == 0 {
            return Err(AtenderError::DeviceQuery {
                reason: format!(
                    "device reports {} units x {} groups/unit",
                    self.compute_units, self.max_groups_per_unit
                ),
            });
        }
        Ok(())
    }
}

/// Chosen chunk grid for one decode launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Sequence positions per chunk
    pub chunk_size: usize,
    /// Number of contiguous chunks the sequence is split into
    pub num_chunks: usize,
    /// Groups the grid occupies (`num_chunks * groups_per_chunk`)
    pub total_groups: usize,
}

/// Largest chunk a single group streams under the given layout. HND groups
/// dedicate all their lanes to one head and keep a larger sequence window;
/// NHD groups split lanes across a head block, so their window is capped
/// higher to compensate for the shallower per-head pipeline.
#[must_use]
pub fn chunk_ceiling(layout: CacheLayout) -> usize {
    match layout {
        CacheLayout::Nhd => 512,
        CacheLayout::Hnd => 256,
    }
}

/// Pick a chunk size and grid shape for the launch.
///
/// Starts at [`CHUNK_FLOOR`] and doubles until the grid fits the device's
/// resident-group budget or the per-layout ceiling is hit.
///
/// # Errors
///
/// [`AtenderError::InvalidShape`] for an empty sequence,
/// [`AtenderError::DeviceQuery`] for unusable limits, and
/// [`AtenderError::LaunchPrecondition`] when even ceiling-sized chunks need
/// more resident groups than the device hosts.
pub fn choose(
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
    layout: CacheLayout,
    limits: &DeviceLimits,
) -> Result<LaunchConfig> {
    if seq_len == 0 || num_heads == 0 {
        return Err(AtenderError::InvalidShape {
            reason: format!("seq_len {seq_len} and num_heads {num_heads} must be > 0"),
        });
    }
    limits.validate()?;

    let max_resident = limits.max_resident_groups();
    let groups_per_chunk = layout.groups_per_chunk(num_heads, head_dim);
    let ceiling = chunk_ceiling(layout);

    let mut chunk_size = CHUNK_FLOOR;
    loop {
        let num_chunks = seq_len.div_ceil(chunk_size);
        let total_groups = num_chunks * groups_per_chunk;
        if total_groups <= max_resident {
            let config = LaunchConfig {
                chunk_size,
                num_chunks,
                total_groups,
            };
            tracing::debug!(
                seq_len,
                num_heads,
                head_dim,
                ?layout,
                chunk_size = config.chunk_size,
                num_chunks = config.num_chunks,
                total_groups = config.total_groups,
                "chose decode launch configuration"
            );
            return Ok(config);
        }
        if chunk_size >= ceiling {
            return Err(AtenderError::LaunchPrecondition {
                required_groups: seq_len.div_ceil(ceiling) * groups_per_chunk,
                max_resident_groups: max_resident,
            });
        }
        chunk_size = (chunk_size * 2).min(ceiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: DeviceLimits = DeviceLimits {
        compute_units: 8,
        max_groups_per_unit: 8,
    };

    #[test]
    fn test_short_sequence_uses_floor_chunk() {
        let config = choose(100, 8, 64, CacheLayout::Nhd, &LIMITS).unwrap();
        assert_eq!(config.chunk_size, CHUNK_FLOOR);
        assert_eq!(config.num_chunks, 2);
    }

    #[test]
    fn test_chunk_grows_to_fit_budget() {
        // HND, 32 heads: 32 groups per chunk, budget 64 -> at most 2 chunks.
        // seq 512 needs chunk 256 (the HND ceiling).
        let config = choose(512, 32, 128, CacheLayout::Hnd, &LIMITS).unwrap();
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.num_chunks, 2);
        assert_eq!(config.total_groups, 64);
    }

    #[test]
    fn test_over_budget_is_precondition_error() {
        // HND, 64 heads, seq 4096: ceil(4096/256) * 64 = 1024 groups > 64
        let err = choose(4096, 64, 128, CacheLayout::Hnd, &LIMITS).unwrap_err();
        match err {
            AtenderError::LaunchPrecondition {
                required_groups,
                max_resident_groups,
            } => {
                assert_eq!(required_groups, 1024);
                assert_eq!(max_resident_groups, 64);
            },
            other => panic!("expected LaunchPrecondition, got {other:?}"),
        }
    }

    #[test]
    fn test_boundary_exact_grid_accepted() {
        // Exactly the budget: 64 chunks x 1 group (NHD, 1 head at dim 64)
        let config = choose(64 * CHUNK_FLOOR, 1, 64, CacheLayout::Nhd, &LIMITS).unwrap();
        assert_eq!(config.total_groups, 64);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let bad = DeviceLimits {
            compute_units: 0,
            max_groups_per_unit: 8,
        };
        assert!(matches!(
            choose(128, 4, 64, CacheLayout::Nhd, &bad),
            Err(AtenderError::DeviceQuery { .. })
        ));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(choose(0, 4, 64, CacheLayout::Nhd, &LIMITS).is_err());
    }
}
