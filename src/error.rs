//! Error types for the decode attention kernel
//!
//! Two failure families exist, both detected before any kernel work runs:
//! configuration errors (caller/build mismatch, e.g. an unsupported head
//! dimension) and launch-precondition errors (the device cannot host the
//! grid the configuration requires). No data errors are detected inside the
//! kernel itself — out-of-range accesses are prevented structurally by
//! validity predicates, never by runtime checks.

use thiserror::Error;

/// Error type for decode attention operations
#[derive(Debug, Error)]
pub enum AtenderError {
    /// Head dimension is not one of the compile-time specialized sizes
    #[error("Unsupported head_dim {head_dim}: expected one of 64, 128, 256")]
    UnsupportedHeadDim {
        /// The head dimension the caller requested
        head_dim: usize,
    },

    /// Tensor shape mismatch detected during input validation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Human-readable description of the mismatch
        reason: String,
    },

    /// The chunk grid needs more concurrently resident groups than the
    /// device can host, violating the one-shot reduction design
    #[error(
        "Launch precondition violated: grid needs {required_groups} resident groups, \
         device hosts at most {max_resident_groups}"
    )]
    LaunchPrecondition {
        /// Groups the chosen chunk grid requires
        required_groups: usize,
        /// Total groups the device can keep resident at once
        max_resident_groups: usize,
    },

    /// A device occupancy query returned an unusable answer
    #[error("Device query failed: {reason}")]
    DeviceQuery {
        /// Description of the failed query
        reason: String,
    },
}

/// Result type alias for decode attention operations
pub type Result<T> = std::result::Result<T, AtenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_contains_values() {
        let err = AtenderError::LaunchPrecondition {
            required_groups: 96,
            max_resident_groups: 64,
        };
        let msg = err.to_string();
        assert!(msg.contains("96"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn test_unsupported_head_dim_message() {
        let err = AtenderError::UnsupportedHeadDim { head_dim: 96 };
        assert!(err.to_string().contains("96"));
    }
}
