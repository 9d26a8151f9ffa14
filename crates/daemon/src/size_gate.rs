//! Size Gate Module
//!
//! Pre-admission check that an input file's size lies within the configured bounds.

use serde::{Deserialize, Serialize};

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Input size is within bounds
    Accept,
    /// Input is below the minimum size
    TooSmall { size_bytes: u64, min_bytes: u64 },
    /// Input is above the maximum size
    TooLarge { size_bytes: u64, max_bytes: u64 },
}

impl SizeGateResult {
    /// Human-readable rejection reason, `None` when accepted
    pub fn reason(&self) -> Option<String> {
        match self {
            SizeGateResult::Accept => None,
            SizeGateResult::TooSmall {
                size_bytes,
                min_bytes,
            } => Some(format!(
                "Input file too small: {} bytes (minimum {} bytes)",
                size_bytes, min_bytes
            )),
            SizeGateResult::TooLarge {
                size_bytes,
                max_bytes,
            } => Some(format!(
                "Input file too large: {} bytes (maximum {} bytes)",
                size_bytes, max_bytes
            )),
        }
    }
}

/// Check whether an input of `size_bytes` passes the size gate.
///
/// Both bounds are inclusive: `min_bytes <= size_bytes <= max_bytes` is accepted.
pub fn check_size_gate(size_bytes: u64, min_bytes: u64, max_bytes: u64) -> SizeGateResult {
    if size_bytes < min_bytes {
        SizeGateResult::TooSmall {
            size_bytes,
            min_bytes,
        }
    } else if size_bytes > max_bytes {
        SizeGateResult::TooLarge {
            size_bytes,
            max_bytes,
        }
    } else {
        SizeGateResult::Accept
    }
}
