// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for device setup, dispatch, and output streaming.
//!
//! One enum so callers can pattern-match on failure modes rather than parse
//! strings. Only `OutOfDeviceMemory` is considered recoverable — and only by
//! the operator lowering the memory-risk fraction and rerunning; every other
//! variant is fatal and never retried.

use std::fmt;

/// Errors arising from GPU initialization, tracking, or path output.
#[derive(Debug)]
pub enum TrackError {
    /// No compatible GPU adapter was found by wgpu.
    NoAdapter,

    /// GPU device creation failed (wraps the underlying wgpu error message).
    DeviceCreation(String),

    /// The particle buffers do not fit in the remaining device-memory budget.
    ///
    /// The only recoverable condition in the pipeline: lower the memory-risk
    /// fraction and rerun.
    OutOfDeviceMemory {
        /// Bytes the requested allocation would need.
        required: u64,
        /// Bytes left in the budget.
        budget: u64,
    },

    /// A device operation (write, dispatch, read-back) failed.
    GpuCompute(String),

    /// Writing to the path output stream failed.
    PathOutput(String),

    /// Input volume or mask data is malformed.
    DataLoad(String),
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAdapter => write!(f, "No GPU adapter found"),
            Self::DeviceCreation(e) => write!(f, "Failed to create GPU device: {e}"),
            Self::OutOfDeviceMemory { required, budget } => write!(
                f,
                "Ran out of device memory while sizing particle buffers \
                 ({required} B needed, {budget} B left). Lowering the memory \
                 risk fraction (e.g. FIBERTRACE_MEMRISK=0.5) and rerunning \
                 should fix this."
            ),
            Self::GpuCompute(e) => write!(f, "GPU compute failed: {e}"),
            Self::PathOutput(e) => write!(f, "Path output failed: {e}"),
            Self::DataLoad(e) => write!(f, "Data loading failed: {e}"),
        }
    }
}

impl std::error::Error for TrackError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_adapter() {
        assert_eq!(TrackError::NoAdapter.to_string(), "No GPU adapter found");
    }

    #[test]
    fn display_out_of_memory_carries_guidance() {
        let err = TrackError::OutOfDeviceMemory {
            required: 2048,
            budget: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("2048 B"));
        assert!(msg.contains("1024 B"));
        assert!(msg.contains("FIBERTRACE_MEMRISK"));
    }

    #[test]
    fn error_trait_works() {
        let err = TrackError::GpuCompute("status read-back".into());
        let dyn_err: &dyn std::error::Error = &err;
        assert!(dyn_err.to_string().contains("status read-back"));
    }
}
