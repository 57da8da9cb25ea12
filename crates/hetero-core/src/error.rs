//! Error Types - Runtime Error Handling
//!
//! Provides the error type shared by every layer of the runtime: allocation,
//! memory transfer, work dispatch, asynchronous device execution, and the
//! scoped stream-override discipline.
//!
//! # Key Features
//! - Unified error type for all runtime operations
//! - Device context attached to allocation and fault errors
//! - Integration with `std::error::Error`
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

use crate::device::DeviceKind;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for runtime operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The device allocator could not satisfy a request.
    #[error("Memory allocation failed: requested {size} bytes on {device} ({reason})")]
    AllocationFailed {
        /// The requested size in bytes.
        size: usize,
        /// The kind of device on which allocation failed.
        device: DeviceKind,
        /// Why the allocator rejected the request.
        reason: String,
    },

    /// A memory copy between two device kinds could not be classified.
    #[error("Unsupported memory transfer from {src} to {dst}")]
    UnsupportedTransfer {
        /// Device kind of the source context.
        src: DeviceKind,
        /// Device kind of the destination context.
        dst: DeviceKind,
    },

    /// Work could not be enqueued (malformed launch parameters, dead stream).
    #[error("Dispatch failed: {message}")]
    DispatchFailed {
        /// Description of the dispatch failure.
        message: String,
    },

    /// Asynchronous device work failed; surfaced at a later synchronize.
    #[error("Device fault on accelerator {device_id}: {message}")]
    DeviceFault {
        /// Device the faulting stream belongs to.
        device_id: i32,
        /// Description of the first fault observed.
        message: String,
    },

    /// Caller broke an API contract (mismatched override pop, negative count).
    #[error("Contract violation: {message}")]
    ContractViolation {
        /// Description of the violated contract.
        message: String,
    },

    /// An accelerator with the requested id does not exist.
    #[error("Device not available: accelerator {device_id}")]
    DeviceNotAvailable {
        /// The requested device id.
        device_id: i32,
    },

    /// Two contexts that must share a memory space do not.
    #[error("Incompatible contexts: {first} and {second}")]
    IncompatibleContexts {
        /// Description of the first context.
        first: String,
        /// Description of the second context.
        second: String,
    },

    /// One or more background units panicked.
    #[error("{failed} background task(s) failed")]
    BackgroundTaskFailed {
        /// Number of units that panicked since the last wait.
        failed: usize,
    },

    /// Runtime configuration was rejected.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration problem.
        message: String,
    },
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for runtime operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Helper Functions
// =============================================================================

impl Error {
    /// Creates a new allocation failure error.
    #[must_use]
    pub fn allocation(size: usize, device: DeviceKind, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            size,
            device,
            reason: reason.into(),
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::DispatchFailed {
            message: message.into(),
        }
    }

    /// Creates a new contract violation error.
    #[must_use]
    pub fn contract_violation(message: impl Into<String>) -> Self {
        Self::ContractViolation {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true for errors that only surface after asynchronous execution.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::DeviceFault { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::allocation(1024, DeviceKind::Accelerator, "budget exhausted");
        let msg = err.to_string();
        assert!(msg.contains("1024 bytes"));
        assert!(msg.contains("accelerator"));
    }

    #[test]
    fn test_unsupported_transfer_display() {
        let err = Error::UnsupportedTransfer {
            src: DeviceKind::Unknown,
            dst: DeviceKind::Host,
        };
        assert_eq!(
            err.to_string(),
            "Unsupported memory transfer from unknown to host"
        );
    }

    #[test]
    fn test_error_equality() {
        let err1 = Error::contract_violation("pop");
        let err2 = Error::contract_violation("pop");
        assert_eq!(err1, err2);
        assert!(!err1.is_deferred());
    }

    #[test]
    fn test_device_fault_is_deferred() {
        let err = Error::DeviceFault {
            device_id: 0,
            message: "boom".to_string(),
        };
        assert!(err.is_deferred());
    }
}
