//! Device Abstraction - Execution Domain Classification
//!
//! Classifies every execution context as host, accelerator, or unknown. The
//! classification decides where dispatched work runs and how memory copies
//! between two contexts are routed.
//!
//! # Example
//! ```rust
//! use hetero_core::DeviceKind;
//!
//! let kind = DeviceKind::Host;
//! assert!(kind.is_host());
//! assert_eq!(kind.to_string(), "host");
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Device id reported by every host context.
pub const HOST_DEVICE_ID: i32 = -1;

// =============================================================================
// DeviceKind Enum
// =============================================================================

/// The kind of execution domain a context represents.
///
/// Assigned once when a context is created and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Not classified; transfers involving it are rejected.
    #[default]
    Unknown,
    /// Asynchronous, stream-ordered device.
    Accelerator,
    /// Synchronous CPU-like device.
    Host,
}

impl DeviceKind {
    /// Returns true if this is a host device.
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }

    /// Returns true if this is an accelerator device.
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Accelerator)
    }

    /// Returns the name of this device kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Accelerator => "accelerator",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Device Capabilities
// =============================================================================

/// Information about a device's capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Name of the device.
    pub name: String,
    /// Kind of the device.
    pub kind: DeviceKind,
    /// Total memory in bytes.
    pub total_memory: usize,
    /// Available memory in bytes.
    pub available_memory: usize,
    /// Maximum threads per block for kernel launches.
    pub max_threads_per_block: usize,
    /// Number of units that execute blocks concurrently.
    pub compute_units: usize,
}

impl DeviceCapabilities {
    /// Returns the capabilities of the host.
    #[must_use]
    pub fn host() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            name: "host".to_string(),
            kind: DeviceKind::Host,
            total_memory: sys.total_memory() as usize,
            available_memory: sys.available_memory() as usize,
            max_threads_per_block: 1,
            compute_units: num_cpus(),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Returns the number of CPU cores.
#[must_use]
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

// =============================================================================
// Tests
// =============================================================================
