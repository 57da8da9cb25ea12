//! Host Backend - System Memory Contexts
//!
//! Provides the host implementation of [`Context`]. Host contexts allocate
//! system memory, execute dispatched work synchronously on the calling thread,
//! and report the invalid-stream value.
//!
//! The pinned variant requests memory meant for fast device transfers. The
//! emulated accelerators share the host address space, so pinned memory is
//! ordinary aligned system memory accounted separately.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use crate::allocator::{Allocator, AllocatorStats, DeleterToken, HostAllocator};
use crate::context::{self, Context, ContextPtr};
use crate::device::{DeviceCapabilities, DeviceKind};
use crate::error::Result;

// =============================================================================
// Host Context Struct
// =============================================================================

/// Context for work on the host CPU.
#[derive(Debug, Default)]
pub struct HostContext {
    pinned: bool,
    allocator: HostAllocator,
}

impl HostContext {
    /// Creates a new host context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new host context that allocates pinned memory.
    #[must_use]
    pub fn pinned() -> Self {
        Self {
            pinned: true,
            allocator: HostAllocator::new(),
        }
    }

    /// Returns true if this context allocates pinned memory.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }
}

// =============================================================================
// Context Trait Implementation
// =============================================================================

impl Context for HostContext {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn allocate(&self, bytes: usize) -> Result<(*mut u8, DeleterToken)> {
        self.allocator.allocate(bytes)
    }

    unsafe fn deallocate(&self, data: *mut u8, token: DeleterToken) {
        self.allocator.deallocate(data, token);
    }

    fn host_context(&self) -> ContextPtr {
        context::host_context()
    }

    fn pinned_context(&self) -> ContextPtr {
        context::pinned_host_context()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::host();
        if self.pinned {
            caps.name = "host (pinned)".to_string();
        }
        caps
    }

    fn memory_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================
