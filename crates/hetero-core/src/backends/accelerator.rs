//! Accelerator Backend - Stream-Ordered Device Contexts
//!
//! Provides the accelerator implementation of [`Context`]. Each device owns a
//! budgeted allocator; each context on a device owns an execution stream.
//! Work dispatched to an accelerator context is enqueued on its stream and the
//! call returns immediately; [`Context::synchronize`] waits for it.
//!
//! # Key Features
//! - Per-device memory budget with usage accounting
//! - Asynchronous, in-order execution per stream
//! - Child contexts with independent streams on the same device
//! - Deferred device-fault reporting at synchronize
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::allocator::{Allocator, AllocatorStats, DeleterToken, DeviceAllocator};
use crate::config::RuntimeConfig;
use crate::context::{self, Context, ContextPtr};
use crate::device::{DeviceCapabilities, DeviceKind};
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::stream_override;

/// Threads per block supported by kernel launches.
pub const MAX_THREADS_PER_BLOCK: usize = 1024;

// =============================================================================
// Accelerator Device
// =============================================================================

/// One physical accelerator: an index and the allocator for its memory.
#[derive(Debug)]
pub struct AcceleratorDevice {
    id: i32,
    allocator: DeviceAllocator,
}

impl AcceleratorDevice {
    /// Creates a standalone device with its own memory budget.
    #[must_use]
    pub fn new(id: i32, memory_limit: usize) -> Self {
        info!(device_id = id, memory_limit, "initialized accelerator device");
        Self {
            id,
            allocator: DeviceAllocator::new(memory_limit),
        }
    }

    /// Returns the process-wide device with index `id`.
    pub fn get(id: i32) -> Result<Arc<Self>> {
        static DEVICES: OnceLock<Vec<Arc<AcceleratorDevice>>> = OnceLock::new();
        let devices = DEVICES.get_or_init(|| {
            let config = RuntimeConfig::global();
            (0..config.num_accelerators)
                .map(|i| Arc::new(Self::new(i as i32, config.accelerator_memory_limit)))
                .collect()
        });
        usize::try_from(id)
            .ok()
            .and_then(|index| devices.get(index))
            .cloned()
            .ok_or(Error::DeviceNotAvailable { device_id: id })
    }

    /// Returns the device index.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Returns the device's allocator.
    #[must_use]
    pub const fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }
}

// =============================================================================
// Accelerator Context Struct
// =============================================================================

/// Context for work on an accelerator, bound to one stream.
#[derive(Debug)]
pub struct AcceleratorContext {
    device: Arc<AcceleratorDevice>,
    stream: Stream,
}

impl AcceleratorContext {
    /// Creates a context on `device` with a fresh stream.
    pub fn new(device: Arc<AcceleratorDevice>) -> Result<Self> {
        let stream = Stream::new(device.id())?;
        Ok(Self { device, stream })
    }

    /// Creates a context on `device` bound to an existing stream.
    pub fn with_stream(device: Arc<AcceleratorDevice>, stream: Stream) -> Result<Self> {
        if stream.device_id() != device.id() {
            return Err(Error::contract_violation(format!(
                "stream {} belongs to accelerator {}, not {}",
                stream.id(),
                stream.device_id(),
                device.id()
            )));
        }
        Ok(Self { device, stream })
    }

    /// Creates a context on the same device with its own stream.
    ///
    /// Work on the child starts only after everything enqueued on this
    /// context's effective stream before the call has completed.
    pub fn child(&self) -> Result<ContextPtr> {
        let child = Self::new(Arc::clone(&self.device))?;
        if let Some(parent) = stream_override::resolve_stream(Some(self.stream.clone())) {
            child.stream.wait_event(&parent.record_event())?;
        }
        Ok(Arc::new(child))
    }

    /// Returns the device this context runs on.
    #[must_use]
    pub fn device(&self) -> &Arc<AcceleratorDevice> {
        &self.device
    }
}

// =============================================================================
// Context Trait Implementation
// =============================================================================

impl Context for AcceleratorContext {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn device_id(&self) -> i32 {
        self.device.id
    }

    fn stream(&self) -> Option<Stream> {
        Some(self.stream.clone())
    }

    fn allocate(&self, bytes: usize) -> Result<(*mut u8, DeleterToken)> {
        self.device.allocator.allocate(bytes)
    }

    unsafe fn deallocate(&self, data: *mut u8, token: DeleterToken) {
        self.device.allocator.deallocate(data, token);
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()?;
        match stream_override::current_override() {
            Some(effective) if effective != self.stream => effective.synchronize(),
            _ => Ok(()),
        }
    }

    fn host_context(&self) -> ContextPtr {
        context::host_context()
    }

    fn pinned_context(&self) -> ContextPtr {
        context::pinned_host_context()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let stats = self.device.allocator.stats();
        DeviceCapabilities {
            name: format!("accelerator:{}", self.device.id),
            kind: DeviceKind::Accelerator,
            total_memory: self.device.allocator.limit(),
            available_memory: self.device.allocator.limit().saturating_sub(stats.bytes_in_use),
            max_threads_per_block: MAX_THREADS_PER_BLOCK,
            compute_units: rayon::current_num_threads(),
        }
    }

    fn memory_stats(&self) -> AllocatorStats {
        self.device.allocator.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================
