//! Execution Context - Allocation and Execution Domains
//!
//! A [`Context`] is the handle through which memory is allocated and work is
//! scheduled on one device. Regions and higher-level buffers share contexts
//! through [`ContextPtr`]; a context lives until its last referent drops it.
//!
//! Contexts are also the integration point with foreign tensor runtimes: an
//! adapter only has to implement [`Context`] to have its memory managed by
//! [`Region`](crate::region::Region) and its devices driven by the dispatcher.
//!
//! # Example
//! ```rust
//! use hetero_core::context::{host_context, memory_copy_kind, MemoryCopyKind};
//!
//! let host = host_context();
//! assert!(host.is_compatible(host.as_ref()));
//! assert_eq!(
//!     memory_copy_kind(host.as_ref(), host.as_ref()).unwrap(),
//!     MemoryCopyKind::HostToHost
//! );
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::allocator::{AllocatorStats, DeleterToken};
use crate::backends::{AcceleratorContext, AcceleratorDevice, HostContext};
use crate::config::RuntimeConfig;
use crate::device::{DeviceCapabilities, DeviceKind, HOST_DEVICE_ID};
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::stream_override;

/// Shared handle to a context.
pub type ContextPtr = Arc<dyn Context>;

// =============================================================================
// Context Trait
// =============================================================================

/// One allocation and execution domain, such as host memory or accelerator N.
pub trait Context: Send + Sync + fmt::Debug {
    /// Returns the kind of device this context allocates on and runs work on.
    fn device_kind(&self) -> DeviceKind;

    /// Returns the physical device index; host contexts return -1.
    fn device_id(&self) -> i32 {
        HOST_DEVICE_ID
    }

    /// Returns the stream work on this context is ordered on.
    ///
    /// `None` is the invalid-stream value reported by host contexts.
    fn stream(&self) -> Option<Stream> {
        None
    }

    /// Allocates `bytes` bytes on this device.
    ///
    /// Zero bytes is legal and yields a null pointer. Memory is aligned at
    /// least as strictly as the system allocator's.
    fn allocate(&self, bytes: usize) -> Result<(*mut u8, DeleterToken)>;

    /// Releases memory obtained from [`Context::allocate`]; null is ignored.
    ///
    /// # Safety
    /// `data` must be null or a live block allocated by this context (or a
    /// context compatible with it that shares its allocator), and `token`
    /// must be the token returned with it. The block must not be used after.
    unsafe fn deallocate(&self, data: *mut u8, token: DeleterToken);

    /// Returns true iff `other` addresses the same physical memory space.
    ///
    /// Must be reflexive.
    fn is_compatible(&self, other: &dyn Context) -> bool {
        same_memory_space(self.device_kind(), self.device_id(), other)
    }

    /// Blocks until all work enqueued on this context's stream has completed.
    ///
    /// No-op on host contexts. Reports asynchronous device faults.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Returns a host context for staging transfers from this device.
    fn host_context(&self) -> ContextPtr;

    /// Returns a host context whose memory is optimised for device transfers.
    fn pinned_context(&self) -> ContextPtr;

    /// Returns the device's capabilities.
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            name: format!("{}:{}", self.device_kind(), self.device_id()),
            kind: self.device_kind(),
            total_memory: 0,
            available_memory: 0,
            max_threads_per_block: 1,
            compute_units: 1,
        }
    }

    /// Returns the allocator's usage counters.
    fn memory_stats(&self) -> AllocatorStats {
        AllocatorStats::default()
    }
}

/// Compatibility rule shared by the built-in contexts: same kind, same index.
pub(crate) fn same_memory_space(kind: DeviceKind, device_id: i32, other: &dyn Context) -> bool {
    kind == other.device_kind() && device_id == other.device_id()
}

// =============================================================================
// Memory Copy Routing
// =============================================================================

/// Direction of a memory transfer between two contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryCopyKind {
    /// Host memory to host memory.
    HostToHost,
    /// Host memory to accelerator memory.
    HostToDevice,
    /// Accelerator memory to host memory.
    DeviceToHost,
    /// Accelerator memory to accelerator memory.
    DeviceToDevice,
}

impl MemoryCopyKind {
    /// Returns true if either side of the transfer is accelerator memory.
    #[must_use]
    pub const fn touches_device(self) -> bool {
        !matches!(self, Self::HostToHost)
    }
}

/// Classifies a transfer from `src` memory to `dst` memory.
pub fn memory_copy_kind(src: &dyn Context, dst: &dyn Context) -> Result<MemoryCopyKind> {
    match (src.device_kind(), dst.device_kind()) {
        (DeviceKind::Host, DeviceKind::Host) => Ok(MemoryCopyKind::HostToHost),
        (DeviceKind::Host, DeviceKind::Accelerator) => Ok(MemoryCopyKind::HostToDevice),
        (DeviceKind::Accelerator, DeviceKind::Host) => Ok(MemoryCopyKind::DeviceToHost),
        (DeviceKind::Accelerator, DeviceKind::Accelerator) => Ok(MemoryCopyKind::DeviceToDevice),
        (src, dst) => Err(Error::UnsupportedTransfer { src, dst }),
    }
}

/// Waits for work outstanding on an accelerator context's native stream and
/// on this thread's effective stream for it.
///
/// Faults raised by that work stay pending for the next synchronize. Contexts
/// that expose no stream are synchronized instead.
pub(crate) fn settle(context: &dyn Context) -> Result<()> {
    if !context.device_kind().is_accelerator() {
        return Ok(());
    }
    let Some(native) = context.stream() else {
        return context.synchronize();
    };
    native.drain();
    if let Some(effective) = stream_override::current_override() {
        if effective != native {
            effective.drain();
        }
    }
    Ok(())
}

/// Copies `count` bytes from `src` (in `src_ctx` memory) to `dst` (in `dst_ctx`).
///
/// Transfers touching an accelerator first wait for in-flight work on the
/// involved devices, so the copy never races a kernel. Faults raised by that
/// work are not reported here; the next [`Context::synchronize`] returns them.
///
/// # Safety
/// `src` must be valid for `count` reads, `dst` for `count` writes, and the
/// two ranges must not overlap.
pub unsafe fn memory_copy(
    src_ctx: &dyn Context,
    dst_ctx: &dyn Context,
    dst: *mut u8,
    src: *const u8,
    count: usize,
) -> Result<()> {
    let kind = memory_copy_kind(src_ctx, dst_ctx)?;
    if count == 0 {
        return Ok(());
    }
    if kind.touches_device() {
        settle(src_ctx)?;
        settle(dst_ctx)?;
    }
    copy_settled(src_ctx, dst_ctx, dst, src, count)
}

/// Like [`memory_copy`], for callers that already settled both contexts.
///
/// # Safety
/// Same contract as [`memory_copy`].
pub(crate) unsafe fn copy_settled(
    src_ctx: &dyn Context,
    dst_ctx: &dyn Context,
    dst: *mut u8,
    src: *const u8,
    count: usize,
) -> Result<()> {
    let kind = memory_copy_kind(src_ctx, dst_ctx)?;
    if count == 0 {
        return Ok(());
    }
    debug!(?kind, count, "memory copy");
    std::ptr::copy_nonoverlapping(src, dst, count);
    Ok(())
}

// =============================================================================
// Context Factories
// =============================================================================

/// Returns the process-wide host context.
pub fn host_context() -> ContextPtr {
    static HOST: OnceLock<ContextPtr> = OnceLock::new();
    Arc::clone(HOST.get_or_init(|| Arc::new(HostContext::new())))
}

/// Returns the process-wide pinned host context.
pub fn pinned_host_context() -> ContextPtr {
    static PINNED: OnceLock<ContextPtr> = OnceLock::new();
    Arc::clone(PINNED.get_or_init(|| Arc::new(HostContext::pinned())))
}

/// Returns the number of accelerator devices.
pub fn accelerator_count() -> usize {
    RuntimeConfig::global().num_accelerators
}

/// Returns the cached context of accelerator `device_id`; -1 picks one.
///
/// Callers must not rely on identity across calls, only on
/// [`Context::is_compatible`].
pub fn accelerator_context(device_id: i32) -> Result<ContextPtr> {
    static CONTEXTS: OnceLock<Mutex<HashMap<i32, ContextPtr>>> = OnceLock::new();

    let resolved = if device_id == -1 { 0 } else { device_id };
    let device = AcceleratorDevice::get(resolved).map_err(|_| Error::DeviceNotAvailable { device_id })?;

    let mut contexts = CONTEXTS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(context) = contexts.get(&resolved) {
        return Ok(Arc::clone(context));
    }
    let context: ContextPtr = Arc::new(AcceleratorContext::new(device)?);
    contexts.insert(resolved, Arc::clone(&context));
    Ok(context)
}

// =============================================================================
// Multi-Object Helpers
// =============================================================================

/// Anything that lives in a context.
pub trait HasContext {
    /// Returns the owning context.
    fn context(&self) -> &ContextPtr;
}

impl HasContext for ContextPtr {
    fn context(&self) -> &ContextPtr {
        self
    }
}

/// Returns true if `a` and `b` may be operated on together without a copy.
pub fn is_compatible<A, B>(a: &A, b: &B) -> bool
where
    A: HasContext + ?Sized,
    B: HasContext + ?Sized,
{
    a.context().is_compatible(b.context().as_ref())
}

/// Returns the context of the first item after checking all are compatible.
pub fn common_context(items: &[&dyn HasContext]) -> Result<ContextPtr> {
    let (first, rest) = items
        .split_first()
        .ok_or_else(|| Error::contract_violation("common_context needs at least one item"))?;
    let ans = first.context();
    for item in rest {
        let other = item.context();
        if !ans.is_compatible(other.as_ref()) {
            return Err(Error::IncompatibleContexts {
                first: format!("{}:{}", ans.device_kind(), ans.device_id()),
                second: format!("{}:{}", other.device_kind(), other.device_id()),
            });
        }
    }
    Ok(Arc::clone(ans))
}

/// Returns the device kind of whatever `item` lives on.
pub fn device_of<T: HasContext + ?Sized>(item: &T) -> DeviceKind {
    item.context().device_kind()
}

// =============================================================================
// Tests
// =============================================================================
