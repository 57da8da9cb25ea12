//! Allocator - Byte Allocators Behind Execution Contexts
//!
//! Provides the allocator abstraction that contexts forward their
//! `allocate`/`deallocate` calls to. Allocators are internally thread-safe so
//! a context can be shared read-only between threads.
//!
//! # Key Features
//! - Unified allocator trait for host and accelerator memory
//! - Opaque deleter tokens carrying per-block bookkeeping
//! - Byte budgets for accelerator memory
//! - Lock-free usage accounting
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::error::{Error, Result};

/// Alignment of every block handed out by the allocators in this module.
pub const ALIGNMENT: usize = 64;

// =============================================================================
// Deleter Token
// =============================================================================

/// Opaque bookkeeping an allocator needs, besides the pointer, to free a block.
///
/// Whatever `allocate` returned must be passed back to `deallocate`. Tokens
/// from foreign allocators may carry anything that fits in a `usize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeleterToken(usize);

impl DeleterToken {
    /// The empty token, used for null allocations.
    pub const EMPTY: Self = Self(0);

    /// Wraps an allocator-specific value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the wrapped value.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns true if this token carries no information.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// Allocator Statistics
// =============================================================================

/// Snapshot of an allocator's usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Bytes currently allocated.
    pub bytes_in_use: usize,
    /// Highest value `bytes_in_use` has reached.
    pub peak_bytes: usize,
    /// Number of non-empty allocations served.
    pub allocations: u64,
    /// Number of non-null blocks released.
    pub deallocations: u64,
    /// Byte budget, if the allocator enforces one.
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct Counters {
    in_use: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

impl Counters {
    /// Accounts `bytes` against `limit`; returns false if the budget is exceeded.
    fn reserve(&self, bytes: usize, limit: Option<usize>) -> bool {
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|&total| limit.map_or(true, |limit| total <= limit))
            });
        match reserved {
            Ok(previous) => {
                self.peak.fetch_max(previous + bytes, Ordering::AcqRel);
                self.allocations.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Undoes a reservation whose block could not be obtained.
    fn unreserve(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
        self.allocations.fetch_sub(1, Ordering::Relaxed);
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, limit: Option<usize>) -> AllocatorStats {
        AllocatorStats {
            bytes_in_use: self.in_use.load(Ordering::Acquire),
            peak_bytes: self.peak.load(Ordering::Acquire),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            limit,
        }
    }
}

// =============================================================================
// Allocator Trait
// =============================================================================

/// A thread-safe source of raw byte blocks for one memory space.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Returns the kind of memory this allocator hands out.
    fn device_kind(&self) -> DeviceKind;

    /// Allocates `bytes` bytes aligned to at least [`ALIGNMENT`].
    ///
    /// Zero bytes yields a null pointer and an empty token.
    fn allocate(&self, bytes: usize) -> Result<(*mut u8, DeleterToken)>;

    /// Releases a block previously returned by [`Allocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must be null or a live block from this allocator, and `token`
    /// must be the token returned alongside it.
    unsafe fn deallocate(&self, ptr: *mut u8, token: DeleterToken);

    /// Returns a snapshot of the usage counters.
    fn stats(&self) -> AllocatorStats;
}

fn layout_for(bytes: usize, device: DeviceKind) -> Result<Layout> {
    Layout::from_size_align(bytes, ALIGNMENT)
        .map_err(|_| Error::allocation(bytes, device, "size overflows allocation layout"))
}

// =============================================================================
// Host Allocator
// =============================================================================

/// Host allocator using system memory.
#[derive(Debug, Default)]
pub struct HostAllocator {
    counters: Counters,
}

impl HostAllocator {
    /// Creates a new host allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for HostAllocator {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn allocate(&self, bytes: usize) -> Result<(*mut u8, DeleterToken)> {
        if bytes == 0 {
            return Ok((std::ptr::null_mut(), DeleterToken::EMPTY));
        }
        let layout = layout_for(bytes, DeviceKind::Host)?;
        if !self.counters.reserve(bytes, None) {
            return Err(Error::allocation(bytes, DeviceKind::Host, "byte counter overflow"));
        }
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            self.counters.unreserve(bytes);
            return Err(Error::allocation(bytes, DeviceKind::Host, "system allocator returned null"));
        }
        Ok((ptr, DeleterToken::new(bytes)))
    }

    unsafe fn deallocate(&self, ptr: *mut u8, token: DeleterToken) {
        if ptr.is_null() {
            return;
        }
        let bytes = token.get();
        dealloc(ptr, Layout::from_size_align_unchecked(bytes, ALIGNMENT));
        self.counters.release(bytes);
    }

    fn stats(&self) -> AllocatorStats {
        self.counters.snapshot(None)
    }
}

// =============================================================================
// Device Allocator
// =============================================================================

/// Accelerator memory allocator with a fixed byte budget.
///
/// Blocks are host-addressable; the budget is what makes the device's memory
/// a finite, separately accounted space.
#[derive(Debug)]
pub struct DeviceAllocator {
    limit: usize,
    counters: Counters,
}

impl DeviceAllocator {
    /// Creates an allocator that serves at most `limit` bytes at a time.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            counters: Counters::default(),
        }
    }

    /// Returns the byte budget.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }
}

impl Allocator for DeviceAllocator {
    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn allocate(&self, bytes: usize) -> Result<(*mut u8, DeleterToken)> {
        if bytes == 0 {
            return Ok((std::ptr::null_mut(), DeleterToken::EMPTY));
        }
        let layout = layout_for(bytes, DeviceKind::Accelerator)?;
        if !self.counters.reserve(bytes, Some(self.limit)) {
            let in_use = self.counters.in_use.load(Ordering::Acquire);
            return Err(Error::allocation(
                bytes,
                DeviceKind::Accelerator,
                format!("out of device memory ({in_use} of {} bytes in use)", self.limit),
            ));
        }
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            self.counters.unreserve(bytes);
            return Err(Error::allocation(
                bytes,
                DeviceKind::Accelerator,
                "backing allocation returned null",
            ));
        }
        Ok((ptr, DeleterToken::new(bytes)))
    }

    unsafe fn deallocate(&self, ptr: *mut u8, token: DeleterToken) {
        if ptr.is_null() {
            return;
        }
        let bytes = token.get();
        dealloc(ptr, Layout::from_size_align_unchecked(bytes, ALIGNMENT));
        self.counters.release(bytes);
    }

    fn stats(&self) -> AllocatorStats {
        self.counters.snapshot(Some(self.limit))
    }
}

// =============================================================================
// Tests
// =============================================================================
