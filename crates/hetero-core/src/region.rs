//! Region - Growable Shared Device Allocations
//!
//! A [`Region`] is one contiguous allocation owned by a context. Several
//! buffer views may share a region through [`RegionPtr`]; the allocation is
//! returned to its context exactly once, when the last view releases it.
//!
//! # Key Features
//! - Reference-counted sharing between buffer views
//! - Amortized growth with power-of-two capacities
//! - Device-aware copy on reallocation
//! - Host staging helpers for reading and writing device memory
//!
//! # Growth
//! Only one view may claim the trailing capacity of a region. A view that
//! does not end at the region's used size (see [`Region::claims_tail`]) must
//! allocate a new region instead of extending this one.
//!
//! # Example
//! ```rust
//! use hetero_core::context::host_context;
//! use hetero_core::region::new_region;
//!
//! let region = new_region(&host_context(), 10).unwrap();
//! region.extend(40).unwrap();
//! assert_eq!(region.capacity(), 64);
//! assert_eq!(region.used(), 40);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::mem;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::RwLock;
use tracing::debug;

use crate::allocator::DeleterToken;
use crate::context::{self, ContextPtr, HasContext};
use crate::device::DeviceKind;
use crate::error::{Error, Result};

/// Shared handle to a region.
pub type RegionPtr = Arc<Region>;

// =============================================================================
// Region Struct
// =============================================================================

struct RegionInner {
    data: *mut u8,
    deleter: DeleterToken,
    capacity: usize,
    used: usize,
}

/// One contiguous allocation, shared by every view that references it.
pub struct Region {
    context: ContextPtr,
    inner: RwLock<RegionInner>,
}

// The pointer is owned by the region and only handed out through raw accessors.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Allocates a region of `bytes` bytes from `context`.
///
/// The new region has `used == capacity == bytes`.
pub fn new_region(context: &ContextPtr, bytes: usize) -> Result<RegionPtr> {
    let (data, deleter) = context.allocate(bytes)?;
    debug!(
        device = %context.device_kind(),
        device_id = context.device_id(),
        bytes,
        "allocated region"
    );
    Ok(Arc::new(Region {
        context: Arc::clone(context),
        inner: RwLock::new(RegionInner {
            data,
            deleter,
            capacity: bytes,
            used: bytes,
        }),
    }))
}

impl Region {
    /// Allocates a new region of `bytes` bytes from this region's context.
    pub fn new_like(&self, bytes: usize) -> Result<RegionPtr> {
        new_region(&self.context, bytes)
    }

    /// Returns the owning context.
    #[must_use]
    pub fn context(&self) -> &ContextPtr {
        &self.context
    }

    /// Returns the number of bytes actually allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Returns the number of bytes occupied by the largest anchored view.
    #[must_use]
    pub fn used(&self) -> usize {
        self.inner.read().used
    }

    /// Returns the start of the allocation as a `T` pointer.
    ///
    /// Null for zero-byte regions. The pointer is invalidated by a growing
    /// [`Region::extend`].
    #[must_use]
    pub fn data<T>(&self) -> *mut T {
        self.inner.read().data.cast()
    }

    /// Like [`Region::data`], but checks the region lives on a `kind` device.
    pub fn data_on<T>(&self, kind: DeviceKind) -> Result<*mut T> {
        let actual = self.context.device_kind();
        if actual != kind {
            return Err(Error::contract_violation(format!(
                "region lives on {actual} memory, {kind} requested"
            )));
        }
        Ok(self.data())
    }

    /// Returns true if a view ending at byte `view_end` may claim the
    /// trailing capacity of this region.
    #[must_use]
    pub fn claims_tail(&self, view_end: usize) -> bool {
        view_end >= self.used()
    }

    /// Grows the used size to `new_used` bytes, reallocating if needed.
    ///
    /// Never shrinks. When the capacity is exceeded the new capacity is
    /// `max(2 * capacity, new_used)` rounded up to a power of two, and the
    /// first `used` bytes are carried over. On failure the region is unchanged.
    ///
    /// Work already enqueued on the context is drained before the region is
    /// locked, so that work may still read the region.
    pub fn extend(&self, new_used: usize) -> Result<()> {
        context::settle(self.context.as_ref())?;
        let mut inner = self.inner.write();
        if new_used <= inner.used {
            return Ok(());
        }

        if new_used > inner.capacity {
            let kind = self.context.device_kind();
            let new_capacity = inner
                .capacity
                .saturating_mul(2)
                .max(new_used)
                .checked_next_power_of_two()
                .ok_or_else(|| Error::allocation(new_used, kind, "region capacity overflow"))?;

            let (data, deleter) = self.context.allocate(new_capacity)?;
            let ctx = self.context.as_ref();
            let copied = unsafe { context::copy_settled(ctx, ctx, data, inner.data, inner.used) };
            if let Err(err) = copied {
                unsafe { self.context.deallocate(data, deleter) };
                return Err(err);
            }

            let old_data = mem::replace(&mut inner.data, data);
            let old_deleter = mem::replace(&mut inner.deleter, deleter);
            unsafe { self.context.deallocate(old_data, old_deleter) };

            debug!(
                device = %kind,
                old_capacity = inner.capacity,
                new_capacity,
                "reallocated region"
            );
            inner.capacity = new_capacity;
        }

        inner.used = new_used;
        Ok(())
    }

    /// Copies `bytes` from host memory into the region at byte `offset`.
    pub fn copy_from_host(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        context::settle(self.context.as_ref())?;
        let inner = self.inner.read();
        let end = offset.checked_add(bytes.len());
        if end.map_or(true, |end| end > inner.used) {
            return Err(Error::contract_violation(format!(
                "write of {} bytes at offset {offset} exceeds region of {} bytes",
                bytes.len(),
                inner.used
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let host = self.context.host_context();
        unsafe {
            context::copy_settled(
                host.as_ref(),
                self.context.as_ref(),
                inner.data.add(offset),
                bytes.as_ptr(),
                bytes.len(),
            )
        }
    }

    /// Copies the used bytes of the region into a host vector.
    pub fn to_host_vec(&self) -> Result<Vec<u8>> {
        context::settle(self.context.as_ref())?;
        let inner = self.inner.read();
        let mut out = vec![0u8; inner.used];
        if inner.used == 0 {
            return Ok(out);
        }
        let host = self.context.host_context();
        unsafe {
            context::copy_settled(
                self.context.as_ref(),
                host.as_ref(),
                out.as_mut_ptr(),
                inner.data,
                inner.used,
            )?;
        }
        Ok(out)
    }

    /// Reads the used bytes of the region as a vector of `T`.
    pub fn read_as<T: Pod>(&self) -> Result<Vec<T>> {
        let width = mem::size_of::<T>();
        let bytes = self.to_host_vec()?;
        if width == 0 || bytes.len() % width != 0 {
            return Err(Error::contract_violation(format!(
                "region of {} bytes is not a whole number of {width}-byte elements",
                bytes.len()
            )));
        }
        let mut out = vec![T::zeroed(); bytes.len() / width];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes);
        Ok(out)
    }
}

impl HasContext for Region {
    fn context(&self) -> &ContextPtr {
        &self.context
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let data = mem::replace(&mut inner.data, std::ptr::null_mut());
        let deleter = mem::replace(&mut inner.deleter, DeleterToken::EMPTY);
        unsafe { self.context.deallocate(data, deleter) };
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Region")
            .field("device", &self.context.device_kind())
            .field("device_id", &self.context.device_id())
            .field("capacity", &inner.capacity)
            .field("used", &inner.used)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{AcceleratorContext, AcceleratorDevice};
    use crate::context::{accelerator_context, host_context};

    #[test]
    fn test_new_region_sizes() {
        let region = new_region(&host_context(), 10).unwrap();
        assert_eq!(region.capacity(), 10);
        assert_eq!(region.used(), 10);
        assert!(!region.data::<u8>().is_null());
    }

    #[test]
    fn test_zero_byte_region() {
        let region = new_region(&host_context(), 0).unwrap();
        assert_eq!(region.capacity(), 0);
        assert!(region.data::<u8>().is_null());
        assert!(region.to_host_vec().unwrap().is_empty());

        region.extend(3).unwrap();
        assert_eq!(region.capacity(), 4);
        assert_eq!(region.used(), 3);
    }

    #[test]
    fn test_extend_preserves_prefix() {
        let region = new_region(&host_context(), 10).unwrap();
        let original: Vec<u8> = (1..=10).collect();
        region.copy_from_host(0, &original).unwrap();

        region.extend(5).unwrap();
        assert_eq!(region.used(), 10);
        assert_eq!(region.capacity(), 10);

        region.extend(40).unwrap();
        assert_eq!(region.capacity(), 64);
        assert_eq!(region.used(), 40);
        assert_eq!(&region.to_host_vec().unwrap()[..10], &original[..]);
    }

    #[test]
    fn test_extend_within_capacity_keeps_pointer() {
        let region = new_region(&host_context(), 1).unwrap();
        region.extend(3).unwrap();
        let ptr = region.data::<u8>();
        assert_eq!(region.capacity(), 4);
        region.extend(4).unwrap();
        assert_eq!(region.data::<u8>(), ptr);
        assert_eq!(region.used(), 4);
    }

    #[test]
    fn test_capacity_is_power_of_two() {
        let region = new_region(&host_context(), 3).unwrap();
        for target in [7, 9, 100, 1000, 1025] {
            region.extend(target).unwrap();
            let capacity = region.capacity();
            assert!(capacity.is_power_of_two());
            assert!(capacity >= target);
        }
    }

    #[test]
    fn test_failed_extend_leaves_region_untouched() {
        let device = Arc::new(AcceleratorDevice::new(0, 100));
        let ctx: ContextPtr = Arc::new(AcceleratorContext::new(device).unwrap());
        let region = new_region(&ctx, 40).unwrap();
        region.copy_from_host(0, &[7u8; 40]).unwrap();
        let ptr = region.data::<u8>();

        let err = region.extend(70).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { size: 128, .. }));
        assert_eq!(region.capacity(), 40);
        assert_eq!(region.used(), 40);
        assert_eq!(region.data::<u8>(), ptr);
        assert_eq!(region.to_host_vec().unwrap(), vec![7u8; 40]);
    }

    #[test]
    fn test_extend_after_kernel_reading_region() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let device = Arc::new(AcceleratorDevice::new(0, 4096));
        let ctx: ContextPtr = Arc::new(AcceleratorContext::new(device).unwrap());
        let region = new_region(&ctx, 16).unwrap();

        let stream = ctx.stream().unwrap();
        stream
            .enqueue(|| thread::sleep(Duration::from_millis(100)))
            .unwrap();
        let keep = Arc::clone(&region);
        crate::dispatch::eval(ctx.as_ref(), 4, move |_| {
            let _ = keep.data::<u8>();
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let grower = Arc::clone(&region);
        thread::spawn(move || {
            let _ = tx.send(grower.extend(1000));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("extend did not return while a kernel held the region");
        result.unwrap();
        assert_eq!(region.capacity(), 1024);
        assert_eq!(region.used(), 1000);
        assert!(stream.is_idle());
    }

    #[test]
    fn test_drop_deallocates_once() {
        let device = Arc::new(AcceleratorDevice::new(0, 1024));
        let ctx: ContextPtr = Arc::new(AcceleratorContext::new(device).unwrap());
        let region = new_region(&ctx, 100).unwrap();
        let view = Arc::clone(&region);
        drop(region);
        assert_eq!(ctx.memory_stats().bytes_in_use, 100);
        drop(view);
        let stats = ctx.memory_stats();
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.deallocations, 1);
    }

    #[test]
    fn test_accelerator_growth_round_trip() {
        let ctx = accelerator_context(0).unwrap();
        let region = new_region(&ctx, 8).unwrap();
        region.copy_from_host(0, bytemuck::cast_slice(&[1.5f32, -2.0])).unwrap();
        region.extend(12).unwrap();
        assert_eq!(region.capacity(), 16);
        region.copy_from_host(8, bytemuck::cast_slice(&[4.25f32])).unwrap();
        assert_eq!(region.read_as::<f32>().unwrap(), vec![1.5, -2.0, 4.25]);
    }

    #[test]
    fn test_data_on_checks_kind() {
        let region = new_region(&host_context(), 16).unwrap();
        assert!(region.data_on::<f32>(DeviceKind::Host).is_ok());
        assert!(matches!(
            region.data_on::<f32>(DeviceKind::Accelerator),
            Err(Error::ContractViolation { .. })
        ));
    }

    #[test]
    fn test_claims_tail_and_new_like() {
        let region = new_region(&host_context(), 32).unwrap();
        assert!(region.claims_tail(32));
        assert!(!region.claims_tail(16));

        let sibling = region.new_like(8).unwrap();
        assert!(context::is_compatible(&*region, &*sibling));
        assert_eq!(sibling.used(), 8);
    }

    #[test]
    fn test_copy_bounds_and_read_width() {
        let region = new_region(&host_context(), 6).unwrap();
        assert!(region.copy_from_host(4, &[0u8; 3]).is_err());
        assert!(region.copy_from_host(usize::MAX, &[0u8; 1]).is_err());
        assert!(matches!(
            region.read_as::<u32>(),
            Err(Error::ContractViolation { .. })
        ));
    }
}
