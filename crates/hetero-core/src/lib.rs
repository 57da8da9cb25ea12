//! Hetero Core - Memory and Dispatch Foundation for Heterogeneous Runtimes
//!
//! This crate provides the layer that every array or tensor type of a
//! CPU/accelerator runtime is built on. It decides where memory lives, how it
//! is allocated, grown and freed, and how per-element work is dispatched to a
//! device.
//!
//! # Key Features
//! - Pluggable execution contexts (host, pinned host, accelerator, foreign)
//! - Growable reference-counted memory regions with device-aware copies
//! - One dispatch API for sequential host loops and asynchronous device streams
//! - Thread-local stream overrides with RAII scoping
//! - Background units and concurrent accelerator streams
//!
//! # Example
//! ```rust
//! use hetero_core::prelude::*;
//!
//! let ctx = accelerator_context(-1).unwrap();
//! let region = new_region(&ctx, 4 * 1000).unwrap();
//! eval_into_region(&region, 1000, |i| i as f32 * 0.5).unwrap();
//! let values = region.read_as::<f32>().unwrap();
//! assert_eq!(values[10], 5.0);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Index spaces are i32 and geometry is u32/u64
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::missing_safety_doc)]

// =============================================================================
// Modules
// =============================================================================

pub mod allocator;
pub mod backends;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod parallel;
pub mod region;
pub mod stream;
pub mod stream_override;

// =============================================================================
// Re-exports
// =============================================================================

pub use allocator::{Allocator, AllocatorStats, DeleterToken, DeviceAllocator, HostAllocator};
pub use backends::{AcceleratorContext, AcceleratorDevice, HostContext};
pub use config::RuntimeConfig;
pub use context::{
    accelerator_context, accelerator_count, common_context, device_of, host_context,
    is_compatible, memory_copy, memory_copy_kind, pinned_host_context, Context, ContextPtr,
    HasContext, MemoryCopyKind,
};
pub use device::{DeviceCapabilities, DeviceKind, HOST_DEVICE_ID};
pub use dispatch::{eval, eval2, eval_into_region, eval_write, LaunchConfig};
pub use error::{Error, Result};
pub use parallel::{BackgroundRunner, ParallelRunner};
pub use region::{new_region, Region, RegionPtr};
pub use stream::{Event, Stream};
pub use stream_override::{with_stream, StreamGuard};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::context::{
        accelerator_context, host_context, pinned_host_context, Context, ContextPtr, HasContext,
    };
    pub use crate::device::DeviceKind;
    pub use crate::dispatch::{eval, eval2, eval_into_region};
    pub use crate::error::{Error, Result};
    pub use crate::parallel::{BackgroundRunner, ParallelRunner};
    pub use crate::region::{new_region, Region, RegionPtr};
    pub use crate::stream::Stream;
    pub use crate::stream_override::StreamGuard;
}
