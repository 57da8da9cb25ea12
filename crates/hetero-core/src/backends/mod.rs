//! Backends - Device-Specific Context Implementations
//!
//! This module contains the built-in implementations of
//! [`Context`](crate::context::Context). Each backend provides device-specific
//! memory operations and an execution model for dispatched work.
//!
//! # Available Backends
//! - `host` - system memory, synchronous execution (always available)
//! - `accelerator` - budgeted device memory, stream-ordered asynchronous execution
//!
//! Foreign runtimes plug in by implementing the trait themselves; nothing in
//! the crate matches on these concrete types.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

// =============================================================================
// Backend Modules
// =============================================================================

pub mod accelerator;
pub mod host;

// =============================================================================
// Re-exports
// =============================================================================

pub use accelerator::{AcceleratorContext, AcceleratorDevice, MAX_THREADS_PER_BLOCK};
pub use host::HostContext;
