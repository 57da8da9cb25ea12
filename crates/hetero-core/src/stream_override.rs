//! Stream Override - Scoped Redirection of Accelerator Dispatch
//!
//! Each thread owns a stack of override streams. While a [`StreamGuard`] is
//! alive, dispatches made by that thread against an accelerator context run on
//! the guard's stream instead of the context's native stream. Host contexts are
//! never redirected.
//!
//! # Example
//! ```rust
//! use hetero_core::stream::Stream;
//! use hetero_core::stream_override::{current_override, StreamGuard};
//!
//! let stream = Stream::new(0).unwrap();
//! {
//!     let _guard = StreamGuard::new(stream.clone());
//!     assert_eq!(current_override(), Some(stream));
//! }
//! assert_eq!(current_override(), None);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::RefCell;
use std::marker::PhantomData;

use tracing::error;

use crate::error::{Error, Result};
use crate::stream::Stream;

// =============================================================================
// Thread-Local Override State
// =============================================================================

thread_local! {
    /// Override streams pushed by this thread, innermost last.
    static STREAM_OVERRIDE: RefCell<Vec<Stream>> = const { RefCell::new(Vec::new()) };
}

/// Returns the innermost override stream of this thread, if any.
#[must_use]
pub fn current_override() -> Option<Stream> {
    STREAM_OVERRIDE.with(|stack| stack.borrow().last().cloned())
}

/// Returns the number of overrides active on this thread.
#[must_use]
pub fn override_depth() -> usize {
    STREAM_OVERRIDE.with(|stack| stack.borrow().len())
}

/// Applies the active override to a context's native stream.
///
/// A `None` native stream (host context) is returned unchanged.
#[must_use]
pub fn resolve_stream(native: Option<Stream>) -> Option<Stream> {
    native.map(|native| current_override().unwrap_or(native))
}

/// Makes `stream` the innermost override of this thread.
pub fn push_stream(stream: Stream) {
    STREAM_OVERRIDE.with(|stack| stack.borrow_mut().push(stream));
}

/// Removes `stream` from the top of this thread's override stack.
///
/// Fails without modifying the stack if `stream` is not the innermost override.
pub fn pop_stream(stream: &Stream) -> Result<()> {
    STREAM_OVERRIDE.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last() {
            Some(top) if top == stream => {
                stack.pop();
                Ok(())
            }
            Some(top) => Err(Error::contract_violation(format!(
                "popped stream {} but the innermost override is stream {}",
                stream.id(),
                top.id()
            ))),
            None => Err(Error::contract_violation(format!(
                "popped stream {} with no override active",
                stream.id()
            ))),
        }
    })
}

// =============================================================================
// StreamGuard
// =============================================================================

/// RAII guard that redirects this thread's accelerator dispatch to a stream.
///
/// The guard pops exactly the stream it pushed when dropped, on every exit
/// path. It cannot be sent to another thread.
#[must_use = "the override ends when the guard is dropped"]
pub struct StreamGuard {
    stream: Stream,
    _thread_bound: PhantomData<*const ()>,
}

impl StreamGuard {
    /// Pushes `stream` as this thread's innermost override.
    pub fn new(stream: Stream) -> Self {
        push_stream(stream.clone());
        Self {
            stream,
            _thread_bound: PhantomData,
        }
    }

    /// Returns the stream this guard installed.
    #[must_use]
    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Err(err) = pop_stream(&self.stream) {
            error!(stream = self.stream.id(), %err, "stream override guard dropped out of order");
            debug_assert!(false, "{err}");
        }
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Executes a closure with this thread's dispatch redirected to `stream`.
pub fn with_stream<F, R>(stream: Stream, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = StreamGuard::new(stream);
    f()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_override_by_default() {
        assert_eq!(current_override(), None);
        assert_eq!(override_depth(), 0);
    }

    #[test]
    fn test_nested_guards_restore() {
        let outer = Stream::new(0).unwrap();
        let inner = Stream::new(0).unwrap();
        {
            let _g1 = StreamGuard::new(outer.clone());
            assert_eq!(current_override(), Some(outer.clone()));
            {
                let _g2 = StreamGuard::new(inner.clone());
                assert_eq!(current_override(), Some(inner.clone()));
                assert_eq!(override_depth(), 2);
            }
            assert_eq!(current_override(), Some(outer.clone()));
        }
        assert_eq!(current_override(), None);
    }

    #[test]
    fn test_resolve_leaves_host_alone() {
        let stream = Stream::new(0).unwrap();
        let native = Stream::new(0).unwrap();
        assert_eq!(resolve_stream(None), None);
        assert_eq!(resolve_stream(Some(native.clone())), Some(native.clone()));

        with_stream(stream.clone(), || {
            assert_eq!(resolve_stream(None), None);
            assert_eq!(resolve_stream(Some(native.clone())), Some(stream.clone()));
        });
    }

    #[test]
    fn test_mismatched_pop_is_rejected() {
        let a = Stream::new(0).unwrap();
        let b = Stream::new(0).unwrap();
        assert!(matches!(pop_stream(&a), Err(Error::ContractViolation { .. })));

        push_stream(a.clone());
        assert!(matches!(pop_stream(&b), Err(Error::ContractViolation { .. })));
        assert_eq!(override_depth(), 1);
        pop_stream(&a).unwrap();
        assert_eq!(override_depth(), 0);
    }

    #[test]
    fn test_override_is_thread_local() {
        let stream = Stream::new(0).unwrap();
        let _guard = StreamGuard::new(stream);
        let seen = std::thread::spawn(current_override).join().unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn test_guard_pops_on_early_return() {
        fn failing(stream: Stream) -> Result<()> {
            let _guard = StreamGuard::new(stream);
            Err(Error::dispatch("early exit"))
        }
        let stream = Stream::new(0).unwrap();
        assert!(failing(stream).is_err());
        assert_eq!(current_override(), None);
    }
}
