//! Dispatch - Per-Index Work on Any Context
//!
//! One generic way to run a function over an index space, whatever device a
//! context targets:
//!
//! - On a host context, indices run on the calling thread in increasing order
//!   and the call returns when they are done.
//! - On an accelerator context, the index space is partitioned into blocks,
//!   the launch is enqueued on the effective stream and the call returns at
//!   once. [`Context::synchronize`] makes the results visible.
//!
//! The effective stream is the context's own stream unless this thread has a
//! stream override active (see [`crate::stream_override`]).
//!
//! # Example
//! ```rust
//! use std::sync::atomic::{AtomicI32, Ordering};
//! use std::sync::Arc;
//! use hetero_core::context::host_context;
//! use hetero_core::dispatch::eval;
//!
//! let sum = Arc::new(AtomicI32::new(0));
//! let acc = Arc::clone(&sum);
//! eval(host_context().as_ref(), 5, move |i| {
//!     acc.fetch_add(i, Ordering::Relaxed);
//! })
//! .unwrap();
//! assert_eq!(sum.load(Ordering::Relaxed), 10);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::mem;
use std::sync::Arc;

use bytemuck::Pod;
use rayon::prelude::*;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::region::RegionPtr;
use crate::stream::Stream;
use crate::stream_override;

/// Threads per block for 1-D launches.
pub const BLOCK_SIZE: u32 = 256;

/// Block edge for 2-D launches.
pub const BLOCK_SIZE_2D: u32 = 16;

/// Largest grid extent along x, in blocks.
pub const MAX_GRID_X: u64 = (1 << 31) - 1;

/// Largest grid extent along y, in blocks.
pub const MAX_GRID_Y: u64 = 65_535;

// =============================================================================
// Launch Geometry
// =============================================================================

/// Returns the number of `block`-sized blocks needed to cover `n` items.
#[must_use]
pub const fn num_blocks(n: u64, block: u32) -> u64 {
    n.div_ceil(block as u64)
}

/// Block and grid dimensions of an accelerator launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Blocks along x and y.
    pub grid_dim: (u32, u32),
    /// Threads per block along x and y.
    pub block_dim: (u32, u32),
}

impl LaunchConfig {
    /// Geometry covering `[0, n)` with one thread per index.
    pub fn for_1d(n: i32) -> Result<Self> {
        let count = non_negative("1-D launch", n)?;
        let blocks = checked_extent(num_blocks(count, BLOCK_SIZE), MAX_GRID_X, "x")?;
        Ok(Self {
            grid_dim: (blocks, 1),
            block_dim: (BLOCK_SIZE, 1),
        })
    }

    /// Geometry covering `[0, m) x [0, n)`; x spans `j`, y spans `i`.
    pub fn for_2d(m: i32, n: i32) -> Result<Self> {
        let rows = non_negative("2-D launch", m)?;
        let cols = non_negative("2-D launch", n)?;
        let grid_x = checked_extent(num_blocks(cols, BLOCK_SIZE_2D), MAX_GRID_X, "x")?;
        let grid_y = checked_extent(num_blocks(rows, BLOCK_SIZE_2D), MAX_GRID_Y, "y")?;
        Ok(Self {
            grid_dim: (grid_x, grid_y),
            block_dim: (BLOCK_SIZE_2D, BLOCK_SIZE_2D),
        })
    }

    /// Total number of blocks in the grid.
    #[must_use]
    pub const fn num_blocks(&self) -> u64 {
        self.grid_dim.0 as u64 * self.grid_dim.1 as u64
    }

    /// Threads in each block.
    #[must_use]
    pub const fn threads_per_block(&self) -> u32 {
        self.block_dim.0 * self.block_dim.1
    }
}

fn checked_extent(blocks: u64, limit: u64, axis: &str) -> Result<u32> {
    if blocks > limit {
        return Err(Error::dispatch(format!(
            "grid needs {blocks} blocks along {axis}, limit is {limit}"
        )));
    }
    u32::try_from(blocks).map_err(|_| Error::dispatch(format!("grid extent {blocks} along {axis}")))
}

fn non_negative(what: &str, count: i32) -> Result<u64> {
    u64::try_from(count)
        .map_err(|_| Error::contract_violation(format!("{what} with negative count {count}")))
}

// =============================================================================
// Block Execution
// =============================================================================

fn parallel_threshold() -> u64 {
    RuntimeConfig::global().parallel_block_threshold as u64
}

fn run_blocks<B>(total: u64, threshold: u64, block: B)
where
    B: Fn(u64) + Sync,
{
    if total >= threshold {
        (0..total).into_par_iter().for_each(|b| block(b));
    } else {
        (0..total).for_each(block);
    }
}

fn launch_1d<F>(stream: &Stream, n: i32, f: F) -> Result<()>
where
    F: Fn(i32) + Send + Sync + 'static,
{
    let config = LaunchConfig::for_1d(n)?;
    let threshold = parallel_threshold();
    debug!(
        stream = stream.id(),
        n,
        blocks = config.num_blocks(),
        "launching 1-D kernel"
    );
    let block_len = i64::from(config.block_dim.0);
    stream.enqueue(move || {
        run_blocks(config.num_blocks(), threshold, |b| {
            let start = b as i64 * block_len;
            let end = (start + block_len).min(i64::from(n));
            for i in start..end {
                f(i as i32);
            }
        });
    })
}

fn launch_2d<F>(stream: &Stream, m: i32, n: i32, f: F) -> Result<()>
where
    F: Fn(i32, i32) + Send + Sync + 'static,
{
    let config = LaunchConfig::for_2d(m, n)?;
    let threshold = parallel_threshold();
    debug!(
        stream = stream.id(),
        m,
        n,
        grid_x = config.grid_dim.0,
        grid_y = config.grid_dim.1,
        "launching 2-D kernel"
    );
    let grid_x = u64::from(config.grid_dim.0);
    let edge = i64::from(BLOCK_SIZE_2D);
    stream.enqueue(move || {
        run_blocks(config.num_blocks(), threshold, |b| {
            let row0 = (b / grid_x) as i64 * edge;
            let col0 = (b % grid_x) as i64 * edge;
            for i in row0..(row0 + edge).min(i64::from(m)) {
                for j in col0..(col0 + edge).min(i64::from(n)) {
                    f(i as i32, j as i32);
                }
            }
        });
    })
}

// =============================================================================
// Output Pointers
// =============================================================================

/// Destination of a writing dispatch, shared by every block.
struct Output<T> {
    ptr: *mut T,
    _owner: Option<RegionPtr>,
}

// Each index is written by exactly one invocation.
unsafe impl<T: Send> Send for Output<T> {}
unsafe impl<T: Send> Sync for Output<T> {}

impl<T> Output<T> {
    /// # Safety
    /// `i` must be within the destination.
    unsafe fn write(&self, i: i32, value: T) {
        self.ptr.add(i as usize).write(value);
    }
}

// =============================================================================
// 1-D Dispatch
// =============================================================================

/// Invokes `f(i)` for every `i` in `[0, n)` on `context`'s device.
///
/// A zero count does nothing. A negative count is rejected before anything
/// runs.
pub fn eval<F>(context: &dyn Context, n: i32, f: F) -> Result<()>
where
    F: Fn(i32) + Send + Sync + 'static,
{
    let stream = stream_override::resolve_stream(context.stream());
    eval_on_stream(stream.as_ref(), n, f)
}

/// Like [`eval`], but on an explicit stream; `None` runs on the calling thread.
pub fn eval_on_stream<F>(stream: Option<&Stream>, n: i32, f: F) -> Result<()>
where
    F: Fn(i32) + Send + Sync + 'static,
{
    if non_negative("eval", n)? == 0 {
        return Ok(());
    }
    match stream {
        None => {
            for i in 0..n {
                f(i);
            }
            Ok(())
        }
        Some(stream) => launch_1d(stream, n, f),
    }
}

/// Stores `f(i)` into `out[i]` for every `i` in `[0, n)`.
///
/// # Safety
/// `out` must be valid for `n` writes of `T` in `context`'s memory and must
/// stay valid until the work has completed, which on an accelerator means
/// until the next synchronize.
pub unsafe fn eval_write<T, F>(context: &dyn Context, out: *mut T, n: i32, f: F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(i32) -> T + Send + Sync + 'static,
{
    let stream = stream_override::resolve_stream(context.stream());
    eval_write_on_stream(stream.as_ref(), out, n, f)
}

/// Like [`eval_write`], but on an explicit stream.
///
/// # Safety
/// Same contract as [`eval_write`].
pub unsafe fn eval_write_on_stream<T, F>(
    stream: Option<&Stream>,
    out: *mut T,
    n: i32,
    f: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(i32) -> T + Send + Sync + 'static,
{
    let out = Output { ptr: out, _owner: None };
    eval_on_stream(stream, n, move |i| unsafe { out.write(i, f(i)) })
}

/// Stores `f(i)` as the `i`-th `T` of `region` for every `i` in `[0, n)`.
///
/// The region is kept alive until the work has run. Fails if `n` elements do
/// not fit in the region's used bytes.
pub fn eval_into_region<T, F>(region: &RegionPtr, n: i32, f: F) -> Result<()>
where
    T: Pod + Send,
    F: Fn(i32) -> T + Send + Sync + 'static,
{
    let count = non_negative("eval_into_region", n)?;
    let needed = (count as usize).saturating_mul(mem::size_of::<T>());
    let used = region.used();
    if needed > used {
        return Err(Error::contract_violation(format!(
            "{count} elements need {needed} bytes, region holds {used}"
        )));
    }
    let out = Output {
        ptr: region.data::<T>(),
        _owner: Some(Arc::clone(region)),
    };
    eval(region.context().as_ref(), n, move |i| unsafe { out.write(i, f(i)) })
}

// =============================================================================
// 2-D Dispatch
// =============================================================================

/// Invokes `f(i, j)` for every `i` in `[0, m)` and `j` in `[0, n)`.
///
/// `j` is the fast-varying index. Does nothing if either extent is zero.
pub fn eval2<F>(context: &dyn Context, m: i32, n: i32, f: F) -> Result<()>
where
    F: Fn(i32, i32) + Send + Sync + 'static,
{
    let stream = stream_override::resolve_stream(context.stream());
    eval2_on_stream(stream.as_ref(), m, n, f)
}

/// Like [`eval2`], but on an explicit stream; `None` runs on the calling thread.
pub fn eval2_on_stream<F>(stream: Option<&Stream>, m: i32, n: i32, f: F) -> Result<()>
where
    F: Fn(i32, i32) + Send + Sync + 'static,
{
    let rows = non_negative("eval2", m)?;
    let cols = non_negative("eval2", n)?;
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    match stream {
        None => {
            for i in 0..m {
                for j in 0..n {
                    f(i, j);
                }
            }
            Ok(())
        }
        Some(stream) => launch_2d(stream, m, n, f),
    }
}

// =============================================================================
// Tests
// =============================================================================
