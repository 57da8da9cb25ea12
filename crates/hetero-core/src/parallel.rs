//! Parallel - Background Units and Concurrent Streams
//!
//! Two helpers for overlapping independent work:
//!
//! - [`BackgroundRunner`] runs independent units on a bounded set of worker
//!   threads and joins them with [`BackgroundRunner::wait`].
//! - [`ParallelRunner`] gives each logical task on an accelerator its own
//!   stream, ordered after the context's stream when created and joined back
//!   into it when the runner finishes. On a host context it is a no-op and
//!   work stays sequential.
//!
//! Ordering between tasks is explicit: the runner inserts ordering points at
//! stream creation and at finish only. Tracking which regions a task reads or
//! writes, and ordering new work after unfinished producers automatically, is
//! left to layers above.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::RuntimeConfig;
use crate::context::ContextPtr;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::stream_override;

/// Background worker threads currently alive across all runners.
static LIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

// =============================================================================
// Worker Permits
// =============================================================================

/// One slot of the process-wide background thread budget.
struct Permit;

impl Permit {
    fn try_acquire(limit: usize) -> Option<Self> {
        LIVE_WORKERS
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .ok()
            .map(|_| Self)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        LIVE_WORKERS.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// BackgroundRunner
// =============================================================================

/// Runs independent units of work on a bounded pool of threads.
///
/// When the process-wide budget has no free slot the unit runs on the caller
/// instead, so units are never dropped and nested runners cannot deadlock. A
/// runner built with [`BackgroundRunner::with_limit`] never has more than its
/// limit of units running at once: a full runner first waits for its oldest
/// running unit.
#[derive(Debug)]
pub struct BackgroundRunner {
    limit: Option<usize>,
    workers: Vec<JoinHandle<()>>,
    failures: usize,
}

impl Default for BackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundRunner {
    /// Creates a runner bounded only by the process-wide thread budget.
    #[must_use]
    pub fn new() -> Self {
        Self {
            limit: None,
            workers: Vec::new(),
            failures: 0,
        }
    }

    /// Creates a runner that keeps at most `threads` of its own units running
    /// at once. A limit of zero runs every unit inline.
    #[must_use]
    pub fn with_limit(threads: usize) -> Self {
        let mut runner = Self::new();
        runner.limit = Some(threads);
        runner
    }

    /// Returns the number of units submitted since the last wait that ran on
    /// worker threads.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.workers.len()
    }

    fn running(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }

    /// Joins the oldest running workers until fewer than `limit` remain.
    fn make_room(&mut self, limit: usize) {
        while self.running() >= limit {
            let Some(index) = self.workers.iter().position(|w| !w.is_finished()) else {
                break;
            };
            let worker = self.workers.remove(index);
            if worker.join().is_err() {
                self.failures += 1;
            }
        }
    }

    /// Submits `unit` to run in the background.
    pub fn background<F>(&mut self, unit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = match self.limit {
            Some(0) => None,
            Some(limit) => {
                self.make_room(limit);
                Permit::try_acquire(RuntimeConfig::global().max_background_threads)
            }
            None => Permit::try_acquire(RuntimeConfig::global().max_background_threads),
        };

        let Some(permit) = permit else {
            debug!("no background slot free, running unit inline");
            self.run_inline(unit);
            return;
        };

        // The unit is only handed over if the spawn succeeds.
        let slot = Arc::new(Mutex::new(Some(unit)));
        let worker_slot = Arc::clone(&slot);
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("hetero-background-{id}"))
            .spawn(move || {
                let _permit = permit;
                if let Some(unit) = worker_slot.lock().take() {
                    unit();
                }
            });

        match spawned {
            Ok(worker) => self.workers.push(worker),
            Err(err) => {
                warn!(%err, "failed to spawn background worker, running unit inline");
                if let Some(unit) = slot.lock().take() {
                    self.run_inline(unit);
                }
            }
        }
    }

    fn run_inline<F: FnOnce()>(&mut self, unit: F) {
        if panic::catch_unwind(AssertUnwindSafe(unit)).is_err() {
            self.failures += 1;
        }
    }

    /// Blocks until every unit submitted since the last wait has finished.
    ///
    /// Reports how many of those units panicked.
    pub fn wait(&mut self) -> Result<()> {
        let mut failed = std::mem::take(&mut self.failures);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, "background units panicked");
            return Err(Error::BackgroundTaskFailed { failed });
        }
        Ok(())
    }
}

impl Drop for BackgroundRunner {
    fn drop(&mut self) {
        if let Err(err) = self.wait() {
            error!(%err, "background runner dropped with failed units");
        }
    }
}

// =============================================================================
// ParallelRunner
// =============================================================================

/// Scoped helper that lets independent tasks on one context use their own
/// accelerator streams.
///
/// Each [`ParallelRunner::new_stream`] call starts a new task: the fresh
/// stream waits for everything already enqueued on the context's stream and
/// becomes this thread's dispatch override. [`ParallelRunner::finish`], or
/// dropping the runner, removes the override and makes the context's stream
/// wait for every stream the runner created.
///
/// The runner is bound to the thread that created it.
#[derive(Debug)]
pub struct ParallelRunner {
    context: ContextPtr,
    parent: Option<Stream>,
    current: Option<Stream>,
    streams: Vec<Stream>,
    _thread_bound: PhantomData<*const ()>,
}

impl ParallelRunner {
    /// Creates a runner for work on `context`.
    #[must_use]
    pub fn new(context: &ContextPtr) -> Self {
        let parent = if context.device_kind().is_accelerator() {
            stream_override::resolve_stream(context.stream())
        } else {
            None
        };
        Self {
            context: Arc::clone(context),
            parent,
            current: None,
            streams: Vec::new(),
            _thread_bound: PhantomData,
        }
    }

    /// Returns the context this runner schedules on.
    #[must_use]
    pub fn context(&self) -> &ContextPtr {
        &self.context
    }

    /// Starts a new task on a fresh stream and returns it.
    ///
    /// Returns `None` for host contexts, where work runs on the caller.
    pub fn new_stream(&mut self) -> Result<Option<Stream>> {
        let Some(parent) = &self.parent else {
            return Ok(None);
        };

        let stream = Stream::new(self.context.device_id())?;
        stream.wait_event(&parent.record_event())?;

        if let Some(previous) = self.current.take() {
            stream_override::pop_stream(&previous)?;
        }
        stream_override::push_stream(stream.clone());
        self.current = Some(stream.clone());
        self.streams.push(stream.clone());

        debug!(
            stream = stream.id(),
            parent = parent.id(),
            tasks = self.streams.len(),
            "started parallel task stream"
        );
        Ok(Some(stream))
    }

    /// Runs `f(i)` for `i` in `[0, n)` as a new task.
    pub fn eval<F>(&mut self, n: i32, f: F) -> Result<()>
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        let stream = self.new_stream()?;
        dispatch::eval_on_stream(stream.as_ref(), n, f)
    }

    /// Runs `f(i, j)` over `[0, m) x [0, n)` as a new task.
    pub fn eval2<F>(&mut self, m: i32, n: i32, f: F) -> Result<()>
    where
        F: Fn(i32, i32) + Send + Sync + 'static,
    {
        let stream = self.new_stream()?;
        dispatch::eval2_on_stream(stream.as_ref(), m, n, f)
    }

    /// Removes this runner's override and orders the context's stream after
    /// every task stream.
    pub fn finish(&mut self) -> Result<()> {
        let popped = match self.current.take() {
            Some(current) => stream_override::pop_stream(&current),
            None => Ok(()),
        };

        if let Some(parent) = &self.parent {
            for stream in self.streams.drain(..) {
                parent.wait_event(&stream.record_event())?;
            }
        }
        popped
    }
}

impl Drop for ParallelRunner {
    fn drop(&mut self) {
        if self.current.is_none() && self.streams.is_empty() {
            return;
        }
        if let Err(err) = self.finish() {
            error!(%err, "parallel runner failed to finish on drop");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{AcceleratorContext, AcceleratorDevice};
    use crate::context::host_context;
    use crate::stream_override::{current_override, override_depth, StreamGuard};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn accelerator() -> ContextPtr {
        let device = Arc::new(AcceleratorDevice::new(0, 1 << 20));
        Arc::new(AcceleratorContext::new(device).unwrap())
    }

    #[test]
    fn test_background_runs_every_unit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut runner = BackgroundRunner::new();
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            runner.background(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        runner.wait().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
        assert_eq!(runner.pending(), 0);
    }

    #[test]
    fn test_background_limit_bounds_concurrency() {
        let counter = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut runner = BackgroundRunner::with_limit(1);
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            runner.background(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        runner.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_zero_limit_runs_inline() {
        let caller = thread::current().id();
        let same_thread = Arc::new(AtomicBool::new(true));
        let mut runner = BackgroundRunner::with_limit(0);
        for _ in 0..3 {
            let same_thread = Arc::clone(&same_thread);
            runner.background(move || {
                if thread::current().id() != caller {
                    same_thread.store(false, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(runner.pending(), 0);
        runner.wait().unwrap();
        assert!(same_thread.load(Ordering::SeqCst));
    }

    #[test]
    fn test_background_limit_counts_joined_panics() {
        let mut runner = BackgroundRunner::with_limit(1);
        runner.background(|| panic!("unit failed"));
        runner.background(|| {});
        runner.background(|| {});
        assert_eq!(runner.wait(), Err(Error::BackgroundTaskFailed { failed: 1 }));
    }

    #[test]
    fn test_background_reports_panics() {
        let mut runner = BackgroundRunner::new();
        runner.background(|| panic!("unit failed"));
        runner.background(|| {});
        assert_eq!(runner.wait(), Err(Error::BackgroundTaskFailed { failed: 1 }));
        assert!(runner.wait().is_ok());
    }

    #[test]
    fn test_nested_background_does_not_deadlock() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut outer = BackgroundRunner::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            outer.background(move || {
                let mut inner = BackgroundRunner::new();
                for _ in 0..4 {
                    let counter = Arc::clone(&counter);
                    inner.background(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                inner.wait().unwrap();
            });
        }
        outer.wait().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_parallel_runner_on_host_is_sequential() {
        let host = host_context();
        let mut runner = ParallelRunner::new(&host);
        assert!(runner.new_stream().unwrap().is_none());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        runner.eval(3, move |_| flag.store(true, Ordering::Release)).unwrap();
        assert!(ran.load(Ordering::Acquire));
        assert_eq!(current_override(), None);
        runner.finish().unwrap();
    }

    #[test]
    fn test_task_stream_ordered_after_context() {
        let ctx = accelerator();
        let native = ctx.stream().unwrap();
        let produced = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&produced);
        native
            .enqueue(move || {
                thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::Release);
            })
            .unwrap();

        let mut runner = ParallelRunner::new(&ctx);
        let task = runner.new_stream().unwrap().unwrap();
        assert_ne!(task, native);
        assert_eq!(current_override(), Some(task.clone()));

        let observed = Arc::new(AtomicBool::new(false));
        let (source, sink) = (Arc::clone(&produced), Arc::clone(&observed));
        dispatch::eval(ctx.as_ref(), 1, move |_| {
            sink.store(source.load(Ordering::Acquire), Ordering::Release);
        })
        .unwrap();
        task.synchronize().unwrap();
        assert!(observed.load(Ordering::Acquire));
        runner.finish().unwrap();
    }

    #[test]
    fn test_finish_joins_tasks_into_context() {
        let ctx = accelerator();
        let native = ctx.stream().unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let mut runner = ParallelRunner::new(&ctx);
        for _ in 0..3 {
            let done = Arc::clone(&done);
            runner
                .eval(1, move |_| {
                    thread::sleep(Duration::from_millis(10));
                    done.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        assert_eq!(override_depth(), 1);
        runner.finish().unwrap();
        assert_eq!(override_depth(), 0);

        let seen = Arc::new(AtomicUsize::new(0));
        let (source, sink) = (Arc::clone(&done), Arc::clone(&seen));
        native
            .enqueue(move || sink.store(source.load(Ordering::Relaxed), Ordering::Relaxed))
            .unwrap();
        ctx.synchronize().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_drop_restores_override() {
        let ctx = accelerator();
        {
            let mut runner = ParallelRunner::new(&ctx);
            runner.new_stream().unwrap();
            runner.new_stream().unwrap();
            assert_eq!(override_depth(), 1);
        }
        assert_eq!(override_depth(), 0);
        ctx.synchronize().unwrap();
    }

    #[test]
    fn test_finish_detects_foreign_override() {
        let ctx = accelerator();
        let mut runner = ParallelRunner::new(&ctx);
        runner.new_stream().unwrap();
        let stray = Stream::new(0).unwrap();
        let guard = StreamGuard::new(stray);
        assert!(matches!(runner.finish(), Err(Error::ContractViolation { .. })));
        drop(guard);
        assert_eq!(override_depth(), 1);
        stream_override::pop_stream(&current_override().unwrap()).unwrap();
    }
}
