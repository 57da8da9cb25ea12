//! Streams - Ordered Work Queues for Accelerator Devices
//!
//! A [`Stream`] is an ordered queue of device work. Work enqueued on the same
//! stream executes in submission order on the stream's own worker thread, and
//! enqueueing never blocks the caller. [`Stream::synchronize`] is the only
//! blocking point: it waits for everything submitted so far and reports any
//! fault raised by device work since the previous synchronize.
//!
//! [`Event`]s mark a position in a stream. Another stream can be told to wait
//! for an event, which is how work on independent streams is ordered.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Shared Queue State
// =============================================================================

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    submitted: u64,
    completed: u64,
    fault: Option<String>,
    shutdown: bool,
}

struct Shared {
    id: u64,
    device_id: i32,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    work_done: Condvar,
}

impl Shared {
    /// Worker loop; drains the queue before honouring shutdown.
    fn run(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    self.work_ready.wait(&mut state);
                }
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(job));

            let mut state = self.state.lock();
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                warn!(
                    stream = self.id,
                    device_id = self.device_id,
                    %message,
                    "device work faulted"
                );
                state.fault.get_or_insert(message);
            }
            state.completed += 1;
            drop(state);
            self.work_done.notify_all();
        }
    }

    fn wait_for(&self, ticket: u64) {
        let mut state = self.state.lock();
        while state.completed < ticket {
            self.work_done.wait(&mut state);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "device work panicked".to_string()
    }
}

struct Handle {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        // The last handle may be released by a job running on the worker itself.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// =============================================================================
// Stream
// =============================================================================

/// Handle to an accelerator execution stream.
///
/// Cloning yields another handle to the same stream. The worker thread exits
/// once the last handle is dropped and all submitted work has run.
#[derive(Clone)]
pub struct Stream {
    handle: Arc<Handle>,
}

impl Stream {
    /// Creates a new stream bound to accelerator `device_id`.
    pub fn new(device_id: i32) -> Result<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            device_id,
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            work_done: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("hetero-stream-{id}"))
            .spawn(move || worker_shared.run())
            .map_err(|e| Error::dispatch(format!("failed to create stream: {e}")))?;
        let worker_id = worker.thread().id();

        info!(stream = id, device_id, "created stream");

        Ok(Self {
            handle: Arc::new(Handle {
                shared,
                worker: Some(worker),
                worker_id,
            }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// Returns the process-unique id of this stream.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared().id
    }

    /// Returns the accelerator this stream belongs to.
    #[must_use]
    pub fn device_id(&self) -> i32 {
        self.shared().device_id
    }

    /// Appends `job` to the stream and returns without waiting for it.
    pub fn enqueue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.shared();
        let mut state = shared.state.lock();
        if state.shutdown {
            return Err(Error::dispatch(format!("stream {} is shut down", shared.id)));
        }
        state.jobs.push_back(Box::new(job));
        state.submitted += 1;
        drop(state);
        shared.work_ready.notify_one();
        Ok(())
    }

    /// Blocks until all work submitted so far has completed.
    ///
    /// Returns the first fault raised by device work since the previous
    /// synchronize; the fault is cleared once reported.
    pub fn synchronize(&self) -> Result<()> {
        let shared = self.shared();
        let ticket = shared.state.lock().submitted;
        shared.wait_for(ticket);

        let fault = shared.state.lock().fault.take();
        match fault {
            Some(message) => Err(Error::DeviceFault {
                device_id: shared.device_id,
                message,
            }),
            None => Ok(()),
        }
    }

    /// Blocks until all work submitted so far has completed.
    ///
    /// Unlike [`Stream::synchronize`], a pending fault is left in place for
    /// the next synchronize to report.
    pub fn drain(&self) {
        let shared = self.shared();
        let ticket = shared.state.lock().submitted;
        shared.wait_for(ticket);
    }

    /// Marks the current tail of this stream.
    #[must_use]
    pub fn record_event(&self) -> Event {
        let shared = self.shared();
        let ticket = shared.state.lock().submitted;
        Event {
            shared: Arc::clone(shared),
            ticket,
        }
    }

    /// Makes all work enqueued on this stream after this call wait for `event`.
    pub fn wait_event(&self, event: &Event) -> Result<()> {
        if event.stream_id() == self.id() || event.is_complete() {
            return Ok(());
        }
        debug!(
            stream = self.id(),
            waits_on = event.stream_id(),
            "inserted ordering point"
        );
        let event = event.clone();
        self.enqueue(move || event.wait())
    }

    /// Returns the number of jobs ever submitted to this stream.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.shared().state.lock().submitted
    }

    /// Returns the number of jobs that have finished running.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared().state.lock().completed
    }

    /// Returns true if no submitted work is outstanding.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.shared().state.lock();
        state.completed == state.submitted
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

// =============================================================================
// Event
// =============================================================================

/// A recorded position in a stream.
///
/// Complete once every job submitted to the stream before the event was
/// recorded has finished. Holding an event does not keep its stream alive.
#[derive(Clone)]
pub struct Event {
    shared: Arc<Shared>,
    ticket: u64,
}

impl Event {
    /// Returns the id of the stream this event was recorded on.
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.shared.id
    }

    /// Returns true if the recorded work has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().completed >= self.ticket
    }

    /// Blocks until the recorded work has completed.
    pub fn wait(&self) {
        self.shared.wait_for(self.ticket);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("stream_id", &self.stream_id())
            .field("ticket", &self.ticket)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let stream = Stream::new(0).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            stream.enqueue(move || seen.lock().push(i)).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        assert!(stream.is_idle());
        assert_eq!(stream.submitted(), 50);
        assert_eq!(stream.completed(), 50);
    }

    #[test]
    fn test_enqueue_does_not_block() {
        let stream = Stream::new(0).unwrap();
        let gate = Arc::new(AtomicBool::new(false));
        let worker_gate = Arc::clone(&gate);
        stream
            .enqueue(move || {
                while !worker_gate.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert!(!stream.is_idle());
        gate.store(true, Ordering::Release);
        stream.synchronize().unwrap();
        assert!(stream.is_idle());
    }

    #[test]
    fn test_fault_reported_once_at_synchronize() {
        let stream = Stream::new(3).unwrap();
        stream.enqueue(|| panic!("bad index")).unwrap();
        let ran_after = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran_after);
        stream.enqueue(move || flag.store(true, Ordering::Release)).unwrap();

        match stream.synchronize() {
            Err(Error::DeviceFault { device_id, message }) => {
                assert_eq!(device_id, 3);
                assert!(message.contains("bad index"));
            }
            other => panic!("expected device fault, got {other:?}"),
        }
        assert!(ran_after.load(Ordering::Acquire));
        assert!(stream.synchronize().is_ok());
    }

    #[test]
    fn test_drain_keeps_fault_for_synchronize() {
        let stream = Stream::new(1).unwrap();
        stream.enqueue(|| panic!("late fault")).unwrap();
        stream.drain();
        assert!(stream.is_idle());
        assert!(matches!(stream.synchronize(), Err(Error::DeviceFault { device_id: 1, .. })));
    }

    #[test]
    fn test_wait_event_orders_streams() {
        let producer = Stream::new(0).unwrap();
        let consumer = Stream::new(0).unwrap();
        let produced = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&produced);
        producer
            .enqueue(move || {
                thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::Release);
            })
            .unwrap();
        let event = producer.record_event();
        consumer.wait_event(&event).unwrap();

        let (source, sink) = (Arc::clone(&produced), Arc::clone(&observed));
        consumer
            .enqueue(move || sink.store(source.load(Ordering::Acquire), Ordering::Release))
            .unwrap();
        consumer.synchronize().unwrap();

        assert!(event.is_complete());
        assert!(observed.load(Ordering::Acquire));
    }

    #[test]
    fn test_wait_on_own_event_is_noop() {
        let stream = Stream::new(0).unwrap();
        let event = stream.record_event();
        stream.wait_event(&event).unwrap();
        assert_eq!(stream.submitted(), 0);
    }

    #[test]
    fn test_drop_drains_pending_work() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let stream = Stream::new(0).unwrap();
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                stream
                    .enqueue(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_stream_identity() {
        let a = Stream::new(0).unwrap();
        let b = Stream::new(0).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.device_id(), 0);
    }
}
