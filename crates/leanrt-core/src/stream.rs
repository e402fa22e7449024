//! Streams: FIFO execution queues with a dedicated worker thread.
//!
//! Work submitted to a stream runs in submission order on the stream's
//! worker. Submission never blocks on execution; completion is observed
//! through `Stream::synchronize`, `Stream::query` or an `Event` recorded on
//! the stream.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use lazy_static::lazy_static;
use tracing::{debug, warn};

use crate::error::StreamError;

type Task = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref DEFAULT_STREAM: Stream = Stream::spawn(true).unwrap_or_else(|e| {
        warn!("Default stream unavailable: {}", e);
        Stream::closed(true)
    });
}

struct StreamShared {
    state: Mutex<StreamState>,
    idle: Condvar,
}

#[derive(Default)]
struct StreamState {
    submitted: u64,
    completed: u64,
    error: Option<String>,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue of work executed by one worker thread.
///
/// Dropping a stream stops accepting work, drains what is queued and joins
/// the worker.
pub struct Stream {
    id: u64,
    is_default: bool,
    shared: Arc<StreamShared>,
    tx: Option<mpsc::Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Create a stream with its own worker thread.
    pub fn new() -> Result<Self, StreamError> {
        Self::spawn(false)
    }

    /// The process-wide default stream.
    ///
    /// Legal to use everywhere, but work from unrelated callers serializes
    /// behind it and cannot overlap; prefer a dedicated stream.
    pub fn default_stream() -> &'static Stream {
        &DEFAULT_STREAM
    }

    fn spawn(is_default: bool) -> Result<Self, StreamError> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState::default()),
            idle: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel::<Task>();

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("leanrt-stream-{}", id))
            .spawn(move || worker_loop(rx, worker_shared))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;

        debug!("Started stream {}", id);

        Ok(Self {
            id,
            is_default,
            shared,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn closed(is_default: bool) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            is_default,
            shared: Arc::new(StreamShared {
                state: Mutex::new(StreamState::default()),
                idle: Condvar::new(),
            }),
            tx: None,
            worker: None,
        }
    }

    /// Unique id of this stream.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this is the process-wide default stream.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Queue `task` behind all previously submitted work.
    ///
    /// A task returning `Err` marks the stream as failed; the error is
    /// reported by the next `synchronize`. Later tasks still run.
    pub fn submit<F>(&self, task: F) -> Result<(), StreamError>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(StreamError::Closed)?;
        let mut state = self.shared.lock();
        tx.send(Box::new(task)).map_err(|_| StreamError::Closed)?;
        state.submitted += 1;
        Ok(())
    }

    /// Block until every submitted task has finished.
    ///
    /// Returns the first failure recorded since the previous call.
    pub fn synchronize(&self) -> Result<(), StreamError> {
        let mut state = self.shared.lock();
        while state.completed < state.submitted {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.error.take() {
            Some(msg) => Err(StreamError::LaunchFailed(msg)),
            None => Ok(()),
        }
    }

    /// Whether all submitted work has finished.
    pub fn query(&self) -> bool {
        let state = self.shared.lock();
        state.completed == state.submitted
    }

    /// Number of tasks submitted but not finished.
    pub fn pending(&self) -> u64 {
        let state = self.shared.lock();
        state.submitted - state.completed
    }

    /// Record a new event that completes once all current work has run.
    pub fn record_event(&self) -> Result<Event, StreamError> {
        let event = Event::new();
        event.record(self)?;
        Ok(event)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("is_default", &self.is_default)
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(rx: mpsc::Receiver<Task>, shared: Arc<StreamShared>) {
    for task in rx {
        let outcome = catch_unwind(AssertUnwindSafe(task));

        let mut state = shared.lock();
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(msg)) => Some(msg),
            Err(_) => Some("task panicked".to_string()),
        };
        if let Some(msg) = failure {
            state.error.get_or_insert(msg);
        }
        state.completed += 1;
        shared.idle.notify_all();
    }
}

struct EventShared {
    pending: Mutex<u64>,
    signalled: Condvar,
}

/// Completion marker for work on a stream.
///
/// An event that was never recorded counts as complete. Clones share state.
#[derive(Clone)]
pub struct Event {
    shared: Arc<EventShared>,
}

impl Event {
    /// Create an event with nothing pending.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EventShared {
                pending: Mutex::new(0),
                signalled: Condvar::new(),
            }),
        }
    }

    /// Mark the event pending until all work currently on `stream` has run.
    pub fn record(&self, stream: &Stream) -> Result<(), StreamError> {
        self.arm();
        let event = self.clone();
        stream
            .submit(move || {
                event.signal();
                Ok(())
            })
            .inspect_err(|_| self.signal())
    }

    /// Block until the event completes.
    pub fn synchronize(&self) {
        let mut pending = self.lock();
        while *pending > 0 {
            pending = self
                .shared
                .signalled
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether the event has completed.
    pub fn query(&self) -> bool {
        *self.lock() == 0
    }

    pub(crate) fn arm(&self) {
        *self.lock() += 1;
    }

    pub(crate) fn signal(&self) {
        let mut pending = self.lock();
        *pending = pending.saturating_sub(1);
        self.shared.signalled.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("complete", &self.query()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order() {
        let stream = Stream::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .submit(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert!(stream.query());
    }

    #[test]
    fn test_submit_does_not_wait() {
        let stream = Stream::new().unwrap();
        let (release_tx, release_rx) = channel::<()>();
        stream
            .submit(move || {
                release_rx.recv_timeout(Duration::from_secs(5)).map_err(|e| e.to_string())
            })
            .unwrap();

        assert!(!stream.query());
        assert_eq!(stream.pending(), 1);
        release_tx.send(()).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_failure_reported_once() {
        let stream = Stream::new().unwrap();
        stream.submit(|| Err("bad kernel".to_string())).unwrap();
        stream.submit(|| Ok(())).unwrap();

        assert_eq!(
            stream.synchronize(),
            Err(StreamError::LaunchFailed("bad kernel".to_string()))
        );
        assert_eq!(stream.synchronize(), Ok(()));
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let stream = Stream::new().unwrap();
        stream.submit(|| panic!("kernel crashed")).unwrap();
        assert!(stream.synchronize().is_err());

        stream.submit(|| Ok(())).unwrap();
        assert_eq!(stream.synchronize(), Ok(()));
    }

    #[test]
    fn test_event_tracks_stream_position() {
        let stream = Stream::new().unwrap();
        let (release_tx, release_rx) = channel::<()>();
        stream
            .submit(move || {
                release_rx.recv_timeout(Duration::from_secs(5)).map_err(|e| e.to_string())
            })
            .unwrap();

        let event = stream.record_event().unwrap();
        assert!(!event.query());
        release_tx.send(()).unwrap();
        event.synchronize();
        assert!(event.query());
    }

    #[test]
    fn test_unrecorded_event_is_complete() {
        let event = Event::new();
        assert!(event.query());
        event.synchronize();
    }

    #[test]
    fn test_default_stream_is_shared() {
        let a = Stream::default_stream();
        let b = Stream::default_stream();
        assert_eq!(a.id(), b.id());
        assert!(a.is_default());
        assert!(!Stream::new().unwrap().is_default());
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(Mutex::new(0));
        {
            let stream = Stream::new().unwrap();
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                stream
                    .submit(move || {
                        *counter.lock().unwrap() += 1;
                        Ok(())
                    })
                    .unwrap();
            }
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
