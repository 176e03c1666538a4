//! Operation Queue
//!
//! Serialises access to a link. Exactly one operation runs at a time; waiting
//! operations are ordered by priority and then by arrival. An operation holds
//! the queue until it releases it, independently of when it emits results.
//!
//! One queue exists per connected link and one per client for connection
//! establishment and teardown.

mod handles;

pub use handles::{OperationEmitter, OperationStream, QueueRelease};

use crate::error::GattError;
use crate::relay::lock;
use async_trait::async_trait;
use core::fmt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Operation Contract
// ----------------------------------------------------------------------------

/// Scheduling class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    /// Dequeued ahead of every waiting normal operation
    High,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
        }
    }
}

/// A unit of work executed against a link
///
/// `run` must release the queue on every exit path. If the caller cancels
/// while the operation is running, the operation stops issuing platform
/// calls and waits for in-flight ones before releasing.
#[async_trait]
pub trait Operation: fmt::Debug + Send + 'static {
    type Output: Send + 'static;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    async fn run(self: Box<Self>, emitter: OperationEmitter<Self::Output>, release: QueueRelease);
}

// ----------------------------------------------------------------------------
// Queue State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    rank: u8,
    sequence: u64,
}

type StartFn = Box<dyn FnOnce(QueueRelease) -> BoxFuture<'static, ()> + Send>;
type FailFn = Box<dyn FnOnce(GattError) + Send>;

struct PendingEntry {
    description: String,
    start: StartFn,
    fail: FailFn,
    queued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<EntryKey, PendingEntry>,
    next_sequence: u64,
    terminated: Option<GattError>,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    wakeup: Arc<Notify>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.wakeup.notify_one();
    }
}

enum Next {
    Run(String, EntryKey, PendingEntry),
    Idle,
    Stop,
}

impl QueueInner {
    fn next_entry(&self) -> Next {
        let mut state = lock(&self.state);
        match state.pending.pop_first() {
            Some((key, entry)) => Next::Run(self.name.clone(), key, entry),
            None if state.terminated.is_some() => Next::Stop,
            None => Next::Idle,
        }
    }
}

/// Removes a not-yet-started entry when its result stream is dropped
pub(crate) struct PendingGuard {
    queue: Weak<QueueInner>,
    key: EntryKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let removed = lock(&queue.state).pending.remove(&self.key);
        if let Some(entry) = removed {
            debug!(queue = %queue.name, operation = %entry.description, "REMOVED");
        }
    }
}

// ----------------------------------------------------------------------------
// Operation Queue
// ----------------------------------------------------------------------------

/// Priority FIFO executor with at most one running operation
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    /// Create a queue and spawn its runner on the current Tokio runtime
    pub fn new(name: impl Into<String>) -> Self {
        let wakeup = Arc::new(Notify::new());
        let inner = Arc::new(QueueInner {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            wakeup: wakeup.clone(),
        });
        tokio::spawn(run_queue(Arc::downgrade(&inner), wakeup));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of operations waiting to start
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.inner.state).terminated.is_some()
    }

    /// Schedule an operation; results arrive on the returned stream
    pub fn enqueue<O: Operation>(&self, operation: O) -> OperationStream<O::Output> {
        let (tx, rx) = mpsc::unbounded_channel();
        let priority = operation.priority();
        let description = format!("{operation:?}");
        let operation = Box::new(operation);
        let emitter = OperationEmitter::new(tx.clone());

        let entry = PendingEntry {
            description: description.clone(),
            start: Box::new(move |release| operation.run(emitter, release)),
            fail: Box::new(move |error| {
                let _ = tx.send(Err(error));
            }),
            queued_at: Instant::now(),
        };

        let mut state = lock(&self.inner.state);
        if let Some(error) = state.terminated.clone() {
            drop(state);
            debug!(queue = %self.inner.name, operation = %description, %error, "REMOVED");
            (entry.fail)(error);
            return OperationStream::new(rx, None);
        }
        let key = EntryKey {
            rank: priority.rank(),
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;
        state.pending.insert(key, entry);
        drop(state);

        debug!(queue = %self.inner.name, operation = %description, ?priority, "QUEUED");
        self.inner.wakeup.notify_one();

        let guard = PendingGuard {
            queue: Arc::downgrade(&self.inner),
            key,
        };
        OperationStream::new(rx, Some(guard))
    }

    /// Fail every waiting operation and reject future ones with `error`
    ///
    /// The running operation, if any, is left to finish on its own.
    pub fn terminate(&self, error: GattError) {
        let drained = {
            let mut state = lock(&self.inner.state);
            if state.terminated.is_some() {
                return;
            }
            state.terminated = Some(error.clone());
            core::mem::take(&mut state.pending)
        };

        info!(queue = %self.inner.name, %error, pending = drained.len(), "Queue terminated");
        for entry in drained.into_values() {
            debug!(queue = %self.inner.name, operation = %entry.description, "REMOVED");
            (entry.fail)(error.clone());
        }
        self.inner.wakeup.notify_one();
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.pending_len())
            .finish()
    }
}

async fn run_queue(queue: Weak<QueueInner>, wakeup: Arc<Notify>) {
    loop {
        let next = match queue.upgrade() {
            Some(queue) => queue.next_entry(),
            None => Next::Stop,
        };

        match next {
            Next::Stop => break,
            Next::Idle => wakeup.notified().await,
            Next::Run(name, _key, entry) => execute(&name, entry).await,
        }
    }
}

async fn execute(queue: &str, entry: PendingEntry) {
    let PendingEntry {
        description,
        start,
        queued_at,
        ..
    } = entry;

    let waited_ms = queued_at.elapsed().as_millis() as u64;
    debug!(queue, operation = %description, waited_ms, "STARTED");

    let started = Instant::now();
    let (release, released) = QueueRelease::new();
    tokio::spawn(start(release));

    // Err means the release was dropped, which also frees the queue.
    let _ = released.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    debug!(queue, operation = %description, elapsed_ms, "FINISHED");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Trace = Arc<Mutex<Vec<String>>>;

    /// Records start and release, optionally waiting for a signal in between
    struct Traced {
        name: String,
        priority: Priority,
        trace: Trace,
        started: Option<oneshot::Sender<()>>,
        hold: Option<oneshot::Receiver<()>>,
    }

    impl Traced {
        fn new(name: impl Into<String>, priority: Priority, trace: &Trace) -> Self {
            Self {
                name: name.into(),
                priority,
                trace: trace.clone(),
                started: None,
                hold: None,
            }
        }
    }

    impl fmt::Debug for Traced {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Traced({})", self.name)
        }
    }

    #[async_trait]
    impl Operation for Traced {
        type Output = String;

        fn priority(&self) -> Priority {
            self.priority
        }

        async fn run(self: Box<Self>, emitter: OperationEmitter<String>, release: QueueRelease) {
            let Traced {
                name,
                trace,
                started,
                hold,
                ..
            } = *self;
            lock(&trace).push(format!("start {name}"));
            if let Some(started) = started {
                let _ = started.send(());
            }
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            tokio::task::yield_now().await;
            lock(&trace).push(format!("release {name}"));
            release.release();
            emitter.emit(name);
        }
    }

    fn starts(trace: &Trace) -> Vec<String> {
        lock(trace)
            .iter()
            .filter_map(|entry| entry.strip_prefix("start ").map(str::to_string))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        let queue = OperationQueue::new("test");
        let trace: Trace = Arc::default();
        let mut callers = Vec::new();
        for name in (0..24).map(|i| format!("op{i}")) {
            let queue = queue.clone();
            let trace = trace.clone();
            callers.push(tokio::spawn(async move {
                queue.enqueue(Traced::new(name, Priority::Normal, &trace)).single().await
            }));
        }
        for caller in callers {
            assert!(caller.await.unwrap().is_ok());
        }

        let trace = lock(&trace).clone();
        assert_eq!(trace.len(), 48);
        for pair in trace.chunks(2) {
            let started = pair[0].strip_prefix("start ").unwrap();
            let released = pair[1].strip_prefix("release ").unwrap();
            assert_eq!(started, released);
        }
    }

    #[tokio::test]
    async fn test_high_priority_jumps_waiting_operations() {
        let queue = OperationQueue::new("test");
        let trace: Trace = Arc::default();

        let (started_tx, started_rx) = oneshot::channel();
        let (hold_tx, hold_rx) = oneshot::channel();
        let mut running = Traced::new("running", Priority::Normal, &trace);
        running.started = Some(started_tx);
        running.hold = Some(hold_rx);

        let running = queue.enqueue(running);
        started_rx.await.unwrap();

        let a = queue.enqueue(Traced::new("A", Priority::Normal, &trace));
        let b = queue.enqueue(Traced::new("B", Priority::High, &trace));
        let c = queue.enqueue(Traced::new("C", Priority::Normal, &trace));
        assert_eq!(queue.pending_len(), 3);

        hold_tx.send(()).unwrap();
        let results = futures::future::join4(running.single(), a.single(), b.single(), c.single()).await;
        assert_eq!(results.0.unwrap(), "running");
        assert_eq!(results.2.unwrap(), "B");

        assert_eq!(starts(&trace), vec!["running", "B", "A", "C"]);
    }

    #[tokio::test]
    async fn test_dropping_waiting_operation_removes_it() {
        let queue = OperationQueue::new("test");
        let trace: Trace = Arc::default();

        let (started_tx, started_rx) = oneshot::channel();
        let (hold_tx, hold_rx) = oneshot::channel();
        let mut running = Traced::new("running", Priority::Normal, &trace);
        running.started = Some(started_tx);
        running.hold = Some(hold_rx);
        let running = queue.enqueue(running);
        started_rx.await.unwrap();

        let cancelled = queue.enqueue(Traced::new("cancelled", Priority::Normal, &trace));
        let kept = queue.enqueue(Traced::new("kept", Priority::Normal, &trace));
        drop(cancelled);
        assert_eq!(queue.pending_len(), 1);

        hold_tx.send(()).unwrap();
        running.single().await.unwrap();
        kept.single().await.unwrap();
        assert_eq!(starts(&trace), vec!["running", "kept"]);
    }

    #[tokio::test]
    async fn test_terminate_fails_waiting_and_future_operations() {
        let queue = OperationQueue::new("test");
        let trace: Trace = Arc::default();

        let (started_tx, started_rx) = oneshot::channel();
        let (hold_tx, hold_rx) = oneshot::channel();
        let mut running = Traced::new("running", Priority::Normal, &trace);
        running.started = Some(started_tx);
        running.hold = Some(hold_rx);
        let running = queue.enqueue(running);
        started_rx.await.unwrap();

        let waiting = queue.enqueue(Traced::new("waiting", Priority::Normal, &trace));
        let error = GattError::QueueTerminated { reason: "test".into() };
        queue.terminate(error.clone());

        assert_eq!(waiting.single().await.unwrap_err(), error);
        let mut late = queue.enqueue(Traced::new("late", Priority::Normal, &trace));
        assert_eq!(late.next().await.unwrap().unwrap_err(), error);
        assert!(late.next().await.is_none());

        hold_tx.send(()).unwrap();
        assert_eq!(running.single().await.unwrap(), "running");
        assert_eq!(starts(&trace), vec!["running"]);
    }

    #[derive(Debug)]
    struct Forgetful;

    #[async_trait]
    impl Operation for Forgetful {
        type Output = ();

        async fn run(self: Box<Self>, _emitter: OperationEmitter<()>, _release: QueueRelease) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_dropped_release_frees_queue() {
        let queue = OperationQueue::new("test");
        let trace: Trace = Arc::default();

        let forgetful = queue.enqueue(Forgetful);
        assert!(matches!(
            forgetful.single().await,
            Err(GattError::QueueTerminated { .. })
        ));
        let next = queue.enqueue(Traced::new("next", Priority::Normal, &trace));
        assert_eq!(next.single().await.unwrap(), "next");
    }
}
