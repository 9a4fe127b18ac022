//! Operation queue: many producers, one consumer on the host thread.
//!
//! Any thread may [`QueueSender::submit`] a closure. Exactly one
//! [`OperationQueue`] (not `Clone`) drains them, one at a time, on the host
//! thread. Ordering is FIFO per producer; there is no ordering across
//! producers, so completions surface in the order their work actually finished.
//!
//! Submissions made from the host thread itself go to a host-local deque and
//! never touch the channel, so a bounded channel can block workers but can never
//! block the consumer on itself.

mod metrics;

pub use metrics::{QueueCounters, QueueMetrics};

use crate::config::QueueConfig;
use crate::error::OperationError;
use crate::scope::HostScope;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Boxed operation body.
pub type Task = Box<dyn FnOnce(&mut dyn HostScope) -> Result<(), OperationError> + Send>;

/// Diagnostic tag naming who submitted an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(Arc<str>);

impl Origin {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Origin {
    fn from(s: &str) -> Self {
        Origin(Arc::from(s))
    }
}

impl From<String> for Origin {
    fn from(s: String) -> Self {
        Origin(Arc::from(s))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A closure waiting for the host thread.
pub struct QueuedOperation {
    origin: Origin,
    task: Task,
    enqueued_at: Instant,
}

impl QueuedOperation {
    pub fn new<F>(origin: impl Into<Origin>, task: F) -> Self
    where
        F: FnOnce(&mut dyn HostScope) -> Result<(), OperationError> + Send + 'static,
    {
        Self {
            origin: origin.into(),
            task: Box::new(task),
            enqueued_at: Instant::now(),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("origin", &self.origin)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// How a bounded drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing queued and no outstanding async work.
    Idle,
    /// The deadline passed with work still outstanding.
    TimedOut,
}

struct Shared {
    tx: Sender<QueuedOperation>,
    local: Mutex<VecDeque<QueuedOperation>>,
    host_thread: RwLock<ThreadId>,
    closed: AtomicBool,
    pending: AtomicUsize,
    counters: QueueCounters,
}

impl Shared {
    fn on_host_thread(&self) -> bool {
        *self.host_thread.read() == thread::current().id()
    }
}

/// Producer handle. Cheap to clone; safe to use from any thread.
#[derive(Clone)]
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl QueueSender {
    /// Submit a closure for execution on the host thread.
    ///
    /// Never blocks on an unbounded queue. Returns `false` when the queue is
    /// closed; the operation is then dropped without running.
    pub fn submit<F>(&self, origin: impl Into<Origin>, task: F) -> bool
    where
        F: FnOnce(&mut dyn HostScope) -> Result<(), OperationError> + Send + 'static,
    {
        self.submit_operation(QueuedOperation::new(origin, task))
    }

    pub fn submit_operation(&self, op: QueuedOperation) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.counters.record_drop();
            debug!(origin = %op.origin, "queue closed, dropping operation");
            return false;
        }

        self.shared.counters.record_submit();
        if self.shared.on_host_thread() {
            self.shared.local.lock().push_back(op);
            return true;
        }

        match self.shared.tx.send(op) {
            Ok(()) => true,
            Err(flume::SendError(op)) => {
                self.shared.counters.record_drop();
                debug!(origin = %op.origin, "queue consumer gone, dropping operation");
                false
            }
        }
    }

    /// Register a unit of outstanding async work.
    ///
    /// The drain loop keeps running while any ticket is alive. Move the ticket
    /// into the operation that completes the work so it is released after the
    /// completion has been delivered (or when the work is abandoned).
    pub fn ticket(&self) -> WorkTicket {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        WorkTicket {
            shared: self.shared.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for QueueSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outstanding async work; released on drop.
pub struct WorkTicket {
    shared: Arc<Shared>,
}

impl Drop for WorkTicket {
    fn drop(&mut self) {
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for WorkTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkTicket")
    }
}

/// The single consumer.
pub struct OperationQueue {
    shared: Arc<Shared>,
    rx: Receiver<QueuedOperation>,
    idle_poll: Duration,
    prefer_local: bool,
}

impl OperationQueue {
    /// Create an unbounded queue bound to the calling thread.
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self::with_channel(tx, rx)
    }

    /// Create a queue whose cross-thread channel holds at most `capacity`
    /// operations; producers on other threads block while it is full.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self::with_channel(tx, rx)
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        let queue = match config.capacity {
            0 => Self::unbounded(),
            capacity => Self::bounded(capacity),
        };
        queue.with_idle_poll(Duration::from_millis(config.idle_poll_ms.max(1)))
    }

    fn with_channel(tx: Sender<QueuedOperation>, rx: Receiver<QueuedOperation>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tx,
                local: Mutex::new(VecDeque::new()),
                host_thread: RwLock::new(thread::current().id()),
                closed: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                counters: QueueCounters::default(),
            }),
            rx,
            idle_poll: Duration::from_millis(5),
            prefer_local: true,
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Make the calling thread the host thread.
    pub fn bind_to_current_thread(&self) {
        *self.shared.host_thread.write() = thread::current().id();
    }

    pub fn sender(&self) -> QueueSender {
        QueueSender {
            shared: self.shared.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.local.lock().len() + self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live [`WorkTicket`]s.
    pub fn pending_work(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Nothing queued and nothing outstanding.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.pending_work() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.shared
            .counters
            .snapshot(self.len(), self.pending_work())
    }

    // Alternate between host-local and cross-thread work so neither starves.
    fn next_ready(&mut self) -> Option<QueuedOperation> {
        let from_local = |shared: &Shared| shared.local.lock().pop_front();
        let from_channel = |rx: &Receiver<QueuedOperation>| match rx.try_recv() {
            Ok(op) => Some(op),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        };

        let op = if self.prefer_local {
            from_local(&self.shared).or_else(|| from_channel(&self.rx))
        } else {
            from_channel(&self.rx).or_else(|| from_local(&self.shared))
        };
        self.prefer_local = !self.prefer_local;
        op
    }

    fn execute(&self, op: QueuedOperation, scope: &mut dyn HostScope) {
        let QueuedOperation {
            origin,
            task,
            enqueued_at,
        } = op;
        debug!(
            origin = %origin,
            waited_us = enqueued_at.elapsed().as_micros() as u64,
            "executing queued operation"
        );

        match panic::catch_unwind(AssertUnwindSafe(|| task(scope))) {
            Ok(Ok(())) => self.shared.counters.record_executed(),
            Ok(Err(err)) => {
                self.shared.counters.record_failed();
                warn!(origin = %origin, error = %err, "queued operation failed");
            }
            Err(payload) => {
                self.shared.counters.record_failed();
                error!(
                    origin = %origin,
                    panic = %panic_message(payload.as_ref()),
                    "queued operation panicked"
                );
            }
        }
    }

    /// Execute at most one ready operation. Returns whether one ran.
    pub fn drain_once(&mut self, scope: &mut dyn HostScope) -> bool {
        match self.next_ready() {
            Some(op) => {
                self.execute(op, scope);
                true
            }
            None => false,
        }
    }

    /// Execute everything that is ready right now, including operations those
    /// operations submit. Does not wait for outstanding work.
    pub fn drain(&mut self, scope: &mut dyn HostScope) -> usize {
        let mut executed = 0;
        while self.drain_once(scope) {
            executed += 1;
        }
        executed
    }

    /// Drain until nothing is queued and no work ticket is alive.
    pub fn run_until_idle(&mut self, scope: &mut dyn HostScope) -> usize {
        let mut executed = 0;
        while self.step(scope, self.idle_poll, &mut executed) {}
        executed
    }

    /// Like [`run_until_idle`](Self::run_until_idle) but gives up at `timeout`.
    pub fn run_for(&mut self, scope: &mut dyn HostScope, timeout: Duration) -> RunOutcome {
        let deadline = Instant::now() + timeout;
        let mut executed = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return if self.is_idle() {
                    RunOutcome::Idle
                } else {
                    RunOutcome::TimedOut
                };
            }
            let wait = self.idle_poll.min(deadline - now);
            if !self.step(scope, wait, &mut executed) {
                return RunOutcome::Idle;
            }
        }
    }

    // One loop iteration; false once idle.
    fn step(&mut self, scope: &mut dyn HostScope, wait: Duration, executed: &mut usize) -> bool {
        if self.drain_once(scope) {
            *executed += 1;
            return true;
        }
        if self.pending_work() == 0 && self.is_empty() {
            return false;
        }
        match self.rx.recv_timeout(wait) {
            Ok(op) => {
                self.execute(op, scope);
                *executed += 1;
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Stop accepting submissions and discard whatever is still queued.
    ///
    /// Later submissions are dropped silently (see [`QueueSender::submit`]).
    pub fn close(&mut self) -> usize {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut discarded = 0;
        while self.next_ready().is_some() {
            discarded += 1;
        }
        info!(discarded, "operation queue closed");
        discarded
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.len())
            .field("pending_work", &self.pending_work())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
