//! Serialized execution queues.
//!
//! An [`ExecutionQueue`] linearizes concurrent submissions into a pipeline
//! with at most one consumer running at any time. The consumer is started
//! on demand by whichever producer finds the queue idle and exits when the
//! queue drains — there is no resident consumer fiber. Within a priority,
//! tasks are delivered to the batch handler in submission order;
//! high-priority tasks jump ahead of pending normal tasks at the next batch
//! boundary, never mid-batch.
//!
//! ```no_run
//! use melon_fiber::{ExecutionQueue, QueueOptions, Runtime, RuntimeConfig};
//!
//! let rt = Runtime::start(RuntimeConfig::default()).unwrap();
//! let queue = ExecutionQueue::start(&rt, QueueOptions::default(), |batch| {
//!     for value in batch {
//!         println!("got {value}");
//!     }
//! });
//! queue.execute(42).unwrap();
//! queue.stop();
//! queue.join().unwrap();
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::id::QueueId;
use crate::park::word::{ParkingWord, WordWait};
use crate::runtime::Runtime;
use crate::sched::worker;
use crate::task::entity::TaskAttrs;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Options fixed at queue start.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Upper bound on tasks handed to one `on_batch` invocation.
    pub batch_cap: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { batch_cap: 64 }
    }
}

/// Per-task submission options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// High-priority tasks are dispatched before pending normal tasks at
    /// the next batch boundary.
    pub high_priority: bool,
    /// Run the consumer on the submitting fiber when the queue was idle,
    /// instead of spawning one. Misuse can deadlock: the batch handler runs
    /// under the caller's stack and locks.
    pub in_place_if_possible: bool,
}

/// Submit with defaults.
pub const TASK_OPTIONS_NORMAL: TaskOptions = TaskOptions {
    high_priority: false,
    in_place_if_possible: false,
};
/// Submit ahead of pending normal tasks.
pub const TASK_OPTIONS_URGENT: TaskOptions = TaskOptions {
    high_priority: true,
    in_place_if_possible: false,
};
/// Submit and consume on the calling fiber when possible.
pub const TASK_OPTIONS_INPLACE: TaskOptions = TaskOptions {
    high_priority: false,
    in_place_if_possible: true,
};

mod node_state {
    pub(super) const PENDING: u8 = 0;
    pub(super) const EXECUTING: u8 = 1;
    pub(super) const DONE: u8 = 2;
    pub(super) const CANCELED: u8 = 3;
}

/// Outcome of [`ExecutionQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was removed before dispatch; its payload is never presented.
    Canceled,
    /// The task is in the batch being consumed right now.
    Executing,
    /// The task already completed (or was already canceled).
    TooLate,
}

struct NodeCtl {
    state: AtomicU8,
}

/// Handle for canceling one submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    ctl: Arc<NodeCtl>,
}

impl TaskHandle {
    /// Cancels the task. [`CancelOutcome::Canceled`] guarantees the payload
    /// is never presented to the batch handler.
    pub fn cancel(&self) -> CancelOutcome {
        match self.ctl.state.compare_exchange(
            node_state::PENDING,
            node_state::CANCELED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => CancelOutcome::Canceled,
            Err(node_state::EXECUTING) => CancelOutcome::Executing,
            Err(_) => CancelOutcome::TooLate,
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskHandle(state={})", self.ctl.state.load(Ordering::Relaxed))
    }
}

struct Node<T> {
    payload: T,
    ctl: Arc<NodeCtl>,
}

struct QueueState<T> {
    normal: VecDeque<Node<T>>,
    high: VecDeque<Node<T>>,
    stopped: bool,
    stop_delivered: bool,
}

type BatchHandler<T> = Box<dyn FnMut(&mut TaskBatch<T>) + Send + 'static>;

struct QueueInner<T> {
    id: QueueId,
    runtime: Arc<Runtime>,
    options: QueueOptions,
    state: Mutex<QueueState<T>>,
    handler: Mutex<BatchHandler<T>>,
    has_consumer: AtomicBool,
    /// 0 until the stop sentinel has been delivered, then 1.
    joined: ParkingWord,
}

/// One delivery to the batch handler: an iterator over payloads plus the
/// stop marker.
pub struct TaskBatch<T> {
    items: std::vec::IntoIter<T>,
    stopped: bool,
}

impl<T> TaskBatch<T> {
    /// True exactly once per queue: the final, empty delivery after `stop`.
    /// All resources tied to the queue may be released when this is seen.
    #[must_use]
    pub fn is_queue_stopped(&self) -> bool {
        self.stopped
    }

    /// Tasks remaining in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the batch carries no payloads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.len() == 0
    }
}

impl<T> Iterator for TaskBatch<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

/// A serialized task dispatcher; clone handles freely, they share the queue.
pub struct ExecutionQueue<T: Send + 'static> {
    inner: Arc<QueueInner<T>>,
}

impl<T: Send + 'static> Clone for ExecutionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for ExecutionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionQueue({:?})", self.inner.id)
    }
}

impl<T: Send + 'static> ExecutionQueue<T> {
    /// Starts a queue. `on_batch` is invoked by the (single) consumer with
    /// successive batches; no two invocations for the same queue ever run
    /// concurrently.
    pub fn start<F>(runtime: &Arc<Runtime>, options: QueueOptions, on_batch: F) -> Self
    where
        F: FnMut(&mut TaskBatch<T>) + Send + 'static,
    {
        let id = QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed));
        trace!(queue = ?id, "execution queue started");
        Self {
            inner: Arc::new(QueueInner {
                id,
                runtime: Arc::clone(runtime),
                options,
                state: Mutex::new(QueueState {
                    normal: VecDeque::new(),
                    high: VecDeque::new(),
                    stopped: false,
                    stop_delivered: false,
                }),
                handler: Mutex::new(Box::new(on_batch)),
                has_consumer: AtomicBool::new(false),
                joined: ParkingWord::new(0),
            }),
        }
    }

    /// This queue's identifier, for logs.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    /// Submits a task with default options.
    pub fn execute(&self, task: T) -> Result<TaskHandle> {
        self.execute_with(task, &TASK_OPTIONS_NORMAL)
    }

    /// Submits a task. Fails with [`ErrorKind::QueueStopped`] once `stop`
    /// has been called.
    pub fn execute_with(&self, task: T, options: &TaskOptions) -> Result<TaskHandle> {
        let ctl = Arc::new(NodeCtl {
            state: AtomicU8::new(node_state::PENDING),
        });
        let node = Node {
            payload: task,
            ctl: Arc::clone(&ctl),
        };
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(Error::new(ErrorKind::QueueStopped));
            }
            if options.high_priority {
                state.high.push_back(node);
            } else {
                state.normal.push_back(node);
            }
        }
        self.ensure_consumer(options.in_place_if_possible);
        Ok(TaskHandle { ctl })
    }

    /// Cancels a submitted task; equivalent to [`TaskHandle::cancel`].
    pub fn cancel(handle: &TaskHandle) -> CancelOutcome {
        handle.cancel()
    }

    /// Stops the queue: pending tasks still drain, then the handler sees one
    /// final batch with [`TaskBatch::is_queue_stopped`] set.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        trace!(queue = ?self.inner.id, "execution queue stopping");
        self.ensure_consumer(false);
    }

    /// Blocks until the stop sentinel has been delivered.
    pub fn join(&self) -> Result<()> {
        loop {
            if self.inner.joined.load() != 0 {
                return Ok(());
            }
            match self.inner.joined.wait_while_equals(0, None) {
                WordWait::Canceled => return Err(Error::new(ErrorKind::Canceled)),
                WordWait::Woke | WordWait::Mismatch | WordWait::TimedOut => {}
            }
        }
    }

    /// Arms a consumer if none is live. The producer that wins the
    /// compare-exchange owns starting it.
    fn ensure_consumer(&self, in_place: bool) {
        if self
            .inner
            .has_consumer
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if in_place && worker::current_fiber().is_some() {
            Self::consume(&self.inner);
            return;
        }
        let inner = Arc::clone(&self.inner);
        let spawned = self
            .inner
            .runtime
            .spawn_with(TaskAttrs::system_default(), move || {
                Self::consume(&inner);
            });
        if let Err(err) = spawned {
            // Roll back so a later submission (or stop) retries.
            self.inner.has_consumer.store(false, Ordering::SeqCst);
            warn!(queue = ?self.inner.id, "failed to spawn queue consumer: {err}");
        }
    }

    /// The consumer loop. Holds the `has_consumer` flag; exits only after a
    /// drain-recheck handshake so a producer that linked a task while we
    /// were clearing the flag re-arms instead of stranding it.
    fn consume(inner: &Arc<QueueInner<T>>) {
        loop {
            let (mut batch, ctls, deliver_stop) = {
                let mut state = inner.state.lock();
                let cap = inner.options.batch_cap.max(1);
                let source = if state.high.is_empty() {
                    &mut state.normal
                } else {
                    &mut state.high
                };
                let mut items = Vec::new();
                let mut ctls = Vec::new();
                while items.len() < cap {
                    let Some(node) = source.pop_front() else {
                        break;
                    };
                    // A canceled payload is never presented.
                    if node
                        .ctl
                        .state
                        .compare_exchange(
                            node_state::PENDING,
                            node_state::EXECUTING,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        items.push(node.payload);
                        ctls.push(node.ctl);
                    }
                }
                let deliver_stop = items.is_empty()
                    && state.stopped
                    && !state.stop_delivered
                    && state.high.is_empty()
                    && state.normal.is_empty();
                if deliver_stop {
                    state.stop_delivered = true;
                }
                (
                    TaskBatch {
                        items: items.into_iter(),
                        stopped: deliver_stop,
                    },
                    ctls,
                    deliver_stop,
                )
            };

            if deliver_stop {
                (*inner.handler.lock())(&mut batch);
                inner.joined.set_and_wake_all(1);
                inner.has_consumer.store(false, Ordering::SeqCst);
                trace!(queue = ?inner.id, "execution queue stopped");
                return;
            }

            if batch.is_empty() && ctls.is_empty() {
                // Nothing to do: step down, then re-check for a racing
                // producer.
                inner.has_consumer.store(false, Ordering::SeqCst);
                let rearm = {
                    let state = inner.state.lock();
                    !state.high.is_empty()
                        || !state.normal.is_empty()
                        || (state.stopped && !state.stop_delivered)
                };
                if rearm
                    && inner
                        .has_consumer
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                return;
            }

            (*inner.handler.lock())(&mut batch);
            drop(batch);
            for ctl in ctls {
                ctl.state.store(node_state::DONE, Ordering::SeqCst);
            }
        }
    }
}
