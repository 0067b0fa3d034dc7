//! The process-wide runtime: scheduling groups, startup/shutdown, and the
//! spawn/join/yield/sleep surface.
//!
//! The runtime is an explicit object passed (as `Arc`) into every entry
//! point; the only ambient state is a thread-local pointer on worker threads
//! that lets free functions like [`yield_now`] and [`sleep_for`] find the
//! current fiber. There is no global singleton.

use crate::clock::{self, TimePoint};
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::id::{FiberId, SessionId, TimerId};
use crate::park::word::{WaitNode, WordWait};
use crate::sched::worker::{self, PostSwap};
use crate::sched::SchedulingGroup;
use crate::sync::session::{SessionCallback, SessionRegistry};
use crate::task::entity::{Affinity, TaskAttrs};
use crate::timer::CancelResult;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

thread_local! {
    /// Set for the lifetime of a worker thread; holds the runtime weakly so
    /// parked workers do not keep a runtime alive after its last user
    /// handle is gone.
    static CURRENT: RefCell<Option<Weak<Runtime>>> = const { RefCell::new(None) };
}

/// Handle to a running fiber runtime.
///
/// Dropping the last handle shuts the runtime down; [`Runtime::shutdown`]
/// does so explicitly and joins the worker threads.
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    groups: Vec<Arc<SchedulingGroup>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    next_group: AtomicUsize,
    stopping: AtomicBool,
    pub(crate) sessions: SessionRegistry,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("groups", &self.groups.len())
            .field("workers_per_group", &self.config.workers_per_group)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Validates the configuration, builds the scheduling groups, and starts
    /// the worker threads.
    pub fn start(config: RuntimeConfig) -> std::result::Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let groups: Vec<Arc<SchedulingGroup>> = (0..config.groups)
            .map(|index| SchedulingGroup::new(index, Arc::clone(&config)))
            .collect();

        let runtime = Arc::new(Self {
            groups: groups.clone(),
            threads: Mutex::new(Vec::new()),
            next_group: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            sessions: SessionRegistry::new(),
            config: Arc::clone(&config),
        });

        let mut threads = runtime.threads.lock();
        for group in &groups {
            for index in 0..config.workers_per_group {
                let group = Arc::clone(group);
                let handle = Arc::downgrade(&runtime);
                let name = format!(
                    "{}-{}-{}",
                    config.worker_name_prefix, group.index, index
                );
                let thread = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        CURRENT.with(|cell| *cell.borrow_mut() = Some(handle));
                        worker::worker_main(group, index);
                        CURRENT.with(|cell| cell.borrow_mut().take());
                    })
                    .map_err(|err| {
                        ConfigError::Invalid(format!("failed to start worker thread: {err}"))
                    })?;
                threads.push(thread);
            }
        }
        drop(threads);

        info!(
            groups = config.groups,
            workers = config.workers_per_group,
            "fiber runtime started"
        );
        Ok(runtime)
    }

    /// Like [`Runtime::start`], with `MELON_FIBER_*` environment overrides.
    pub fn start_from_env() -> std::result::Result<Arc<Self>, ConfigError> {
        Self::start(RuntimeConfig::from_env()?)
    }

    /// The runtime owning the current worker thread, if this thread is one.
    ///
    /// A convenience for code that is already running on a fiber and needs
    /// to spawn, start queues, or touch sessions without threading the
    /// handle through every call; everywhere else the runtime is passed
    /// explicitly. Returns `None` on non-worker threads and during the
    /// runtime's final teardown.
    #[must_use]
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Stops dispatch, wakes every worker, and joins the worker threads.
    ///
    /// Idempotent. When called from a worker thread the join step is
    /// skipped (a worker cannot join itself); the threads exit on their own
    /// once their queues drain.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("runtime shutdown requested");
        for group in &self.groups {
            group.begin_shutdown();
        }
        let on_worker = self
            .groups
            .iter()
            .any(|group| worker::current_worker_in(group).is_some());
        if on_worker {
            warn!("shutdown called from a worker; skipping thread join");
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("fiber runtime stopped");
    }

    /// The runtime configuration in effect.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ---------------------------------------------------------------- spawn

    /// Spawns a fiber with default attributes.
    pub fn spawn<F>(self: &Arc<Self>, entry: F) -> Result<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(TaskAttrs::default(), entry)
    }

    /// Spawns a fiber with explicit attributes.
    pub fn spawn_with<F>(self: &Arc<Self>, attrs: TaskAttrs, entry: F) -> Result<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        let group = self.pick_group(attrs.affinity);
        let id = group.create_task(Box::new(entry), attrs)?;
        group.schedule(id);
        Ok(JoinHandle {
            id,
            group,
        })
    }

    fn pick_group(&self, affinity: Affinity) -> Arc<SchedulingGroup> {
        let index = match affinity {
            Affinity::Current => self
                .groups
                .iter()
                .position(|group| worker::current_worker_in(group).is_some())
                .unwrap_or(0),
            Affinity::Any => self.next_group.fetch_add(1, Ordering::Relaxed) % self.groups.len(),
            Affinity::System => self.groups.len() - 1,
        };
        Arc::clone(&self.groups[index])
    }

    // --------------------------------------------------------------- timers

    /// Registers a callback to run as a fresh fiber at `deadline`.
    pub fn timer_add<F>(self: &Arc<Self>, deadline: TimePoint, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let group = self.pick_group(Affinity::Current);
        let id = group.add_timer(deadline, Box::new(callback), false);
        TimerHandle { id, group }
    }

    /// Registers a callback to run `delay` from now.
    pub fn timer_after<F>(self: &Arc<Self>, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer_add(clock::deadline_after(delay), callback)
    }

    // -------------------------------------------------------------- sessions

    /// Creates a session. See [`crate::sync::session`] for the protocol.
    pub fn session_create(self: &Arc<Self>, on_error: SessionCallback) -> Result<SessionId> {
        self.sessions.create(on_error)
    }

    /// Whether `id` still names a live session (advisory; a concurrent
    /// destroy can invalidate it immediately afterwards).
    #[must_use]
    pub fn session_exists(self: &Arc<Self>, id: SessionId) -> bool {
        self.sessions.exists(id)
    }

    /// Locks a session's per-slot mutex if the id is current.
    pub fn session_lock(self: &Arc<Self>, id: SessionId) -> Result<()> {
        self.sessions.lock(id)
    }

    /// Unlocks a session's per-slot mutex.
    pub fn session_unlock(self: &Arc<Self>, id: SessionId) -> Result<()> {
        self.sessions.unlock(id)
    }

    /// Unlocks, bumps the version, and wakes every holder of the old id.
    pub fn session_unlock_and_destroy(self: &Arc<Self>, id: SessionId) -> Result<()> {
        self.sessions.unlock_and_destroy(id)
    }

    /// Schedules the session's error callback exactly once.
    pub fn session_set_failed(self: &Arc<Self>, id: SessionId, code: i32) -> Result<()> {
        self.sessions.set_failed(self, id, code)
    }

    /// Blocks until the session is destroyed.
    pub fn session_join(self: &Arc<Self>, id: SessionId) -> Result<()> {
        self.sessions.join(id)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owner's handle to a spawned fiber.
#[derive(Debug, Clone)]
pub struct JoinHandle {
    id: FiberId,
    group: Arc<SchedulingGroup>,
}

impl JoinHandle {
    /// The fiber's identifier.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Blocks until the fiber completes.
    ///
    /// Returns [`ErrorKind::WouldDeadlock`] for a self-join,
    /// [`ErrorKind::InvalidId`] once the entity has been recycled for a new
    /// fiber, and [`ErrorKind::Canceled`] if the joiner itself is stopped
    /// while waiting. Completion of the target — even by panic — is `Ok`.
    pub fn join(&self) -> Result<()> {
        if worker::current_fiber() == Some(self.id) {
            return Err(Error::new(ErrorKind::WouldDeadlock));
        }
        let slot = self.group.slot_by_index(self.id.slot());
        loop {
            match slot.version().wrapping_sub(self.id.version()) {
                0 => match slot.join_word.wait_while_equals(self.id.version(), None) {
                    WordWait::Canceled => return Err(Error::new(ErrorKind::Canceled)),
                    WordWait::Woke | WordWait::Mismatch | WordWait::TimedOut => {}
                },
                1 => return Ok(()),
                _ => return Err(Error::new(ErrorKind::InvalidId)),
            }
        }
    }

    /// Requests a cooperative stop: sets the fiber's stop flag and cancels
    /// its current wait, if any.
    pub fn stop(&self) -> Result<()> {
        self.group.request_stop(self.id)
    }
}

/// Handle to a registered timer.
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    group: Arc<SchedulingGroup>,
}

impl TimerHandle {
    /// The timer's identifier.
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Cancels the timer. [`CancelResult::Canceled`] guarantees the callback
    /// never runs.
    pub fn cancel(&self) -> CancelResult {
        self.group.wheel.cancel(self.id)
    }
}

// ------------------------------------------------------------ free functions

/// The id of the fiber running on this thread, if any.
#[must_use]
pub fn current_fiber_id() -> Option<FiberId> {
    worker::current_fiber()
}

/// Whether a stop has been requested for the current fiber. Long-running
/// fibers poll this at convenient points and unwind on their own terms.
#[must_use]
pub fn stop_requested() -> bool {
    worker::current_fiber_context().is_some_and(|(group, id)| {
        group
            .slot_get(id)
            .is_some_and(|slot| slot.stop_requested.load(Ordering::SeqCst))
    })
}

/// Yields the current fiber to the back of its worker's dispatch order.
/// Outside a fiber this is an OS-level yield.
pub fn yield_now() {
    if worker::current_fiber().is_some() {
        worker::suspend_current(PostSwap::Yield);
    } else {
        std::thread::yield_now();
    }
}

/// Suspends the caller until `deadline`.
///
/// On a fiber this parks through the group's timer wheel and honors stop
/// requests with [`ErrorKind::Canceled`]; on a plain thread it degrades to
/// `std::thread::sleep`.
pub fn sleep_until(deadline: TimePoint) -> Result<()> {
    loop {
        let now = clock::now();
        if now >= deadline {
            return Ok(());
        }
        let Some((node, group, id)) = WaitNode::for_current_fiber() else {
            std::thread::sleep(deadline.saturating_duration_since(now));
            return Ok(());
        };

        let slot = group.slot_by_index(id.slot());
        if slot.stop_requested.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Canceled));
        }
        *slot.current_wait.lock() = Some(Arc::clone(&node));
        if slot.stop_requested.load(Ordering::SeqCst) {
            node.cancel();
        }
        let timer_node = Arc::clone(&node);
        let timer = group.add_timer(
            deadline,
            Box::new(move || {
                timer_node.timeout();
            }),
            true,
        );

        worker::suspend_current(PostSwap::Park(Arc::clone(&node)));

        slot.current_wait.lock().take();
        match node.outcome() {
            WordWait::Canceled => {
                let _outcome = group.wheel.cancel(timer);
                return Err(Error::new(ErrorKind::Canceled));
            }
            WordWait::TimedOut => {} // deadline reached; loop re-checks the clock
            WordWait::Woke | WordWait::Mismatch => {
                // Spurious; drop the stale timer and re-arm on the next pass.
                let _outcome = group.wheel.cancel(timer);
            }
        }
    }
}

/// Suspends the caller for `duration`.
pub fn sleep_for(duration: Duration) -> Result<()> {
    sleep_until(clock::deadline_after(duration))
}
