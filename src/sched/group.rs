//! A scheduling group: N workers, their queues, parking, timers, and the
//! arenas that own every fiber entity and stack.
//!
//! The group is the sole owner of task slots; workers and fibers refer to
//! each other only through version-tagged [`FiberId`]s. The enqueue path
//! follows a strict order — publish the task, bump the work epoch, wake one
//! parked worker — which together with the worker's publish-then-rescan
//! parking protocol guarantees no wakeup is lost.

use crate::clock::{self, TimePoint};
use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Error, ErrorKind, Result};
use crate::id::{FiberId, TimerId};
use crate::sched::idle::{IdleArray, ParkSite};
use crate::sched::ready_queue::ReadyQueue;
use crate::sched::worker;
use crate::stack::StackPool;
use crate::task::entity::{state, TaskAttrs, TaskSlot};
use crate::timer::{TimerCallback, TimerWheel};
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// No worker currently holds the timer-driver role.
const NO_DRIVER: u32 = u32::MAX;

/// A cluster of workers sharing ready queues, stealing, parking, and timers.
pub(crate) struct SchedulingGroup {
    /// Group index within the runtime.
    pub(crate) index: usize,
    pub(crate) config: Arc<RuntimeConfig>,
    /// Grow-only arena of task slots.
    slots: RwLock<Vec<Arc<TaskSlot>>>,
    /// Recycled slot indices.
    free_slots: Mutex<Vec<u32>>,
    /// Size-classed stack pool.
    pub(crate) stack_pool: StackPool,
    /// One ready queue per worker.
    pub(crate) locals: Vec<Arc<ReadyQueue>>,
    /// One park site per worker.
    pub(crate) sites: Vec<Arc<ParkSite>>,
    /// Spill target for full local queues.
    overflow: Mutex<VecDeque<FiberId>>,
    /// Injection queue for enqueues from outside the group's workers.
    remote: SegQueue<FiberId>,
    /// Parking array.
    pub(crate) idle: IdleArray,
    /// Work epoch, bumped on every enqueue.
    pub(crate) epoch: AtomicU64,
    /// Group-local timer wheel.
    pub(crate) wheel: TimerWheel,
    /// Worker index currently driving timers, or [`NO_DRIVER`].
    timer_driver: AtomicU32,
    /// Park site of the driver while it sleeps with a timer deadline.
    driver_park: Mutex<Option<Arc<ParkSite>>>,
    /// Rotating target for enqueues from non-worker threads.
    next_target: AtomicUsize,
    /// Set once by runtime shutdown.
    pub(crate) shutdown: AtomicBool,
}

impl SchedulingGroup {
    pub(crate) fn new(index: usize, config: Arc<RuntimeConfig>) -> Arc<Self> {
        let workers = config.workers_per_group;
        let locals = (0..workers)
            .map(|_| Arc::new(ReadyQueue::new(config.ready_queue_capacity)))
            .collect();
        let sites = (0..workers).map(|_| ParkSite::new()).collect();
        Arc::new(Self {
            index,
            stack_pool: StackPool::new(
                config.small_stack_size,
                config.normal_stack_size,
                config.large_stack_size,
                config.guard_pages,
                config.stack_pool_capacity,
            ),
            slots: RwLock::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            locals,
            sites,
            overflow: Mutex::new(VecDeque::new()),
            remote: SegQueue::new(),
            idle: IdleArray::new(config.parking_slots),
            epoch: AtomicU64::new(0),
            wheel: TimerWheel::new(config.timer_tick),
            timer_driver: AtomicU32::new(NO_DRIVER),
            driver_park: Mutex::new(None),
            next_target: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            config,
        })
    }

    // ---------------------------------------------------------------- slots

    /// Slot lookup by index, without version validation. Panics on an index
    /// the group never allocated; internal callers only pass indices taken
    /// from a FiberId this group issued.
    pub(crate) fn slot_by_index(&self, index: u32) -> Arc<TaskSlot> {
        Arc::clone(&self.slots.read()[index as usize])
    }

    /// Version-validated slot lookup.
    pub(crate) fn slot_get(&self, id: FiberId) -> Option<Arc<TaskSlot>> {
        let slot = self.slots.read().get(id.slot() as usize).cloned()?;
        (slot.version() == id.version()).then_some(slot)
    }

    pub(crate) fn is_pinned(&self, id: FiberId) -> bool {
        self.slots
            .read()
            .get(id.slot() as usize)
            .is_some_and(|slot| slot.pinned.load(Ordering::Relaxed))
    }

    /// Creates a fiber entity: slot from the free list (or arena growth),
    /// fresh even version, stack from the pool, context seeded to enter the
    /// trampoline. The fiber is not yet queued.
    pub(crate) fn create_task(
        self: &Arc<Self>,
        entry: Box<dyn FnOnce() + Send + 'static>,
        attrs: TaskAttrs,
    ) -> Result<FiberId> {
        let index = match self.free_slots.lock().pop() {
            Some(index) => index,
            None => {
                let mut slots = self.slots.write();
                let index = u32::try_from(slots.len()).map_err(|_| {
                    Error::with_context(ErrorKind::ResourceExhausted, "task arena overflow")
                })?;
                slots.push(Arc::new(TaskSlot::new(index)));
                index
            }
        };
        let slot = self.slot_by_index(index);

        let stack = match self.stack_pool.acquire(attrs.stack_class) {
            Ok(stack) => stack,
            Err(err) => {
                self.free_slots.lock().push(index);
                return Err(err);
            }
        };

        let version = slot.version().wrapping_add(1); // odd -> even: live
        {
            let mut inner = slot.inner.lock();
            slot.ctx
                .install(context::fresh_context(stack.top(), worker::fiber_trampoline));
            inner.stack = Some(stack);
            inner.entry = Some(entry);
            inner.storage = crate::task::storage::LocalStorage::default();
            inner.panicked = false;
            inner.attrs = attrs.clone();
        }
        slot.stop_requested.store(false, Ordering::SeqCst);
        slot.pinned.store(attrs.group_local, Ordering::SeqCst);
        slot.stolen.store(0, Ordering::Relaxed);
        slot.last_worker.store(u32::MAX, Ordering::Relaxed);
        slot.state.store(state::NEW, Ordering::SeqCst);
        slot.join_word.store(version);
        slot.version.store(version, Ordering::SeqCst);

        let id = FiberId::new(index, version);
        trace!(fiber = %id, group = self.index, "fiber created");
        Ok(id)
    }

    /// Recycles a terminated fiber's slot and stack. Runs on a worker's own
    /// stack, strictly after the final context switch away from the fiber.
    pub(crate) fn finalize(&self, id: FiberId) {
        let slot = self.slot_by_index(id.slot());
        debug_assert_eq!(slot.state.load(Ordering::SeqCst), state::DONE);

        let stack = slot.inner.lock().stack.take();
        slot.current_wait.lock().take();

        let dead_version = slot.version().wrapping_add(1); // even -> odd
        slot.version.store(dead_version, Ordering::SeqCst);
        slot.join_word.set_and_wake_all(dead_version);

        if let Some(stack) = stack {
            self.stack_pool.release(stack);
        }
        self.free_slots.lock().push(slot.index);
        trace!(fiber = %id, group = self.index, "fiber finalized");
    }

    // -------------------------------------------------------------- enqueue

    /// Makes a READY (or NEW) fiber visible to the group and wakes a parked
    /// worker if there is one. This is the only path that inserts ids into
    /// ready queues.
    pub(crate) fn schedule(self: &Arc<Self>, id: FiberId) {
        let slot = self.slot_by_index(id.slot());
        let target = if slot.pinned.load(Ordering::Relaxed) {
            // Pinned fibers always land on their home worker.
            let home = slot.last_worker.load(Ordering::Relaxed);
            let target = if home == u32::MAX {
                self.pick_target()
            } else {
                home as usize
            };
            slot.last_worker.store(target as u32, Ordering::Relaxed);
            Some(target)
        } else {
            worker::current_worker_in(self)
        };

        match target {
            Some(target) => {
                if let Err(id) = self.locals[target].push(id) {
                    warn!(group = self.index, "local queue full, spilling to overflow");
                    self.overflow.lock().push_back(id);
                }
            }
            None => self.remote.push(id),
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        if !self.idle.is_empty() {
            self.idle.wake_one();
        }
    }

    fn pick_target(&self) -> usize {
        self.next_target.fetch_add(1, Ordering::Relaxed) % self.locals.len()
    }

    /// Wakes a suspended fiber. Exactly one of the wake path and the
    /// suspending worker's post-switch step performs the SUSPENDED -> READY
    /// transition, so the fiber lands in exactly one ready queue.
    pub(crate) fn resume(self: &Arc<Self>, id: FiberId) {
        let Some(slot) = self.slot_get(id) else {
            return;
        };
        if slot
            .state
            .compare_exchange(
                state::SUSPENDED,
                state::READY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.schedule(id);
        }
        // RUNNING: the worker is mid-suspend and will observe the wake in
        // its post-switch step. READY/NEW/DONE: nothing to do.
    }

    /// Requeues a yielding fiber on its worker's steal end.
    pub(crate) fn requeue_yield(self: &Arc<Self>, worker_index: usize, id: FiberId) {
        self.locals[worker_index].push_front(id);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.idle.wake_one();
    }

    // ------------------------------------------------------------- dequeue

    pub(crate) fn pop_overflow(&self) -> Option<FiberId> {
        self.overflow.lock().pop_front()
    }

    pub(crate) fn pop_remote(&self) -> Option<FiberId> {
        self.remote.pop()
    }

    /// Steals one fiber for `thief`, probing victims from a rotating offset.
    pub(crate) fn steal_for(&self, thief: usize, offset: usize) -> Option<FiberId> {
        let workers = self.locals.len();
        if workers <= 1 {
            return None;
        }
        let mut probes = 0;
        let mut victim = offset % workers;
        while probes < self.config.steal_retries {
            if victim != thief {
                if let Some(id) = self.locals[victim].steal(|id| self.is_pinned(id)) {
                    self.slot_by_index(id.slot())
                        .stolen
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(group = self.index, thief, victim, fiber = %id, "stole fiber");
                    return Some(id);
                }
                probes += 1;
            }
            victim = (victim + 1) % workers;
        }
        None
    }

    /// True when any queue in the group holds work.
    pub(crate) fn has_visible_work(&self) -> bool {
        !self.remote.is_empty()
            || self.locals.iter().any(|queue| !queue.is_empty())
            || !self.overflow.lock().is_empty()
    }

    // --------------------------------------------------------------- timers

    /// Adds a timer to the group wheel and nudges the driver so a shortened
    /// horizon is noticed.
    pub(crate) fn add_timer(
        self: &Arc<Self>,
        deadline: TimePoint,
        callback: TimerCallback,
        inline: bool,
    ) -> TimerId {
        let id = self.wheel.add(deadline, callback, inline);
        if let Some(site) = self.driver_park.lock().clone() {
            site.wake();
        } else {
            self.idle.wake_one();
        }
        id
    }

    pub(crate) fn try_claim_timer_driver(&self, worker: usize) -> bool {
        self.timer_driver
            .compare_exchange(
                NO_DRIVER,
                worker as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn release_timer_driver(&self, worker: usize) {
        self.driver_park.lock().take();
        let _unused = self.timer_driver.compare_exchange(
            worker as u32,
            NO_DRIVER,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Publishes the driver's park site so `add_timer` can interrupt a
    /// timed sleep whose horizon just moved closer.
    pub(crate) fn set_driver_park(&self, site: &Arc<ParkSite>) {
        *self.driver_park.lock() = Some(Arc::clone(site));
    }

    /// Advances the wheel and dispatches due timers: short callbacks run
    /// inline on the calling worker, the rest become system fibers.
    pub(crate) fn drive_timers(self: &Arc<Self>) -> usize {
        let fired = self.wheel.collect_expired(clock::now());
        let count = fired.len();
        for expired in fired {
            if expired.inline {
                (expired.callback)();
            } else {
                let attrs = TaskAttrs::system_default();
                match self.create_task(expired.callback, attrs) {
                    Ok(id) => self.schedule(id),
                    Err(err) => warn!(group = self.index, "timer fiber spawn failed: {err}"),
                }
            }
        }
        if count > 0 {
            trace!(group = self.index, count, "timers fired");
        }
        count
    }

    // ------------------------------------------------------------- shutdown

    /// Flags shutdown and wakes every worker so the loops can drain and exit.
    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.idle.wake_all();
        for site in &self.sites {
            site.wake();
        }
        debug!(group = self.index, "group shutdown requested");
    }

    /// Cooperative-stop flag plus interruption of the fiber's current wait.
    pub(crate) fn request_stop(&self, id: FiberId) -> Result<()> {
        let slot = self.slot_get(id).ok_or(ErrorKind::InvalidId)?;
        slot.stop_requested.store(true, Ordering::SeqCst);
        let node = slot.current_wait.lock().clone();
        if let Some(node) = node {
            node.cancel();
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingGroup")
            .field("index", &self.index)
            .field("workers", &self.locals.len())
            .finish_non_exhaustive()
    }
}
