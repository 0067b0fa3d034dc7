//! Worker threads: the scheduling loop and the fiber suspension protocol.
//!
//! Each worker runs fibers on their own stacks and falls back to its
//! scheduler context (the OS thread's stack) between fibers. A fiber leaves
//! the CPU only through [`suspend_current`], which records a [`PostSwap`]
//! action for the worker to perform once it is safely off the fiber's stack.
//! That post-switch step is what makes the wake/suspend race benign: the
//! SUSPENDED state is published only after the switch, and both the waker
//! and the worker race a single SUSPENDED -> READY compare-exchange, so a
//! fiber is never queued while its stack is still live on another worker.

#![allow(unsafe_code)]

use crate::context;
use crate::id::FiberId;
use crate::park::futex;
use crate::park::word::WaitNode;
use crate::sched::group::SchedulingGroup;
use crate::sched::idle::ParkSite;
use crate::task::entity::state;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Action a suspending fiber hands to its worker, executed after the switch
/// back onto the worker's own stack.
pub(crate) enum PostSwap {
    /// Requeue at the steal end of the worker's queue.
    Yield,
    /// Publish SUSPENDED, then re-ready immediately if the wait was already
    /// resolved while the fiber was mid-switch.
    Park(Arc<WaitNode>),
    /// Recycle the entity and stack; joiners are woken by the finalizer.
    Terminate,
}

/// Per-worker state reachable from the scheduler context and from fibers
/// running on this worker's thread.
pub(crate) struct WorkerCore {
    pub(crate) group: Arc<SchedulingGroup>,
    pub(crate) index: usize,
    pub(crate) site: Arc<ParkSite>,
    sched_ctx: context::ContextCell,
    current: Cell<Option<FiberId>>,
    post_swap: RefCell<Option<PostSwap>>,
    pop_count: Cell<u32>,
    next_victim: Cell<usize>,
    /// Set when the previous fiber yielded: the next scan visits the shared
    /// queues first so a lone yielder cannot monopolize its worker.
    last_yield: Cell<bool>,
}

thread_local! {
    static CORE: RefCell<Option<Rc<WorkerCore>>> = const { RefCell::new(None) };
}

fn current_core() -> Option<Rc<WorkerCore>> {
    CORE.with(|core| core.borrow().clone())
}

/// The fiber currently running on this thread, if the thread is a worker.
pub(crate) fn current_fiber() -> Option<FiberId> {
    CORE.with(|core| core.borrow().as_ref().and_then(|core| core.current.get()))
}

/// The running fiber together with its owning group.
pub(crate) fn current_fiber_context() -> Option<(Arc<SchedulingGroup>, FiberId)> {
    CORE.with(|core| {
        let borrowed = core.borrow();
        let core = borrowed.as_ref()?;
        let id = core.current.get()?;
        Some((Arc::clone(&core.group), id))
    })
}

/// This thread's worker index within `group`, when it is one of the group's
/// workers.
pub(crate) fn current_worker_in(group: &Arc<SchedulingGroup>) -> Option<usize> {
    CORE.with(|core| {
        core.borrow()
            .as_ref()
            .and_then(|core| Arc::ptr_eq(&core.group, group).then_some(core.index))
    })
}

/// Suspends the current fiber, handing `post` to the worker. Returns when
/// the fiber is next resumed (never, for [`PostSwap::Terminate`]).
pub(crate) fn suspend_current(post: PostSwap) {
    let fiber_ctx;
    let sched_ctx;
    {
        let core = current_core().expect("suspend_current outside a worker");
        let id = core.current.get().expect("suspend_current without a fiber");
        let slot = core.group.slot_by_index(id.slot());
        fiber_ctx = slot.ctx.as_ptr();
        sched_ctx = core.sched_ctx.as_ptr();
        *core.post_swap.borrow_mut() = Some(post);
        // Both handles drop here; nothing owned lives across the switch.
    }
    // SAFETY: fiber_ctx belongs to the fiber running right now on this
    // thread, sched_ctx to this worker; both outlive the switch because the
    // arena and the worker loop own them.
    unsafe {
        context::swap_context(fiber_ctx, sched_ctx);
    }
}

/// First resumption target of every fresh fiber context.
///
/// Runs the entry closure with panics contained, drives the termination
/// path (storage destructors on the fiber's own stack, DONE published), and
/// switches away for good. The worker recycles the stack afterwards, so
/// nothing here may touch the stack after that final switch.
pub(crate) extern "C" fn fiber_trampoline() -> ! {
    {
        let (group, id) = current_fiber_context().expect("trampoline outside a fiber");
        let slot = group.slot_by_index(id.slot());

        let entry = slot
            .inner
            .lock()
            .entry
            .take()
            .expect("fiber entry already taken");
        if catch_unwind(AssertUnwindSafe(entry)).is_err() {
            slot.inner.lock().panicked = true;
            error!(fiber = %id, "fiber entry panicked; joiners will still be released");
        }

        let storage = std::mem::take(&mut slot.inner.lock().storage);
        storage.run_destructors();

        slot.state.store(state::DONE, Ordering::SeqCst);
        // group, slot drop here, before the final switch.
    }
    suspend_current(PostSwap::Terminate);
    unreachable!("terminated fiber was resumed")
}

/// Body of a worker OS thread.
pub(crate) fn worker_main(group: Arc<SchedulingGroup>, index: usize) {
    let core = Rc::new(WorkerCore {
        site: Arc::clone(&group.sites[index]),
        group,
        index,
        sched_ctx: context::ContextCell::empty(),
        current: Cell::new(None),
        post_swap: RefCell::new(None),
        pop_count: Cell::new(0),
        next_victim: Cell::new(index.wrapping_mul(7)),
        last_yield: Cell::new(false),
    });
    CORE.with(|slot| *slot.borrow_mut() = Some(Rc::clone(&core)));
    debug!(group = core.group.index, worker = index, "worker started");

    loop {
        if let Some(id) = find_task(&core) {
            run_fiber(&core, id);
            continue;
        }
        if core.group.shutdown.load(Ordering::SeqCst) {
            break;
        }
        idle_park(&core);
    }

    CORE.with(|slot| slot.borrow_mut().take());
    debug!(group = core.group.index, worker = index, "worker stopped");
}

/// Local pop, cadenced overflow drain, remote drain, then bounded stealing.
fn find_task(core: &Rc<WorkerCore>) -> Option<FiberId> {
    let group = &core.group;
    let count = core.pop_count.get().wrapping_add(1);
    core.pop_count.set(count);

    if core.last_yield.replace(false) {
        if let Some(id) = group.pop_overflow().or_else(|| group.pop_remote()) {
            return Some(id);
        }
    }
    if count % group.config.overflow_drain_interval == 0 {
        if let Some(id) = group.pop_overflow() {
            return Some(id);
        }
    }
    if let Some(id) = group.locals[core.index].pop() {
        return Some(id);
    }
    if let Some(id) = group.pop_overflow() {
        return Some(id);
    }
    if let Some(id) = group.pop_remote() {
        return Some(id);
    }
    let offset = core.next_victim.get();
    core.next_victim.set(offset.wrapping_add(1));
    group.steal_for(core.index, offset)
}

/// Claims the READY (or NEW) transition and switches into the fiber, then
/// performs its post-switch action.
fn run_fiber(core: &Rc<WorkerCore>, id: FiberId) {
    let group = Arc::clone(&core.group);
    let slot = group.slot_by_index(id.slot());
    if slot.version() != id.version() {
        return; // stale queue entry; the slot moved on
    }
    let claimed = slot
        .state
        .compare_exchange(state::NEW, state::RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
        || slot
            .state
            .compare_exchange(
                state::READY,
                state::RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
    if !claimed {
        return;
    }

    slot.last_worker.store(core.index as u32, Ordering::Relaxed);
    core.current.set(Some(id));
    trace!(group = group.index, worker = core.index, fiber = %id, "running fiber");

    // SAFETY: this worker just won the RUNNING transition, so it is the sole
    // owner of both contexts for the duration of the switch.
    unsafe {
        context::swap_context(core.sched_ctx.as_ptr(), slot.ctx.as_ptr());
    }

    core.current.set(None);
    let post = core
        .post_swap
        .borrow_mut()
        .take()
        .expect("fiber switched out without a post-switch action");
    match post {
        PostSwap::Yield => {
            slot.state.store(state::READY, Ordering::SeqCst);
            core.last_yield.set(true);
            group.requeue_yield(core.index, id);
        }
        PostSwap::Park(node) => {
            slot.state.store(state::SUSPENDED, Ordering::SeqCst);
            if !node.is_waiting()
                && slot
                    .state
                    .compare_exchange(
                        state::SUSPENDED,
                        state::READY,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                // The wake raced our suspend; requeue immediately.
                group.schedule(id);
            }
        }
        PostSwap::Terminate => {
            group.finalize(id);
        }
    }
}

/// The park protocol: snapshot the epoch, opportunistically drive timers,
/// publish in the parking array, rescan once, then sleep on the park site.
fn idle_park(core: &Rc<WorkerCore>) {
    let group = &core.group;
    let epoch = group.epoch.load(Ordering::SeqCst);

    let driver = group.try_claim_timer_driver(core.index);
    if driver && group.drive_timers() > 0 {
        group.release_timer_driver(core.index);
        return;
    }

    // Read the generation before publishing: any wake aimed at us after the
    // publish bumps the word past `gen` and the sleep returns immediately.
    let gen = core.site.generation();

    if !group.idle.publish(core.index as u32, Arc::clone(&core.site), epoch) {
        if driver {
            group.release_timer_driver(core.index);
        }
        std::thread::yield_now();
        return;
    }

    if group.has_visible_work() || group.epoch.load(Ordering::SeqCst) != epoch {
        group.idle.retract(core.index as u32);
        if driver {
            group.release_timer_driver(core.index);
        }
        return;
    }

    let deadline = if driver {
        group.set_driver_park(&core.site);
        group.wheel.next_deadline()
    } else {
        None
    };
    futex::wait(&core.site.word, gen, deadline);
    group.idle.retract(core.index as u32);

    if driver {
        group.drive_timers();
        group.release_timer_driver(core.index);
    }
}
