//! The fiber-aware parking word.
//!
//! A [`ParkingWord`] is a 32-bit value plus a waiter queue. `wait_while_equals`
//! atomically checks the value against an expected snapshot and suspends the
//! caller while they match: a fiber is switched out and re-readied by the
//! waker, an ordinary OS thread blocks on a private futex word. The waiter
//! is published under the queue lock before the value re-check, so the
//! store-then-wake sequence on the other side can never be lost.
//!
//! Wakes, timeouts, and stop requests race on a single compare-exchange of
//! the waiter's status, so each waiter resolves exactly once.

use crate::clock::TimePoint;
use crate::id::FiberId;
use crate::park::futex;
use crate::sched::group::SchedulingGroup;
use crate::sched::worker::{self, PostSwap};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// How a wait on a [`ParkingWord`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WordWait {
    /// A wake arrived (possibly spurious; callers loop on their predicate).
    Woke,
    /// The word's value did not match at the call site.
    Mismatch,
    /// The deadline passed first.
    TimedOut,
    /// The waiting fiber was asked to stop.
    Canceled,
}

/// Status values of a [`WaitNode`].
mod status {
    pub(super) const WAITING: u8 = 0;
    pub(super) const WOKEN: u8 = 1;
    pub(super) const TIMED_OUT: u8 = 2;
    pub(super) const CANCELED: u8 = 3;
}

enum Party {
    Fiber {
        group: Arc<SchedulingGroup>,
        id: FiberId,
    },
    Thread {
        word: AtomicU32,
    },
}

/// One waiter: either a fiber to be re-readied or a thread to be unblocked.
///
/// The status field resolves exactly once; whichever of wake, timeout, or
/// cancel wins the compare-exchange owns delivering the wakeup.
pub(crate) struct WaitNode {
    state: AtomicU8,
    party: Party,
}

impl std::fmt::Debug for WaitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let party = match &self.party {
            Party::Fiber { id, .. } => format!("fiber {id}"),
            Party::Thread { .. } => "thread".to_string(),
        };
        write!(
            f,
            "WaitNode({party}, status={})",
            self.state.load(Ordering::Relaxed)
        )
    }
}

impl WaitNode {
    /// A node for the fiber currently running on this thread, if any.
    pub(crate) fn for_current_fiber() -> Option<(Arc<Self>, Arc<SchedulingGroup>, FiberId)> {
        let (group, id) = worker::current_fiber_context()?;
        let node = Arc::new(Self {
            state: AtomicU8::new(status::WAITING),
            party: Party::Fiber {
                group: Arc::clone(&group),
                id,
            },
        });
        Some((node, group, id))
    }

    /// A node for a plain OS thread.
    pub(crate) fn for_thread() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(status::WAITING),
            party: Party::Thread {
                word: AtomicU32::new(0),
            },
        })
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state.load(Ordering::SeqCst) == status::WAITING
    }

    fn resolve(&self, to: u8) -> bool {
        if self
            .state
            .compare_exchange(status::WAITING, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        match &self.party {
            Party::Fiber { group, id } => group.resume(*id),
            Party::Thread { word } => {
                word.store(1, Ordering::SeqCst);
                futex::wake(word, 1);
            }
        }
        true
    }

    /// Delivers a wake. Returns false if the node already resolved.
    pub(crate) fn wake(&self) -> bool {
        self.resolve(status::WOKEN)
    }

    /// Delivers a timeout.
    pub(crate) fn timeout(&self) -> bool {
        self.resolve(status::TIMED_OUT)
    }

    /// Delivers a stop request.
    pub(crate) fn cancel(&self) -> bool {
        self.resolve(status::CANCELED)
    }

    /// Blocks the calling thread until the node resolves. Thread parties
    /// handle deadlines themselves; there is no timer wheel involved.
    fn block_thread(&self, deadline: Option<TimePoint>) {
        let Party::Thread { word } = &self.party else {
            unreachable!("block_thread on a fiber waiter");
        };
        loop {
            if self.state.load(Ordering::SeqCst) != status::WAITING {
                return;
            }
            if futex::wait(word, 0, deadline) == futex::WaitOutcome::TimedOut {
                self.timeout();
                return;
            }
        }
    }

    pub(crate) fn outcome(&self) -> WordWait {
        match self.state.load(Ordering::SeqCst) {
            status::WOKEN => WordWait::Woke,
            status::TIMED_OUT => WordWait::TimedOut,
            status::CANCELED => WordWait::Canceled,
            _ => WordWait::Woke, // resolved-in-flight; treat as spurious
        }
    }
}

/// A 32-bit atomic cell with compare-and-sleep / wake semantics, aware of
/// both fibers and plain threads.
pub struct ParkingWord {
    value: AtomicU32,
    waiters: Mutex<VecDeque<Arc<WaitNode>>>,
}

impl std::fmt::Debug for ParkingWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParkingWord({})", self.value.load(Ordering::Relaxed))
    }
}

impl ParkingWord {
    /// Creates a word holding `value` with no waiters.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Current value, `SeqCst`.
    #[must_use]
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Stores a value without waking anyone.
    pub fn store(&self, value: u32) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Compare-exchange on the value, `SeqCst` both ways.
    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.value
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Atomic swap of the value.
    pub fn swap(&self, value: u32) -> u32 {
        self.value.swap(value, Ordering::SeqCst)
    }

    /// Atomic add on the value, returning the previous value.
    pub fn fetch_add(&self, n: u32) -> u32 {
        self.value.fetch_add(n, Ordering::SeqCst)
    }

    /// Blocks the caller while the value equals `expected`.
    ///
    /// Fibers are suspended through the scheduler; their deadline, if any,
    /// is an inline timer on the group wheel, and a stop request resolves
    /// the wait with [`WordWait::Canceled`]. Threads block on a private
    /// futex word.
    pub(crate) fn wait_while_equals(
        &self,
        expected: u32,
        deadline: Option<TimePoint>,
    ) -> WordWait {
        if self.load() != expected {
            return WordWait::Mismatch;
        }

        let fiber = WaitNode::for_current_fiber();
        let node = match &fiber {
            Some((node, _, _)) => Arc::clone(node),
            None => WaitNode::for_thread(),
        };

        {
            let mut waiters = self.waiters.lock();
            if self.load() != expected {
                return WordWait::Mismatch;
            }
            waiters.push_back(Arc::clone(&node));
        }

        match fiber {
            Some((node, group, id)) => {
                let slot = group.slot_by_index(id.slot());
                *slot.current_wait.lock() = Some(Arc::clone(&node));
                if slot.stop_requested.load(Ordering::SeqCst) {
                    node.cancel();
                }
                let timer = deadline.map(|deadline| {
                    let timer_node = Arc::clone(&node);
                    group.add_timer(
                        deadline,
                        Box::new(move || {
                            timer_node.timeout();
                        }),
                        true,
                    )
                });

                worker::suspend_current(PostSwap::Park(Arc::clone(&node)));

                slot.current_wait.lock().take();
                if let Some(timer) = timer {
                    let _outcome = group.wheel.cancel(timer);
                }
                self.remove_waiter(&node);
                node.outcome()
            }
            None => {
                node.block_thread(deadline);
                self.remove_waiter(&node);
                node.outcome()
            }
        }
    }

    fn remove_waiter(&self, node: &Arc<WaitNode>) {
        self.waiters
            .lock()
            .retain(|waiter| !Arc::ptr_eq(waiter, node));
    }

    /// Wakes up to `max_wakers` waiters. Returns how many were actually
    /// delivered a wake.
    pub(crate) fn wake(&self, max_wakers: usize) -> usize {
        let mut woken = 0;
        let mut waiters = self.waiters.lock();
        while woken < max_wakers {
            let Some(node) = waiters.pop_front() else {
                break;
            };
            if node.wake() {
                woken += 1;
            }
        }
        woken
    }

    /// Wakes every waiter.
    pub(crate) fn wake_all(&self) -> usize {
        self.wake(usize::MAX)
    }

    /// Stores a value and wakes every waiter, as one release operation.
    pub fn set_and_wake_all(&self, value: u32) {
        self.store(value);
        self.wake_all();
    }
}
