//! The heap-owned record describing one fiber.

use crate::context::ContextCell;
use crate::park::word::{ParkingWord, WaitNode};
use crate::stack::{Stack, StackClass};
use crate::task::storage::LocalStorage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Which scheduling group a new fiber should land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Affinity {
    /// The spawner's own group; falls back to the first group when the
    /// spawner is not a worker.
    #[default]
    Current,
    /// Any group, chosen round-robin.
    Any,
    /// The system group (the last configured group).
    System,
}

/// Attributes of a new fiber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttrs {
    /// Stack size class.
    pub stack_class: StackClass,
    /// Group placement.
    pub affinity: Affinity,
    /// Marks the fiber as belonging to runtime-internal machinery. System
    /// fibers are reported separately in logs.
    pub system: bool,
    /// Whether signal delivery may interrupt this fiber's waits.
    pub signal_enabled: bool,
    /// Detached fibers release their slot without waiting for a joiner.
    pub detached: bool,
    /// Pins the fiber to the worker that first queues it: it is never
    /// work-stolen and always re-enqueued on its home worker.
    pub group_local: bool,
}

impl Default for TaskAttrs {
    fn default() -> Self {
        Self {
            stack_class: StackClass::Small,
            affinity: Affinity::Current,
            system: false,
            signal_enabled: false,
            detached: false,
            group_local: false,
        }
    }
}

impl TaskAttrs {
    /// Attributes for runtime-internal fibers.
    #[must_use]
    pub(crate) fn system_default() -> Self {
        Self {
            system: true,
            ..Self::default()
        }
    }

    /// Sets the stack class.
    #[must_use]
    pub fn stack_class(mut self, class: StackClass) -> Self {
        self.stack_class = class;
        self
    }

    /// Sets the group placement.
    #[must_use]
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    /// Marks the fiber detached.
    #[must_use]
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Pins the fiber to its home worker.
    #[must_use]
    pub fn group_local(mut self) -> Self {
        self.group_local = true;
        self
    }
}

/// Task state word values.
pub(crate) mod state {
    /// Created, not yet queued or claimed.
    pub const NEW: u8 = 0;
    /// Queued in exactly one ready queue.
    pub const READY: u8 = 1;
    /// Claimed by a worker; its stack is live.
    pub const RUNNING: u8 = 2;
    /// Off all queues, waiting for a wake.
    pub const SUSPENDED: u8 = 3;
    /// Terminated; the slot is on its way back to the free list.
    pub const DONE: u8 = 4;
}

/// Interior task state touched only with the slot's lock held or by the
/// owning worker during well-defined transitions.
#[derive(Default)]
pub(crate) struct TaskInner {
    /// The entry closure, taken exactly once by the trampoline.
    pub entry: Option<Box<dyn FnOnce() + Send + 'static>>,
    /// The fiber's stack, present from creation until recycling.
    pub stack: Option<Stack>,
    /// Attributes frozen at creation.
    pub attrs: TaskAttrs,
    /// Fiber-local storage slots.
    pub storage: LocalStorage,
    /// Set when the entry closure panicked.
    pub panicked: bool,
}

impl std::fmt::Debug for TaskInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInner")
            .field("has_entry", &self.entry.is_some())
            .field("has_stack", &self.stack.is_some())
            .field("attrs", &self.attrs)
            .field("panicked", &self.panicked)
            .finish()
    }
}

/// One arena slot: the full record of a fiber, reused across generations.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    /// Slot index inside the owning group's arena.
    pub index: u32,
    /// Even while a fiber occupies the slot; odd after it terminates.
    pub version: AtomicU32,
    /// One of the [`state`] values.
    pub state: AtomicU8,
    /// Cooperative cancellation flag, polled at suspension points.
    pub stop_requested: AtomicBool,
    /// Joiners wait here for the version to move past theirs.
    pub join_word: ParkingWord,
    /// The wait this fiber is currently parked on, if any. Used by
    /// stop requests to interrupt the wait.
    pub current_wait: Mutex<Option<Arc<WaitNode>>>,
    /// Saved machine context.
    pub ctx: ContextCell,
    /// How many times this fiber has been work-stolen.
    pub stolen: AtomicU32,
    /// Index of the worker that last ran the fiber.
    pub last_worker: AtomicU32,
    /// Mirrors `attrs.group_local` for lock-free checks on the steal path.
    pub pinned: AtomicBool,
    /// Everything that needs a lock.
    pub inner: Mutex<TaskInner>,
}

impl TaskSlot {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            version: AtomicU32::new(1),
            state: AtomicU8::new(state::NEW),
            stop_requested: AtomicBool::new(false),
            join_word: ParkingWord::new(0),
            current_wait: Mutex::new(None),
            ctx: ContextCell::empty(),
            stolen: AtomicU32::new(0),
            last_worker: AtomicU32::new(u32::MAX),
            pinned: AtomicBool::new(false),
            inner: Mutex::new(TaskInner::default()),
        }
    }

    /// Current version, `SeqCst`.
    pub(crate) fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }
}
