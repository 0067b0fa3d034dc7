//! Work-stealing scheduler: groups, workers, ready queues, idle parking.
//!
//! A [`group::SchedulingGroup`] binds N workers. Each worker owns a bounded
//! [`ready_queue::ReadyQueue`] (LIFO for the owner, FIFO for stealers) with
//! spill into a group-wide overflow deque; enqueues from outside the group
//! land in a lock-free injection queue. Idle workers publish themselves in
//! the group's [`idle::IdleArray`] and sleep on a private futex word; the
//! enqueue path's publish-then-wake ordering guarantees no task is stranded
//! behind a sleeping worker.

pub(crate) mod group;
pub(crate) mod idle;
pub(crate) mod ready_queue;
pub(crate) mod worker;

pub(crate) use group::SchedulingGroup;
