//! Hierarchical timing wheel for deadline-driven callbacks.
//!
//! The wheel stores timers in multiple levels of buckets with increasing
//! resolution. A timer is inserted into the coarsest level that can
//! represent its deadline relative to the current tick; as time advances,
//! coarse buckets cascade down into finer ones until their entries fire.
//! Deadlines beyond the wheel's horizon sit in an overflow heap and are
//! promoted as they come within range.
//!
//! Cancellation is a state transition, not a removal: `cancel` flips the
//! entry's state and the bucket drain discards it, so a canceled-before-fired
//! timer never runs and a fired timer runs exactly once, whichever side wins
//! the race. Timers sharing a deadline fire in insertion order.
//!
//! # Performance Characteristics
//!
//! - Insert: O(1) slot calculation plus a heap push for the horizon
//! - Cancel: O(1) map update
//! - Advance with no expiry: O(ticks elapsed)
//! - Advance with expiry: O(expired)

use crate::clock::TimePoint;
use crate::id::TimerId;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

const LEVELS: usize = 4;
const SLOTS: usize = 64;

/// Result of canceling a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The timer was pending; its callback will never run.
    Canceled,
    /// The fire path got there first (or the id is long gone); the callback
    /// runs (or already ran) exactly once.
    AlreadyFired,
    /// The timer had already been canceled.
    AlreadyCanceled,
}

/// Callback type stored in wheel entries.
pub(crate) type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// A due timer handed back to the driving worker.
pub(crate) struct ExpiredTimer {
    pub(crate) callback: TimerCallback,
    /// Short callbacks (the runtime's own wake/timeout paths) run inline on
    /// the driver; everything else becomes a fiber.
    pub(crate) inline: bool,
}

struct WheelEntry {
    token: u64,
    deadline_ticks: u64,
    callback: TimerCallback,
    inline: bool,
}

struct OverflowEntry {
    deadline_ticks: u64,
    sequence: u64,
    entry: WheelEntry,
}

impl PartialEq for OverflowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for OverflowEntry {}

impl PartialOrd for OverflowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OverflowEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: earliest deadline (then earliest insertion) pops first.
        other
            .deadline_ticks
            .cmp(&self.deadline_ticks)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Canceled,
}

struct WheelState {
    levels: Vec<Vec<VecDeque<WheelEntry>>>,
    /// Ticks fully processed.
    now_ticks: u64,
    overflow: BinaryHeap<OverflowEntry>,
    /// Live tokens. Absent means fired (or never existed).
    entries: HashMap<u64, EntryState>,
    /// Deadline horizon, lazily pruned.
    horizon: BinaryHeap<Reverse<(u64, u64)>>,
    next_token: u64,
    next_sequence: u64,
    /// Canceled entries still parked in buckets; swept past a threshold.
    canceled_count: usize,
}

/// Bucket sweep trigger: canceled entries whose slots the fast-forwarding
/// cursor may never visit are reclaimed in bulk past this count.
const SWEEP_THRESHOLD: usize = 1024;

/// A per-group hierarchical timer wheel.
pub(crate) struct TimerWheel {
    tick: Duration,
    state: Mutex<WheelState>,
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerWheel(tick={:?})", self.tick)
    }
}

impl TimerWheel {
    pub(crate) fn new(tick: Duration) -> Self {
        let tick = tick.max(Duration::from_micros(10));
        Self {
            tick,
            state: Mutex::new(WheelState {
                levels: (0..LEVELS)
                    .map(|_| (0..SLOTS).map(|_| VecDeque::new()).collect())
                    .collect(),
                now_ticks: 0,
                overflow: BinaryHeap::new(),
                entries: HashMap::new(),
                horizon: BinaryHeap::new(),
                next_token: 1,
                next_sequence: 0,
                canceled_count: 0,
            }),
        }
    }

    /// Ticks fully elapsed at `now`; the advance loop never runs ahead of
    /// the clock.
    fn ticks_elapsed(&self, now: TimePoint) -> u64 {
        now.as_nanos() / self.tick.as_nanos() as u64
    }

    /// Tick at-or-after `deadline`; a timer never fires early.
    fn ticks_for_deadline(&self, deadline: TimePoint) -> u64 {
        deadline.as_nanos().div_ceil(self.tick.as_nanos() as u64)
    }

    /// Registers a callback to run at `deadline`.
    pub(crate) fn add(
        &self,
        deadline: TimePoint,
        callback: TimerCallback,
        inline: bool,
    ) -> TimerId {
        let deadline_ticks = self.ticks_for_deadline(deadline);
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.entries.insert(token, EntryState::Pending);
        state.horizon.push(Reverse((deadline_ticks, token)));
        let entry = WheelEntry {
            token,
            deadline_ticks,
            callback,
            inline,
        };
        Self::insert(&mut state, entry);
        TimerId { token }
    }

    fn insert(state: &mut WheelState, entry: WheelEntry) {
        // An already-due entry lands on the next tick; the cursor has
        // passed its natural slot and must not orbit a full revolution.
        let target = entry.deadline_ticks.max(state.now_ticks + 1);
        let delta = target - state.now_ticks;
        let mut span = SLOTS as u64;
        for level in 0..LEVELS {
            if delta < span {
                let resolution = span / SLOTS as u64;
                let slot = (target / resolution) as usize % SLOTS;
                state.levels[level][slot].push_back(entry);
                return;
            }
            span = span.saturating_mul(SLOTS as u64);
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.overflow.push(OverflowEntry {
            deadline_ticks: entry.deadline_ticks,
            sequence,
            entry,
        });
    }

    /// Cancels a timer. A pending timer is guaranteed never to run after
    /// `Canceled` is returned.
    pub(crate) fn cancel(&self, id: TimerId) -> CancelResult {
        let mut state = self.state.lock();
        match state.entries.get_mut(&id.token) {
            None => CancelResult::AlreadyFired,
            Some(entry @ EntryState::Pending) => {
                *entry = EntryState::Canceled;
                state.canceled_count += 1;
                CancelResult::Canceled
            }
            Some(EntryState::Canceled) => CancelResult::AlreadyCanceled,
        }
    }

    /// Advances the wheel to `now` and returns every due, uncanceled timer.
    /// Callbacks run outside the wheel lock.
    pub(crate) fn collect_expired(&self, now: TimePoint) -> Vec<ExpiredTimer> {
        let target_ticks = self.ticks_elapsed(now);
        let mut fired = Vec::new();
        let mut state = self.state.lock();

        if state.canceled_count >= SWEEP_THRESHOLD {
            Self::sweep_canceled(&mut state);
        }
        // Promote up front so an overflow entry that fell due while nobody
        // drove the wheel fires here instead of forcing a tick-by-tick walk.
        Self::promote_overflow(&mut state, &mut fired);

        while state.now_ticks < target_ticks {
            match Self::earliest_pending_tick(&mut state) {
                None => {
                    // Nothing pending anywhere; the cursor can move in one
                    // step.
                    state.now_ticks = target_ticks;
                    break;
                }
                Some(next) => {
                    // Skip ticks that can neither fire nor cascade: the next
                    // interesting tick is the earliest pending deadline or
                    // one of its cascade boundaries.
                    if next > state.now_ticks + 1 {
                        let mut jump = next;
                        let mut scale = SLOTS as u64;
                        for _ in 1..LEVELS {
                            let boundary = (next / scale) * scale;
                            if boundary > state.now_ticks {
                                jump = jump.min(boundary);
                            }
                            scale = scale.saturating_mul(SLOTS as u64);
                        }
                        state.now_ticks = jump.min(target_ticks) - 1;
                    }
                }
            }
            state.now_ticks += 1;
            let tick = state.now_ticks;
            let slot = (tick % SLOTS as u64) as usize;
            let drained: Vec<WheelEntry> = state.levels[0][slot].drain(..).collect();
            for entry in drained {
                if entry.deadline_ticks <= tick {
                    Self::dispatch(&mut state, entry, &mut fired);
                } else {
                    Self::insert(&mut state, entry);
                }
            }

            // Crossing a coarser boundary pulls that level's slot down.
            let mut scale = SLOTS as u64;
            for level in 1..LEVELS {
                if tick % scale != 0 {
                    break;
                }
                let slot = ((tick / scale) % SLOTS as u64) as usize;
                let cascading: Vec<WheelEntry> = state.levels[level][slot].drain(..).collect();
                for entry in cascading {
                    if entry.deadline_ticks <= tick {
                        Self::dispatch(&mut state, entry, &mut fired);
                    } else {
                        Self::insert(&mut state, entry);
                    }
                }
                scale = scale.saturating_mul(SLOTS as u64);
            }
        }

        Self::promote_overflow(&mut state, &mut fired);

        fired
    }

    /// Moves overflow timers that came within the wheel's range (or fell
    /// due) into the buckets or straight into `fired`.
    fn promote_overflow(state: &mut WheelState, fired: &mut Vec<ExpiredTimer>) {
        let horizon_ticks = {
            let mut span = 1u64;
            for _ in 0..LEVELS {
                span = span.saturating_mul(SLOTS as u64);
            }
            state.now_ticks.saturating_add(span)
        };
        while let Some(front) = state.overflow.peek() {
            if front.deadline_ticks >= horizon_ticks {
                break;
            }
            let OverflowEntry { entry, .. } = state.overflow.pop().expect("peeked entry");
            if entry.deadline_ticks <= state.now_ticks {
                Self::dispatch(state, entry, fired);
            } else {
                Self::insert(state, entry);
            }
        }
    }

    /// Drops canceled entries from every bucket, the overflow heap, and the
    /// token map. Runs under the wheel lock; O(total entries).
    fn sweep_canceled(state: &mut WheelState) {
        let WheelState {
            levels,
            overflow,
            entries,
            ..
        } = state;
        for level in levels.iter_mut() {
            for slot in level.iter_mut() {
                slot.retain(|entry| entries.get(&entry.token) == Some(&EntryState::Pending));
            }
        }
        let kept = std::mem::take(overflow)
            .into_iter()
            .filter(|of| entries.get(&of.entry.token) == Some(&EntryState::Pending));
        overflow.extend(kept);
        entries.retain(|_, entry_state| *entry_state == EntryState::Pending);
        state.canceled_count = 0;
    }

    /// Earliest pending deadline tick, pruning resolved horizon entries.
    fn earliest_pending_tick(state: &mut WheelState) -> Option<u64> {
        loop {
            let Reverse((deadline_ticks, token)) = *state.horizon.peek()?;
            if state.entries.get(&token) == Some(&EntryState::Pending) {
                return Some(deadline_ticks);
            }
            state.horizon.pop();
        }
    }

    fn dispatch(state: &mut WheelState, entry: WheelEntry, fired: &mut Vec<ExpiredTimer>) {
        match state.entries.remove(&entry.token) {
            Some(EntryState::Pending) => fired.push(ExpiredTimer {
                callback: entry.callback,
                inline: entry.inline,
            }),
            // Canceled (or somehow unknown): the callback is dropped unrun.
            _ => {}
        }
    }

    /// Earliest pending deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<TimePoint> {
        let mut state = self.state.lock();
        loop {
            let Reverse((deadline_ticks, token)) = *state.horizon.peek()?;
            match state.entries.get(&token) {
                Some(EntryState::Pending) => {
                    let nanos = deadline_ticks.saturating_mul(self.tick.as_nanos() as u64);
                    return Some(TimePoint::from_nanos(nanos));
                }
                _ => {
                    state.horizon.pop();
                }
            }
        }
    }

    /// Number of pending (uncanceled, unfired) timers.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|entry| **entry == EntryState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(1);

    fn counter_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn run_all(wheel: &TimerWheel, now: TimePoint) -> usize {
        let fired = wheel.collect_expired(now);
        let count = fired.len();
        for timer in fired {
            (timer.callback)();
        }
        count
    }

    #[test]
    fn due_timer_fires_once() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        wheel.add(
            TimePoint::from_nanos(5_000_000),
            counter_callback(&counter),
            true,
        );

        run_all(&wheel, TimePoint::from_nanos(10_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Re-driving past the deadline does not re-fire.
        run_all(&wheel, TimePoint::from_nanos(20_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceled_timer_never_fires() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = wheel.add(
            TimePoint::from_nanos(5_000_000),
            counter_callback(&counter),
            true,
        );

        assert_eq!(wheel.cancel(id), CancelResult::Canceled);
        assert_eq!(wheel.cancel(id), CancelResult::AlreadyCanceled);

        run_all(&wheel, TimePoint::from_nanos(50_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_reports_already_fired() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = wheel.add(
            TimePoint::from_nanos(2_000_000),
            counter_callback(&counter),
            true,
        );
        run_all(&wheel, TimePoint::from_nanos(10_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.cancel(id), CancelResult::AlreadyFired);
    }

    #[test]
    fn same_deadline_fires_in_insertion_order() {
        let wheel = TimerWheel::new(TICK);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5u32 {
            let order = Arc::clone(&order);
            wheel.add(
                TimePoint::from_nanos(3_000_000),
                Box::new(move || order.lock().push(tag)),
                true,
            );
        }
        run_all(&wheel, TimePoint::from_nanos(10_000_000));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn far_deadline_cascades_down_and_fires() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        // Beyond level 0 (64 ticks): lands in a coarser level first.
        let deadline = TimePoint::from_nanos(500 * 1_000_000);
        wheel.add(deadline, counter_callback(&counter), true);

        run_all(&wheel, TimePoint::from_nanos(499 * 1_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        run_all(&wheel, TimePoint::from_nanos(501 * 1_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overflow_horizon_timer_is_promoted() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        // 64^4 ticks at 1ms is ~4.6 hours; 5 hours goes to overflow.
        let deadline = TimePoint::from_nanos(5 * 3600 * 1_000_000_000);
        wheel.add(deadline, counter_callback(&counter), true);
        assert_eq!(wheel.pending(), 1);

        run_all(&wheel, deadline.saturating_add(Duration::from_millis(2)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.pending(), 0);
    }

    #[test]
    fn next_deadline_tracks_earliest_pending() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        let early = wheel.add(
            TimePoint::from_nanos(5_000_000),
            counter_callback(&counter),
            true,
        );
        wheel.add(
            TimePoint::from_nanos(50_000_000),
            counter_callback(&counter),
            true,
        );

        let first = wheel.next_deadline().expect("two pending timers");
        assert_eq!(first.as_nanos(), 5_000_000);

        wheel.cancel(early);
        let second = wheel.next_deadline().expect("one pending timer");
        assert_eq!(second.as_nanos(), 50_000_000);
    }

    #[test]
    fn sub_tick_deadline_rounds_up_never_early() {
        let wheel = TimerWheel::new(TICK);
        let counter = Arc::new(AtomicUsize::new(0));
        // 1.5ms lands on the 2ms tick, not the 1ms tick.
        wheel.add(
            TimePoint::from_nanos(1_500_000),
            counter_callback(&counter),
            true,
        );
        run_all(&wheel, TimePoint::from_nanos(1_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        run_all(&wheel, TimePoint::from_nanos(2_000_000));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
