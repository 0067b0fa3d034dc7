//! Timer wheel scenarios under load: batch adds, random cancels, fire races.

use melon_fiber::test_utils::{init_test_logging, test_runtime};
use melon_fiber::timer::CancelResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Small deterministic PRNG so the cancel pattern is reproducible.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn mass_timers_fire_exactly_once_minus_cancels() {
    init_test_logging();
    melon_fiber::test_phase!("mass_timers_fire_exactly_once_minus_cancels");
    let rt = test_runtime(4);

    const TIMERS: usize = 2000;
    let fired = Arc::new(AtomicUsize::new(0));
    let mut rng = XorShift(0xDEAD_BEEF);
    let mut handles = Vec::with_capacity(TIMERS);

    for i in 0..TIMERS {
        let fired = Arc::clone(&fired);
        let delay = Duration::from_millis(10 + (i as u64 * 290 / TIMERS as u64));
        handles.push(rt.timer_after(delay, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Cancel roughly half before they fire; count only the cancels that won
    // the race against the fire path.
    let mut canceled = 0usize;
    for handle in &handles {
        if rng.next() % 2 == 0 && handle.cancel() == CancelResult::Canceled {
            canceled += 1;
        }
    }

    // Wait for the survivors.
    let deadline = Instant::now() + Duration::from_secs(10);
    while fired.load(Ordering::SeqCst) < TIMERS - canceled {
        assert!(
            Instant::now() < deadline,
            "only {}/{} timers fired",
            fired.load(Ordering::SeqCst),
            TIMERS - canceled
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    // Give stragglers a chance to over-fire, then check exactness.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), TIMERS - canceled);

    // Cancel after the dust settles: everything reports a terminal state.
    for handle in &handles {
        assert_ne!(handle.cancel(), CancelResult::Canceled);
    }
    rt.shutdown();
    melon_fiber::test_complete!("mass_timers_fire_exactly_once_minus_cancels");
}

#[test]
fn timer_fires_near_its_deadline_when_idle() {
    init_test_logging();
    let rt = test_runtime(2);
    let fired_at = Arc::new(parking_lot::Mutex::new(None));
    let start = Instant::now();
    {
        let fired_at = Arc::clone(&fired_at);
        rt.timer_after(Duration::from_millis(50), move || {
            *fired_at.lock() = Some(start.elapsed());
        });
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(elapsed) = *fired_at.lock() {
            assert!(
                elapsed >= Duration::from_millis(49),
                "fired early: {elapsed:?}"
            );
            assert!(
                elapsed < Duration::from_millis(500),
                "fired far too late on an idle runtime: {elapsed:?}"
            );
            break;
        }
        assert!(Instant::now() < deadline, "timer never fired");
        std::thread::sleep(Duration::from_millis(5));
    }
    rt.shutdown();
}

#[test]
fn canceled_timer_callback_never_runs() {
    init_test_logging();
    let rt = test_runtime(2);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = {
        let fired = Arc::clone(&fired);
        rt.timer_after(Duration::from_millis(60), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert_eq!(handle.cancel(), CancelResult::Canceled);
    assert_eq!(handle.cancel(), CancelResult::AlreadyCanceled);
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    rt.shutdown();
}
