//! Sleep, yield, and cooperative stop scenarios.

use melon_fiber::sync::Mutex;
use melon_fiber::test_utils::{init_test_logging, test_runtime};
use melon_fiber::{runtime, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn sleep_for_waits_roughly_the_requested_time() {
    init_test_logging();
    let rt = test_runtime(2);
    let elapsed = Arc::new(Mutex::new(None));
    let handle = {
        let elapsed = Arc::clone(&elapsed);
        rt.spawn(move || {
            let start = Instant::now();
            runtime::sleep_for(Duration::from_millis(50)).expect("sleep");
            *elapsed.lock().expect("lock") = Some(start.elapsed());
        })
        .expect("spawn")
    };
    handle.join().expect("join");
    let elapsed = elapsed.lock().expect("lock").expect("sleep measured");
    assert!(
        elapsed >= Duration::from_millis(49),
        "sleep returned early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "sleep wildly overshot: {elapsed:?}"
    );
    rt.shutdown();
}

#[test]
fn stop_cancels_a_long_sleep_promptly() {
    init_test_logging();
    melon_fiber::test_phase!("stop_cancels_a_long_sleep_promptly");
    let rt = test_runtime(2);

    let outcome = Arc::new(Mutex::new(None));
    let handle = {
        let outcome = Arc::clone(&outcome);
        rt.spawn(move || {
            let result = runtime::sleep_for(Duration::from_secs(10));
            *outcome.lock().expect("lock") = Some(result);
        })
        .expect("spawn sleeper")
    };

    std::thread::sleep(Duration::from_millis(10));
    let start = Instant::now();
    handle.stop().expect("stop");
    handle.join().expect("join");
    let latency = start.elapsed();

    let result = outcome
        .lock()
        .expect("lock")
        .take()
        .expect("sleeper recorded its outcome");
    assert_eq!(
        result.expect_err("sleep must be canceled").kind(),
        ErrorKind::Canceled
    );
    assert!(
        latency < Duration::from_secs(2),
        "cancellation took {latency:?}"
    );
    rt.shutdown();
    melon_fiber::test_complete!("stop_cancels_a_long_sleep_promptly");
}

#[test]
fn stop_flag_is_visible_at_yield_points() {
    init_test_logging();
    let rt = test_runtime(2);
    let observed = Arc::new(AtomicBool::new(false));
    let handle = {
        let observed = Arc::clone(&observed);
        rt.spawn(move || loop {
            if runtime::stop_requested() {
                observed.store(true, Ordering::SeqCst);
                return;
            }
            runtime::yield_now();
        })
        .expect("spawn poller")
    };
    std::thread::sleep(Duration::from_millis(10));
    handle.stop().expect("stop");
    handle.join().expect("join");
    assert!(observed.load(Ordering::SeqCst));
    rt.shutdown();
}

#[test]
fn sleep_after_stop_fails_immediately() {
    init_test_logging();
    let rt = test_runtime(2);
    let results = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let results = Arc::clone(&results);
        rt.spawn(move || {
            let first = runtime::sleep_for(Duration::from_secs(10));
            let second = runtime::sleep_for(Duration::from_millis(1));
            results
                .lock()
                .expect("lock")
                .extend([first.is_err(), second.is_err()]);
        })
        .expect("spawn")
    };
    std::thread::sleep(Duration::from_millis(10));
    handle.stop().expect("stop");
    handle.join().expect("join");
    assert_eq!(*results.lock().expect("lock"), vec![true, true]);
    rt.shutdown();
}

#[test]
fn yielding_fibers_interleave() {
    init_test_logging();
    let rt = test_runtime(1); // single worker forces interleaving via yields
    let trace = Arc::new(Mutex::new(Vec::new()));
    let go = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for tag in 0..2u32 {
        let trace = Arc::clone(&trace);
        let go = Arc::clone(&go);
        handles.push(
            rt.spawn(move || {
                while !go.load(Ordering::SeqCst) {
                    runtime::yield_now();
                }
                for round in 0..3 {
                    trace.lock().expect("lock").push((tag, round));
                    runtime::yield_now();
                }
            })
            .expect("spawn"),
        );
    }
    std::thread::sleep(Duration::from_millis(30));
    go.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join().expect("join");
    }
    let trace = trace.lock().expect("lock").clone();
    assert_eq!(trace.len(), 6);
    // Both fibers made progress before either finished: the trace is not
    // two uninterrupted runs.
    let first_tag = trace[0].0;
    let cut = trace.iter().take_while(|(tag, _)| *tag == first_tag).count();
    assert!(cut < 3 || trace[3..].iter().any(|(tag, _)| *tag == first_tag));
    rt.shutdown();
}
