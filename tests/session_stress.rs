//! Session id lifecycle under contention.

use melon_fiber::test_utils::{init_test_logging, test_runtime};
use melon_fiber::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn lock_loops_survive_destruction() {
    init_test_logging();
    melon_fiber::test_phase!("lock_loops_survive_destruction");
    let rt = test_runtime(4);

    let id = rt
        .session_create(Arc::new(|_, _| {}))
        .expect("create session");

    const LOOPERS: usize = 50;
    let stop = Arc::new(AtomicBool::new(false));
    let clean_exits = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..LOOPERS {
        let rt2 = Arc::clone(&rt);
        let stop = Arc::clone(&stop);
        let clean_exits = Arc::clone(&clean_exits);
        handles.push(
            rt.spawn(move || {
                loop {
                    match rt2.session_lock(id) {
                        Ok(()) => rt2.session_unlock(id).expect("unlock after lock"),
                        Err(err) => {
                            // Destruction surfaced: from here on the id must
                            // stay invalid.
                            assert_eq!(err.kind(), ErrorKind::InvalidId);
                            break;
                        }
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    melon_fiber::runtime::yield_now();
                }
                clean_exits.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn looper"),
        );
    }

    std::thread::sleep(Duration::from_millis(100));
    rt.session_lock(id).expect("destroyer lock");
    rt.session_unlock_and_destroy(id).expect("destroy");
    stop.store(true, Ordering::SeqCst);

    for handle in handles {
        handle.join().expect("join looper");
    }
    assert_eq!(clean_exits.load(Ordering::SeqCst), LOOPERS);
    assert_eq!(
        rt.session_lock(id).expect_err("id is dead").kind(),
        ErrorKind::InvalidId
    );
    rt.shutdown();
    melon_fiber::test_complete!("lock_loops_survive_destruction");
}

#[test]
fn set_failed_runs_error_handler_exactly_once() {
    init_test_logging();
    let rt = test_runtime(2);

    let calls = Arc::new(AtomicUsize::new(0));
    let observed_code = Arc::new(AtomicUsize::new(0));
    let rt_for_handler = Arc::clone(&rt);
    let id = rt
        .session_create({
            let calls = Arc::clone(&calls);
            let observed_code = Arc::clone(&observed_code);
            Arc::new(move |session, code| {
                calls.fetch_add(1, Ordering::SeqCst);
                observed_code.store(code as usize, Ordering::SeqCst);
                rt_for_handler
                    .session_unlock_and_destroy(session)
                    .expect("handler destroys the session");
            })
        })
        .expect("create");

    rt.session_set_failed(id, 7).expect("first set_failed");
    // The handler may already have destroyed the session; either way the
    // second failure must not schedule another callback.
    if let Err(err) = rt.session_set_failed(id, 8) {
        assert_eq!(err.kind(), ErrorKind::InvalidId);
    }

    rt.session_join(id).expect("join waits for destruction");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(observed_code.load(Ordering::SeqCst), 7);
    rt.shutdown();
}

#[test]
fn stale_operations_have_no_side_effects() {
    init_test_logging();
    let rt = test_runtime(2);

    let first = rt.session_create(Arc::new(|_, _| {})).expect("create");
    rt.session_unlock_and_destroy(first).expect("destroy");
    let second = rt.session_create(Arc::new(|_, _| {})).expect("recreate");

    // The recycled slot answers only to the new version.
    assert_eq!(
        rt.session_lock(first).expect_err("stale lock").kind(),
        ErrorKind::InvalidId
    );
    assert_eq!(
        rt.session_set_failed(first, 1)
            .expect_err("stale set_failed")
            .kind(),
        ErrorKind::InvalidId
    );
    rt.session_lock(second).expect("fresh lock still works");
    rt.session_unlock(second).expect("fresh unlock");
    rt.session_join(first).expect("join on dead id returns");
    rt.shutdown();
}
