//! Mutex, condvar, countdown event, and fiber-local storage exercised from
//! real fibers (the in-module unit tests cover the plain-thread paths).

use melon_fiber::sync::{Condvar, CountdownEvent, Mutex};
use melon_fiber::task::storage::{self, key_create};
use melon_fiber::test_utils::{init_test_logging, test_runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn fibers_contend_on_mutex_without_losing_updates() {
    init_test_logging();
    melon_fiber::test_phase!("fibers_contend_on_mutex_without_losing_updates");
    let rt = test_runtime(4);
    let counter = Arc::new(Mutex::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = Arc::clone(&counter);
        handles.push(
            rt.spawn(move || {
                for _ in 0..500 {
                    *counter.lock().expect("lock") += 1;
                }
            })
            .expect("spawn"),
        );
    }
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(*counter.lock().expect("final"), 4000);
    assert!(!counter.is_locked());
    rt.shutdown();
    melon_fiber::test_complete!("fibers_contend_on_mutex_without_losing_updates");
}

#[test]
fn condvar_hands_off_between_fibers() {
    init_test_logging();
    let rt = test_runtime(2);
    let shared = Arc::new((Mutex::new(0u32), Condvar::new()));

    // Consumer waits for the value to become odd, then bumps it even.
    let consumer = {
        let shared = Arc::clone(&shared);
        rt.spawn(move || {
            let (mutex, condvar) = &*shared;
            for _ in 0..10 {
                let mut guard = mutex.lock().expect("lock");
                while *guard % 2 == 0 {
                    guard = condvar.wait(guard).expect("wait");
                }
                *guard += 1;
                condvar.notify_all();
            }
        })
        .expect("spawn consumer")
    };
    let producer = {
        let shared = Arc::clone(&shared);
        rt.spawn(move || {
            let (mutex, condvar) = &*shared;
            for _ in 0..10 {
                let mut guard = mutex.lock().expect("lock");
                while *guard % 2 == 1 {
                    guard = condvar.wait(guard).expect("wait");
                }
                *guard += 1;
                condvar.notify_all();
            }
        })
        .expect("spawn producer")
    };

    producer.join().expect("join producer");
    consumer.join().expect("join consumer");
    assert_eq!(*shared.0.lock().expect("final"), 20);
    rt.shutdown();
}

#[test]
fn countdown_event_gathers_fibers() {
    init_test_logging();
    let rt = test_runtime(4);
    let event = Arc::new(CountdownEvent::new(5));
    let released = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let event = Arc::clone(&event);
        let released = Arc::clone(&released);
        waiters.push(
            rt.spawn(move || {
                event.wait().expect("wait");
                released.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn waiter"),
        );
    }

    let mut signalers = Vec::new();
    for _ in 0..5 {
        let event = Arc::clone(&event);
        signalers.push(
            rt.spawn(move || {
                melon_fiber::runtime::sleep_for(Duration::from_millis(10)).expect("sleep");
                event.signal(1);
            })
            .expect("spawn signaler"),
        );
    }

    for handle in signalers.into_iter().chain(waiters) {
        handle.join().expect("join");
    }
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert_eq!(event.count(), 0);
    rt.shutdown();
}

#[test]
fn fiber_local_storage_runs_destructors_at_termination() {
    init_test_logging();
    let rt = test_runtime(2);
    let dropped = Arc::new(AtomicUsize::new(0));
    let key = key_create(Some({
        let dropped = Arc::clone(&dropped);
        Arc::new(move |value| {
            let value = *value.downcast::<u32>().expect("stored a u32");
            dropped.fetch_add(value as usize, Ordering::SeqCst);
        })
    }))
    .expect("key");

    let handle = rt
        .spawn(move || {
            storage::set_local(key, Box::new(41u32)).expect("set");
            // Values are readable and replaceable within the fiber.
            let previous = storage::set_local(key, Box::new(7u32))
                .expect("replace")
                .expect("previous value present");
            assert_eq!(*previous.downcast::<u32>().expect("u32"), 41);
            storage::with_local(key, |value| {
                let value = value.expect("value present");
                assert_eq!(*value.downcast_ref::<u32>().expect("u32"), 7);
            })
            .expect("with_local");
        })
        .expect("spawn");
    handle.join().expect("join");

    // The destructor saw the live value (7), not the replaced one.
    assert_eq!(dropped.load(Ordering::SeqCst), 7);
    storage::key_delete(key);
    rt.shutdown();
}

#[test]
fn storage_is_unreachable_outside_fibers() {
    init_test_logging();
    let key = key_create(None).expect("key");
    assert!(storage::set_local(key, Box::new(1u8)).is_err());
    storage::key_delete(key);
}

#[test]
fn mutex_relock_on_same_fiber_is_detected() {
    init_test_logging();
    let rt = test_runtime(2);
    let verdict = Arc::new(Mutex::new(None));
    let mutex = Arc::new(Mutex::new(()));
    let handle = {
        let verdict = Arc::clone(&verdict);
        let mutex = Arc::clone(&mutex);
        rt.spawn(move || {
            let _guard = mutex.lock().expect("first lock");
            let second = mutex.lock();
            *verdict.lock().expect("verdict") = Some(second.map(|_| ()));
        })
        .expect("spawn")
    };
    handle.join().expect("join");
    let result = verdict
        .lock()
        .expect("verdict")
        .take()
        .expect("fiber recorded");
    assert_eq!(
        result.expect_err("relock must fail").kind(),
        melon_fiber::ErrorKind::WouldDeadlock
    );
    rt.shutdown();
}
