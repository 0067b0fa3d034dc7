//! Spawn/join lifecycle scenarios.

use melon_fiber::sync::Mutex;
use melon_fiber::test_utils::{init_test_logging, test_runtime, test_runtime_with_system_group};
use melon_fiber::{runtime, Affinity, ErrorKind, TaskAttrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn spawned_fiber_writes_are_visible_to_joiner() {
    init_test_logging();
    melon_fiber::test_phase!("spawned_fiber_writes_are_visible_to_joiner");
    let rt = test_runtime(2);

    let mailbox = Arc::new(Mutex::new(Vec::new()));
    let producer = {
        let mailbox = Arc::clone(&mailbox);
        rt.spawn(move || {
            mailbox.lock().expect("producer lock").push(42);
        })
        .expect("spawn producer")
    };

    let seen = Arc::new(Mutex::new(None));
    let reader = {
        let mailbox = Arc::clone(&mailbox);
        let seen = Arc::clone(&seen);
        rt.spawn(move || {
            producer.join().expect("join producer");
            let value = mailbox.lock().expect("reader lock").first().copied();
            *seen.lock().expect("seen lock") = value;
        })
        .expect("spawn reader")
    };

    reader.join().expect("join reader");
    assert_eq!(*seen.lock().expect("final lock"), Some(42));
    rt.shutdown();
    melon_fiber::test_complete!("spawned_fiber_writes_are_visible_to_joiner");
}

#[test]
fn thousand_fibers_increment_shared_counter() {
    init_test_logging();
    melon_fiber::test_phase!("thousand_fibers_increment_shared_counter");
    let rt = test_runtime(4);

    let counter = Arc::new(Mutex::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..1000 {
        let counter = Arc::clone(&counter);
        handles.push(
            rt.spawn(move || {
                *counter.lock().expect("counter lock") += 1;
            })
            .expect("spawn"),
        );
    }
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(*counter.lock().expect("final"), 1000);
    rt.shutdown();
    melon_fiber::test_complete!("thousand_fibers_increment_shared_counter");
}

#[test]
fn join_after_completion_and_self_join() {
    init_test_logging();
    let rt = test_runtime(2);

    // Join well after the fiber completed.
    let done = Arc::new(AtomicUsize::new(0));
    let handle = {
        let done = Arc::clone(&done);
        rt.spawn(move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn")
    };
    std::thread::sleep(std::time::Duration::from_millis(50));
    handle.join().expect("late join is fine");
    assert_eq!(done.load(Ordering::SeqCst), 1);

    // A fiber joining itself must be rejected, not hang.
    let verdict = Arc::new(Mutex::new(None));
    let handle_cell = Arc::new(Mutex::new(None));
    let self_joiner = {
        let verdict = Arc::clone(&verdict);
        let handle_cell = Arc::clone(&handle_cell);
        rt.spawn(move || {
            // Wait for our own handle to arrive.
            loop {
                if let Some(handle) = handle_cell.lock().expect("cell").take() {
                    let me: melon_fiber::JoinHandle = handle;
                    *verdict.lock().expect("verdict") = Some(me.join());
                    return;
                }
                runtime::yield_now();
            }
        })
        .expect("spawn self joiner")
    };
    *handle_cell.lock().expect("cell") = Some(self_joiner.clone());
    self_joiner.join().expect("join self joiner");
    let result = verdict
        .lock()
        .expect("verdict")
        .take()
        .expect("fiber recorded a verdict");
    assert_eq!(
        result.expect_err("self-join must fail").kind(),
        ErrorKind::WouldDeadlock
    );
    rt.shutdown();
}

#[test]
fn panicked_fiber_still_releases_joiner() {
    init_test_logging();
    let rt = test_runtime(2);
    let handle = rt
        .spawn(|| panic!("fiber panic must not cross the trampoline"))
        .expect("spawn");
    handle.join().expect("join returns despite the panic");
    rt.shutdown();
}

#[test]
fn spawn_many_reuses_slots_and_stacks() {
    init_test_logging();
    let rt = test_runtime(2);
    let counter = Arc::new(AtomicUsize::new(0));
    // Several waves so slots and stacks cycle through the free lists.
    for _ in 0..10 {
        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            handles.push(
                rt.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .expect("spawn"),
            );
        }
        for handle in handles {
            handle.join().expect("join");
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 500);
    rt.shutdown();
}

#[test]
fn stale_handle_reports_invalid_id() {
    init_test_logging();
    let rt = test_runtime(1);
    let first = rt.spawn(|| {}).expect("spawn");
    first.join().expect("join");
    // Recycle the slot; the old handle's version is now two behind.
    for _ in 0..20 {
        rt.spawn(|| {}).expect("spawn").join().expect("join");
    }
    match first.join() {
        Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidId),
        // The slot may not have been reused yet on this schedule; the
        // just-terminated window reports success instead.
        Ok(()) => {}
    }
    rt.shutdown();
}

#[test]
fn current_runtime_is_visible_from_fibers_only() {
    init_test_logging();
    let rt = test_runtime(2);
    assert!(
        melon_fiber::Runtime::current().is_none(),
        "the spawning thread is not a worker"
    );

    let nested_ran = Arc::new(AtomicUsize::new(0));
    let handle = {
        let nested_ran = Arc::clone(&nested_ran);
        rt.spawn(move || {
            let ambient = melon_fiber::Runtime::current().expect("worker thread has a runtime");
            // The ambient handle is the real runtime: it can spawn.
            let inner = {
                let nested_ran = Arc::clone(&nested_ran);
                ambient
                    .spawn(move || {
                        nested_ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .expect("nested spawn")
            };
            inner.join().expect("join nested");
        })
        .expect("spawn")
    };
    handle.join().expect("join");
    assert_eq!(nested_ran.load(Ordering::SeqCst), 1);
    rt.shutdown();
}

#[test]
fn system_affinity_lands_in_the_system_group() {
    init_test_logging();
    let rt = test_runtime_with_system_group(2);
    let ran = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for affinity in [Affinity::Any, Affinity::System, Affinity::Current] {
        let ran = Arc::clone(&ran);
        handles.push(
            rt.spawn_with(TaskAttrs::default().affinity(affinity), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn"),
        );
    }
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    rt.shutdown();
}

#[test]
fn pinned_fiber_stays_on_one_worker() {
    init_test_logging();
    let rt = test_runtime(4);
    let workers_seen = Arc::new(Mutex::new(std::collections::HashSet::new()));
    let handle = {
        let workers_seen = Arc::clone(&workers_seen);
        rt.spawn_with(TaskAttrs::default().group_local(), move || {
            for _ in 0..50 {
                let thread = std::thread::current().id();
                workers_seen.lock().expect("lock").insert(thread);
                runtime::yield_now();
            }
        })
        .expect("spawn pinned")
    };
    handle.join().expect("join");
    assert_eq!(
        workers_seen.lock().expect("final").len(),
        1,
        "a pinned fiber must never migrate"
    );
    rt.shutdown();
}

#[test]
fn detached_and_system_attrs_spawn_fine() {
    init_test_logging();
    let rt = test_runtime(2);
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = Arc::clone(&ran);
        rt.spawn_with(TaskAttrs::default().detached(), move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn detached");
    }
    {
        let ran = Arc::clone(&ran);
        rt.spawn_with(
            TaskAttrs::default().stack_class(melon_fiber::StackClass::Normal),
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("spawn with normal stack");
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) < 2 {
        assert!(std::time::Instant::now() < deadline, "fibers never ran");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    rt.shutdown();
}
