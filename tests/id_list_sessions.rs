//! The ABA-free id list in its intended role: remembering session ids for
//! error notification, with destroyed sessions lazily overwritten.

use melon_fiber::sync::ListOfAbaFreeId;
use melon_fiber::test_utils::{init_test_logging, test_runtime};
use melon_fiber::SessionId;
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn destroyed_sessions_are_skipped_and_their_slots_reused() {
    init_test_logging();
    let rt = test_runtime(2);

    let exists = {
        let rt = Arc::clone(&rt);
        move |id: &SessionId| rt.session_exists(*id)
    };

    let mut list: ListOfAbaFreeId<SessionId> = ListOfAbaFreeId::new(4096);

    // Remember a batch of sessions, then destroy every other one.
    let mut live = Vec::new();
    let mut dead = Vec::new();
    for i in 0..40 {
        let id = rt.session_create(Arc::new(|_, _| {})).expect("create");
        list.add(id, &exists).expect("add");
        if i % 2 == 0 {
            live.push(id);
        } else {
            dead.push(id);
        }
    }
    for id in &dead {
        rt.session_unlock_and_destroy(*id).expect("destroy");
    }

    // Only the live sessions are visited.
    let mut seen = HashSet::new();
    list.for_each(&exists, |id| {
        seen.insert(*id);
    });
    assert_eq!(seen.len(), live.len());
    for id in &live {
        assert!(seen.contains(id), "live session {id:?} missing from walk");
    }
    for id in &dead {
        assert!(!seen.contains(id), "destroyed session {id:?} still visited");
    }

    // New sessions overwrite the dead entries instead of growing the list.
    let before = list.capacity();
    for _ in 0..dead.len() {
        let id = rt.session_create(Arc::new(|_, _| {})).expect("recreate");
        list.add(id, &exists).expect("re-add");
    }
    assert_eq!(
        list.capacity(),
        before,
        "dead entries should be reused before allocating blocks"
    );

    for id in live {
        rt.session_unlock_and_destroy(id).expect("cleanup");
    }
    rt.shutdown();
}
