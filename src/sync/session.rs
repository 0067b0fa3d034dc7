//! Version-tagged sessions: a per-slot mutex plus an error callback,
//! protected from use-after-free.
//!
//! A [`SessionId`] packs a slot index and a version. Destroying the session
//! bumps the slot's version, so every later operation on the stale id —
//! lock, unlock, set_failed — returns
//! [`ErrorKind::InvalidId`](crate::ErrorKind::InvalidId) without side
//! effect. `set_failed` schedules the session's error callback exactly once
//! (first-wins), on a fresh fiber that acquires the per-slot mutex before
//! invoking it; the callback is expected to unlock or destroy the session.

use crate::error::{Error, ErrorKind, Result};
use crate::id::SessionId;
use crate::park::word::{ParkingWord, WordWait};
use crate::runtime::Runtime;
use crate::task::entity::TaskAttrs;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Callback invoked (with the per-slot mutex held) when a session fails.
pub type SessionCallback = Arc<dyn Fn(SessionId, i32) + Send + Sync + 'static>;

struct SessionInner {
    on_error: Option<SessionCallback>,
    error_scheduled: bool,
}

struct SessionSlot {
    index: u32,
    version: AtomicU32,
    lock_word: ParkingWord,
    /// Holds the live version; bumped and broadcast on destroy so `join`
    /// and lock-waiters observe the death.
    death_word: ParkingWord,
    inner: Mutex<SessionInner>,
}

impl SessionSlot {
    fn matches(&self, id: SessionId) -> bool {
        self.version.load(Ordering::SeqCst) == id.version
    }
}

/// Process-wide session table, owned by the runtime.
pub(crate) struct SessionRegistry {
    slots: RwLock<Vec<Arc<SessionSlot>>>,
    free: Mutex<Vec<u32>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    fn slot_for(&self, id: SessionId) -> Result<Arc<SessionSlot>> {
        let slot = self
            .slots
            .read()
            .get(id.slot as usize)
            .cloned()
            .ok_or(ErrorKind::InvalidId)?;
        if !slot.matches(id) {
            return Err(Error::new(ErrorKind::InvalidId));
        }
        Ok(slot)
    }

    pub(crate) fn create(&self, on_error: SessionCallback) -> Result<SessionId> {
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                let mut slots = self.slots.write();
                let index = u32::try_from(slots.len())
                    .map_err(|_| Error::new(ErrorKind::ResourceExhausted))?;
                slots.push(Arc::new(SessionSlot {
                    index,
                    version: AtomicU32::new(1),
                    lock_word: ParkingWord::new(UNLOCKED),
                    death_word: ParkingWord::new(1),
                    inner: Mutex::new(SessionInner {
                        on_error: None,
                        error_scheduled: false,
                    }),
                }));
                index
            }
        };
        let slot = Arc::clone(&self.slots.read()[index as usize]);
        let version = slot.version.load(Ordering::SeqCst);
        {
            let mut inner = slot.inner.lock();
            inner.on_error = Some(on_error);
            inner.error_scheduled = false;
        }
        slot.lock_word.store(UNLOCKED);
        slot.death_word.store(version);
        Ok(SessionId::new(index, version))
    }

    /// Whether the id still names a live session. The check is advisory: a
    /// concurrent destroy can invalidate the id immediately afterwards.
    pub(crate) fn exists(&self, id: SessionId) -> bool {
        self.slot_for(id).is_ok()
    }

    /// Acquires the per-slot mutex if the version still matches.
    pub(crate) fn lock(&self, id: SessionId) -> Result<()> {
        loop {
            let slot = self.slot_for(id)?;
            if slot.lock_word.compare_exchange(UNLOCKED, LOCKED).is_ok() {
                if !slot.matches(id) {
                    // Destroyed between the check and the acquire; undo.
                    slot.lock_word.store(UNLOCKED);
                    slot.lock_word.wake(1);
                    return Err(Error::new(ErrorKind::InvalidId));
                }
                return Ok(());
            }
            if slot.lock_word.swap(CONTENDED) == UNLOCKED {
                if !slot.matches(id) {
                    slot.lock_word.store(UNLOCKED);
                    slot.lock_word.wake(1);
                    return Err(Error::new(ErrorKind::InvalidId));
                }
                return Ok(());
            }
            match slot.lock_word.wait_while_equals(CONTENDED, None) {
                WordWait::Canceled => return Err(Error::new(ErrorKind::Canceled)),
                WordWait::Woke | WordWait::Mismatch | WordWait::TimedOut => {}
            }
        }
    }

    /// Releases the per-slot mutex.
    pub(crate) fn unlock(&self, id: SessionId) -> Result<()> {
        let slot = self.slot_for(id)?;
        if slot.lock_word.swap(UNLOCKED) == CONTENDED {
            slot.lock_word.wake(1);
        }
        Ok(())
    }

    /// Releases the mutex, bumps the version, and wakes everyone holding or
    /// awaiting the old id.
    pub(crate) fn unlock_and_destroy(&self, id: SessionId) -> Result<()> {
        let slot = self.slot_for(id)?;
        let next = id.version.wrapping_add(1);
        slot.version.store(next, Ordering::SeqCst);
        slot.inner.lock().on_error = None;
        slot.lock_word.set_and_wake_all(UNLOCKED);
        slot.death_word.set_and_wake_all(next);
        self.free.lock().push(slot.index);
        Ok(())
    }

    /// Schedules the error callback exactly once; later calls are no-ops.
    pub(crate) fn set_failed(&self, runtime: &Arc<Runtime>, id: SessionId, code: i32) -> Result<()> {
        let slot = self.slot_for(id)?;
        let callback = {
            let mut inner = slot.inner.lock();
            if inner.error_scheduled {
                return Ok(());
            }
            inner.error_scheduled = true;
            inner.on_error.clone()
        };
        let Some(callback) = callback else {
            return Ok(());
        };
        let handoff = Arc::clone(runtime);
        let spawned = runtime.spawn_with(TaskAttrs::system_default(), move || {
            // The session may be destroyed before the handler runs; a stale
            // id is simply dropped.
            if handoff.session_lock(id).is_ok() {
                callback(id, code);
            }
        });
        if let Err(err) = spawned {
            warn!(session = ?id, "failed to spawn session error handler: {err}");
        }
        Ok(())
    }

    /// Blocks until the session is destroyed. A stale id returns
    /// immediately with `Ok`.
    pub(crate) fn join(&self, id: SessionId) -> Result<()> {
        loop {
            let Ok(slot) = self.slot_for(id) else {
                return Ok(());
            };
            match slot.death_word.wait_while_equals(id.version, None) {
                WordWait::Canceled => return Err(Error::new(ErrorKind::Canceled)),
                WordWait::Woke | WordWait::Mismatch | WordWait::TimedOut => {}
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionRegistry({} slots)", self.slots.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> SessionCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn lock_unlock_and_destroy_cycle() {
        let registry = SessionRegistry::new();
        let id = registry.create(noop_callback()).expect("create");
        registry.lock(id).expect("lock");
        registry.unlock(id).expect("unlock");
        registry.lock(id).expect("relock");
        registry.unlock_and_destroy(id).expect("destroy");

        assert_eq!(
            registry.lock(id).expect_err("stale lock").kind(),
            ErrorKind::InvalidId
        );
        assert_eq!(
            registry.unlock(id).expect_err("stale unlock").kind(),
            ErrorKind::InvalidId
        );
    }

    #[test]
    fn recycled_slot_gets_new_version() {
        let registry = SessionRegistry::new();
        let first = registry.create(noop_callback()).expect("create");
        registry.unlock_and_destroy(first).expect("destroy");
        let second = registry.create(noop_callback()).expect("recreate");
        assert_eq!(first.slot, second.slot);
        assert_ne!(first.version, second.version);
        // The old id stays dead.
        assert_eq!(
            registry.lock(first).expect_err("stale").kind(),
            ErrorKind::InvalidId
        );
        registry.lock(second).expect("fresh id locks");
    }

    #[test]
    fn join_on_destroyed_session_returns_immediately() {
        let registry = SessionRegistry::new();
        let id = registry.create(noop_callback()).expect("create");
        registry.unlock_and_destroy(id).expect("destroy");
        registry.join(id).expect("join after destroy");
    }
}
