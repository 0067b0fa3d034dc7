//! Fiber-local storage.
//!
//! A small fixed-arity slot vector per fiber, keyed by process-wide
//! [`LocalKey`]s. Keys are version-tagged so a deleted key's slot can be
//! reused without old values leaking into the new key. Destructors
//! registered with a key run in reverse insertion order when the fiber
//! terminates, mirroring pthread key semantics.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::sync::{Arc, OnceLock};

/// A value stored in fiber-local storage.
pub type LocalValue = Box<dyn Any + Send + 'static>;

/// Destructor invoked for a live value when its fiber terminates.
pub type KeyDestructor = Arc<dyn Fn(LocalValue) + Send + Sync + 'static>;

/// A process-wide storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalKey {
    index: u32,
    version: u32,
}

struct KeyEntry {
    version: u32,
    live: bool,
    dtor: Option<KeyDestructor>,
}

struct KeyRegistry {
    entries: Vec<KeyEntry>,
    free: Vec<u32>,
}

fn registry() -> &'static Mutex<KeyRegistry> {
    static REGISTRY: OnceLock<Mutex<KeyRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(KeyRegistry {
            entries: Vec::new(),
            free: Vec::new(),
        })
    })
}

/// Registers a new storage key, optionally with a destructor.
pub fn key_create(dtor: Option<KeyDestructor>) -> crate::Result<LocalKey> {
    let mut reg = registry().lock();
    if let Some(index) = reg.free.pop() {
        let entry = &mut reg.entries[index as usize];
        entry.live = true;
        entry.dtor = dtor;
        Ok(LocalKey {
            index,
            version: entry.version,
        })
    } else {
        let index = u32::try_from(reg.entries.len())
            .map_err(|_| crate::Error::new(crate::ErrorKind::ResourceExhausted))?;
        reg.entries.push(KeyEntry {
            version: 0,
            live: true,
            dtor,
        });
        Ok(LocalKey { index, version: 0 })
    }
}

/// Deletes a key. Existing values become unreachable; their destructors do
/// not run (matching pthread_key_delete).
pub fn key_delete(key: LocalKey) {
    let mut reg = registry().lock();
    let Some(entry) = reg.entries.get_mut(key.index as usize) else {
        return;
    };
    if entry.live && entry.version == key.version {
        entry.live = false;
        entry.dtor = None;
        entry.version = entry.version.wrapping_add(1);
        reg.free.push(key.index);
    }
}

fn destructor_for(key: LocalKey) -> Option<KeyDestructor> {
    let reg = registry().lock();
    let entry = reg.entries.get(key.index as usize)?;
    (entry.live && entry.version == key.version)
        .then(|| entry.dtor.clone())
        .flatten()
}

struct StorageEntry {
    key: LocalKey,
    value: Option<LocalValue>,
}

impl std::fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalStorage({} slots)", self.slots.len())
    }
}

/// Per-fiber slot vector. Slots allocate lazily on first set.
#[derive(Default)]
pub(crate) struct LocalStorage {
    slots: SmallVec<[StorageEntry; 4]>,
}

impl LocalStorage {
    /// Stores a value under `key`, returning the previous value if any.
    pub(crate) fn set(&mut self, key: LocalKey, value: LocalValue) -> Option<LocalValue> {
        for entry in &mut self.slots {
            if entry.key == key {
                return entry.value.replace(value);
            }
        }
        self.slots.push(StorageEntry {
            key,
            value: Some(value),
        });
        None
    }

    /// Removes and returns the value under `key`.
    pub(crate) fn take(&mut self, key: LocalKey) -> Option<LocalValue> {
        self.slots
            .iter_mut()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.take())
    }

    /// Borrows the value under `key`.
    pub(crate) fn get(&self, key: LocalKey) -> Option<&LocalValue> {
        self.slots
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Runs key destructors over all live values, in reverse insertion
    /// order, consuming the storage. Called on the terminating fiber's own
    /// stack, before its entity is recycled.
    pub(crate) fn run_destructors(mut self) {
        while let Some(entry) = self.slots.pop() {
            if let Some(value) = entry.value {
                if let Some(dtor) = destructor_for(entry.key) {
                    dtor(value);
                }
            }
        }
    }
}

/// Stores `value` in the current fiber's storage, returning the previous
/// value under `key`. Fails when called outside a fiber.
pub fn set_local(key: LocalKey, value: LocalValue) -> crate::Result<Option<LocalValue>> {
    with_current_storage(|storage| storage.set(key, value))
}

/// Removes and returns the current fiber's value under `key`.
pub fn take_local(key: LocalKey) -> crate::Result<Option<LocalValue>> {
    with_current_storage(|storage| storage.take(key))
}

/// Runs `f` over the current fiber's value under `key`.
pub fn with_local<R>(key: LocalKey, f: impl FnOnce(Option<&LocalValue>) -> R) -> crate::Result<R> {
    with_current_storage(|storage| f(storage.get(key)))
}

fn with_current_storage<R>(f: impl FnOnce(&mut LocalStorage) -> R) -> crate::Result<R> {
    let (group, id) = crate::sched::worker::current_fiber_context()
        .ok_or(crate::ErrorKind::Internal)
        .map_err(|kind| {
            crate::Error::with_context(kind, "fiber-local storage outside a fiber")
        })?;
    let slot = group.slot_by_index(id.slot());
    let mut inner = slot.inner.lock();
    Ok(f(&mut inner.storage))
}
