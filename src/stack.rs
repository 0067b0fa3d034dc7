//! Guard-paged, size-classed fiber stacks.
//!
//! Stacks are acquired from a per-group pool, falling back to a process-wide
//! pool, falling back to a fresh anonymous mapping with `PROT_NONE` guard
//! pages at both ends. A released stack goes back to its pool for reuse; the
//! scheduler guarantees it is only released after the final context switch
//! away from it, so at most one fiber's frames ever live on a stack at once.

#![allow(unsafe_code)]

use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

/// Size class of a fiber stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackClass {
    /// The OS thread's own stack, borrowed. Never allocated or pooled.
    Main,
    /// A few tens of KiB. The default for ordinary fibers.
    Small,
    /// Hundreds of KiB, for handlers with deeper call trees.
    Normal,
    /// Multi-MiB, for recursion-heavy work.
    Large,
}

impl StackClass {
    pub(crate) fn pool_index(self) -> Option<usize> {
        match self {
            Self::Main => None,
            Self::Small => Some(0),
            Self::Normal => Some(1),
            Self::Large => Some(2),
        }
    }
}

/// Returns the system page size.
#[must_use]
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                // SAFETY: sysconf with a valid name has no preconditions.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).unwrap_or(4096)
            } else {
                4096
            }
        }
    })
}

/// An owned stack mapping.
///
/// `base`/`len` cover the whole mapping including guard pages; `top()` is
/// the one-past-the-end address of the usable region, which is what a fresh
/// context is seeded from.
#[derive(Debug)]
pub(crate) struct Stack {
    base: *mut u8,
    len: usize,
    guard: usize,
    class: StackClass,
}

// SAFETY: the mapping is plain memory; ownership transfers with the value.
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a fresh stack of `usable` bytes (rounded up to whole pages),
    /// with one guard page at each end when `guard_pages` is set.
    pub(crate) fn allocate(class: StackClass, usable: usize, guard_pages: bool) -> Result<Self> {
        let page = page_size();
        let usable = usable.div_ceil(page) * page;
        let guard = if guard_pages { page } else { 0 };
        let len = usable + 2 * guard;
        let base = map_stack(len)?;
        if guard > 0 {
            protect_guards(base, len, guard)?;
        }
        Ok(Self {
            base,
            len,
            guard,
            class,
        })
    }

    /// One-past-the-end address of the usable region.
    pub(crate) fn top(&self) -> *mut u8 {
        // SAFETY: base..base+len is a live mapping; the result stays inside.
        unsafe { self.base.add(self.len - self.guard) }
    }

    pub(crate) fn class(&self) -> StackClass {
        self.class
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unmap_stack(self.base, self.len);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn map_stack(len: usize) -> Result<*mut u8> {
            // SAFETY: anonymous private mapping with no address hint.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(Error::with_context(
                    ErrorKind::ResourceExhausted,
                    format!("mmap of {len}-byte stack failed"),
                ));
            }
            Ok(base.cast())
        }

        fn protect_guards(base: *mut u8, len: usize, guard: usize) -> Result<()> {
            // SAFETY: both ranges lie inside the mapping created above.
            let rc = unsafe {
                libc::mprotect(base.cast(), guard, libc::PROT_NONE)
                    | libc::mprotect(base.add(len - guard).cast(), guard, libc::PROT_NONE)
            };
            if rc != 0 {
                unmap_stack(base, len);
                return Err(Error::with_context(
                    ErrorKind::ResourceExhausted,
                    "mprotect of stack guard pages failed",
                ));
            }
            Ok(())
        }

        fn unmap_stack(base: *mut u8, len: usize) {
            // SAFETY: base/len describe a mapping we own.
            unsafe {
                libc::munmap(base.cast(), len);
            }
        }
    } else {
        fn map_stack(len: usize) -> Result<*mut u8> {
            let layout = std::alloc::Layout::from_size_align(len, 16)
                .map_err(|_| Error::new(ErrorKind::ResourceExhausted))?;
            // SAFETY: layout is non-zero-sized.
            let base = unsafe { std::alloc::alloc(layout) };
            if base.is_null() {
                return Err(Error::new(ErrorKind::ResourceExhausted));
            }
            Ok(base)
        }

        fn protect_guards(_base: *mut u8, _len: usize, _guard: usize) -> Result<()> {
            // No page protection without mmap; guard bytes are dead weight.
            Ok(())
        }

        fn unmap_stack(base: *mut u8, len: usize) {
            let layout = std::alloc::Layout::from_size_align(len, 16).expect("valid stack layout");
            // SAFETY: allocated with the same layout in map_stack.
            unsafe {
                std::alloc::dealloc(base, layout);
            }
        }
    }
}

/// Size-classed stack pool.
///
/// Each scheduling group owns one; misses fall through to the process-wide
/// pool before mapping fresh memory.
#[derive(Debug)]
pub(crate) struct StackPool {
    sizes: [usize; 3],
    guard_pages: bool,
    capacity: usize,
    pools: [Mutex<Vec<Stack>>; 3],
}

fn global_pool() -> &'static [Mutex<Vec<Stack>>; 3] {
    static GLOBAL: OnceLock<[Mutex<Vec<Stack>>; 3]> = OnceLock::new();
    GLOBAL.get_or_init(|| [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())])
}

impl StackPool {
    pub(crate) fn new(
        small: usize,
        normal: usize,
        large: usize,
        guard_pages: bool,
        capacity: usize,
    ) -> Self {
        Self {
            sizes: [small, normal, large],
            guard_pages,
            capacity,
            pools: [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())],
        }
    }

    /// Acquires a stack of the given class: group pool, then process pool,
    /// then a fresh mapping.
    pub(crate) fn acquire(&self, class: StackClass) -> Result<Stack> {
        let Some(index) = class.pool_index() else {
            return Err(Error::with_context(
                ErrorKind::Internal,
                "main-class stacks are borrowed, not allocated",
            ));
        };
        if let Some(stack) = self.pools[index].lock().pop() {
            return Ok(stack);
        }
        if let Some(stack) = global_pool()[index].lock().pop() {
            return Ok(stack);
        }
        Stack::allocate(class, self.sizes[index], self.guard_pages).map_err(|err| {
            warn!(class = ?class, "stack allocation failed: {err}");
            err
        })
    }

    /// Returns a stack to the pool, spilling to the process pool when this
    /// group's pool is at capacity. Beyond both caps the mapping is freed.
    pub(crate) fn release(&self, stack: Stack) {
        let Some(index) = stack.class().pool_index() else {
            return;
        };
        {
            let mut pool = self.pools[index].lock();
            if pool.len() < self.capacity {
                pool.push(stack);
                return;
            }
        }
        let mut global = global_pool()[index].lock();
        if global.len() < self.capacity {
            global.push(stack);
        }
        // else: dropped, unmapping the stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_round_trip() {
        let pool = StackPool::new(16 * 1024, 64 * 1024, 256 * 1024, true, 4);
        let stack = pool.acquire(StackClass::Small).expect("acquire");
        let top = stack.top() as usize;
        assert_eq!(top % page_size(), 0);
        pool.release(stack);
        // Reacquire should come from the pool, not a fresh mapping.
        let again = pool.acquire(StackClass::Small).expect("reacquire");
        assert_eq!(again.top() as usize, top);
    }

    #[test]
    fn main_class_is_never_allocated() {
        let pool = StackPool::new(16 * 1024, 64 * 1024, 256 * 1024, false, 4);
        assert!(pool.acquire(StackClass::Main).is_err());
    }

    #[test]
    fn stack_is_writable_below_top() {
        let stack = Stack::allocate(StackClass::Small, 32 * 1024, true).expect("allocate");
        // SAFETY: inside the usable region.
        unsafe {
            let p = stack.top().sub(64);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }
}
