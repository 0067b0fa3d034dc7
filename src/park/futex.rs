//! Raw 32-bit wait/wake over a futex-like word.
//!
//! `wait` atomically checks `*addr == expected` and, if so, suspends the
//! calling thread until a `wake` on the same address or the deadline passes.
//! If the value differs at the call site, it returns
//! [`WaitOutcome::Mismatch`] immediately. Spurious wakeups are permitted;
//! callers loop on their own predicate.
//!
//! On Linux the implementation is `FUTEX_WAIT_PRIVATE` / `FUTEX_WAKE_PRIVATE`.
//! On other platforms a fixed table of mutex/condvar buckets hashed by word
//! address emulates the same contract: the waiter is published under the
//! bucket lock before the value re-check, so a store+wake sequenced after
//! the check cannot be lost.

#![allow(unsafe_code)]

use crate::clock::TimePoint;
use std::sync::atomic::AtomicU32;

/// Result of a [`wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A wake arrived (or the wakeup was spurious).
    Woke,
    /// The deadline passed before a wake arrived.
    TimedOut,
    /// `*addr != expected` at the call site.
    Mismatch,
}

/// Blocks the calling thread while `*addr == expected`, until woken or the
/// deadline passes.
pub fn wait(addr: &AtomicU32, expected: u32, deadline: Option<TimePoint>) -> WaitOutcome {
    imp::wait(addr, expected, deadline)
}

/// Wakes up to `max_wakers` threads blocked in [`wait`] on `addr`.
///
/// Returns the number of threads actually woken (Linux only; the portable
/// fallback returns `max_wakers` capped by the bucket's waiter count).
pub fn wake(addr: &AtomicU32, max_wakers: u32) -> usize {
    imp::wake(addr, max_wakers)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod imp {
            use super::WaitOutcome;
            use crate::clock::{self, TimePoint};
            use std::sync::atomic::{AtomicU32, Ordering};

            pub fn wait(
                addr: &AtomicU32,
                expected: u32,
                deadline: Option<TimePoint>,
            ) -> WaitOutcome {
                if addr.load(Ordering::Acquire) != expected {
                    return WaitOutcome::Mismatch;
                }
                let timespec = deadline.map(|d| {
                    let remaining = d.saturating_duration_since(clock::now());
                    libc::timespec {
                        tv_sec: remaining.as_secs() as libc::time_t,
                        tv_nsec: libc::c_long::from(remaining.subsec_nanos()),
                    }
                });
                let timespec_ptr = timespec
                    .as_ref()
                    .map_or(std::ptr::null(), std::ptr::from_ref);
                // SAFETY: addr points at a live AtomicU32 for the duration of
                // the call; FUTEX_WAIT_PRIVATE only reads the word.
                let rc = unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        addr.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        libc::c_uint::from(expected),
                        timespec_ptr,
                    )
                };
                if rc == 0 {
                    return WaitOutcome::Woke;
                }
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::ETIMEDOUT) => WaitOutcome::TimedOut,
                    Some(libc::EAGAIN) => WaitOutcome::Mismatch,
                    // EINTR and anything unexpected count as spurious wakes.
                    _ => WaitOutcome::Woke,
                }
            }

            pub fn wake(addr: &AtomicU32, max_wakers: u32) -> usize {
                // SAFETY: addr points at a live AtomicU32; FUTEX_WAKE_PRIVATE
                // does not dereference beyond the word.
                let rc = unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        addr.as_ptr(),
                        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                        max_wakers,
                    )
                };
                usize::try_from(rc).unwrap_or(0)
            }
        }
    } else {
        mod imp {
            use super::WaitOutcome;
            use crate::clock::{self, TimePoint};
            use std::sync::atomic::{AtomicU32, Ordering};
            use std::sync::{Condvar, Mutex};

            const BUCKETS: usize = 64;

            struct Bucket {
                lock: Mutex<()>,
                cond: Condvar,
            }

            fn bucket(addr: &AtomicU32) -> &'static Bucket {
                use std::sync::OnceLock;
                static TABLE: OnceLock<Vec<Bucket>> = OnceLock::new();
                let table = TABLE.get_or_init(|| {
                    (0..BUCKETS)
                        .map(|_| Bucket {
                            lock: Mutex::new(()),
                            cond: Condvar::new(),
                        })
                        .collect()
                });
                let hash = std::ptr::from_ref(addr) as usize >> 4;
                &table[hash % BUCKETS]
            }

            pub fn wait(
                addr: &AtomicU32,
                expected: u32,
                deadline: Option<TimePoint>,
            ) -> WaitOutcome {
                let bucket = bucket(addr);
                let guard = bucket.lock.lock().expect("futex bucket poisoned");
                // The waiter holds the bucket lock across this re-check, and
                // wake broadcasts under the same lock, so a store+wake after
                // the check cannot be lost.
                if addr.load(Ordering::Acquire) != expected {
                    return WaitOutcome::Mismatch;
                }
                match deadline {
                    None => {
                        let _unused = bucket.cond.wait(guard).expect("futex bucket poisoned");
                        WaitOutcome::Woke
                    }
                    Some(d) => {
                        let remaining = d.saturating_duration_since(clock::now());
                        let (_guard, result) = bucket
                            .cond
                            .wait_timeout(guard, remaining)
                            .expect("futex bucket poisoned");
                        if result.timed_out() {
                            WaitOutcome::TimedOut
                        } else {
                            WaitOutcome::Woke
                        }
                    }
                }
            }

            pub fn wake(addr: &AtomicU32, max_wakers: u32) -> usize {
                let bucket = bucket(addr);
                let _guard = bucket.lock.lock().expect("futex bucket poisoned");
                // Buckets are shared between addresses, so a targeted wake is
                // not possible; broadcast and let waiters re-check.
                bucket.cond.notify_all();
                max_wakers as usize
            }
        }
    }
}
