//! Machine context switching for fibers.
//!
//! A fiber's entire saved state is its stack: the switch pushes the
//! callee-saved registers onto the current stack, stores the stack pointer
//! into the outgoing [`SavedContext`], loads the incoming context's stack
//! pointer, pops the callee-saved registers, and returns. Everything else a
//! fiber owns lives in memory it can reach from its stack.
//!
//! The per-architecture implementations live in [`x86_64`] and [`aarch64`]
//! as `global_asm!` routines exporting `melon_fiber_swap_context`. A fresh
//! context is a fabricated frame whose return address is the worker's
//! trampoline; the first switch into it "returns" into the trampoline on the
//! new stack.
//!
//! # Safety discipline
//!
//! `swap_context` is only ever called by the worker that holds the RUNNING
//! transition for the fiber involved, or by that fiber itself. A
//! [`ContextCell`] is therefore accessed by exactly one thread at a time
//! even though it is shared through `Arc`ed task slots.

#![allow(unsafe_code)]

use core::cell::UnsafeCell;
use core::fmt;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use x86_64 as arch;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64 as arch;
    } else {
        compile_error!("unsupported architecture: fiber context switching needs x86_64 or aarch64");
    }
}

/// Saved register context of a suspended fiber.
///
/// Only the stack pointer is stored here; the callee-saved registers live in
/// the frame `swap_context` builds on the fiber's own stack.
#[repr(C)]
#[derive(Debug)]
pub struct SavedContext {
    sp: *mut u8,
}

impl SavedContext {
    /// A context that has never been switched into or out of.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            sp: std::ptr::null_mut(),
        }
    }
}

/// The trampoline signature a fresh context returns into.
pub type EntryPoint = extern "C" fn() -> !;

/// Fabricates a context that, when first switched into, enters `entry` on
/// the stack whose (exclusive) top is `stack_top`.
///
/// `stack_top` must be the one-past-the-end address of a live stack mapping
/// with at least one page of usable space below it.
pub(crate) fn fresh_context(stack_top: *mut u8, entry: EntryPoint) -> SavedContext {
    let sp = arch::seed_frame(stack_top, entry as usize);
    SavedContext { sp }
}

/// Switches from the context behind `from` to the context behind `to`.
///
/// Returns when something later switches back into `from`. Never returns if
/// the outgoing fiber terminates instead of suspending.
///
/// # Safety
///
/// - `from` and `to` must point at live, distinct `SavedContext` values.
/// - `to` must hold a stack pointer produced by [`fresh_context`] or by a
///   previous `swap_context` save, on a stack that is still mapped.
/// - The caller must be the sole thread touching either context.
pub(crate) unsafe fn swap_context(from: *mut SavedContext, to: *const SavedContext) {
    // SAFETY: forwarded to the caller.
    unsafe {
        melon_fiber_swap_context(from, to);
    }
}

extern "C" {
    fn melon_fiber_swap_context(from: *mut SavedContext, to: *const SavedContext);
}

/// Shared cell holding a [`SavedContext`] inside a task slot.
///
/// The scheduler's state machine guarantees single-threaded access: the cell
/// is written only by the fiber itself (saving, on suspend) and by the
/// worker that owns the fiber's RUNNING transition (restoring).
pub(crate) struct ContextCell(UnsafeCell<SavedContext>);

// SAFETY: access is serialized by the task state machine; see type docs.
unsafe impl Send for ContextCell {}
// SAFETY: as above.
unsafe impl Sync for ContextCell {}

impl ContextCell {
    pub(crate) const fn empty() -> Self {
        Self(UnsafeCell::new(SavedContext::empty()))
    }

    /// Raw pointer for use in `swap_context` calls.
    pub(crate) fn as_ptr(&self) -> *mut SavedContext {
        self.0.get()
    }

    /// Replaces the stored context. Caller must hold the RUNNING transition.
    pub(crate) fn install(&self, ctx: SavedContext) {
        // SAFETY: serialized by the task state machine.
        unsafe {
            *self.0.get() = ctx;
        }
    }
}

impl fmt::Debug for ContextCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextCell(..)")
    }
}
