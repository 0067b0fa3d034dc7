//! x86_64 System V context switch.
//!
//! Saves the callee-saved registers (rbx, rbp, r12-r15) on the outgoing
//! stack, swaps stack pointers, restores them from the incoming stack, and
//! returns. The return address slot doubles as the entry point for a fresh
//! context.

#![allow(unsafe_code)]

#[cfg(not(unix))]
compile_error!("the x86_64 context switch assumes the System V calling convention");

macro_rules! define_swap {
    ($symbol:literal) => {
        core::arch::global_asm!(
            concat!(".globl ", $symbol),
            concat!($symbol, ":"),
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    };
}

#[cfg(target_vendor = "apple")]
define_swap!("_melon_fiber_swap_context");
#[cfg(not(target_vendor = "apple"))]
define_swap!("melon_fiber_swap_context");

/// Number of 8-byte slots in a fabricated frame: six callee-saved registers,
/// the return address, and a zeroed frame terminator that keeps unwinders
/// from walking past the trampoline.
const FRAME_SLOTS: usize = 8;

/// Builds the initial frame for a fresh fiber on `stack_top` and returns the
/// stack pointer to store in its context.
///
/// Layout, from the returned pointer upward:
/// `[r15][r14][r13][r12][rbx][rbp][entry][0]`. After the six pops the switch
/// `ret`s into `entry` with `rsp % 16 == 8`, exactly the alignment a SysV
/// function expects at its first instruction.
pub(super) fn seed_frame(stack_top: *mut u8, entry: usize) -> *mut u8 {
    let top = (stack_top as usize) & !15;
    let sp = top - FRAME_SLOTS * 8;
    // SAFETY: the caller guarantees at least a page of usable stack below
    // `stack_top`; the frame is 64 bytes.
    unsafe {
        let frame = sp as *mut usize;
        for slot in 0..6 {
            frame.add(slot).write(0);
        }
        frame.add(6).write(entry);
        frame.add(7).write(0);
    }
    sp as *mut u8
}
