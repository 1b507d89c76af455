//! # Saved Execution Context
//!
//! Layout of a suspended task's registers on its own stack, and the code
//! that fabricates that layout for a task that has never run.
//!
//! On exception entry an ARMv7-M core stacks R0–R3, R12, LR, PC and xPSR
//! on the process stack. The context switch handler then pushes R4–R11
//! below that. A suspended task's saved stack pointer therefore points at
//! its R4 slot:
//!
//! ```text
//! high address  xPSR   (T bit set)      ┐
//!               PC     (entry point)    │
//!               LR                      │ HardwareFrame, stacked by the core
//!               R12                     │
//!               R3 R2 R1                │
//!               R0     (task argument)  ┘
//!               R11 ... R4              ] CalleeSaved, pushed by PendSV
//! low address   <- saved stack pointer
//! ```

use core::ffi::c_void;
use core::mem::size_of;

use crate::config::{MAIN_STACK_SIZE, MAX_TASKS, THREAD_STACK_SIZE};
use crate::task::TaskEntry;

/// xPSR with only the Thumb (T) bit set. A clear T bit faults on the
/// first instruction of the task.
pub const INITIAL_XPSR: u32 = 1 << 24;

/// Registers the core stacks on exception entry, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Registers the context switch handler saves by hand.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeSaved {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
}

/// Everything a suspended task has on its stack, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedContext {
    pub callee: CalleeSaved,
    pub hardware: HardwareFrame,
}

/// Words in the frame stacked by the core on exception entry.
pub const HARDWARE_FRAME_WORDS: usize = size_of::<HardwareFrame>() / 4;

/// Words in a complete saved context.
pub const CONTEXT_WORDS: usize = size_of::<SavedContext>() / 4;

const _: () = assert!(HARDWARE_FRAME_WORDS == 8);
const _: () = assert!(CONTEXT_WORDS == 16);

/// Where the running task's context will end up once the switch handler
/// has pushed R4–R11, given the live process stack pointer inside an
/// exception handler.
///
/// Both the tick handler and the trap dispatcher record this value, so a
/// task suspended by either resumes through the same path.
#[inline]
pub fn save_point(live_sp: *mut u32) -> *mut u32 {
    live_sp.wrapping_sub(HARDWARE_FRAME_WORDS)
}

/// A helper for pushing words onto a full-descending stack.
pub(crate) struct StackPusher(*mut u32);

impl StackPusher {
    /// Start pushing just below `stack_top`.
    ///
    /// # Safety
    ///
    /// There must be writable space below `stack_top` for every word that
    /// will be pushed.
    pub(crate) unsafe fn new(stack_top: *mut u32) -> StackPusher {
        StackPusher(stack_top)
    }

    /// Push one word.
    pub(crate) fn push(&mut self, value: u32) {
        // SAFETY: the caller of `new` promised room for this word
        unsafe {
            self.0 = self.0.offset(-1);
            self.0.write_volatile(value);
        }
    }

    /// The address of the last word pushed.
    pub(crate) fn current(&self) -> *mut u32 {
        self.0
    }
}

/// Build the context of a task that has never run and return its initial
/// stack pointer.
///
/// The scratch registers hold their own register number so a fresh frame
/// is easy to spot in a debugger. R0 carries `arg`.
///
/// # Safety
///
/// `stack_top` must be 8-byte aligned with at least [`CONTEXT_WORDS`]
/// writable words below it, and nothing else may be using that memory.
pub unsafe fn build_initial_frame(
    stack_top: *mut u32,
    entry: TaskEntry,
    arg: *mut c_void,
) -> *mut u32 {
    // SAFETY: forwarded from our caller
    let mut stack = unsafe { StackPusher::new(stack_top) };

    stack.push(INITIAL_XPSR);
    // Exception return wants a halfword-aligned PC, without the Thumb bit
    stack.push(entry as usize as u32 & !1);
    stack.push(0xE); // LR
    stack.push(0xC); // R12
    stack.push(0x3);
    stack.push(0x2);
    stack.push(0x1);
    stack.push(arg as usize as u32); // R0

    for reg in (4..=11).rev() {
        stack.push(reg);
    }

    stack.current()
}

/// The memory below the main stack from which task stacks are carved.
///
/// Slot `n` owns the `THREAD_STACK_SIZE` bytes ending
/// `MAIN_STACK_SIZE + n * THREAD_STACK_SIZE` bytes below `top`, so slots
/// never overlap each other or the main stack. The idle task uses slot
/// `MAX_TASKS`.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    top: usize,
}

impl StackRegion {
    /// Bytes needed below `top` for the main stack and every task slot.
    pub const REQUIRED_SIZE: usize = MAIN_STACK_SIZE + (MAX_TASKS + 1) * THREAD_STACK_SIZE;

    /// Describe a region ending at `top`.
    ///
    /// # Safety
    ///
    /// The `REQUIRED_SIZE` bytes below `top` must be valid for writes and
    /// reserved for the kernel for as long as it runs. The top
    /// `MAIN_STACK_SIZE` bytes are left alone.
    pub const unsafe fn new(top: usize) -> StackRegion {
        StackRegion { top }
    }

    /// Top of the stack belonging to `slot`, rounded down to 8 bytes as
    /// AAPCS requires.
    pub fn slot_top(&self, slot: usize) -> *mut u32 {
        let top = self.top - MAIN_STACK_SIZE - slot * THREAD_STACK_SIZE;
        (top & !0x7) as *mut u32
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
