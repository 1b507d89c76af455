//! # Cortex-M3 Port Layer
//!
//! Exception handlers and register access for ARMv7-M.
//!
//! ## Exceptions
//!
//! | Exception | Priority | Job |
//! |-----------|----------|-----|
//! | SVCall    | 0xFD     | trap dispatcher: `yield`, `sleep`, `block` |
//! | SysTick   | 0xFE     | tick state machine |
//! | PendSV    | 0xFF     | context switch |
//!
//! SVCall and SysTick only decide. Both end by pending PendSV, which at
//! the lowest priority runs after them and swaps the process stack.
//! Tasks run in Thread mode on PSP; handlers run on MSP.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::SYSTICK_RELOAD;
use crate::context::{HardwareFrame, StackRegion};
use crate::kernel;
use crate::syscall::{self, SvcCall};

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Order the three kernel exceptions: trap above tick above switch.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: the kernel is not running yet, so no priority-based
    // critical section can be broken
    unsafe {
        scb.set_priority(SystemHandler::SVCall, 0xFD);
        scb.set_priority(SystemHandler::SysTick, 0xFE);
        scb.set_priority(SystemHandler::PendSV, 0xFF);
    }
}

/// Start SysTick at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    syst.set_reload(SYSTICK_RELOAD);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// The RAM below the initial main stack pointer.
pub fn stack_region() -> StackRegion {
    extern "C" {
        // Initial MSP, from the linker script
        static _stack_start: u32;
    }
    // SAFETY: we only take the address
    let top = unsafe { core::ptr::addr_of!(_stack_start) } as usize;
    // SAFETY: memory.x leaves the top of RAM to the stacks
    unsafe { StackRegion::new(top) }
}

/// Point PSP at the idle task's saved context.
///
/// # Safety
///
/// Must run in Thread mode on MSP, before [`start_first_task`].
pub unsafe fn set_process_stack(sp: *mut u32) {
    unsafe { asm!("msr psp, {}", in(reg) sp, options(nomem, nostack)) };
}

/// Switch Thread mode onto PSP and trap into the first context switch.
///
/// Whatever runs here afterwards is on the idle task's stack below its
/// saved context, and is never resumed.
///
/// # Safety
///
/// PSP must already hold the idle task's stack pointer and the kernel
/// must be started.
pub unsafe fn start_first_task() -> ! {
    unsafe {
        asm!(
            "movs {tmp}, #2",
            "msr control, {tmp}",
            "isb",
            "svc #{yield_call}",
            "1:",
            "b 1b",
            tmp = out(reg) _,
            yield_call = const SvcCall::Yield as u8,
            options(noreturn),
        )
    }
}

// ---------------------------------------------------------------------------
// Traps and switch requests
// ---------------------------------------------------------------------------

/// Enter the kernel with `call`. Must not be used with interrupts masked.
#[inline(always)]
pub fn trap(call: SvcCall) {
    // SAFETY: the SVCall handler only touches kernel state
    unsafe {
        match call {
            SvcCall::Yield => asm!("svc #{n}", n = const SvcCall::Yield as u8),
            SvcCall::Sleep => asm!("svc #{n}", n = const SvcCall::Sleep as u8),
            SvcCall::Block => asm!("svc #{n}", n = const SvcCall::Block as u8),
        }
    }
}

/// Pend PendSV so the switch happens once every higher-priority handler
/// has returned.
#[inline]
pub fn pend_context_switch() {
    SCB::set_pendsv();
    cortex_m::asm::isb();
}

/// Sleep until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// SysTick exception handler. Runs the tick state machine.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let psp = cortex_m::register::psp::read() as usize as *mut u32;
    // SAFETY: SysTick cannot preempt SVCall and PendSV runs with
    // interrupts masked, so nothing else holds the kernel
    let scheduler = unsafe { kernel::scheduler() };
    let switch = scheduler.tick(psp);
    kernel::publish_now(scheduler.now());
    if switch {
        pend_context_switch();
    }
}

/// SVCall exception handler. Finds the stacked frame and hands it to
/// [`svc_dispatch`].
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "tst lr, #4",
        "ite eq",
        "mrseq r0, msp",
        "mrsne r0, psp",
        "b {dispatch}",
        dispatch = sym svc_dispatch,
    );
}

unsafe extern "C" fn svc_dispatch(frame: *mut u32) {
    // SAFETY: `frame` is the frame the core stacked for this exception
    let pc = unsafe { (*(frame as *const HardwareFrame)).pc };
    let number = unsafe { syscall::svc_number(pc as usize as *const u8) };

    // SAFETY: SVCall is the highest kernel priority
    let scheduler = unsafe { kernel::scheduler() };
    if scheduler.handle_trap(number, frame) {
        pend_context_switch();
    }
}

/// PendSV exception handler. Performs the context switch.
///
/// ## Sequence
/// 1. Push R4–R11 onto the outgoing task's stack. This lands exactly at
///    the save point the tick handler or dispatcher recorded
/// 2. Ask the kernel for the incoming task's saved stack pointer
/// 3. Pop R4–R11 from it and install it as PSP
/// 4. Return to Thread mode on PSP; the core unstacks the rest
///
/// Interrupts are masked across the swap so a tick never sees a
/// half-switched PSP.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "cpsid i",
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {target}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "cpsie i",
        // EXC_RETURN: Thread mode, process stack
        "mvn lr, #2",
        "bx lr",
        target = sym switch_target,
    );
}

extern "C" fn switch_target() -> *mut u32 {
    // SAFETY: called from PendSV with interrupts masked
    unsafe { kernel::scheduler() }.switch_target()
}
