//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections for thread-mode access to the kernel.
//! Exception handlers do not need one: SVCall, SysTick and PendSV are
//! serialized by priority and PendSV masks interrupts while it runs.

use cortex_m::interrupt;

/// Run `f` with interrupts disabled, restoring the previous mask on exit.
///
/// Thread-mode kernel calls wrap their scheduler access in this so a tick
/// never sees a half-updated task table.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| unsafe { kernel::scheduler().now() });
/// ```
///
/// Never issue an `svc` inside the closure: a trap taken with interrupts
/// masked escalates to HardFault.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&interrupt::CriticalSection) -> R,
{
    interrupt::free(f)
}
