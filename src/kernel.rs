//! # Kernel
//!
//! The global scheduler instance and the public API tasks and `main` call.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()              ← Claim the stack region
//!         ├─► kernel::create_task()       ← Register tasks (×N)
//!         ├─► kernel::create_mutex()      ← Register mutexes (×M)
//!         └─► kernel::start()             ← No return on success
//!               ├─► Build the idle task, install its stack as PSP
//!               ├─► Set exception priorities, start SysTick
//!               └─► svc #0 ← first switch
//! ```
//!
//! Thread-mode functions here touch the scheduler inside a critical
//! section and issue traps outside it.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::cortex_m3;
use crate::error::KernelError;
use crate::mutex::{Acquisition, MutexId, MutexMask};
use crate::scheduler::Scheduler;
use crate::sync;
use crate::syscall::SvcCall;
use crate::task::{TaskEntry, TaskId};

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

struct KernelCell(UnsafeCell<Scheduler>);

// SAFETY: every access goes through `scheduler`, whose callers hold either
// a critical section or a kernel exception priority
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Scheduler::new()));

/// Copy of the tick counter, readable without borrowing the scheduler.
/// Log timestamps are taken while the scheduler is borrowed.
static NOW: AtomicU32 = AtomicU32::new(0);

/// Borrow the global scheduler.
///
/// # Safety
/// Only one borrow may be live at a time. Call it from thread mode inside
/// [`sync::critical_section`], or from the SVCall, SysTick or PendSV
/// handlers, which never preempt one another while inside the kernel.
pub(crate) unsafe fn scheduler() -> &'static mut Scheduler {
    unsafe { &mut *KERNEL.0.get() }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Initialize the kernel. Must be called once, from `main`, before any
/// task or mutex is created.
pub fn init() {
    let stacks = cortex_m3::stack_region();
    sync::critical_section(|_cs| unsafe { scheduler().init(stacks) });
}

/// Create a round-robin task running `entry(arg)`, which may use the
/// mutexes in `mutexes`.
///
/// # Example
/// ```ignore
/// extern "C" fn worker(_arg: *mut c_void) -> ! {
///     loop { kernel::yield_now(); }
/// }
/// kernel::create_task(worker, core::ptr::null_mut(), MutexMask::NONE)?;
/// ```
pub fn create_task(
    entry: TaskEntry,
    arg: *mut c_void,
    mutexes: MutexMask,
) -> Result<TaskId, KernelError> {
    sync::critical_section(|_cs| unsafe { scheduler().create_task(entry, arg, mutexes) })
}

/// Create a task with its own `period` in ticks. A zero period falls back
/// to the round-robin quantum.
pub fn create_timed_task(
    entry: TaskEntry,
    arg: *mut c_void,
    period: u32,
    mutexes: MutexMask,
) -> Result<TaskId, KernelError> {
    sync::critical_section(|_cs| unsafe {
        scheduler().create_timed_task(entry, arg, period, mutexes)
    })
}

/// Create the next mutex. Ids are handed out in creation order.
pub fn create_mutex() -> Result<MutexId, KernelError> {
    sync::critical_section(|_cs| unsafe { scheduler().create_mutex() })
}

/// Start the kernel.
///
/// On success this never returns: the calling context is abandoned and
/// the scheduler owns the CPU. The returned error explains why the
/// kernel could not start.
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> KernelError {
    let idle_sp = match sync::critical_section(|_cs| unsafe { scheduler().start(idle_task) }) {
        Ok(sp) => sp,
        Err(err) => return err,
    };

    // SAFETY: still in thread mode on MSP, and the idle frame is built.
    // A tick arriving before the trap below switches from the idle stack.
    unsafe { cortex_m3::set_process_stack(idle_sp) };
    cortex_m3::set_interrupt_priorities(&mut core_peripherals.SCB);
    cortex_m3::configure_systick(&mut core_peripherals.SYST);

    // SAFETY: PSP holds the idle stack and the scheduler is started
    unsafe { cortex_m3::start_first_task() }
}

/// Give up the CPU until the running task's next period.
pub fn yield_now() {
    cortex_m3::trap(SvcCall::Yield);
}

/// Block the running task for `ticks` ticks. `sleep(0)` sleeps for one.
pub fn sleep(ticks: u32) {
    let prepared = sync::critical_section(|_cs| unsafe { scheduler().prepare_sleep(ticks) });
    match prepared {
        Ok(()) => cortex_m3::trap(SvcCall::Sleep),
        Err(err) => warn!("sleep: {}", err),
    }
}

/// Take every mutex the running task declared at creation, blocking
/// until all of them are owned.
pub fn acquire_mutexes() -> Result<(), KernelError> {
    let outcome = sync::critical_section(|_cs| unsafe { scheduler().acquire_mutexes() })?;
    if outcome == Acquisition::Blocked {
        // Resumes once the last owner has handed everything over
        cortex_m3::trap(SvcCall::Block);
    }
    Ok(())
}

/// Hand every mutex the running task owns to its first waiter, or free
/// it. Returns how many waiting tasks became runnable. The caller keeps
/// the CPU.
pub fn release_mutexes() -> Result<usize, KernelError> {
    sync::critical_section(|_cs| unsafe { scheduler().release_mutexes() })
}

/// Ticks since the kernel started.
pub fn now() -> u32 {
    NOW.load(Ordering::Relaxed)
}

pub(crate) fn publish_now(ticks: u32) {
    NOW.store(ticks, Ordering::Relaxed);
}

/// The task currently holding the CPU.
pub fn current_task() -> Option<TaskId> {
    sync::critical_section(|_cs| unsafe { scheduler().current_task() })
}

/// Runs when no user task is `Active`.
extern "C" fn idle_task(_arg: *mut c_void) -> ! {
    loop {
        cortex_m3::wait_for_interrupt();
    }
}
