//! # System Calls
//!
//! Tasks enter the kernel with `svc #n`. The port's SVCall handler hands
//! the call number and the stacked frame to [`Scheduler::handle_trap`],
//! which updates the caller's state, saves its context point and picks
//! the next task.

use crate::context;
use crate::error::KernelError;
use crate::scheduler::Scheduler;
use crate::task::TaskState;

/// Service numbers encoded in the `svc` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SvcCall {
    /// Give up the CPU until the next period: `Waiting`, timeout reloaded.
    Yield = 0,
    /// Give up the CPU for the timeout set by [`Scheduler::prepare_sleep`].
    Sleep = 1,
    /// Give up the CPU while blocked on a mutex. State is left as is.
    Block = 2,
}

impl SvcCall {
    /// Decode a service number. Unknown numbers are reserved.
    pub const fn from_number(number: u8) -> Option<SvcCall> {
        match number {
            0 => Some(SvcCall::Yield),
            1 => Some(SvcCall::Sleep),
            2 => Some(SvcCall::Block),
            _ => None,
        }
    }
}

/// Read the service number out of the `svc` instruction that trapped.
///
/// `return_address` is the PC from the stacked exception frame, which
/// points just past the instruction. Thumb `svc #imm8` is the halfword
/// `0xDF00 | imm8`, stored little-endian, so the number is the byte two
/// before the return address.
///
/// # Safety
///
/// `return_address` must be the stacked PC of an SVCall exception.
pub unsafe fn svc_number(return_address: *const u8) -> u8 {
    // SAFETY: the byte belongs to the svc instruction that just executed
    unsafe { return_address.sub(2).read() }
}

impl Scheduler {
    /// Put the running task to sleep for `ticks` ticks. The caller traps
    /// with [`SvcCall::Sleep`] straight after. The sleep starts counting
    /// here, so a tick that preempts the caller before its trap does not
    /// stretch it.
    ///
    /// A zero-tick sleep sleeps for one tick.
    pub fn prepare_sleep(&mut self, ticks: u32) -> Result<(), KernelError> {
        let task = self.current_user_task()?;
        let tcb = &mut self.tasks[task.index()];
        tcb.timeout = ticks.max(1);
        tcb.state = TaskState::Waiting;
        Ok(())
    }

    /// Trap dispatcher. `frame_sp` is the process stack pointer with the
    /// hardware frame already stacked.
    ///
    /// Returns `true` when the port should pend a context switch. Unknown
    /// call numbers are ignored and return `false`.
    pub fn handle_trap(&mut self, number: u8, frame_sp: *mut u32) -> bool {
        let Some(call) = SvcCall::from_number(number) else {
            trace!("ignored svc #{=u8}", number);
            return false;
        };

        self.dispatching = true;

        // The very first trap, from kernel start, has no task to save
        if let Some(running) = self.running {
            let tcb = &mut self.tasks[running.index()];
            match call {
                SvcCall::Yield => {
                    tcb.state = TaskState::Waiting;
                    tcb.timeout = tcb.period;
                }
                // `prepare_sleep` already set state and timeout. A task
                // that is no longer `Waiting` was preempted before the
                // trap and has slept its time out already.
                SvcCall::Sleep => {}
                SvcCall::Block => {}
            }
            tcb.stack_pointer = context::save_point(frame_sp);
        }

        let next = self.schedule();
        trace!("svc {}: switch to {}", call, next);

        self.deferred_switch = false;
        self.dispatching = false;
        true
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
