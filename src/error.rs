//! Kernel error type.

use core::fmt;

/// Everything a kernel call can refuse to do.
///
/// Failures are capacity or lifecycle problems the caller can recover from.
/// Corrupted task state is not reported here; it ends in a HardFault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// All `MAX_TASKS` task slots are in use.
    TaskTableFull,
    /// All `MAX_MUTEXES` mutex slots are in use.
    MutexTableFull,
    /// The kernel was started with no user tasks.
    NoTasks,
    /// No stack region has been given to the kernel yet.
    NotInitialized,
    /// Tasks and mutexes can only be created before the kernel starts.
    AlreadyStarted,
    /// The call needs a running user task and there is none.
    NoCurrentTask,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::TaskTableFull => "task table full",
            KernelError::MutexTableFull => "mutex table full",
            KernelError::NoTasks => "no tasks to run",
            KernelError::NotInitialized => "kernel not initialized",
            KernelError::AlreadyStarted => "kernel already started",
            KernelError::NoCurrentTask => "no current task",
        };
        f.write_str(msg)
    }
}
