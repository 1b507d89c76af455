//! # Task Control Block
//!
//! Per-task state for TickOS. The scheduler owns a fixed array of these,
//! one slot per user task plus a hidden slot for the idle task.
//!
//! ## State machine
//!
//! ```text
//!              timeout expires                 acquire_mutexes()
//!   ┌────────┐ ──────────────► ┌─────────┐      finds a held mutex   ┌─────────┐
//!   │ Active │                 │ Waiting │   Active ───────────────► │ Blocked │
//!   └────────┘ ◄────────────── └─────────┘          ◄─────────────── └─────────┘
//!        │     timeout expires      ▲                 ownership handed
//!        └──────────────────────────┘                 over on release
//!             yield() / sleep()
//! ```
//!
//! `Created` marks an unused slot. `Destroyed` is reserved; nothing
//! reaches it yet.

use core::ffi::c_void;
use core::fmt;

use crate::config::{MAX_TASKS, ROUND_ROBIN_QUANTUM, UNINITIALIZED_PERIOD};
use crate::mutex::MutexMask;

/// Task entry point. Receives the opaque argument given at creation and
/// must never return.
pub type TaskEntry = extern "C" fn(*mut c_void) -> !;

/// Index of a task in the kernel's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

impl TaskId {
    /// The idle task, one slot beyond the user tasks.
    pub const IDLE: TaskId = TaskId(MAX_TASKS);

    pub(crate) const fn new(index: usize) -> TaskId {
        TaskId(index)
    }

    /// Slot index in the task table.
    pub const fn index(self) -> usize {
        self.0
    }

    /// Is this the hidden idle task?
    pub const fn is_idle(self) -> bool {
        self.0 == MAX_TASKS
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle() {
            write!(f, "IDLE")
        } else {
            write!(f, "T{:03}", self.0)
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TaskId {
    fn format(&self, fmt: defmt::Formatter) {
        if self.is_idle() {
            defmt::write!(fmt, "IDLE");
        } else {
            defmt::write!(fmt, "T{=usize:03}", self.0);
        }
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    /// Slot not yet holding a task.
    Created,
    /// Runnable. The scheduler may pick it while its timeout is nonzero.
    Active,
    /// Yielded, sleeping, or preempted after a full quantum. Becomes
    /// `Active` again when its timeout expires.
    Waiting,
    /// Queued on at least one mutex. Neither scheduled nor aged.
    Blocked,
    /// Reserved for task termination.
    Destroyed,
}

/// Task Control Block.
///
/// `stack_pointer` is the saved top of the task's private stack whenever
/// the task is not running. It always points at a complete 16-word saved
/// context (see [`crate::context::SavedContext`]).
pub struct TaskControlBlock {
    /// Entry point, written into the initial frame's PC slot.
    pub entry: Option<TaskEntry>,

    /// Current scheduling state.
    pub state: TaskState,

    /// Saved process stack pointer.
    pub stack_pointer: *mut u32,

    /// Ticks left until the next tick-driven state transition.
    pub timeout: u32,

    /// Reload value for `timeout`. Never `UNINITIALIZED_PERIOD` once the
    /// task exists.
    pub period: u32,

    /// Reserved. Always zero.
    pub sleep_timer: u32,

    /// Mutexes this task declares it will use.
    pub mutexes: MutexMask,
}

impl TaskControlBlock {
    /// An unused slot.
    pub const EMPTY: TaskControlBlock = TaskControlBlock {
        entry: None,
        state: TaskState::Created,
        stack_pointer: core::ptr::null_mut(),
        timeout: 0,
        period: UNINITIALIZED_PERIOD,
        sleep_timer: 0,
        mutexes: MutexMask::NONE,
    };

    /// Fill in a freshly allocated slot. The stack frame is built
    /// separately by [`crate::context::build_initial_frame`].
    pub fn init(&mut self, entry: TaskEntry, period: u32, mutexes: MutexMask) {
        self.entry = Some(entry);
        self.mutexes = mutexes;
        self.period = if period == UNINITIALIZED_PERIOD {
            ROUND_ROBIN_QUANTUM
        } else {
            period
        };
        self.timeout = self.period;
        self.sleep_timer = 0;
        self.state = TaskState::Active;
    }

    /// Advance this task by one tick.
    ///
    /// Returns `true` if the task changed state, meaning the running task
    /// may have to be switched out.
    pub fn age(&mut self) -> bool {
        let next = match self.state {
            TaskState::Waiting => TaskState::Active,
            TaskState::Active => TaskState::Waiting,
            TaskState::Created | TaskState::Blocked | TaskState::Destroyed => return false,
        };

        self.timeout = self.timeout.saturating_sub(1);
        if self.timeout != 0 {
            return false;
        }

        self.timeout = self.period;
        self.state = next;
        true
    }

    /// Can the scheduler pick this task?
    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.state == TaskState::Active && self.timeout != 0
    }

    /// Make a blocked task runnable again with a fresh period.
    pub(crate) fn unblock(&mut self) {
        if self.state == TaskState::Blocked {
            self.state = TaskState::Active;
            self.timeout = self.period;
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
