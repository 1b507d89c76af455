//! # TickOS
//!
//! A small preemptive, tick-driven RTOS kernel for single-core ARM
//! Cortex-M3 microcontrollers (developed on the NXP LPC1768).
//!
//! ## Overview
//!
//! A fixed table of tasks shares one CPU. Every SysTick interrupt ages
//! each task's `timeout`; when a countdown runs out the task flips
//! between `Active` (runnable) and `Waiting` (sleeping or out of quantum)
//! and the scheduler picks again. Selection favours the `Active` task
//! closest to the end of its countdown, so short periods behave like
//! near deadlines. An idle task runs when nothing else can.
//!
//! Tasks give up the CPU through traps: `yield_now`, `sleep` and, when a
//! mutex they declared is taken, blocking inside `acquire_mutexes`.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                 │
//! │  init · create_task · create_mutex · start · yield_now │
//! │  sleep · acquire_mutexes · release_mutexes · now       │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Scheduler   │  System Calls    │  Mutexes             │
//! │  scheduler.rs│  syscall.rs      │  mutex.rs            │
//! │  ─ tick()    │  ─ handle_trap() │  ─ acquire_mutexes() │
//! │  ─ schedule()│  ─ svc_number()  │  ─ release_mutexes() │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │      Task Model (task.rs) · Saved Context (context.rs) │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m3.rs)               │
//! │         SVCall · SysTick · PendSV · priorities         │
//! ├────────────────────────────────────────────────────────┤
//! │           ARM Cortex-M3 Hardware (Thumb-2)             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the port layer is plain data and runs under
//! `cargo test` on the host. The port, the global kernel instance and the
//! critical section only exist when building for the target.
//!
//! ## Memory Model
//!
//! - **No heap**: all state is statically allocated
//! - **Fixed tables**: `MAX_TASKS` user tasks plus idle, `MAX_MUTEXES`
//!   mutexes in a `heapless::Vec`, wait queues in `heapless::Deque`
//! - **Stacks**: carved from the top of RAM below the main stack, one
//!   `THREAD_STACK_SIZE` slot per task
//!
//! ## Logging
//!
//! With the `defmt` feature the kernel logs task creation, start, and
//! scheduling decisions through `defmt`. Without it the log macros
//! compile to nothing.

#![cfg_attr(not(test), no_std)]

// Must come first: defines the log macros used by every other module
mod fmt;

pub mod config;
pub mod context;
pub mod error;
pub mod mutex;
pub mod scheduler;
pub mod syscall;
pub mod task;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod arch;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod kernel;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod sync;

pub use error::KernelError;
pub use mutex::{MutexId, MutexMask};
pub use scheduler::Scheduler;
pub use task::{TaskEntry, TaskId, TaskState};
