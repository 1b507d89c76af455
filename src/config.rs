//! # TickOS Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time; there is no dynamic allocation.

/// Maximum number of user tasks. The idle task lives in one extra slot
/// beyond this and is never counted.
pub const MAX_TASKS: usize = 3;

/// Maximum number of mutexes. Mutex identity is creation order, and each
/// task declares its usage as a bitmask over these identities.
pub const MAX_MUTEXES: usize = MAX_TASKS;

/// Default period in ticks for a task created without one. A task that
/// never yields is forcibly preempted after this many ticks.
pub const ROUND_ROBIN_QUANTUM: u32 = 10;

/// Period sentinel meaning "not yet assigned". Resolved to
/// [`ROUND_ROBIN_QUANTUM`] during task creation.
pub const UNINITIALIZED_PERIOD: u32 = 0;

/// Initial timeout of the idle task.
pub const IDLE_TIMEOUT: u32 = 1;

/// Core clock frequency in Hz (LPC1768 after PLL setup).
pub const SYSTEM_CLOCK_HZ: u32 = 100_000_000;

/// Kernel tick frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// SysTick reload value producing one interrupt per kernel tick.
pub const SYSTICK_RELOAD: u32 = SYSTEM_CLOCK_HZ / TICK_HZ - 1;

/// Size in bytes of each task's private stack region.
pub const THREAD_STACK_SIZE: usize = 0x200;

/// Size in bytes reserved at the top of RAM for the main (interrupt)
/// stack. Task stacks are carved immediately below it.
pub const MAIN_STACK_SIZE: usize = 0x400;

const _: () = assert!(MAX_MUTEXES <= 32, "mutex masks are 32 bits wide");
const _: () = assert!(THREAD_STACK_SIZE % 8 == 0 && MAIN_STACK_SIZE % 8 == 0);
const _: () = assert!(THREAD_STACK_SIZE >= 16 * 4 * 2);
const _: () = assert!(SYSTICK_RELOAD < (1 << 24), "SysTick is a 24-bit counter");
