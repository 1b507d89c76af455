//! # TickOS Demo Firmware
//!
//! Three tasks on the default 10-tick quantum, each showing one way a
//! task gives up the CPU:
//!
//! | Task | Mutexes | Behavior |
//! |------|---------|----------|
//! | `yielding_task` | M00 | Logs, then yields straight away |
//! | `sleeping_task` | M00, M01 | Bumps `x`, then sleeps for 1000 ticks |
//! | `busy_task` | M01 | Bumps `y` forever; only preemption stops it |
//!
//! ## Expected Output
//!
//! The sleeper logs once per second. Between its runs the yielder and the
//! busy task alternate: the yielder gives up its slot at once, the busy
//! task runs until its quantum expires. The idle task never runs while
//! either of them is `Active`.
//!
//! Run on an LPC1768 with `cargo run --release --features demo`; output
//! arrives over semihosting.

#![no_std]
#![no_main]

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use defmt_semihosting as _;
use panic_halt as _;

use tickos::kernel;
use tickos::mutex::MutexMask;

defmt::timestamp!("{=u32:010}", kernel::now());

static X: AtomicU32 = AtomicU32::new(0);
static Y: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

fn release() {
    if let Err(err) = kernel::release_mutexes() {
        defmt::warn!("release failed: {}", err);
    }
}

extern "C" fn yielding_task(_arg: *mut c_void) -> ! {
    loop {
        if kernel::acquire_mutexes().is_ok() {
            defmt::info!("in yielding task");
            release();
        }
        kernel::yield_now();
    }
}

/// Wakes once a second.
extern "C" fn sleeping_task(_arg: *mut c_void) -> ! {
    loop {
        if kernel::acquire_mutexes().is_ok() {
            let x = X.fetch_add(1, Ordering::Relaxed) + 1;
            defmt::info!("in sleeping task, x = {=u32}", x);
            release();
        }
        kernel::sleep(1000);
    }
}

/// Never yields. Each preemption lands somewhere in this loop.
extern "C" fn busy_task(_arg: *mut c_void) -> ! {
    loop {
        if kernel::acquire_mutexes().is_ok() {
            let y = Y.fetch_add(1, Ordering::Relaxed) + 1;
            if y % 100_000 == 0 {
                defmt::debug!("in busy task, y = {=u32}", y);
            }
            release();
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().unwrap();

    kernel::init();

    kernel::create_task(
        yielding_task,
        core::ptr::null_mut(),
        MutexMask::from([true, false, false]),
    )
    .expect("Failed to create yielding_task");
    kernel::create_task(
        sleeping_task,
        core::ptr::null_mut(),
        MutexMask::from([true, true, false]),
    )
    .expect("Failed to create sleeping_task");
    kernel::create_task(
        busy_task,
        core::ptr::null_mut(),
        MutexMask::from([false, true, false]),
    )
    .expect("Failed to create busy_task");

    for _ in 0..3 {
        kernel::create_mutex().expect("Failed to create mutex");
    }

    // Only returns if the kernel refused to start
    let err = kernel::start(cp);
    defmt::error!("kernel start failed: {}", err);
    loop {
        cortex_m::asm::wfi();
    }
}
