//! # rtkernel Demo Firmware
//!
//! Exercises every kernel service on an RP2350:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `sampler` | 3 | Fixed 10 ms rate with `delay_until`, signals a semaphore |
//! | `filter` | 2 | Waits on the semaphore, updates shared state under a mutex |
//! | `reporter` | 1 | Every 100 ms reads the shared state under the same mutex |
//!
//! A periodic `heartbeat` timer counts half-second beats, and the sampler
//! pends a function call to the timer service every hundred samples. The
//! mutex is shared between priorities 2 and 1, so while the reporter
//! holds it the filter's wait raises the reporter to priority 2.

#![no_std]
#![no_main]

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::interrupt::{self, Mutex};
use cortex_m_rt::entry;
use panic_halt as _;

use rtkernel::api;
use rtkernel::config::ms_to_ticks;
use rtkernel::{Callback, MutexId, SemaphoreId, TaskConfig, Timeout};

/// RP2350 IMAGE_DEF block: Arm, secure, executable image.
#[link_section = ".start_block"]
#[used]
pub static IMAGE_DEF: [u32; 5] = [0xffffded3, 0x10210142, 0x000001ff, 0x00000000, 0xab123579];

#[derive(Clone, Copy)]
struct Shared {
    sample_ready: SemaphoreId,
    state_lock: MutexId,
}

static SHARED: Mutex<Cell<Option<Shared>>> = Mutex::new(Cell::new(None));

static SAMPLES: AtomicU32 = AtomicU32::new(0);
static FILTERED: AtomicU32 = AtomicU32::new(0);
static REPORTED: AtomicU32 = AtomicU32::new(0);
static BEATS: AtomicU32 = AtomicU32::new(0);
static BATCHES: AtomicU32 = AtomicU32::new(0);

fn shared() -> Shared {
    match interrupt::free(|cs| SHARED.borrow(cs).get()) {
        Some(shared) => shared,
        None => panic!("shared handles not published"),
    }
}

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

extern "C" fn sampler(_: usize) -> ! {
    let shared = shared();
    let mut last_wake = api::tick_count();
    loop {
        let _ = api::delay_until(&mut last_wake, ms_to_ticks(10));
        let n = SAMPLES.fetch_add(1, Ordering::Relaxed) + 1;
        // A full semaphore means the filter is behind; drop the sample.
        let _ = api::semaphore_give(shared.sample_ready);
        if n % 100 == 0 {
            let _ = api::pend_function_call(record_batch, n as usize, 100, Timeout::Poll);
        }
    }
}

extern "C" fn filter(_: usize) -> ! {
    let shared = shared();
    loop {
        if api::semaphore_take(shared.sample_ready, Timeout::Ticks(ms_to_ticks(50))).is_err() {
            // The sampler stalled.
            continue;
        }
        if api::mutex_lock(shared.state_lock, Timeout::Forever).is_ok() {
            FILTERED.fetch_add(1, Ordering::Relaxed);
            let _ = api::mutex_unlock(shared.state_lock);
        }
    }
}

extern "C" fn reporter(_: usize) -> ! {
    let shared = shared();
    loop {
        if api::mutex_lock(shared.state_lock, Timeout::Forever).is_ok() {
            REPORTED.store(FILTERED.load(Ordering::Relaxed), Ordering::Relaxed);
            let _ = api::mutex_unlock(shared.state_lock);
        }
        let _ = api::delay(ms_to_ticks(100));
    }
}

fn heartbeat(_: usize) {
    BEATS.fetch_add(1, Ordering::Relaxed);
}

fn record_batch(_upto: usize, size: u32) {
    BATCHES.fetch_add(size, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let cp = match cortex_m::Peripherals::take() {
        Some(cp) => cp,
        None => panic!("core peripherals already taken"),
    };

    let sample_ready = api::create_semaphore(4, 0).expect("Failed to create semaphore");
    let state_lock = api::create_mutex().expect("Failed to create mutex");
    interrupt::free(|cs| {
        SHARED.borrow(cs).set(Some(Shared {
            sample_ready,
            state_lock,
        }))
    });

    api::create_task(sampler, TaskConfig::new("sampler", 3)).expect("Failed to create sampler");
    api::create_task(filter, TaskConfig::new("filter", 2)).expect("Failed to create filter");
    api::create_task(reporter, TaskConfig::new("reporter", 1).with_stack_words(256))
        .expect("Failed to create reporter");

    let beat = api::create_timer("heartbeat", ms_to_ticks(500), true, Callback::new(heartbeat, 0))
        .expect("Failed to create heartbeat timer");
    // Queued now, processed once the timer service runs.
    api::timer_start(beat, Timeout::Poll).expect("Failed to start heartbeat timer");

    // Does not return unless the scheduler failed to start
    let error = api::start(cp);
    panic!("scheduler failed to start: {error}");
}
