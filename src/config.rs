//! # Kernel Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! The values match an RP2350 (Cortex-M33) build with a 1 ms tick, six
//! priority levels and a 16 KiB kernel heap. Nothing here is run-time
//! configurable.
//!
//! The optional task APIs are Cargo features rather than constants:
//! `task-delay`, `task-delay-until`, `task-delete`, `task-suspend`,
//! `priority-get`, `priority-set` and `pend-function-call`.

use crate::time::Tick;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Tick interrupt frequency in Hz. One tick is the kernel's time quantum.
pub const TICK_RATE_HZ: u32 = 1000;

/// Number of task priority levels. Valid priorities are
/// `0..MAX_PRIORITIES`; higher numbers are more urgent.
pub const MAX_PRIORITIES: usize = 6;

/// A task that becomes Ready at a priority above the running task's
/// preempts it immediately.
pub const USE_PREEMPTION: bool = true;

/// Equal-priority Ready tasks share the CPU in one-tick slices.
pub const USE_TIME_SLICING: bool = true;

/// The idle task yields as soon as another priority-0 task is Ready.
pub const IDLE_SHOULD_YIELD: bool = true;

// ---------------------------------------------------------------------------
// Tasks and memory
// ---------------------------------------------------------------------------

/// Smallest accepted task stack, in 32-bit words. Also the idle task's
/// stack size.
pub const MINIMAL_STACK_SIZE: usize = 128;

/// Bytes in the kernel heap arena.
pub const TOTAL_HEAP_SIZE: usize = 16364;

/// Maximum task name length in bytes. Longer names are truncated.
pub const MAX_TASK_NAME_LEN: usize = 16;

/// Capacity of the task table (including the idle and timer tasks).
pub const MAX_TASKS: usize = 16;

/// Capacity of the mutex table.
pub const MAX_MUTEXES: usize = 16;

/// Capacity of the semaphore table.
pub const MAX_SEMAPHORES: usize = 16;

/// Capacity of the software timer table.
pub const MAX_TIMERS: usize = 16;

/// Pattern written over a fresh stack; used for high-water-mark reports.
pub const STACK_FILL_BYTE: u8 = 0xA5;

// ---------------------------------------------------------------------------
// Software timers
// ---------------------------------------------------------------------------

/// Create the timer service task when the scheduler starts.
pub const USE_TIMERS: bool = true;

/// Priority of the timer service task.
pub const TIMER_TASK_PRIORITY: u8 = (MAX_PRIORITIES - 1) as u8;

/// Depth of the timer command queue.
pub const TIMER_QUEUE_LENGTH: usize = 10;

/// Stack of the timer service task, in words.
pub const TIMER_TASK_STACK_DEPTH: usize = MINIMAL_STACK_SIZE;

// ---------------------------------------------------------------------------
// Interrupts and hardware
// ---------------------------------------------------------------------------

/// Interrupts at this NVIC priority value or numerically above (less
/// urgent) may call the kernel's ISR-safe APIs. The kernel masks up to
/// this level with BASEPRI while mutating its state.
pub const MAX_SYSCALL_INTERRUPT_PRIORITY: u8 = 16;

/// Processor clock feeding SysTick (RP2350 default `clk_sys`).
pub const SYSTEM_CLOCK_HZ: u32 = 150_000_000;

/// Lazily stack s16–s31 for tasks that use the FPU.
pub const ENABLE_FPU: bool = true;

/// No MPU regions are programmed.
pub const ENABLE_MPU: bool = false;

/// Everything runs in a single security state.
pub const ENABLE_TRUSTZONE: bool = false;

// ---------------------------------------------------------------------------
// Sanity checks
// ---------------------------------------------------------------------------

const _: () = assert!(MAX_PRIORITIES > 0 && MAX_PRIORITIES <= 32, "ready bitmap is a u32");
const _: () = assert!((TIMER_TASK_PRIORITY as usize) < MAX_PRIORITIES);
const _: () = assert!(MAX_TASKS <= u16::MAX as usize);
const _: () = assert!(TIMER_QUEUE_LENGTH > 0);
const _: () = assert!(TIMER_TASK_STACK_DEPTH >= MINIMAL_STACK_SIZE);
const _: () = assert!(TICK_RATE_HZ > 0 && SYSTEM_CLOCK_HZ / TICK_RATE_HZ > 1);

/// Convert milliseconds to ticks, rounding down.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> Tick {
    ((ms as u64 * TICK_RATE_HZ as u64) / 1000) as Tick
}
