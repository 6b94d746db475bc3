//! # Task-Facing API
//!
//! Free functions over the single kernel instance. Each call masks the
//! kernel's interrupts with BASEPRI for the duration of one [`Kernel`]
//! method, pends PendSV if that method asked for a switch, and unmasks.
//! Unmasking is what lets the pended switch run, so a call that blocked
//! has already been switched away from and back again by the time it
//! collects its result:
//!
//! ```text
//! semaphore_take(s, timeout)
//!   ├─► with_kernel: Kernel::semaphore_take → Blocked, PendSV pended
//!   │        ··· other tasks run until a give or the timeout ···
//!   └─► with_kernel: Kernel::take_wait_result → Ok / TimedOut
//! ```
//!
//! Hooks and timer callbacks must not call back into this module from
//! inside the kernel lock: idle and tick hooks run under it, timer
//! callbacks and pended calls do not.

use core::cell::UnsafeCell;

use crate::arch::cortex_m33::{
    configure_systick, enable_lazy_fp_stacking, raise_basepri, restore_basepri,
    set_interrupt_priorities, start_first_task, trigger_pendsv,
};
use crate::error::KernelError;
use crate::heap::HeapStats;
use crate::kernel::{Acquire, Kernel};
use crate::sync::{MutexId, SemaphoreId};
use crate::task::{Callback, Priority, TaskConfig, TaskEntry, TaskId, TaskInfo};
use crate::time::{Tick, Timeout};
use crate::timer::{Sent, TimerId};

struct KernelCell(UnsafeCell<Kernel>);

// Safety: only reached through `with_kernel`, which masks every context
// allowed to touch the kernel.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Run `f` on the kernel with kernel-aware interrupts masked.
///
/// Must not be nested, and must not be called from an interrupt more
/// urgent than `MAX_SYSCALL_INTERRUPT_PRIORITY`.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let previous = raise_basepri();
    // Safety: see `KernelCell`.
    let kernel = unsafe { &mut *KERNEL.0.get() };
    let result = f(kernel);
    if kernel.is_switch_pending() {
        trigger_pendsv();
    }
    restore_basepri(previous);
    result
}

/// Finish a call that may have blocked.
fn complete(outcome: Result<Acquire, KernelError>) -> Result<(), KernelError> {
    match outcome? {
        Acquire::Acquired => Ok(()),
        Acquire::Blocked => with_kernel(|kernel| kernel.take_wait_result()),
    }
}

fn complete_send(outcome: Result<Sent, KernelError>) -> Result<(), KernelError> {
    match outcome? {
        Sent::Queued => Ok(()),
        Sent::Blocked => with_kernel(|kernel| kernel.take_wait_result()),
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Create the system tasks and enter the highest-priority task.
///
/// Only returns if the scheduler could not start (out of kernel heap, or
/// already started).
pub fn start(mut peripherals: cortex_m::Peripherals) -> KernelError {
    if let Err(error) = with_kernel(|kernel| kernel.start(idle_task, timer_service_task)) {
        log::error!("scheduler failed to start: {error}");
        return error;
    }

    // Stays raised until the SVC handler enters the first task, so no
    // tick or switch lands in between.
    raise_basepri();
    set_interrupt_priorities(&mut peripherals.SCB);
    enable_lazy_fp_stacking();
    configure_systick(&mut peripherals.SYST);
    start_first_task()
}

extern "C" fn idle_task(_: usize) -> ! {
    loop {
        with_kernel(|kernel| kernel.idle_step());
    }
}

extern "C" fn timer_service_task(_: usize) -> ! {
    loop {
        let batch = with_kernel(|kernel| kernel.timer_service_step());
        for work in batch {
            work.run();
        }
    }
}

pub fn set_idle_hook(hook: Option<Callback>) {
    with_kernel(|kernel| kernel.set_idle_hook(hook));
}

pub fn set_tick_hook(hook: Option<Callback>) {
    with_kernel(|kernel| kernel.set_tick_hook(hook));
}

pub fn tick_count() -> Tick {
    with_kernel(|kernel| kernel.tick_count())
}

pub fn heap_stats() -> HeapStats {
    with_kernel(|kernel| kernel.heap_stats())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub fn create_task(entry: TaskEntry, config: TaskConfig) -> Result<TaskId, KernelError> {
    with_kernel(|kernel| kernel.create_task(entry, config))
}

#[cfg(feature = "task-delete")]
pub fn delete_task(task: TaskId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.delete_task(task))
}

#[cfg(feature = "task-suspend")]
pub fn suspend_task(task: TaskId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.suspend_task(task))
}

#[cfg(feature = "task-suspend")]
pub fn resume_task(task: TaskId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.resume_task(task))
}

#[cfg(feature = "priority-set")]
pub fn set_priority(task: TaskId, priority: Priority) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.set_priority(task, priority))
}

#[cfg(feature = "priority-get")]
pub fn get_priority(task: TaskId) -> Result<Priority, KernelError> {
    with_kernel(|kernel| kernel.get_priority(task))
}

/// Sleep for `ticks` ticks; `0` only yields.
#[cfg(feature = "task-delay")]
pub fn delay(ticks: Tick) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.delay(ticks))
}

/// Sleep until `*last_wake + increment` and advance `last_wake`. Returns
/// whether the task actually slept.
#[cfg(feature = "task-delay-until")]
pub fn delay_until(last_wake: &mut Tick, increment: Tick) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.delay_until(last_wake, increment))
}

pub fn yield_now() -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.yield_now())
}

pub fn current_task() -> Option<TaskId> {
    with_kernel(|kernel| kernel.current_task())
}

pub fn task_info(task: TaskId) -> Result<TaskInfo, KernelError> {
    with_kernel(|kernel| kernel.task_info(task))
}

// ---------------------------------------------------------------------------
// Mutexes and semaphores
// ---------------------------------------------------------------------------

pub fn create_mutex() -> Result<MutexId, KernelError> {
    with_kernel(|kernel| kernel.create_mutex())
}

pub fn delete_mutex(mutex: MutexId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.delete_mutex(mutex))
}

pub fn mutex_lock(mutex: MutexId, timeout: Timeout) -> Result<(), KernelError> {
    complete(with_kernel(|kernel| kernel.mutex_acquire(mutex, timeout)))
}

pub fn mutex_unlock(mutex: MutexId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.mutex_release(mutex))
}

pub fn create_semaphore(max: u32, initial: u32) -> Result<SemaphoreId, KernelError> {
    with_kernel(|kernel| kernel.create_semaphore(max, initial))
}

pub fn create_binary_semaphore() -> Result<SemaphoreId, KernelError> {
    with_kernel(|kernel| kernel.create_binary_semaphore())
}

pub fn delete_semaphore(semaphore: SemaphoreId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.delete_semaphore(semaphore))
}

pub fn semaphore_take(semaphore: SemaphoreId, timeout: Timeout) -> Result<(), KernelError> {
    complete(with_kernel(|kernel| kernel.semaphore_take(semaphore, timeout)))
}

pub fn semaphore_give(semaphore: SemaphoreId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.semaphore_give(semaphore))
}

/// Give from an ISR. The switch to a woken higher-priority task is pended
/// here; it runs when the ISR returns.
pub fn semaphore_give_from_isr(semaphore: SemaphoreId) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.semaphore_give_from_isr(semaphore))
}

pub fn semaphore_take_from_isr(semaphore: SemaphoreId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.semaphore_take_from_isr(semaphore))
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

pub fn create_timer(
    name: &str,
    period: Tick,
    auto_reload: bool,
    callback: Callback,
) -> Result<TimerId, KernelError> {
    with_kernel(|kernel| kernel.create_timer(name, period, auto_reload, callback))
}

pub fn timer_start(timer: TimerId, timeout: Timeout) -> Result<(), KernelError> {
    complete_send(with_kernel(|kernel| kernel.timer_start(timer, timeout)))
}

pub fn timer_reset(timer: TimerId, timeout: Timeout) -> Result<(), KernelError> {
    complete_send(with_kernel(|kernel| kernel.timer_reset(timer, timeout)))
}

pub fn timer_stop(timer: TimerId, timeout: Timeout) -> Result<(), KernelError> {
    complete_send(with_kernel(|kernel| kernel.timer_stop(timer, timeout)))
}

pub fn timer_change_period(timer: TimerId, period: Tick, timeout: Timeout) -> Result<(), KernelError> {
    complete_send(with_kernel(|kernel| kernel.timer_change_period(timer, period, timeout)))
}

pub fn timer_delete(timer: TimerId, timeout: Timeout) -> Result<(), KernelError> {
    complete_send(with_kernel(|kernel| kernel.timer_delete(timer, timeout)))
}

pub fn timer_start_from_isr(timer: TimerId) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.timer_start_from_isr(timer))
}

pub fn timer_reset_from_isr(timer: TimerId) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.timer_reset_from_isr(timer))
}

pub fn timer_stop_from_isr(timer: TimerId) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.timer_stop_from_isr(timer))
}

pub fn timer_change_period_from_isr(timer: TimerId, period: Tick) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.timer_change_period_from_isr(timer, period))
}

pub fn timer_delete_from_isr(timer: TimerId) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.timer_delete_from_isr(timer))
}

pub fn timer_is_active(timer: TimerId) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.timer_is_active(timer))
}

/// Run `func(arg1, arg2)` on the timer service task.
#[cfg(feature = "pend-function-call")]
pub fn pend_function_call(
    func: fn(usize, u32),
    arg1: usize,
    arg2: u32,
    timeout: Timeout,
) -> Result<(), KernelError> {
    complete_send(with_kernel(|kernel| kernel.pend_function_call(func, arg1, arg2, timeout)))
}

#[cfg(feature = "pend-function-call")]
pub fn pend_function_call_from_isr(func: fn(usize, u32), arg1: usize, arg2: u32) -> Result<bool, KernelError> {
    with_kernel(|kernel| kernel.pend_function_call_from_isr(func, arg1, arg2))
}
