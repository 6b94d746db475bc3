//! # Software Timers
//!
//! Timers are serviced by a dedicated task, not by the tick interrupt.
//! Tasks and ISRs post commands into a bounded queue; the service task
//! drains it, keeps the armed timers in a wrap-aware list ordered by
//! expiry, and runs callbacks outside the kernel lock.
//!
//! ## Service loop
//!
//! ```text
//! loop {
//!     batch = with_kernel(|k| k.timer_service_step());
//!     for work in batch { work.run() }     // callbacks, pended calls
//! }
//! ```
//!
//! A step that produces no work blocks the service task until the next
//! expiry or the next command, whichever comes first.
//!
//! ## Periodic timers
//!
//! A periodic timer re-arms relative to the expiry it just served, not to
//! when the service got round to it, so it doesn't drift. If the service
//! ran late by several periods the missed expiries collapse into a single
//! callback.

use heapless::{Deque, Vec};

use crate::config::{MAX_TASKS, MAX_TIMERS, TIMER_QUEUE_LENGTH};
use crate::error::{fatal, KernelError, Violation};
use crate::heap::HeapBlock;
use crate::kernel::Kernel;
use crate::table::{define_handle, ObjectTable};
use crate::task::{Callback, PendedCall, Priority, TaskId, TaskName, WaitTarget};
use crate::time::{Tick, TickList, Timeout};

define_handle!(
    /// Handle to a software timer.
    TimerId
);

/// Most work items one service step can hand back.
pub const MAX_DEFERRED: usize = MAX_TIMERS + TIMER_QUEUE_LENGTH + MAX_TASKS;

/// Work returned by [`Kernel::timer_service_step`].
pub type DeferredBatch = Vec<Deferred, MAX_DEFERRED>;

/// Something the timer service must run outside the kernel lock.
#[derive(Debug, Clone, Copy)]
pub enum Deferred {
    /// A timer expired.
    Expired { timer: TimerId, callback: Callback },
    /// A call posted with `pend_function_call`.
    Call(PendedCall),
}

impl Deferred {
    pub fn run(self) {
        match self {
            Self::Expired { callback, .. } => callback.invoke(),
            Self::Call(call) => call.invoke(),
        }
    }
}

/// Outcome of posting a command from task context.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Queued,
    /// The queue was full; the caller waits for space. The result arrives
    /// through [`Kernel::take_wait_result`] (`QueueFull` on timeout).
    Blocked,
}

#[derive(Debug, Clone, Copy)]
enum TimerCommand {
    /// Start or restart; the period counts from `issued`.
    Start { timer: TimerId, issued: Tick },
    Stop(TimerId),
    ChangePeriod { timer: TimerId, period: Tick },
    Delete(TimerId),
    #[cfg(feature = "pend-function-call")]
    PendCall(PendedCall),
}

struct Timer {
    name: TaskName,
    period: Tick,
    auto_reload: bool,
    callback: Callback,
    expiry: Tick,
    active: bool,
    control: HeapBlock,
}

/// Timer service state, owned by the [`Kernel`].
pub(crate) struct TimerService {
    timers: ObjectTable<Timer, MAX_TIMERS>,
    active: TickList<TimerId, MAX_TIMERS>,
    queue: Deque<TimerCommand, TIMER_QUEUE_LENGTH>,
    /// Senders blocked on a full queue, in arrival order.
    pending_sends: Vec<(TaskId, TimerCommand), MAX_TASKS>,
    /// Tick count seen by the previous step, to notice wraps.
    last_sample: Tick,
    pub task: Option<TaskId>,
}

impl TimerService {
    pub const fn new() -> Self {
        Self {
            timers: ObjectTable::new(),
            active: TickList::new(),
            queue: Deque::new(),
            pending_sends: Vec::new(),
            last_sample: 0,
            task: None,
        }
    }

    /// Forget the command of a sender whose wait ended early.
    pub fn cancel_send(&mut self, task: TaskId) {
        self.pending_sends.retain(|&(t, _)| t != task);
    }

    fn timer(&self, timer: TimerId) -> Result<&Timer, KernelError> {
        self.timers.get(timer.0).ok_or(KernelError::InvalidHandle)
    }

    /// Hand out the callback of a timer that expired at `expiry` and re-arm
    /// it if it is periodic.
    fn fire(&mut self, id: TimerId, expiry: Tick, now: Tick, batch: &mut DeferredBatch) {
        let Some(timer) = self.timers.get_mut(id.0) else {
            return;
        };
        let _ = batch.push(Deferred::Expired {
            timer: id,
            callback: timer.callback,
        });
        if timer.auto_reload {
            let next = next_expiry(expiry, timer.period, now);
            timer.expiry = next;
            self.active.insert(now, next, id);
        } else {
            timer.active = false;
        }
    }

    fn arm(&mut self, id: TimerId, expiry: Tick, now: Tick) {
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.active = true;
            timer.expiry = expiry;
            self.active.insert(now, expiry, id);
        }
    }

    /// Fire everything due at `now`.
    fn process_expired(&mut self, now: Tick, batch: &mut DeferredBatch) {
        while !batch.is_full() {
            let Some((expiry, id)) = self.active.pop_expired(now) else {
                break;
            };
            self.fire(id, expiry, now, batch);
        }
    }

    /// The tick count wrapped since the last step: everything left in the
    /// old epoch is overdue.
    fn process_wrap(&mut self, now: Tick, batch: &mut DeferredBatch) {
        let mut overdue: Vec<(Tick, TimerId), MAX_TIMERS> = Vec::new();
        while let Some(entry) = self.active.pop_current() {
            if overdue.push(entry).is_err() {
                fatal(Violation::ListOverflow);
            }
        }
        self.active.switch_lists();
        for (expiry, id) in overdue {
            self.fire(id, expiry, now, batch);
        }
    }

    /// Apply one command. Returns the control block of a deleted timer.
    fn process(&mut self, command: TimerCommand, now: Tick, batch: &mut DeferredBatch) -> Option<HeapBlock> {
        match command {
            TimerCommand::Start { timer, issued } => {
                let period = self.timers.get(timer.0)?.period;
                self.active.remove(timer);
                let expiry = issued.wrapping_add(period);
                if now.wrapping_sub(issued) >= period {
                    // Processed after the timer would already have expired.
                    if let Some(t) = self.timers.get_mut(timer.0) {
                        t.active = true;
                        t.expiry = expiry;
                    }
                    self.fire(timer, expiry, now, batch);
                } else {
                    self.arm(timer, expiry, now);
                }
            }
            TimerCommand::Stop(timer) => {
                self.active.remove(timer);
                self.timers.get_mut(timer.0)?.active = false;
            }
            TimerCommand::ChangePeriod { timer, period } => {
                self.timers.get_mut(timer.0)?.period = period;
                self.active.remove(timer);
                self.arm(timer, now.wrapping_add(period), now);
            }
            TimerCommand::Delete(timer) => {
                self.active.remove(timer);
                let removed = self.timers.remove(timer.0)?;
                log::debug!("deleted timer {timer:?} '{}'", removed.name);
                return Some(removed.control);
            }
            #[cfg(feature = "pend-function-call")]
            TimerCommand::PendCall(call) => {
                let _ = batch.push(Deferred::Call(call));
            }
        }
        None
    }
}

/// First expiry after `now` on the grid `expiry + k * period`.
pub(crate) fn next_expiry(expiry: Tick, period: Tick, now: Tick) -> Tick {
    let late = now.wrapping_sub(expiry);
    let periods = (late / period).wrapping_add(1);
    expiry.wrapping_add(periods.wrapping_mul(period))
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl Kernel {
    /// Create a dormant timer. `period` is in ticks and must be non-zero.
    pub fn create_timer(
        &mut self,
        name: &str,
        period: Tick,
        auto_reload: bool,
        callback: Callback,
    ) -> Result<TimerId, KernelError> {
        if period == 0 {
            return Err(KernelError::InvalidParameter);
        }
        let control = self.heap.allocate(core::mem::size_of::<Timer>())?;
        let timer = Timer {
            name: TaskName::new(name),
            period,
            auto_reload,
            callback,
            expiry: 0,
            active: false,
            control,
        };
        match self.timers.timers.insert(timer) {
            Ok(handle) => {
                let id = TimerId(handle);
                log::debug!("created timer {id:?} '{name}' period {period}");
                Ok(id)
            }
            Err(_) => {
                self.heap.free(control);
                Err(KernelError::AllocationFailure)
            }
        }
    }

    /// Arm the timer to expire one period from now, restarting it if it
    /// is already running.
    pub fn timer_start(&mut self, timer: TimerId, timeout: Timeout) -> Result<Sent, KernelError> {
        self.timers.timer(timer)?;
        let issued = self.tick_count;
        self.send_command(TimerCommand::Start { timer, issued }, timeout)
    }

    /// Same as [`timer_start`](Self::timer_start).
    pub fn timer_reset(&mut self, timer: TimerId, timeout: Timeout) -> Result<Sent, KernelError> {
        self.timer_start(timer, timeout)
    }

    pub fn timer_stop(&mut self, timer: TimerId, timeout: Timeout) -> Result<Sent, KernelError> {
        self.timers.timer(timer)?;
        self.send_command(TimerCommand::Stop(timer), timeout)
    }

    /// Set a new period and (re)arm the timer one new period from when the
    /// service processes the command.
    pub fn timer_change_period(
        &mut self,
        timer: TimerId,
        period: Tick,
        timeout: Timeout,
    ) -> Result<Sent, KernelError> {
        if period == 0 {
            return Err(KernelError::InvalidParameter);
        }
        self.timers.timer(timer)?;
        self.send_command(TimerCommand::ChangePeriod { timer, period }, timeout)
    }

    pub fn timer_delete(&mut self, timer: TimerId, timeout: Timeout) -> Result<Sent, KernelError> {
        self.timers.timer(timer)?;
        self.send_command(TimerCommand::Delete(timer), timeout)
    }

    /// Interrupt-context start. Returns whether the service task woke with
    /// a priority above the interrupted task.
    pub fn timer_start_from_isr(&mut self, timer: TimerId) -> Result<bool, KernelError> {
        self.timers.timer(timer)?;
        let issued = self.tick_count;
        self.send_command_from_isr(TimerCommand::Start { timer, issued })
    }

    pub fn timer_reset_from_isr(&mut self, timer: TimerId) -> Result<bool, KernelError> {
        self.timer_start_from_isr(timer)
    }

    pub fn timer_stop_from_isr(&mut self, timer: TimerId) -> Result<bool, KernelError> {
        self.timers.timer(timer)?;
        self.send_command_from_isr(TimerCommand::Stop(timer))
    }

    pub fn timer_change_period_from_isr(&mut self, timer: TimerId, period: Tick) -> Result<bool, KernelError> {
        if period == 0 {
            return Err(KernelError::InvalidParameter);
        }
        self.timers.timer(timer)?;
        self.send_command_from_isr(TimerCommand::ChangePeriod { timer, period })
    }

    pub fn timer_delete_from_isr(&mut self, timer: TimerId) -> Result<bool, KernelError> {
        self.timers.timer(timer)?;
        self.send_command_from_isr(TimerCommand::Delete(timer))
    }

    /// Have the timer service call `func(arg1, arg2)`.
    #[cfg(feature = "pend-function-call")]
    pub fn pend_function_call(
        &mut self,
        func: fn(usize, u32),
        arg1: usize,
        arg2: u32,
        timeout: Timeout,
    ) -> Result<Sent, KernelError> {
        let call = PendedCall { func, arg1, arg2 };
        self.send_command(TimerCommand::PendCall(call), timeout)
    }

    #[cfg(feature = "pend-function-call")]
    pub fn pend_function_call_from_isr(
        &mut self,
        func: fn(usize, u32),
        arg1: usize,
        arg2: u32,
    ) -> Result<bool, KernelError> {
        let call = PendedCall { func, arg1, arg2 };
        self.send_command_from_isr(TimerCommand::PendCall(call))
    }

    /// Armed and waiting to expire.
    pub fn timer_is_active(&self, timer: TimerId) -> Result<bool, KernelError> {
        Ok(self.timers.timer(timer)?.active)
    }

    /// Tick the timer next expires at. Only meaningful while active.
    pub fn timer_expiry(&self, timer: TimerId) -> Result<Tick, KernelError> {
        Ok(self.timers.timer(timer)?.expiry)
    }

    pub fn timer_period(&self, timer: TimerId) -> Result<Tick, KernelError> {
        Ok(self.timers.timer(timer)?.period)
    }

    pub fn timer_name(&self, timer: TimerId) -> Result<&str, KernelError> {
        Ok(self.timers.timer(timer)?.name.as_str())
    }

    /// One iteration of the timer service task.
    ///
    /// Fires expired timers, then drains the command queue in arrival
    /// order. The returned work must be run after the kernel lock is
    /// dropped. When there is nothing to run and the caller is the service
    /// task, it is blocked until the next expiry or command.
    pub fn timer_service_step(&mut self) -> DeferredBatch {
        let mut batch = DeferredBatch::new();
        let service = self.timers.task.filter(|&t| Some(t) == self.scheduler.current());
        if let Some(service) = service {
            // The previous wait ends with a timeout when a timer is due.
            if let Ok(tcb) = self.tcb_mut(service) {
                tcb.wait_result = None;
            }
        }

        let now = self.tick_count;
        if now < self.timers.last_sample {
            self.timers.process_wrap(now, &mut batch);
        }
        self.timers.last_sample = now;
        self.timers.process_expired(now, &mut batch);

        while !batch.is_full() {
            let Some(command) = self.timers.queue.pop_front() else {
                break;
            };
            self.admit_pending_send();
            if let Some(control) = self.timers.process(command, now, &mut batch) {
                self.heap.free(control);
            }
        }

        if batch.is_empty() && service.is_some() {
            let timeout = match self.timers.active.next_wake() {
                Some(at) => Timeout::ticks(at.wrapping_sub(now)),
                None => Timeout::Forever,
            };
            // Can't fail: the service task is running.
            let _ = self.block_current(timeout, Some(WaitTarget::TimerCommands));
        }
        batch
    }

    fn send_command(&mut self, command: TimerCommand, timeout: Timeout) -> Result<Sent, KernelError> {
        if self.timers.queue.push_back(command).is_ok() {
            self.notify_timer_service();
            return Ok(Sent::Queued);
        }

        let caller = self.scheduler.current().filter(|_| self.scheduler.is_started());
        let caller = match caller {
            // The service task would be waiting on itself.
            Some(caller) if !timeout.is_poll() && Some(caller) != self.timers.task => caller,
            _ => {
                log::warn!("timer command queue full");
                return Err(KernelError::QueueFull);
            }
        };
        if self.timers.pending_sends.push((caller, command)).is_err() {
            fatal(Violation::ListOverflow);
        }
        self.block_current(timeout, Some(WaitTarget::TimerQueueSpace))?;
        Ok(Sent::Blocked)
    }

    fn send_command_from_isr(&mut self, command: TimerCommand) -> Result<bool, KernelError> {
        if self.timers.queue.push_back(command).is_err() {
            return Err(KernelError::QueueFull);
        }
        if !self.notify_timer_service() {
            return Ok(false);
        }
        let (Some(service), Some(current)) = (self.timers.task, self.scheduler.current()) else {
            return Ok(false);
        };
        Ok(self.priority_of(service) > self.priority_of(current))
    }

    /// Wake the service task if it is waiting for commands.
    fn notify_timer_service(&mut self) -> bool {
        let Some(service) = self.timers.task else {
            return false;
        };
        let waiting = self
            .tasks
            .get(service.0)
            .is_some_and(|tcb| tcb.waiting_on == Some(WaitTarget::TimerCommands));
        if waiting {
            self.wake_waiter(service, Ok(()));
        }
        waiting
    }

    /// Move the most urgent blocked sender's command into the queue.
    fn admit_pending_send(&mut self) {
        if self.timers.queue.is_full() {
            return;
        }
        let mut best: Option<(usize, Priority)> = None;
        for (index, &(task, _)) in self.timers.pending_sends.iter().enumerate() {
            let priority = self.priority_of(task);
            if best.map_or(true, |(_, p)| priority > p) {
                best = Some((index, priority));
            }
        }
        let Some((index, _)) = best else {
            return;
        };
        let (task, command) = self.timers.pending_sends.remove(index);
        // Can't fail: checked for room above.
        let _ = self.timers.queue.push_back(command);
        self.wake_waiter(task, Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::kernel::tests::{init_logging, settle, started};

    fn noop(_: usize) {}

    fn periodic(kernel: &mut Kernel, period: Tick) -> TimerId {
        kernel
            .create_timer("periodic", period, true, Callback::new(noop, 0))
            .unwrap()
    }

    fn advance_to(kernel: &mut Kernel, tick: Tick) {
        while kernel.tick_count() != tick {
            kernel.tick();
        }
    }

    #[test]
    fn test_next_expiry_coalesces_missed_periods() {
        assert_eq!(next_expiry(100, 100, 100), 200);
        assert_eq!(next_expiry(100, 100, 250), 300);
        assert_eq!(next_expiry(100, 100, 299), 300);
        assert_eq!(next_expiry(u32::MAX - 5, 10, 2), 4);
    }

    #[test]
    fn test_late_service_fires_once_without_drift() {
        init_logging();
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 100);
        assert_eq!(kernel.timer_start(t, Timeout::Poll), Ok(Sent::Queued));
        assert!(kernel.timer_service_step().is_empty());
        assert!(kernel.timer_is_active(t).unwrap());
        assert_eq!(kernel.timer_expiry(t), Ok(100));

        advance_to(&mut kernel, 250);
        let batch = kernel.timer_service_step();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0], Deferred::Expired { timer, .. } if timer == t));
        assert_eq!(kernel.timer_expiry(t), Ok(300));
        assert!(kernel.timer_service_step().is_empty());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut kernel = Kernel::new();
        let t = kernel
            .create_timer("once", 5, false, Callback::new(noop, 0))
            .unwrap();
        let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        kernel.timer_service_step();
        advance_to(&mut kernel, 5);
        assert_eq!(kernel.timer_service_step().len(), 1);
        assert_eq!(kernel.timer_is_active(t), Ok(false));
        advance_to(&mut kernel, 20);
        assert!(kernel.timer_service_step().is_empty());
    }

    #[test]
    fn test_start_processed_late_fires_at_once() {
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 100);
        let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        advance_to(&mut kernel, 150);
        assert_eq!(kernel.timer_service_step().len(), 1);
        assert_eq!(kernel.timer_expiry(t), Ok(200));
    }

    #[test]
    fn test_stop_and_change_period() {
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 10);
        let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        let _ = kernel.timer_stop(t, Timeout::Poll).unwrap();
        kernel.timer_service_step();
        assert_eq!(kernel.timer_is_active(t), Ok(false));
        advance_to(&mut kernel, 30);
        assert!(kernel.timer_service_step().is_empty());

        let _ = kernel.timer_change_period(t, 7, Timeout::Poll).unwrap();
        kernel.timer_service_step();
        assert_eq!(kernel.timer_period(t), Ok(7));
        assert_eq!(kernel.timer_expiry(t), Ok(37));
        assert!(kernel.timer_is_active(t).unwrap());
        assert_eq!(
            kernel.timer_change_period(t, 0, Timeout::Poll),
            Err(KernelError::InvalidParameter)
        );
    }

    #[test]
    fn test_isr_change_period_and_delete() {
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 10);
        assert!(kernel.timer_start_from_isr(t).is_ok());
        assert!(kernel.timer_change_period_from_isr(t, 4).is_ok());
        assert_eq!(
            kernel.timer_change_period_from_isr(t, 0),
            Err(KernelError::InvalidParameter)
        );
        kernel.timer_service_step();
        assert_eq!(kernel.timer_period(t), Ok(4));
        assert_eq!(kernel.timer_expiry(t), Ok(4));

        assert!(kernel.timer_reset_from_isr(t).is_ok());
        assert!(kernel.timer_delete_from_isr(t).is_ok());
        kernel.timer_service_step();
        assert_eq!(kernel.timer_name(t), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_delete_returns_memory() {
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 10);
        let before = kernel.heap_stats().free_bytes;
        let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        let _ = kernel.timer_delete(t, Timeout::Poll).unwrap();
        // Still valid until the service processes the delete.
        assert_eq!(kernel.timer_name(t), Ok("periodic"));
        kernel.timer_service_step();
        assert_eq!(kernel.timer_name(t), Err(KernelError::InvalidHandle));
        assert!(kernel.heap_stats().free_bytes > before);
    }

    #[test]
    fn test_full_queue_rejects_polling_and_isr_senders() {
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 10);
        for _ in 0..TIMER_QUEUE_LENGTH {
            assert_eq!(kernel.timer_start(t, Timeout::Poll), Ok(Sent::Queued));
        }
        assert_eq!(kernel.timer_start(t, Timeout::Poll), Err(KernelError::QueueFull));
        assert_eq!(kernel.timer_stop_from_isr(t), Err(KernelError::QueueFull));
        // Before the scheduler runs nobody can wait for space.
        assert_eq!(kernel.timer_start(t, Timeout::Forever), Err(KernelError::QueueFull));
    }

    #[test]
    fn test_blocked_sender_gets_slot_when_service_drains() {
        let (mut kernel, tasks) = started(&[2]);
        let t = periodic(&mut kernel, 50);
        for _ in 0..TIMER_QUEUE_LENGTH {
            assert_eq!(kernel.timer_start(t, Timeout::Poll), Ok(Sent::Queued));
        }
        // A zero-tick wait polls even with a running task to block.
        assert_eq!(
            kernel.timer_stop(t, Timeout::Ticks(0)),
            Err(KernelError::QueueFull)
        );
        assert_eq!(kernel.current_task(), Some(tasks[0]));
        assert_eq!(kernel.timer_stop(t, Timeout::Ticks(5)), Ok(Sent::Blocked));
        assert_eq!(settle(&mut kernel), kernel.timers.task);

        assert!(kernel.timer_service_step().is_empty());
        // The stop was admitted and processed last.
        assert_eq!(kernel.timer_is_active(t), Ok(false));
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
        assert_eq!(kernel.take_wait_result(), Ok(()));
    }

    #[test]
    fn test_blocked_sender_times_out_with_queue_full() {
        let (mut kernel, tasks) = started(&[2]);
        let t = periodic(&mut kernel, 50);
        for _ in 0..TIMER_QUEUE_LENGTH {
            let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        }
        assert_eq!(kernel.timer_stop(t, Timeout::Ticks(3)), Ok(Sent::Blocked));
        assert_eq!(settle(&mut kernel), kernel.timers.task);
        // The service doesn't get round to the queue before the timeout.
        for _ in 0..3 {
            kernel.tick();
        }
        kernel.timer_service_step();
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
        assert_eq!(kernel.take_wait_result(), Err(KernelError::QueueFull));
        assert!(kernel.timer_is_active(t).unwrap());
    }

    #[test]
    fn test_service_sleeps_until_next_expiry() {
        let (mut kernel, tasks) = started(&[2]);
        let t = periodic(&mut kernel, 10);
        let _ = kernel.timer_start(t, Timeout::Forever).unwrap();
        assert_eq!(settle(&mut kernel), kernel.timers.task);
        assert!(kernel.timer_service_step().is_empty());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));

        for _ in 0..9 {
            kernel.tick();
            assert_eq!(settle(&mut kernel), Some(tasks[0]));
        }
        assert!(kernel.tick());
        assert_eq!(settle(&mut kernel), kernel.timers.task);
        assert_eq!(kernel.timer_service_step().len(), 1);
        assert_eq!(kernel.timer_expiry(t), Ok(20));
    }

    #[test]
    fn test_isr_command_reports_service_wakeup() {
        let (mut kernel, _) = started(&[2]);
        let t = periodic(&mut kernel, 10);
        assert_eq!(kernel.timer_start_from_isr(t), Ok(true));
        // Already awake: no new wakeup to report.
        assert_eq!(kernel.timer_reset_from_isr(t), Ok(false));
    }

    #[test]
    fn test_timer_across_tick_wrap() {
        let mut kernel = Kernel::new();
        let t = periodic(&mut kernel, 10);
        kernel.tick_count = u32::MAX - 5;
        let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        kernel.timer_service_step();
        assert_eq!(kernel.timer_expiry(t), Ok(4));

        advance_to(&mut kernel, 2);
        assert!(kernel.timer_service_step().is_empty());
        advance_to(&mut kernel, 4);
        assert_eq!(kernel.timer_service_step().len(), 1);
        assert_eq!(kernel.timer_expiry(t), Ok(14));
    }

    #[test]
    fn test_callbacks_run_with_context() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn record(context: usize) {
            FIRED.fetch_add(context, Ordering::SeqCst);
        }
        let mut kernel = Kernel::new();
        let t = kernel
            .create_timer("cb", 1, false, Callback::new(record, 7))
            .unwrap();
        let _ = kernel.timer_start(t, Timeout::Poll).unwrap();
        kernel.timer_service_step();
        kernel.tick();
        for work in kernel.timer_service_step() {
            work.run();
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 7);
    }

    #[test]
    #[cfg(feature = "pend-function-call")]
    fn test_pended_call_runs_in_order() {
        static SUM: AtomicUsize = AtomicUsize::new(0);
        fn add(a: usize, b: u32) {
            SUM.fetch_add(a * b as usize, Ordering::SeqCst);
        }
        let mut kernel = Kernel::new();
        let _ = kernel.pend_function_call(add, 3, 4, Timeout::Poll).unwrap();
        kernel.pend_function_call_from_isr(add, 1, 2).unwrap();
        let batch = kernel.timer_service_step();
        assert_eq!(batch.len(), 2);
        for work in batch {
            work.run();
        }
        assert_eq!(SUM.load(Ordering::SeqCst), 14);
    }

    #[test]
    fn test_invalid_parameters() {
        let mut kernel = Kernel::new();
        assert_eq!(
            kernel
                .create_timer("zero", 0, true, Callback::new(noop, 0))
                .unwrap_err(),
            KernelError::InvalidParameter
        );
        let t = periodic(&mut kernel, 3);
        assert_eq!(kernel.timer_name(t), Ok("periodic"));
        let _ = kernel.timer_delete(t, Timeout::Poll).unwrap();
        kernel.timer_service_step();
        assert_eq!(kernel.timer_start(t, Timeout::Poll), Err(KernelError::InvalidHandle));
    }
}
