//! # Kernel
//!
//! The [`Kernel`] value owns every piece of scheduler state: the heap, the
//! task table, the ready/delayed/blocked/suspended/terminating lists, the
//! synchronization objects and the timer service. Operations are plain
//! `&mut self` methods, so the whole kernel runs on the host under test; the
//! target port keeps exactly one instance in a static and reaches it with
//! interrupts masked up to the syscall ceiling.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt)
//!   └─► main()
//!         ├─► create_task() ×N        ← tasks queue up on the ready lists
//!         └─► start()                 ← idle + timer service, first task
//!               ├─► configure SysTick, PendSV/SysTick priorities
//!               └─► SVC 0 → first task
//! ```
//!
//! ## Blocking protocol
//!
//! A call that must wait queues the caller, requests a switch and returns
//! [`Acquire::Blocked`]. The port lets the deferred switch happen; when the
//! task runs again it collects the outcome with
//! [`take_wait_result`](Kernel::take_wait_result). Whoever ends the wait
//! (a release, a give, a timeout) has already handed over the resource, so
//! the task never retries.

use heapless::Vec;

use crate::config::{
    IDLE_SHOULD_YIELD, MAX_MUTEXES, MAX_PRIORITIES, MAX_SEMAPHORES, MAX_TASKS, MINIMAL_STACK_SIZE,
    TIMER_TASK_PRIORITY, TIMER_TASK_STACK_DEPTH, TOTAL_HEAP_SIZE, USE_PREEMPTION, USE_TIMERS,
    USE_TIME_SLICING,
};
use crate::error::{fatal, KernelError, Violation};
use crate::heap::{Heap, HeapStats};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::sync::mutex::Mutex;
use crate::sync::semaphore::Semaphore;
use crate::table::ObjectTable;
use crate::task::{
    init_stack, Callback, ListMembership, Priority, TaskConfig, TaskEntry, TaskId, TaskInfo,
    TaskName, TaskState, Tcb, WaitTarget,
};
use crate::time::{Tick, TickList, Timeout};
use crate::timer::TimerService;

/// Outcome of a call that may have to wait.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Completed without waiting.
    Acquired,
    /// The caller was queued; collect the result with
    /// [`Kernel::take_wait_result`] once it runs again.
    Blocked,
}

/// What one pass of the idle task did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleStep {
    /// Self-deleted tasks whose memory was returned to the heap.
    pub reclaimed: usize,
    /// The idle task gave way to another priority-0 task.
    pub yielded: bool,
}

// ---------------------------------------------------------------------------
// Kernel struct
// ---------------------------------------------------------------------------

pub struct Kernel {
    pub(crate) heap: Heap<TOTAL_HEAP_SIZE>,
    pub(crate) tasks: ObjectTable<Tcb, MAX_TASKS>,
    pub(crate) scheduler: Scheduler,
    pub(crate) delayed: TickList<TaskId, MAX_TASKS>,
    /// Tasks waiting without a deadline.
    pub(crate) blocked: Vec<TaskId, MAX_TASKS>,
    pub(crate) suspended: Vec<TaskId, MAX_TASKS>,
    /// Self-deleted tasks awaiting cleanup by the idle task.
    pub(crate) terminating: Vec<TaskId, MAX_TASKS>,
    pub(crate) tick_count: Tick,
    pub(crate) mutexes: ObjectTable<Mutex, MAX_MUTEXES>,
    pub(crate) semaphores: ObjectTable<Semaphore, MAX_SEMAPHORES>,
    pub(crate) timers: TimerService,
    idle_hook: Option<Callback>,
    tick_hook: Option<Callback>,
    idle_task: Option<TaskId>,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            heap: Heap::new(),
            tasks: ObjectTable::new(),
            scheduler: Scheduler::new(),
            delayed: TickList::new(),
            blocked: Vec::new(),
            suspended: Vec::new(),
            terminating: Vec::new(),
            tick_count: 0,
            mutexes: ObjectTable::new(),
            semaphores: ObjectTable::new(),
            timers: TimerService::new(),
            idle_hook: None,
            tick_hook: None,
            idle_task: None,
        }
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Create the idle and timer service tasks and pick the first task.
    ///
    /// `idle` and `timer_service` are the bodies the port runs for the two
    /// system tasks. Returns the task to start.
    pub fn start(&mut self, idle: TaskEntry, timer_service: TaskEntry) -> Result<TaskId, KernelError> {
        if self.scheduler.is_started() {
            return Err(KernelError::AlreadyStarted);
        }

        let idle = self.create_task(idle, TaskConfig::new("IDLE", 0))?;
        self.tcb_mut(idle)?.system = true;
        self.idle_task = Some(idle);

        if USE_TIMERS {
            let config = TaskConfig::new("Tmr Svc", TIMER_TASK_PRIORITY)
                .with_stack_words(TIMER_TASK_STACK_DEPTH);
            let service = self.create_task(timer_service, config)?;
            self.tcb_mut(service)?.system = true;
            self.timers.task = Some(service);
        }

        self.scheduler.mark_started();
        self.scheduler.request_switch();
        let first = self
            .context_switch()
            .unwrap_or_else(|| fatal(Violation::NoRunnableTask));
        log::debug!("scheduler started, first task {first:?}");
        Ok(first)
    }

    // -----------------------------------------------------------------------
    // Context switching
    // -----------------------------------------------------------------------

    /// Execute a pending switch (the PendSV body) and return the task that
    /// runs afterwards.
    pub fn context_switch(&mut self) -> Option<TaskId> {
        if !self.scheduler.take_switch() {
            return self.scheduler.current();
        }
        let rotate = self.scheduler.take_rotation();

        if let Some(prev) = self.scheduler.current() {
            if let Some(tcb) = self.tasks.get_mut(prev.0) {
                if tcb.state == TaskState::Running {
                    tcb.state = TaskState::Ready;
                    if rotate {
                        let priority = tcb.priority;
                        self.scheduler.ready.rotate_to_back(prev, priority);
                    }
                }
            }
        }

        let next = self
            .scheduler
            .select_next_task()
            .unwrap_or_else(|| fatal(Violation::NoRunnableTask));
        match self.tasks.get_mut(next.0) {
            Some(tcb) => tcb.state = TaskState::Running,
            None => fatal(Violation::DanglingTask),
        }
        if self.scheduler.current() != Some(next) {
            log::trace!("switch {:?} -> {next:?}", self.scheduler.current());
        }
        self.scheduler.set_current(next);

        #[cfg(debug_assertions)]
        if let Err(violation) = self.check_integrity() {
            fatal(violation);
        }
        Some(next)
    }

    /// Record the outgoing task's process stack pointer (absolute address).
    pub fn save_stack_pointer(&mut self, sp: usize) {
        let base = self.heap.base_address();
        if let Some(current) = self.scheduler.current() {
            if let Some(tcb) = self.tasks.get_mut(current.0) {
                tcb.saved_sp = sp - base;
            }
        }
    }

    /// Absolute process stack pointer to resume the running task from.
    pub fn current_stack_pointer(&self) -> Option<usize> {
        let current = self.scheduler.current()?;
        let tcb = self.tasks.get(current.0)?;
        Some(self.heap.base_address() + tcb.saved_sp)
    }

    #[inline]
    pub fn is_switch_pending(&self) -> bool {
        self.scheduler.is_switch_pending()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Create a task and make it Ready.
    ///
    /// The control block and the stack both come from the heap; if either
    /// allocation fails nothing is registered and all memory is returned.
    pub fn create_task(&mut self, entry: TaskEntry, config: TaskConfig) -> Result<TaskId, KernelError> {
        if config.priority as usize >= MAX_PRIORITIES {
            return Err(KernelError::PriorityOutOfRange);
        }
        if config.stack_words < MINIMAL_STACK_SIZE {
            return Err(KernelError::StackTooSmall);
        }

        let control = self.heap.allocate(core::mem::size_of::<Tcb>())?;
        let stack = match self.heap.allocate(config.stack_words * 4) {
            Ok(stack) => stack,
            Err(e) => {
                self.heap.free(control);
                return Err(e);
            }
        };
        let base = self.heap.base_address() + stack.offset();
        let sp = init_stack(self.heap.bytes_mut(stack), base, entry, config.param);

        let tcb = Tcb {
            name: TaskName::new(config.name),
            priority: config.priority,
            base_priority: config.priority,
            state: TaskState::Ready,
            list: ListMembership::Ready,
            saved_sp: stack.offset() + sp,
            stack,
            control,
            wake_tick: 0,
            waiting_on: None,
            wait_result: None,
            held_mutexes: Vec::new(),
            system: false,
        };
        let id = match self.tasks.insert(tcb) {
            Ok(handle) => TaskId(handle),
            Err(_) => {
                self.heap.free(stack);
                self.heap.free(control);
                return Err(KernelError::AllocationFailure);
            }
        };

        log::debug!(
            "created task {id:?} '{}' prio {} stack {} words",
            config.name,
            config.priority,
            config.stack_words
        );
        self.make_ready(id);
        Ok(id)
    }

    /// Delete a task. Deleting the running task defers freeing its memory
    /// to the idle task.
    ///
    /// Mutexes the task holds are not released.
    #[cfg(feature = "task-delete")]
    pub fn delete_task(&mut self, task: TaskId) -> Result<(), KernelError> {
        let tcb = self.tcb(task)?;
        if tcb.system {
            log::warn!("refusing to delete system task {task:?}");
            return Err(KernelError::SystemTask);
        }
        if tcb.state == TaskState::Deleted {
            return Ok(());
        }
        if !tcb.held_mutexes.is_empty() {
            log::warn!("task {task:?} deleted while holding {} mutex(es)", tcb.held_mutexes.len());
        }

        self.detach(task);
        if self.scheduler.current() == Some(task) {
            let tcb = self.tcb_mut(task)?;
            tcb.state = TaskState::Deleted;
            tcb.list = ListMembership::Terminating;
            push_or_fatal(&mut self.terminating, task);
            self.scheduler.request_switch();
            log::debug!("task {task:?} deleted itself");
        } else {
            self.free_task(task);
            log::debug!("deleted task {task:?}");
        }
        Ok(())
    }

    /// Take a task out of scheduling until resumed. A pending wait ends
    /// with [`KernelError::WaitAborted`].
    #[cfg(feature = "task-suspend")]
    pub fn suspend_task(&mut self, task: TaskId) -> Result<(), KernelError> {
        let tcb = self.tcb(task)?;
        if tcb.system {
            return Err(KernelError::SystemTask);
        }
        match tcb.state {
            TaskState::Suspended | TaskState::Deleted => return Ok(()),
            _ => {}
        }

        self.detach(task);
        let tcb = self.tcb_mut(task)?;
        tcb.state = TaskState::Suspended;
        tcb.list = ListMembership::Suspended;
        push_or_fatal(&mut self.suspended, task);
        if self.scheduler.current() == Some(task) {
            self.scheduler.request_switch();
        }
        Ok(())
    }

    /// Make a suspended task Ready again. Resuming a task that isn't
    /// suspended does nothing.
    #[cfg(feature = "task-suspend")]
    pub fn resume_task(&mut self, task: TaskId) -> Result<(), KernelError> {
        if self.tcb(task)?.state != TaskState::Suspended {
            return Ok(());
        }
        remove_item(&mut self.suspended, task);
        self.make_ready(task);
        Ok(())
    }

    /// Change a task's base priority. An inherited priority above the new
    /// base stays in force until the mutexes are released.
    #[cfg(feature = "priority-set")]
    pub fn set_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), KernelError> {
        if priority as usize >= MAX_PRIORITIES {
            return Err(KernelError::PriorityOutOfRange);
        }
        self.tcb_mut(task)?.base_priority = priority;
        self.refresh_priority(task);
        Ok(())
    }

    /// Effective priority, including inheritance.
    #[cfg(feature = "priority-get")]
    pub fn get_priority(&self, task: TaskId) -> Result<Priority, KernelError> {
        Ok(self.tcb(task)?.priority)
    }

    /// Priority the task was given, ignoring inheritance.
    pub fn base_priority(&self, task: TaskId) -> Result<Priority, KernelError> {
        Ok(self.tcb(task)?.base_priority)
    }

    /// Block the running task for `ticks`. Zero yields instead.
    #[cfg(feature = "task-delay")]
    pub fn delay(&mut self, ticks: Tick) -> Result<(), KernelError> {
        if ticks == 0 {
            return self.yield_now();
        }
        self.block_current(Timeout::ticks(ticks), None)
    }

    /// Block until `*last_wake + increment`, then advance `last_wake` to
    /// that tick. Gives a fixed period regardless of how long the task ran.
    ///
    /// Returns `false` when the wake tick had already passed, in which
    /// case the task only yields.
    #[cfg(feature = "task-delay-until")]
    pub fn delay_until(&mut self, last_wake: &mut Tick, increment: Tick) -> Result<bool, KernelError> {
        if increment == 0 {
            return Err(KernelError::InvalidParameter);
        }
        self.running_task()?;

        let now = self.tick_count;
        let previous = *last_wake;
        let wake = previous.wrapping_add(increment);
        let should_delay = if now < previous {
            // The tick count wrapped since the last wake.
            wake < previous && wake > now
        } else {
            wake < previous || wake > now
        };
        *last_wake = wake;

        if should_delay {
            self.block_current(Timeout::Ticks(wake.wrapping_sub(now)), None)?;
        } else {
            self.yield_now()?;
        }
        Ok(should_delay)
    }

    /// Give way to other Ready tasks of the same priority.
    pub fn yield_now(&mut self) -> Result<(), KernelError> {
        self.running_task()?;
        self.scheduler.request_rotation();
        self.scheduler.request_switch();
        Ok(())
    }

    #[inline]
    pub fn current_task(&self) -> Option<TaskId> {
        self.scheduler.current()
    }

    pub fn task_state(&self, task: TaskId) -> Result<TaskState, KernelError> {
        Ok(self.tcb(task)?.state)
    }

    pub fn task_info(&self, task: TaskId) -> Result<TaskInfo, KernelError> {
        let tcb = self.tcb(task)?;
        Ok(tcb.info(self.heap.bytes(tcb.stack)))
    }

    /// Live tasks, including the system tasks and those awaiting cleanup.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn tick_count(&self) -> Tick {
        self.tick_count
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn set_idle_hook(&mut self, hook: Option<Callback>) {
        self.idle_hook = hook;
    }

    pub fn set_tick_hook(&mut self, hook: Option<Callback>) {
        self.tick_hook = hook;
    }

    /// Collect the outcome of the running task's last blocking call.
    pub fn take_wait_result(&mut self) -> Result<(), KernelError> {
        let current = self.running_task()?;
        let tcb = self.tcb_mut(current)?;
        tcb.wait_result.take().unwrap_or(Ok(()))
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the tick counter (the SysTick body).
    ///
    /// Wakes every task whose delay or timeout expired and requests
    /// round-robin rotation when the running task shares its priority.
    /// Returns whether a context switch is pending.
    pub fn tick(&mut self) -> bool {
        self.tick_count = self.tick_count.wrapping_add(1);
        let now = self.tick_count;
        if now == 0 {
            self.delayed.switch_lists();
        }

        while let Some((_, task)) = self.delayed.pop_expired(now) {
            let target = self.tasks.get(task.0).and_then(|tcb| tcb.waiting_on);
            if let Some(target) = target {
                self.abort_wait(task, Err(target.timeout_error()));
            }
            self.make_ready(task);
        }

        if USE_PREEMPTION && USE_TIME_SLICING {
            if let Some(current) = self.scheduler.current() {
                if let Some(tcb) = self.tasks.get(current.0) {
                    if tcb.state == TaskState::Running
                        && self.scheduler.ready.len_at(tcb.priority) > 1
                    {
                        self.scheduler.request_rotation();
                        self.scheduler.request_switch();
                    }
                }
            }
        }

        if let Some(hook) = self.tick_hook {
            hook.invoke();
        }
        self.scheduler.is_switch_pending()
    }

    // -----------------------------------------------------------------------
    // Idle
    // -----------------------------------------------------------------------

    /// One pass of the idle task: reclaim self-deleted tasks, run the idle
    /// hook and give way to other priority-0 tasks.
    pub fn idle_step(&mut self) -> IdleStep {
        let mut step = IdleStep::default();
        while let Some(task) = self.terminating.pop() {
            self.free_task(task);
            step.reclaimed += 1;
        }
        if step.reclaimed > 0 {
            log::debug!("idle reclaimed {} task(s)", step.reclaimed);
        }

        if let Some(hook) = self.idle_hook {
            hook.invoke();
        }

        if IDLE_SHOULD_YIELD
            && self.idle_task.is_some()
            && self.scheduler.current() == self.idle_task
            && self.scheduler.ready.len_at(0) > 1
        {
            step.yielded = self.yield_now().is_ok();
        }
        step
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Verify list membership, the ready bitmap, the preemption rule and
    /// priority inheritance.
    ///
    /// The preemption checks only apply while no switch is pending.
    pub fn check_integrity(&self) -> Result<(), Violation> {
        if !self.scheduler.ready.bitmap_consistent() {
            return Err(Violation::ReadyBitmap);
        }

        for (handle, tcb) in self.tasks.iter() {
            let task = TaskId(handle);
            let memberships = [
                (ListMembership::Ready, self.scheduler.ready.contains(task, tcb.priority)),
                (ListMembership::Delayed, self.delayed.contains(task)),
                (ListMembership::Blocked, self.blocked.contains(&task)),
                (ListMembership::Suspended, self.suspended.contains(&task)),
                (ListMembership::Terminating, self.terminating.contains(&task)),
            ];
            let on: usize = memberships.iter().filter(|(_, present)| *present).count();
            let expected = memberships.iter().any(|&(list, present)| list == tcb.list && present);
            if on != 1 || !expected {
                return Err(Violation::ListMembership);
            }
        }
        let listed = self.scheduler.ready.len()
            + self.delayed.len()
            + self.blocked.len()
            + self.suspended.len()
            + self.terminating.len();
        if listed != self.tasks.len() {
            return Err(Violation::DanglingTask);
        }

        if self.scheduler.is_started() && !self.scheduler.is_switch_pending() {
            let current = self.scheduler.current().ok_or(Violation::NoRunnableTask)?;
            let tcb = self.tasks.get(current.0).ok_or(Violation::DanglingTask)?;
            if tcb.state != TaskState::Running
                || self.scheduler.ready.head(tcb.priority) != Some(current)
            {
                return Err(Violation::RunningNotHead);
            }
            if self.scheduler.ready.highest_priority() != Some(tcb.priority) {
                return Err(Violation::PreemptionMissed);
            }
        }

        for (_, mutex) in self.mutexes.iter() {
            let Some(owner) = mutex.owner.and_then(|o| self.tasks.get(o.0)) else {
                continue;
            };
            if let Some(highest) = mutex.waiters.highest_priority(|t| self.priority_of(t)) {
                if owner.priority < highest {
                    return Err(Violation::InheritanceBroken);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    pub(crate) fn tcb(&self, task: TaskId) -> Result<&Tcb, KernelError> {
        self.tasks.get(task.0).ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn tcb_mut(&mut self, task: TaskId) -> Result<&mut Tcb, KernelError> {
        self.tasks.get_mut(task.0).ok_or(KernelError::InvalidHandle)
    }

    /// Effective priority of a task that must exist.
    pub(crate) fn priority_of(&self, task: TaskId) -> Priority {
        match self.tasks.get(task.0) {
            Some(tcb) => tcb.priority,
            None => fatal(Violation::DanglingTask),
        }
    }

    /// The running task, or `BadContext` before the scheduler starts.
    pub(crate) fn running_task(&self) -> Result<TaskId, KernelError> {
        if !self.scheduler.is_started() {
            return Err(KernelError::BadContext);
        }
        self.scheduler.current().ok_or(KernelError::BadContext)
    }

    /// Put `task` at the tail of its ready list, preempting the running
    /// task if it is outranked.
    pub(crate) fn make_ready(&mut self, task: TaskId) {
        let priority = match self.tasks.get_mut(task.0) {
            Some(tcb) => {
                tcb.state = TaskState::Ready;
                tcb.list = ListMembership::Ready;
                tcb.priority
            }
            None => fatal(Violation::DanglingTask),
        };
        self.scheduler.ready.push_back(task, priority);

        if let Some(current) = self.scheduler.current() {
            if current != task && self.scheduler.preempts(priority, self.priority_of(current)) {
                self.scheduler.request_switch();
            }
        }
    }

    /// Move the running task off the ready lists until `timeout` passes or
    /// someone ends its wait on `target`.
    pub(crate) fn block_current(
        &mut self,
        timeout: Timeout,
        target: Option<WaitTarget>,
    ) -> Result<(), KernelError> {
        if timeout.is_poll() {
            return Err(target.map_or(KernelError::TimedOut, |t| t.timeout_error()));
        }
        let current = self.running_task()?;
        let now = self.tick_count;
        let tcb = self.tcb_mut(current)?;
        let priority = tcb.priority;
        tcb.state = TaskState::Blocked;
        tcb.waiting_on = target;
        tcb.wait_result = None;

        match timeout.deadline(now) {
            Some(at) => {
                tcb.list = ListMembership::Delayed;
                tcb.wake_tick = at;
                self.delayed.insert(now, at, current);
            }
            None => {
                tcb.list = ListMembership::Blocked;
                push_or_fatal(&mut self.blocked, current);
            }
        }
        self.scheduler.ready.remove(current, priority);
        self.scheduler.request_switch();
        Ok(())
    }

    /// End the wait of a blocked task with `result` and make it Ready. The
    /// caller has already taken it off the object's wait list.
    pub(crate) fn wake_waiter(&mut self, task: TaskId, result: Result<(), KernelError>) {
        let list = match self.tasks.get_mut(task.0) {
            Some(tcb) => {
                tcb.waiting_on = None;
                tcb.wait_result = Some(result);
                tcb.list
            }
            None => fatal(Violation::DanglingTask),
        };
        match list {
            ListMembership::Delayed => {
                self.delayed.remove(task);
            }
            ListMembership::Blocked => {
                remove_item(&mut self.blocked, task);
            }
            _ => fatal(Violation::ListMembership),
        }
        self.make_ready(task);
    }

    /// Take `task` off whatever object it waits on and record `result`.
    /// Scheduling lists are left alone.
    pub(crate) fn abort_wait(&mut self, task: TaskId, result: Result<(), KernelError>) {
        let Some(tcb) = self.tasks.get_mut(task.0) else {
            return;
        };
        let Some(target) = tcb.waiting_on.take() else {
            return;
        };
        tcb.wait_result = Some(result);

        match target {
            WaitTarget::Mutex(mutex) => {
                let owner = self.mutexes.get_mut(mutex.0).and_then(|m| {
                    m.waiters.remove(task);
                    m.owner
                });
                // The owner may have been inheriting from this waiter.
                if let Some(owner) = owner {
                    self.refresh_priority(owner);
                }
            }
            WaitTarget::Semaphore(semaphore) => {
                if let Some(s) = self.semaphores.get_mut(semaphore.0) {
                    s.waiters.remove(task);
                }
            }
            WaitTarget::TimerQueueSpace => self.timers.cancel_send(task),
            WaitTarget::TimerCommands => {}
        }
    }

    /// Remove `task` from its scheduling list, aborting any wait.
    pub(crate) fn detach(&mut self, task: TaskId) {
        self.abort_wait(task, Err(KernelError::WaitAborted));
        let (list, priority) = match self.tasks.get(task.0) {
            Some(tcb) => (tcb.list, tcb.priority),
            None => return,
        };
        match list {
            ListMembership::Ready => {
                self.scheduler.ready.remove(task, priority);
            }
            ListMembership::Delayed => {
                self.delayed.remove(task);
            }
            ListMembership::Blocked => remove_item(&mut self.blocked, task),
            ListMembership::Suspended => remove_item(&mut self.suspended, task),
            ListMembership::Terminating => remove_item(&mut self.terminating, task),
        }
    }

    /// Drop a detached task from the table and return its memory.
    fn free_task(&mut self, task: TaskId) {
        if let Some(tcb) = self.tasks.remove(task.0) {
            self.heap.free(tcb.stack);
            self.heap.free(tcb.control);
        }
    }

    /// Recompute the effective priority of `task` from its base priority
    /// and the waiters of the mutexes it holds, then follow the chain of
    /// mutex owners it is itself blocked on.
    pub(crate) fn refresh_priority(&mut self, task: TaskId) {
        let mut task = task;
        // A chain can't be longer than the number of tasks.
        for _ in 0..MAX_TASKS {
            let Some(tcb) = self.tasks.get(task.0) else {
                return;
            };
            let mut effective = tcb.base_priority;
            for mutex in tcb.held_mutexes.iter().filter_map(|m| self.mutexes.get(m.0)) {
                if let Some(p) = mutex.waiters.highest_priority(|t| self.priority_of(t)) {
                    effective = effective.max(p);
                }
            }
            let next_owner = match tcb.waiting_on {
                Some(WaitTarget::Mutex(m)) => self.mutexes.get(m.0).and_then(|m| m.owner),
                _ => None,
            };
            if effective == tcb.priority {
                return;
            }
            self.apply_priority(task, effective);
            match next_owner {
                Some(owner) => task = owner,
                None => return,
            }
        }
    }

    /// Set the effective priority of `task`, re-homing it on the ready
    /// lists and requesting a switch when the change affects who runs.
    fn apply_priority(&mut self, task: TaskId, priority: Priority) {
        let (old, list) = match self.tasks.get_mut(task.0) {
            Some(tcb) => {
                let old = tcb.priority;
                tcb.priority = priority;
                (old, tcb.list)
            }
            None => return,
        };
        if old == priority {
            return;
        }
        log::trace!("task {task:?} priority {old} -> {priority}");
        if list != ListMembership::Ready {
            return;
        }

        self.scheduler.ready.remove(task, old);
        let current = self.scheduler.current();
        if current == Some(task) {
            if priority > old {
                // Keep running: stay at the head of the new level.
                self.scheduler.ready.push_front(task, priority);
            } else {
                self.scheduler.ready.push_back(task, priority);
                self.scheduler.request_switch();
            }
        } else {
            self.scheduler.ready.push_back(task, priority);
            if let Some(current) = current {
                if self.scheduler.preempts(priority, self.priority_of(current)) {
                    self.scheduler.request_switch();
                }
            }
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn push_or_fatal<const N: usize>(list: &mut Vec<TaskId, N>, task: TaskId) {
    if list.push(task).is_err() {
        fatal(Violation::ListOverflow);
    }
}

pub(crate) fn remove_item<const N: usize>(list: &mut Vec<TaskId, N>, task: TaskId) {
    if let Some(index) = list.iter().position(|&t| t == task) {
        list.remove(index);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    pub(crate) extern "C" fn spin(_: usize) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    pub(crate) fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// A started kernel plus the tasks created before start.
    pub(crate) fn started(priorities: &[Priority]) -> (Kernel, std::vec::Vec<TaskId>) {
        init_logging();
        let mut kernel = Kernel::new();
        let tasks = priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                kernel
                    .create_task(spin, TaskConfig::new("task", p).with_param(i))
                    .unwrap()
            })
            .collect();
        kernel.start(spin, spin).unwrap();
        settle(&mut kernel);
        // Let the timer service block with nothing to do. A task created
        // earlier at the service's priority is ahead of it and must yield.
        let service = kernel.timers.task.unwrap();
        while kernel.task_state(service).unwrap() != TaskState::Blocked {
            if kernel.current_task() == Some(service) {
                assert!(kernel.timer_service_step().is_empty());
            } else {
                kernel.yield_now().unwrap();
            }
            settle(&mut kernel);
        }
        (kernel, tasks)
    }

    /// Run pending switches and check the invariants, as PendSV would.
    pub(crate) fn settle(kernel: &mut Kernel) -> Option<TaskId> {
        let running = kernel.context_switch();
        kernel.check_integrity().unwrap();
        running
    }

    #[test]
    fn test_start_runs_highest_priority_task() {
        let (mut kernel, tasks) = started(&[1, 3, 2]);
        assert_eq!(kernel.current_task(), Some(tasks[1]));
        assert_eq!(kernel.task_state(tasks[1]), Ok(TaskState::Running));
        assert_eq!(kernel.task_count(), 5);
        assert_eq!(kernel.start(spin, spin), Err(KernelError::AlreadyStarted));
        kernel.check_integrity().unwrap();
    }

    #[test]
    fn test_timer_service_outranks_application_tasks() {
        let mut kernel = Kernel::new();
        kernel.create_task(spin, TaskConfig::new("app", 4)).unwrap();
        let first = kernel.start(spin, spin).unwrap();
        assert_eq!(Some(first), kernel.timers.task);
        assert_eq!(kernel.task_state(first), Ok(TaskState::Running));
    }

    #[test]
    fn test_create_task_validates_parameters() {
        let mut kernel = Kernel::new();
        assert_eq!(
            kernel.create_task(spin, TaskConfig::new("p", 6)).unwrap_err(),
            KernelError::PriorityOutOfRange
        );
        assert_eq!(
            kernel
                .create_task(spin, TaskConfig::new("s", 1).with_stack_words(64))
                .unwrap_err(),
            KernelError::StackTooSmall
        );
        assert_eq!(kernel.task_count(), 0);
    }

    #[test]
    fn test_heap_exhaustion_registers_nothing() {
        let mut kernel = Kernel::new();
        let before = kernel.heap_stats().free_bytes;
        let huge = TaskConfig::new("huge", 1).with_stack_words(8192);
        assert_eq!(
            kernel.create_task(spin, huge).unwrap_err(),
            KernelError::AllocationFailure
        );
        assert_eq!(kernel.task_count(), 0);
        assert_eq!(kernel.heap_stats().free_bytes, before);
        assert!(kernel.scheduler.ready.is_empty());
    }

    #[test]
    fn test_table_exhaustion_returns_memory() {
        let mut kernel = Kernel::new();
        for _ in 0..MAX_TASKS {
            kernel.create_task(spin, TaskConfig::new("t", 1)).unwrap();
        }
        let before = kernel.heap_stats().free_bytes;
        assert_eq!(
            kernel.create_task(spin, TaskConfig::new("t", 1)).unwrap_err(),
            KernelError::AllocationFailure
        );
        assert_eq!(kernel.heap_stats().free_bytes, before);
    }

    #[test]
    fn test_task_info_reports_stack_usage() {
        let mut kernel = Kernel::new();
        let task = kernel
            .create_task(spin, TaskConfig::new("a-very-long-task-name", 2))
            .unwrap();
        let info = kernel.task_info(task).unwrap();
        assert_eq!(info.name.as_str(), "a-very-long-task");
        assert_eq!(info.state, TaskState::Ready);
        assert_eq!(info.stack_words, MINIMAL_STACK_SIZE);
        assert_eq!(
            info.stack_high_water_mark,
            MINIMAL_STACK_SIZE - crate::task::INITIAL_FRAME_WORDS
        );
    }

    #[test]
    fn test_blocking_before_start_is_bad_context() {
        let mut kernel = Kernel::new();
        assert_eq!(kernel.yield_now(), Err(KernelError::BadContext));
        assert_eq!(kernel.take_wait_result(), Err(KernelError::BadContext));
    }

    #[test]
    fn test_request_switch_idempotent_through_kernel() {
        let (mut kernel, tasks) = started(&[1, 1]);
        assert_eq!(kernel.current_task(), Some(tasks[0]));

        let before = kernel.scheduler_stats().context_switches;
        kernel.yield_now().unwrap();
        kernel.yield_now().unwrap();
        kernel.yield_now().unwrap();
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert_eq!(kernel.scheduler_stats().context_switches, before + 1);
        // Nothing pending: no further switch.
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
    }

    #[test]
    fn test_tick_round_robins_equal_priorities() {
        let (mut kernel, tasks) = started(&[2, 2, 2]);
        assert_eq!(kernel.current_task(), Some(tasks[0]));

        assert!(kernel.tick());
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert!(kernel.tick());
        assert_eq!(settle(&mut kernel), Some(tasks[2]));
        assert!(kernel.tick());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
    }

    #[test]
    fn test_lone_task_is_not_rotated() {
        let (mut kernel, tasks) = started(&[3]);
        assert_eq!(kernel.current_task(), Some(tasks[0]));
        assert!(!kernel.tick());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
    }

    #[cfg(feature = "task-delay")]
    #[test]
    fn test_delay_wakes_after_exact_ticks() {
        let (mut kernel, tasks) = started(&[3, 1]);
        assert_eq!(kernel.current_task(), Some(tasks[0]));

        kernel.delay(3).unwrap();
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert_eq!(kernel.task_state(tasks[0]), Ok(TaskState::Blocked));

        kernel.tick();
        kernel.tick();
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert!(kernel.tick());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
        assert_eq!(kernel.take_wait_result(), Ok(()));
    }

    #[cfg(feature = "task-delay")]
    #[test]
    fn test_delay_zero_yields() {
        let (mut kernel, tasks) = started(&[2, 2]);
        kernel.delay(0).unwrap();
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert_eq!(kernel.task_state(tasks[0]), Ok(TaskState::Ready));
    }

    #[cfg(feature = "task-delay")]
    #[test]
    fn test_delay_across_tick_wrap() {
        let (mut kernel, tasks) = started(&[3, 1]);
        kernel.tick_count = Tick::MAX - 2;

        kernel.delay(5).unwrap(); // due at tick 2 of the next epoch
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        for _ in 0..4 {
            kernel.tick();
            assert_eq!(settle(&mut kernel), Some(tasks[1]));
        }
        assert_eq!(kernel.tick_count(), 1);
        kernel.tick();
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
    }

    #[cfg(feature = "task-delay-until")]
    #[test]
    fn test_delay_until_keeps_fixed_period() {
        let (mut kernel, tasks) = started(&[3, 1]);

        let mut last_wake = kernel.tick_count();
        for period in 1..=3u32 {
            // Burn some of the period before delaying.
            kernel.tick();
            assert!(kernel.delay_until(&mut last_wake, 10).unwrap());
            assert_eq!(settle(&mut kernel), Some(tasks[1]));
            while kernel.current_task() != Some(tasks[0]) {
                kernel.tick();
                settle(&mut kernel);
            }
            assert_eq!(kernel.tick_count(), period * 10);
            assert_eq!(last_wake, period * 10);
        }
    }

    #[cfg(feature = "task-delay-until")]
    #[test]
    fn test_delay_until_missed_wake_only_yields() {
        let (mut kernel, _) = started(&[3, 1]);
        let mut last_wake = 0;
        kernel.tick_count = 25;
        assert_eq!(kernel.delay_until(&mut last_wake, 10), Ok(false));
        assert_eq!(last_wake, 10);
        assert_eq!(kernel.delay_until(&mut last_wake, 0), Err(KernelError::InvalidParameter));
    }

    #[cfg(feature = "task-suspend")]
    #[test]
    fn test_suspend_resume_round_trip() {
        let (mut kernel, tasks) = started(&[2, 2, 1]);

        let before: std::vec::Vec<(Priority, TaskId)> = kernel.scheduler.ready.iter().collect();
        kernel.suspend_task(tasks[1]).unwrap();
        assert_eq!(kernel.task_state(tasks[1]), Ok(TaskState::Suspended));
        // Suspending twice is harmless.
        kernel.suspend_task(tasks[1]).unwrap();
        settle(&mut kernel);

        kernel.resume_task(tasks[1]).unwrap();
        assert_eq!(kernel.task_state(tasks[1]), Ok(TaskState::Ready));
        settle(&mut kernel);
        let after: std::vec::Vec<(Priority, TaskId)> = kernel.scheduler.ready.iter().collect();
        assert_eq!(before, after);
    }

    #[cfg(feature = "task-suspend")]
    #[test]
    fn test_suspend_running_task_switches_away() {
        let (mut kernel, tasks) = started(&[4, 1]);
        kernel.suspend_task(tasks[0]).unwrap();
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        kernel.resume_task(tasks[0]).unwrap();
        assert!(kernel.is_switch_pending());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
    }

    #[cfg(all(feature = "task-suspend", feature = "task-delay"))]
    #[test]
    fn test_suspend_aborts_delay() {
        let (mut kernel, tasks) = started(&[4, 1]);
        kernel.delay(5).unwrap();
        settle(&mut kernel);
        kernel.suspend_task(tasks[0]).unwrap();
        for _ in 0..10 {
            kernel.tick();
        }
        assert_eq!(kernel.task_state(tasks[0]), Ok(TaskState::Suspended));
    }

    #[cfg(all(feature = "task-delete", feature = "task-suspend"))]
    #[test]
    fn test_system_tasks_are_protected() {
        let (mut kernel, _) = started(&[1]);
        let idle = kernel.idle_task.unwrap();
        let service = kernel.timers.task.unwrap();
        assert_eq!(kernel.delete_task(idle), Err(KernelError::SystemTask));
        assert_eq!(kernel.suspend_task(service), Err(KernelError::SystemTask));
    }

    #[cfg(feature = "task-delete")]
    #[test]
    fn test_delete_other_task_frees_memory() {
        let (mut kernel, tasks) = started(&[1, 2]);
        let before = kernel.heap_stats().free_bytes;
        kernel.delete_task(tasks[0]).unwrap();
        assert!(kernel.heap_stats().free_bytes > before);
        assert_eq!(kernel.task_state(tasks[0]), Err(KernelError::InvalidHandle));
        settle(&mut kernel);
    }

    #[cfg(feature = "task-delete")]
    #[test]
    fn test_self_delete_is_reclaimed_by_idle() {
        let (mut kernel, tasks) = started(&[1]);
        assert_eq!(kernel.current_task(), Some(tasks[0]));

        let free_before = kernel.heap_stats().free_bytes;
        kernel.delete_task(tasks[0]).unwrap();
        assert_eq!(kernel.task_state(tasks[0]), Ok(TaskState::Deleted));
        assert_eq!(settle(&mut kernel), kernel.idle_task);

        let step = kernel.idle_step();
        assert_eq!(step.reclaimed, 1);
        assert!(kernel.heap_stats().free_bytes > free_before);
        assert_eq!(kernel.task_state(tasks[0]), Err(KernelError::InvalidHandle));
        kernel.check_integrity().unwrap();
    }

    #[test]
    fn test_idle_yields_to_priority_zero_peer() {
        let (mut kernel, tasks) = started(&[0]);
        // The application task was created first, so it leads level 0.
        assert_eq!(kernel.current_task(), Some(tasks[0]));
        kernel.yield_now().unwrap();
        assert_eq!(settle(&mut kernel), kernel.idle_task);

        let step = kernel.idle_step();
        assert!(step.yielded);
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
    }

    #[cfg(all(feature = "priority-set", feature = "priority-get"))]
    #[test]
    fn test_raising_ready_task_preempts() {
        let (mut kernel, tasks) = started(&[2, 1]);
        kernel.set_priority(tasks[1], 3).unwrap();
        assert!(kernel.is_switch_pending());
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert_eq!(kernel.get_priority(tasks[1]), Ok(3));
        assert_eq!(kernel.base_priority(tasks[1]), Ok(3));
    }

    #[cfg(feature = "priority-set")]
    #[test]
    fn test_lowering_running_task_gives_way() {
        let (mut kernel, tasks) = started(&[3, 2]);
        kernel.set_priority(tasks[0], 1).unwrap();
        assert_eq!(settle(&mut kernel), Some(tasks[1]));
        assert_eq!(
            kernel.set_priority(tasks[0], 9),
            Err(KernelError::PriorityOutOfRange)
        );
    }

    #[test]
    fn test_tick_hook_runs_each_tick() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static TICKS: AtomicUsize = AtomicUsize::new(0);
        fn count(_: usize) {
            TICKS.fetch_add(1, Ordering::SeqCst);
        }
        let mut kernel = Kernel::new();
        kernel.set_tick_hook(Some(Callback::new(count, 0)));
        kernel.tick();
        kernel.tick();
        assert_eq!(TICKS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stack_pointer_round_trip() {
        let (mut kernel, _) = started(&[1]);
        let sp = kernel.current_stack_pointer().unwrap();
        kernel.save_stack_pointer(sp - 64);
        assert_eq!(kernel.current_stack_pointer(), Some(sp - 64));
    }

    // -----------------------------------------------------------------------
    // Property tests: random operation sequences
    // -----------------------------------------------------------------------

    /// Decode a byte string into kernel operations and apply them, checking
    /// the invariants after every executed switch.
    #[cfg(all(
        feature = "task-delete",
        feature = "task-suspend",
        feature = "priority-set",
        feature = "task-delay"
    ))]
    fn interpret(program: &[u8]) {
        let (mut kernel, mut tasks) = started(&[1, 2, 3]);
        let mut bytes = program.iter().copied();
        while let Some(op) = bytes.next() {
            let arg = bytes.next().unwrap_or(0);
            let pick = |tasks: &[TaskId]| tasks.get(arg as usize % tasks.len().max(1)).copied();
            match op % 9 {
                0 => {
                    let config = TaskConfig::new("rand", arg % MAX_PRIORITIES as u8);
                    if let Ok(task) = kernel.create_task(spin, config) {
                        tasks.push(task);
                    }
                }
                1 => {
                    if let Some(task) = pick(&tasks) {
                        let _ = kernel.delete_task(task);
                    }
                }
                2 => {
                    if let Some(task) = pick(&tasks) {
                        let _ = kernel.suspend_task(task);
                    }
                }
                3 => {
                    if let Some(task) = pick(&tasks) {
                        let _ = kernel.resume_task(task);
                    }
                }
                4 => {
                    if let Some(task) = pick(&tasks) {
                        let _ = kernel.set_priority(task, (arg >> 4) % MAX_PRIORITIES as u8);
                    }
                }
                5 => {
                    kernel.tick();
                }
                6 => {
                    let _ = kernel.yield_now();
                }
                7 => {
                    if kernel.current_task() != kernel.idle_task {
                        let _ = kernel.delay(Tick::from(arg % 8));
                    }
                }
                _ => {
                    kernel.idle_step();
                }
            }
            settle(&mut kernel);
            tasks.retain(|&t| kernel.task_state(t).is_ok());

            // Membership: every live, non-suspended task is schedulable.
            let live_unsuspended = kernel
                .tasks
                .iter()
                .filter(|(_, tcb)| {
                    !matches!(tcb.state, TaskState::Suspended | TaskState::Deleted)
                })
                .count();
            let schedulable =
                kernel.scheduler.ready.len() + kernel.delayed.len() + kernel.blocked.len();
            assert_eq!(live_unsuspended, schedulable);
        }
    }

    #[cfg(all(
        feature = "task-delete",
        feature = "task-suspend",
        feature = "priority-set",
        feature = "task-delay"
    ))]
    #[quickcheck]
    fn qc_random_operations_keep_invariants(program: std::vec::Vec<u8>) {
        interpret(&program);
    }

    #[cfg(all(
        feature = "task-delete",
        feature = "task-suspend",
        feature = "priority-set",
        feature = "task-delay"
    ))]
    #[test]
    fn test_interpret_regressions() {
        interpret(&[]);
        interpret(&[7, 3, 5, 0, 5, 0, 5, 0, 5, 0]);
        interpret(&[1, 0, 1, 1, 1, 2, 8, 0]);
        interpret(&[2, 2, 7, 1, 3, 2, 4, 0x50]);
    }
}
