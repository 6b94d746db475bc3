//! # Scheduler
//!
//! Fixed-priority preemptive selection with round-robin among equal
//! priorities.
//!
//! ## Scheduling Algorithm
//!
//! 1. **Select**: the head of the highest non-empty ready list. The bitmap in
//!    [`ReadyLists`] makes this O(1); delayed and blocked tasks are never
//!    scanned.
//! 2. **Preempt**: a task becoming Ready above the running priority marks a
//!    switch pending at once.
//! 3. **Rotate**: on a tick (with time slicing) or a yield, the running task
//!    moves behind its equal-priority peers when the pending switch runs.
//!
//! Switch requests are idempotent: however many arrive before the deferred
//! switch executes, it executes once.

use crate::list::ReadyLists;
use crate::task::{Priority, TaskId};

/// Counters kept by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Switches actually executed.
    pub context_switches: u32,
    /// Calls to [`Scheduler::request_switch`].
    pub switch_requests: u32,
    /// Requests absorbed because a switch was already pending.
    pub coalesced_requests: u32,
}

pub struct Scheduler {
    pub(crate) ready: ReadyLists,
    current: Option<TaskId>,
    switch_pending: bool,
    rotate_pending: bool,
    started: bool,
    stats: SchedulerStats,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: ReadyLists::new(),
            current: None,
            switch_pending: false,
            rotate_pending: false,
            started: false,
            stats: SchedulerStats {
                context_switches: 0,
                switch_requests: 0,
                coalesced_requests: 0,
            },
        }
    }

    /// Head of the highest non-empty ready list.
    #[inline]
    pub fn select_next_task(&self) -> Option<TaskId> {
        let priority = self.ready.highest_priority()?;
        self.ready.head(priority)
    }

    /// Ask for a context switch at the next opportunity.
    pub fn request_switch(&mut self) {
        self.stats.switch_requests = self.stats.switch_requests.wrapping_add(1);
        if self.switch_pending {
            self.stats.coalesced_requests = self.stats.coalesced_requests.wrapping_add(1);
        }
        self.switch_pending = true;
    }

    /// Ask for the running task to go behind its peers on the next switch.
    pub fn request_rotation(&mut self) {
        self.rotate_pending = true;
    }

    #[inline]
    pub fn is_switch_pending(&self) -> bool {
        self.switch_pending
    }

    /// Consume the pending request, if any.
    pub(crate) fn take_switch(&mut self) -> bool {
        core::mem::take(&mut self.switch_pending)
    }

    pub(crate) fn take_rotation(&mut self) -> bool {
        core::mem::take(&mut self.rotate_pending)
    }

    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub(crate) fn set_current(&mut self, task: TaskId) {
        if self.current != Some(task) {
            self.stats.context_switches = self.stats.context_switches.wrapping_add(1);
        }
        self.current = Some(task);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    /// Whether a task at `priority` becoming Ready should preempt the
    /// running task whose priority is `running`.
    #[inline]
    pub fn preempts(&self, priority: Priority, running: Priority) -> bool {
        crate::config::USE_PREEMPTION && self.started && priority > running
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ObjectTable;

    #[test]
    fn test_request_switch_is_idempotent() {
        let mut scheduler = Scheduler::new();
        scheduler.request_switch();
        scheduler.request_switch();
        scheduler.request_switch();
        assert!(scheduler.take_switch());
        assert!(!scheduler.take_switch());

        let stats = scheduler.stats();
        assert_eq!(stats.switch_requests, 3);
        assert_eq!(stats.coalesced_requests, 2);
    }

    #[test]
    fn test_select_highest_head() {
        let mut table: ObjectTable<(), 4> = ObjectTable::new();
        let low = TaskId(table.insert(()).unwrap());
        let high_a = TaskId(table.insert(()).unwrap());
        let high_b = TaskId(table.insert(()).unwrap());

        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.select_next_task(), None);
        scheduler.ready.push_back(low, 1);
        scheduler.ready.push_back(high_a, 3);
        scheduler.ready.push_back(high_b, 3);
        assert_eq!(scheduler.select_next_task(), Some(high_a));

        scheduler.ready.rotate_to_back(high_a, 3);
        assert_eq!(scheduler.select_next_task(), Some(high_b));
    }

    #[test]
    fn test_no_preemption_before_start() {
        let mut scheduler = Scheduler::new();
        assert!(!scheduler.preempts(5, 0));
        scheduler.mark_started();
        assert!(scheduler.preempts(5, 0));
        assert!(!scheduler.preempts(2, 2));
    }
}
