//! Counting semaphore.
//!
//! The count stays within `0..=max`. A give with a task waiting passes the
//! token straight to the most urgent waiter instead of touching the count,
//! so the woken task doesn't race anyone for it.

use crate::error::KernelError;
use crate::heap::HeapBlock;
use crate::kernel::{Acquire, Kernel};
use crate::list::WaitQueue;
use crate::table::define_handle;
use crate::task::{TaskId, WaitTarget};
use crate::time::Timeout;

define_handle!(
    /// Handle to a counting or binary semaphore.
    SemaphoreId
);

pub(crate) struct Semaphore {
    count: u32,
    max: u32,
    pub waiters: WaitQueue,
    control: HeapBlock,
}

impl Kernel {
    /// Create a semaphore holding `initial` of at most `max` tokens.
    pub fn create_semaphore(&mut self, max: u32, initial: u32) -> Result<SemaphoreId, KernelError> {
        if max == 0 || initial > max {
            return Err(KernelError::InvalidParameter);
        }
        let control = self.heap.allocate(core::mem::size_of::<Semaphore>())?;
        let semaphore = Semaphore {
            count: initial,
            max,
            waiters: WaitQueue::new(),
            control,
        };
        match self.semaphores.insert(semaphore) {
            Ok(handle) => {
                let id = SemaphoreId(handle);
                log::debug!("created semaphore {id:?} ({initial}/{max})");
                Ok(id)
            }
            Err(_) => {
                self.heap.free(control);
                Err(KernelError::AllocationFailure)
            }
        }
    }

    /// A semaphore with one slot, created empty.
    pub fn create_binary_semaphore(&mut self) -> Result<SemaphoreId, KernelError> {
        self.create_semaphore(1, 0)
    }

    /// Delete a semaphore. Waiters wake with [`KernelError::WaitAborted`].
    pub fn delete_semaphore(&mut self, semaphore: SemaphoreId) -> Result<(), KernelError> {
        let removed = self
            .semaphores
            .remove(semaphore.0)
            .ok_or(KernelError::InvalidHandle)?;
        for waiter in removed.waiters.iter() {
            self.wake_waiter(waiter, Err(KernelError::WaitAborted));
        }
        self.heap.free(removed.control);
        log::debug!("deleted semaphore {semaphore:?}");
        Ok(())
    }

    /// Take a token, or queue the caller for up to `timeout`.
    pub fn semaphore_take(
        &mut self,
        semaphore: SemaphoreId,
        timeout: Timeout,
    ) -> Result<Acquire, KernelError> {
        let s = self.semaphore_mut(semaphore)?;
        if s.count > 0 {
            s.count -= 1;
            return Ok(Acquire::Acquired);
        }
        if timeout.is_poll() {
            return Err(KernelError::TimedOut);
        }

        let caller = self.running_task()?;
        self.semaphore_mut(semaphore)?.waiters.push(caller);
        self.block_current(timeout, Some(WaitTarget::Semaphore(semaphore)))?;
        Ok(Acquire::Blocked)
    }

    /// Take a token from interrupt context. Never blocks.
    pub fn semaphore_take_from_isr(&mut self, semaphore: SemaphoreId) -> Result<(), KernelError> {
        let s = self.semaphore_mut(semaphore)?;
        if s.count == 0 {
            return Err(KernelError::WouldBlock);
        }
        s.count -= 1;
        Ok(())
    }

    /// Return a token, waking the most urgent waiter if there is one.
    pub fn semaphore_give(&mut self, semaphore: SemaphoreId) -> Result<(), KernelError> {
        self.give(semaphore).map(|_| ())
    }

    /// Give from interrupt context. Returns whether the woken task outranks
    /// the interrupted one, i.e. whether the ISR should request a switch.
    pub fn semaphore_give_from_isr(&mut self, semaphore: SemaphoreId) -> Result<bool, KernelError> {
        let woken = self.give(semaphore)?;
        let running = self.scheduler.current().map(|t| self.priority_of(t));
        Ok(match (woken, running) {
            (Some(task), Some(running)) => self.priority_of(task) > running,
            _ => false,
        })
    }

    pub fn semaphore_count(&self, semaphore: SemaphoreId) -> Result<u32, KernelError> {
        self.semaphores
            .get(semaphore.0)
            .map(|s| s.count)
            .ok_or(KernelError::InvalidHandle)
    }

    /// Shared give path; returns the task that received the token.
    fn give(&mut self, semaphore: SemaphoreId) -> Result<Option<TaskId>, KernelError> {
        let waiter = {
            let tasks = &self.tasks;
            let s = self
                .semaphores
                .get_mut(semaphore.0)
                .ok_or(KernelError::InvalidHandle)?;
            match s.waiters.pop_highest(|t| tasks.get(t.0).map_or(0, |tcb| tcb.priority)) {
                Some(waiter) => Some(waiter),
                None if s.count >= s.max => return Err(KernelError::Full),
                None => {
                    s.count += 1;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            self.wake_waiter(waiter, Ok(()));
        }
        Ok(waiter)
    }

    fn semaphore_mut(&mut self, semaphore: SemaphoreId) -> Result<&mut Semaphore, KernelError> {
        self.semaphores
            .get_mut(semaphore.0)
            .ok_or(KernelError::InvalidHandle)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::KernelError;
    use crate::kernel::tests::{settle, started};
    use crate::kernel::{Acquire, Kernel};
    use crate::time::Timeout;

    #[test]
    fn test_parameters_are_validated() {
        let mut kernel = Kernel::new();
        assert_eq!(kernel.create_semaphore(0, 0), Err(KernelError::InvalidParameter));
        assert_eq!(kernel.create_semaphore(2, 3), Err(KernelError::InvalidParameter));
        let s = kernel.create_binary_semaphore().unwrap();
        assert_eq!(kernel.semaphore_count(s), Ok(0));
    }

    #[test]
    fn test_give_at_max_is_full() {
        let mut kernel = Kernel::new();
        let s = kernel.create_semaphore(3, 3).unwrap();
        assert_eq!(kernel.semaphore_give(s), Err(KernelError::Full));
        assert_eq!(kernel.semaphore_count(s), Ok(3));

        kernel.semaphore_take_from_isr(s).unwrap();
        kernel.semaphore_give(s).unwrap();
        assert_eq!(kernel.semaphore_give_from_isr(s), Err(KernelError::Full));
        assert_eq!(kernel.semaphore_count(s), Ok(3));
    }

    #[test]
    fn test_isr_take_never_blocks() {
        let mut kernel = Kernel::new();
        let s = kernel.create_semaphore(2, 1).unwrap();
        assert_eq!(kernel.semaphore_take_from_isr(s), Ok(()));
        assert_eq!(kernel.semaphore_take_from_isr(s), Err(KernelError::WouldBlock));
        assert_eq!(kernel.semaphore_take(s, Timeout::Poll), Err(KernelError::TimedOut));
    }

    #[test]
    fn test_count_tracks_gives_minus_takes() {
        let (mut kernel, _) = started(&[1]);
        let s = kernel.create_semaphore(10, 0).unwrap();
        for _ in 0..7 {
            kernel.semaphore_give(s).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(kernel.semaphore_take(s, Timeout::Forever), Ok(Acquire::Acquired));
        }
        assert_eq!(kernel.semaphore_count(s), Ok(4));
    }

    #[cfg(all(feature = "task-suspend", feature = "task-delete"))]
    #[test]
    fn test_give_wakes_highest_priority_waiter_first() {
        let (mut kernel, tasks) = started(&[2, 3, 1]);
        let (two, three, giver) = (tasks[0], tasks[1], tasks[2]);
        let s = kernel.create_semaphore(2, 0).unwrap();

        // The priority-2 task starts waiting before the priority-3 one.
        kernel.suspend_task(three).unwrap();
        settle(&mut kernel);
        assert_eq!(kernel.semaphore_take(s, Timeout::Forever), Ok(Acquire::Blocked));
        kernel.resume_task(three).unwrap();
        assert_eq!(settle(&mut kernel), Some(three));
        assert_eq!(kernel.semaphore_take(s, Timeout::Forever), Ok(Acquire::Blocked));
        assert_eq!(settle(&mut kernel), Some(giver));

        // Woken from an interrupt: still the highest waiter, not the first.
        assert_eq!(kernel.semaphore_give_from_isr(s), Ok(true));
        assert_eq!(settle(&mut kernel), Some(three));
        assert_eq!(kernel.take_wait_result(), Ok(()));
        assert_eq!(kernel.semaphore_count(s), Ok(0));
        assert_eq!(kernel.task_state(two), Ok(crate::task::TaskState::Blocked));

        kernel.delete_task(three).unwrap();
        settle(&mut kernel);
        assert_eq!(kernel.semaphore_give_from_isr(s), Ok(true));
        assert_eq!(settle(&mut kernel), Some(two));
    }

    #[test]
    fn test_zero_tick_timeout_never_blocks() {
        let (mut kernel, tasks) = started(&[3, 1]);
        let s = kernel.create_binary_semaphore().unwrap();
        kernel.tick_count = u32::MAX;
        assert_eq!(kernel.semaphore_take(s, Timeout::Ticks(0)), Err(KernelError::TimedOut));
        assert!(!kernel.is_switch_pending());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));

        kernel.tick();
        assert_eq!(kernel.tick_count(), 0);
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
    }

    #[test]
    fn test_give_from_isr_reports_woken_task() {
        let (mut kernel, tasks) = started(&[3, 1]);
        let s = kernel.create_binary_semaphore().unwrap();
        assert_eq!(kernel.semaphore_take(s, Timeout::Forever), Ok(Acquire::Blocked));
        assert_eq!(settle(&mut kernel), Some(tasks[1]));

        assert_eq!(kernel.semaphore_give_from_isr(s), Ok(true));
        assert!(kernel.is_switch_pending());
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
        assert_eq!(kernel.semaphore_give_from_isr(s), Ok(false));
        assert_eq!(kernel.semaphore_count(s), Ok(1));
    }

    #[test]
    fn test_take_timeout_leaves_count() {
        let (mut kernel, tasks) = started(&[3, 1]);
        let s = kernel.create_binary_semaphore().unwrap();
        assert_eq!(kernel.semaphore_take(s, Timeout::Ticks(3)), Ok(Acquire::Blocked));
        settle(&mut kernel);
        for _ in 0..3 {
            kernel.tick();
        }
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
        assert_eq!(kernel.take_wait_result(), Err(KernelError::TimedOut));
        assert_eq!(kernel.semaphore_count(s), Ok(0));
    }

    #[test]
    fn test_delete_aborts_waiters() {
        let (mut kernel, tasks) = started(&[3, 1]);
        let s = kernel.create_binary_semaphore().unwrap();
        let _ = kernel.semaphore_take(s, Timeout::Forever).unwrap();
        settle(&mut kernel);
        kernel.delete_semaphore(s).unwrap();
        assert_eq!(settle(&mut kernel), Some(tasks[0]));
        assert_eq!(kernel.take_wait_result(), Err(KernelError::WaitAborted));
        assert_eq!(kernel.semaphore_give(s), Err(KernelError::InvalidHandle));
    }
}
