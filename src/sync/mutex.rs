//! Mutex with priority inheritance.
//!
//! While a mutex is held, its owner runs at no less than the priority of
//! the most urgent waiter. Inheritance is transitive: if the owner is itself
//! blocked on another mutex, that mutex's owner is raised too. On release
//! the mutex passes directly to the highest-priority, earliest waiter, and
//! the releaser drops back to whatever its remaining mutexes justify.

use crate::error::{fatal, KernelError, Violation};
use crate::heap::HeapBlock;
use crate::kernel::{Acquire, Kernel};
use crate::list::WaitQueue;
use crate::table::define_handle;
use crate::task::{TaskId, WaitTarget};
use crate::time::Timeout;

define_handle!(
    /// Handle to a mutex.
    MutexId
);

pub(crate) struct Mutex {
    pub owner: Option<TaskId>,
    pub waiters: WaitQueue,
    control: HeapBlock,
}

impl Kernel {
    pub fn create_mutex(&mut self) -> Result<MutexId, KernelError> {
        let control = self.heap.allocate(core::mem::size_of::<Mutex>())?;
        let mutex = Mutex {
            owner: None,
            waiters: WaitQueue::new(),
            control,
        };
        match self.mutexes.insert(mutex) {
            Ok(handle) => {
                let id = MutexId(handle);
                log::debug!("created mutex {id:?}");
                Ok(id)
            }
            Err(_) => {
                self.heap.free(control);
                Err(KernelError::AllocationFailure)
            }
        }
    }

    /// Delete a mutex that is free or held by the caller. Waiters wake
    /// with [`KernelError::WaitAborted`].
    pub fn delete_mutex(&mut self, mutex: MutexId) -> Result<(), KernelError> {
        let owner = self.mutex(mutex)?.owner;
        let caller = self.scheduler.current();
        if let Some(owner) = owner {
            let owner_alive = self.tasks.contains(owner.0);
            if owner_alive && Some(owner) != caller {
                log::warn!("mutex {mutex:?} is held by {owner:?}, not deleting");
                return Err(KernelError::NotOwner);
            }
        }

        let Some(removed) = self.mutexes.remove(mutex.0) else {
            return Err(KernelError::InvalidHandle);
        };
        for waiter in removed.waiters.iter() {
            self.wake_waiter(waiter, Err(KernelError::WaitAborted));
        }
        if let Some(owner) = owner.filter(|&o| Some(o) == caller) {
            if let Ok(tcb) = self.tcb_mut(owner) {
                tcb.held_mutexes.retain(|&m| m != mutex);
            }
            self.refresh_priority(owner);
        }
        self.heap.free(removed.control);
        log::debug!("deleted mutex {mutex:?}");
        Ok(())
    }

    /// Take the mutex, or queue the caller for up to `timeout`.
    ///
    /// With [`Timeout::Poll`] a held mutex fails at once with
    /// [`KernelError::TimedOut`].
    pub fn mutex_acquire(&mut self, mutex: MutexId, timeout: Timeout) -> Result<Acquire, KernelError> {
        let caller = self.running_task()?;
        let owner = self.mutex(mutex)?.owner;

        match owner {
            None => {
                self.mutex_mut(mutex)?.owner = Some(caller);
                if self.tcb_mut(caller)?.held_mutexes.push(mutex).is_err() {
                    fatal(Violation::ListOverflow);
                }
                Ok(Acquire::Acquired)
            }
            Some(owner) if owner == caller => Err(KernelError::Deadlock),
            Some(owner) => {
                if timeout.is_poll() {
                    return Err(KernelError::TimedOut);
                }
                self.mutex_mut(mutex)?.waiters.push(caller);
                self.block_current(timeout, Some(WaitTarget::Mutex(mutex)))?;
                self.refresh_priority(owner);
                Ok(Acquire::Blocked)
            }
        }
    }

    /// Release a mutex held by the caller, handing it to the next waiter.
    pub fn mutex_release(&mut self, mutex: MutexId) -> Result<(), KernelError> {
        let caller = self.running_task()?;
        if self.mutex(mutex)?.owner != Some(caller) {
            log::warn!("task {caller:?} released mutex {mutex:?} it does not own");
            return Err(KernelError::NotOwner);
        }
        self.tcb_mut(caller)?.held_mutexes.retain(|&m| m != mutex);

        let next = {
            let tasks = &self.tasks;
            let m = self.mutexes.get_mut(mutex.0).ok_or(KernelError::InvalidHandle)?;
            let next = m.waiters.pop_highest(|t| tasks.get(t.0).map_or(0, |tcb| tcb.priority));
            m.owner = next;
            next
        };
        if let Some(next) = next {
            if self.tcb_mut(next)?.held_mutexes.push(mutex).is_err() {
                fatal(Violation::ListOverflow);
            }
            self.wake_waiter(next, Ok(()));
            // The new owner inherits from whoever still waits.
            self.refresh_priority(next);
        }
        self.refresh_priority(caller);
        Ok(())
    }

    /// Current owner. A deleted owner is still reported.
    pub fn mutex_holder(&self, mutex: MutexId) -> Result<Option<TaskId>, KernelError> {
        Ok(self.mutex(mutex)?.owner)
    }

    fn mutex(&self, mutex: MutexId) -> Result<&Mutex, KernelError> {
        self.mutexes.get(mutex.0).ok_or(KernelError::InvalidHandle)
    }

    fn mutex_mut(&mut self, mutex: MutexId) -> Result<&mut Mutex, KernelError> {
        self.mutexes.get_mut(mutex.0).ok_or(KernelError::InvalidHandle)
    }
}
