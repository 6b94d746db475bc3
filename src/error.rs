//! # Errors
//!
//! Caller-visible failures are [`KernelError`] values returned through
//! `Result`. Internal consistency failures are [`Violation`]s and never
//! reach a caller: they go to [`fatal`], which halts the system because the
//! scheduler's data structures can no longer be trusted.

use core::fmt;

/// Error returned by a kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The heap or an object table is exhausted. Nothing was registered.
    AllocationFailure,
    /// A blocking call's deadline elapsed. The object is unchanged.
    TimedOut,
    /// The caller does not own the mutex it tried to release or delete.
    NotOwner,
    /// The timer command queue is full.
    QueueFull,
    /// Priority is not below [`MAX_PRIORITIES`](crate::config::MAX_PRIORITIES).
    PriorityOutOfRange,
    /// The handle does not name a live object.
    InvalidHandle,
    /// Requested stack is below [`MINIMAL_STACK_SIZE`](crate::config::MINIMAL_STACK_SIZE).
    StackTooSmall,
    /// An interrupt-context call would have to block.
    WouldBlock,
    /// The semaphore is already at its maximum count.
    Full,
    /// The calling task already owns the mutex.
    Deadlock,
    /// The operation needs a running task (or a started scheduler).
    BadContext,
    /// A numeric argument is out of its valid range.
    InvalidParameter,
    /// The wait ended because the task was suspended or the object deleted.
    WaitAborted,
    /// The idle and timer service tasks can't be deleted or suspended.
    SystemTask,
    /// The scheduler is already running.
    AlreadyStarted,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AllocationFailure => "kernel heap or object table exhausted",
            Self::TimedOut => "timed out",
            Self::NotOwner => "mutex is not owned by the caller",
            Self::QueueFull => "timer command queue is full",
            Self::PriorityOutOfRange => "priority out of range",
            Self::InvalidHandle => "invalid handle",
            Self::StackTooSmall => "stack smaller than the minimal stack size",
            Self::WouldBlock => "operation would block",
            Self::Full => "semaphore count at maximum",
            Self::Deadlock => "mutex already owned by the caller",
            Self::BadContext => "no running task",
            Self::InvalidParameter => "invalid parameter",
            Self::WaitAborted => "wait aborted",
            Self::SystemTask => "operation not permitted on a system task",
            Self::AlreadyStarted => "scheduler already started",
        };
        f.write_str(msg)
    }
}

/// An internal invariant that no longer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A task is on a list that disagrees with its recorded membership, or
    /// on more than one scheduling list.
    ListMembership,
    /// A bounded list ran out of room although capacity matches the task
    /// table.
    ListOverflow,
    /// The ready bitmap disagrees with the ready lists.
    ReadyBitmap,
    /// A Ready task outranks the running task with no switch pending.
    PreemptionMissed,
    /// The running task is not the head of its ready list.
    RunningNotHead,
    /// A mutex owner runs below one of its waiters.
    InheritanceBroken,
    /// No task is Ready, not even the idle task.
    NoRunnableTask,
    /// A heap block header is corrupted or freed twice.
    HeapCorrupted,
    /// The delayed list still held entries when the tick counter wrapped.
    TickWrap,
    /// A list or table referenced a task that doesn't exist.
    DanglingTask,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Halt on an internal invariant violation.
///
/// On the target this masks every maskable interrupt and spins forever.
/// On hosted builds it panics so tests can observe it.
#[cold]
#[inline(never)]
pub fn fatal(violation: Violation) -> ! {
    log::error!("kernel invariant violated: {violation}");
    halt(violation)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn halt(_violation: Violation) -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::nop();
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn halt(violation: Violation) -> ! {
    panic!("kernel invariant violated: {violation}");
}

/// Check an internal invariant, halting through [`fatal`] if it fails.
macro_rules! kassert {
    ($cond:expr, $violation:expr) => {
        if !$cond {
            $crate::error::fatal($violation);
        }
    };
}
pub(crate) use kassert;
