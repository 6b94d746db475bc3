//! # Task Control Block
//!
//! Defines the task model: handles, states, creation parameters, the
//! control block the kernel keeps per task, and the initial stack frame a
//! new task is started from.

use core::fmt;

use heapless::{String, Vec};

use crate::config::{MAX_MUTEXES, MAX_TASK_NAME_LEN, MINIMAL_STACK_SIZE, STACK_FILL_BYTE};
use crate::error::KernelError;
use crate::heap::HeapBlock;
use crate::sync::{MutexId, SemaphoreId};
use crate::table::define_handle;
use crate::time::Tick;

/// Task priority. Higher values are more urgent; `0` is the idle level.
pub type Priority = u8;

/// Task entry point. The argument is [`TaskConfig::param`].
pub type TaskEntry = extern "C" fn(usize) -> !;

define_handle!(
    /// Handle to a task.
    TaskId
);

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///              select            block / delay
///   Ready ───────────► Running ───────────────► Blocked
///     ▲    preempt /      │                        │
///     └──── yield ────────┘                        │
///     ▲            wake / timeout / give           │
///     └────────────────────────────────────────────┘
///
///   any ── suspend ──► Suspended ── resume ──► Ready
///   any ── delete ───► Deleted (freed at once, or by idle if self-deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Ready to run and waiting in its priority's ready list.
    Ready,
    /// Currently executing.
    Running,
    /// Waiting for a tick, an object, or queue space.
    Blocked,
    /// Excluded from scheduling until resumed.
    Suspended,
    /// Deleted itself; memory is reclaimed by the idle task.
    Deleted,
}

/// The scheduling list a task currently sits on. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListMembership {
    Ready,
    Delayed,
    Blocked,
    Suspended,
    Terminating,
}

/// What a blocked task is waiting for, besides (possibly) a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    /// A sender waiting for room in the timer command queue.
    TimerQueueSpace,
    /// The timer service waiting for a command or the next expiry.
    TimerCommands,
}

impl WaitTarget {
    /// Error reported to the waiter when its deadline passes first.
    pub(crate) const fn timeout_error(self) -> KernelError {
        match self {
            Self::TimerQueueSpace => KernelError::QueueFull,
            _ => KernelError::TimedOut,
        }
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Task or timer name, silently truncated to
/// [`MAX_TASK_NAME_LEN`] bytes on a character boundary.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TaskName(String<MAX_TASK_NAME_LEN>);

impl TaskName {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(MAX_TASK_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut s = String::new();
        // Can't fail: `end` is within capacity.
        let _ = s.push_str(&name[..end]);
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Creation parameters for a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Descriptive name; truncated to 16 bytes.
    pub name: &'static str,
    /// Base priority, below [`MAX_PRIORITIES`](crate::config::MAX_PRIORITIES).
    pub priority: Priority,
    /// Stack depth in 32-bit words, at least [`MINIMAL_STACK_SIZE`].
    pub stack_words: usize,
    /// Passed to the entry function in `r0`.
    pub param: usize,
}

impl TaskConfig {
    /// A task with the minimal stack and a zero parameter.
    pub const fn new(name: &'static str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            stack_words: MINIMAL_STACK_SIZE,
            param: 0,
        }
    }

    pub const fn with_stack_words(mut self, stack_words: usize) -> Self {
        self.stack_words = stack_words;
        self
    }

    pub const fn with_param(mut self, param: usize) -> Self {
        self.param = param;
        self
    }
}

/// Snapshot returned by [`Kernel::task_info`](crate::kernel::Kernel::task_info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: TaskName,
    pub state: TaskState,
    /// Effective priority, including inheritance.
    pub priority: Priority,
    pub base_priority: Priority,
    /// Stack depth in words.
    pub stack_words: usize,
    /// Fewest words that have ever been free on the stack.
    pub stack_high_water_mark: usize,
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// A function plus the context word it is called with. Used for timer
/// expiry callbacks and the idle and tick hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callback {
    pub func: fn(usize),
    pub context: usize,
}

impl Callback {
    pub const fn new(func: fn(usize), context: usize) -> Self {
        Self { func, context }
    }

    #[inline]
    pub fn invoke(self) {
        (self.func)(self.context)
    }
}

/// A function call deferred to the timer service task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendedCall {
    pub func: fn(usize, u32),
    pub arg1: usize,
    pub arg2: u32,
}

impl PendedCall {
    #[inline]
    pub fn invoke(self) {
        (self.func)(self.arg1, self.arg2)
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Per-task kernel record. Its footprint is also charged to the heap.
pub(crate) struct Tcb {
    pub name: TaskName,
    /// Effective priority: base raised by inheritance.
    pub priority: Priority,
    pub base_priority: Priority,
    pub state: TaskState,
    pub list: ListMembership,
    /// Saved process stack pointer as a byte offset into the heap arena.
    pub saved_sp: usize,
    pub stack: HeapBlock,
    /// Heap block charged for this record.
    pub control: HeapBlock,
    /// Tick the task leaves the delayed list at, if it is on it.
    pub wake_tick: Tick,
    pub waiting_on: Option<WaitTarget>,
    /// Outcome of the last blocking call, set by whoever ended the wait.
    pub wait_result: Option<Result<(), KernelError>>,
    /// Held mutexes in acquisition order.
    pub held_mutexes: Vec<MutexId, MAX_MUTEXES>,
    /// Idle and timer service tasks.
    pub system: bool,
}

impl Tcb {
    pub fn info(&self, stack: &[u8]) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            base_priority: self.base_priority,
            stack_words: self.stack.len() / 4,
            stack_high_water_mark: stack_high_water_mark(stack),
        }
    }
}

// ---------------------------------------------------------------------------
// Initial stack frame
// ---------------------------------------------------------------------------

/// Exception return into Thread mode on the process stack with a basic
/// (non-FPU) frame, secure state.
pub const INITIAL_EXC_RETURN: u32 = 0xFFFF_FFFD;
/// Thumb bit.
pub const INITIAL_XPSR: u32 = 0x0100_0000;
/// Words in the initial frame: PSPLIM, EXC_RETURN, r4-r11, then the
/// hardware frame r0-r3, r12, lr, pc, xPSR.
pub const INITIAL_FRAME_WORDS: usize = 18;

/// Fill `stack` with the watermark byte and lay down the frame the
/// context-switch handler restores a task from.
///
/// `base_address` is the absolute address of `stack[0]`. Returns the byte
/// offset inside `stack` of the initial stack pointer.
pub(crate) fn init_stack(stack: &mut [u8], base_address: usize, entry: TaskEntry, param: usize) -> usize {
    stack.fill(STACK_FILL_BYTE);

    // AAPCS wants an 8-byte aligned top of stack.
    let top = ((base_address + stack.len()) & !0x07) - base_address;
    let frame = top - INITIAL_FRAME_WORDS * 4;

    let words: [u32; INITIAL_FRAME_WORDS] = [
        base_address as u32, // PSPLIM
        INITIAL_EXC_RETURN,
        0, 0, 0, 0, 0, 0, 0, 0, // r4-r11
        param as u32,           // r0
        0, 0, 0, 0,             // r1-r3, r12
        task_exit as usize as u32, // lr
        entry as usize as u32,     // pc
        INITIAL_XPSR,
    ];
    for (i, word) in words.iter().enumerate() {
        let at = frame + i * 4;
        stack[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
    frame
}

/// Words at the low end of `stack` that still hold the fill pattern.
pub(crate) fn stack_high_water_mark(stack: &[u8]) -> usize {
    stack.iter().take_while(|&&b| b == STACK_FILL_BYTE).count() / 4
}

/// Landing pad for a task that returns from its entry function.
extern "C" fn task_exit() -> ! {
    log::error!("task returned from its entry function");
    loop {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::wfi();
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        core::hint::spin_loop();
    }
}
