//! # Task Lists
//!
//! Handle-based replacements for intrusive linked lists:
//!
//! - [`ReadyLists`]: one FIFO per priority level plus a bitmap of non-empty
//!   levels, so the highest ready priority is a single leading-zero count.
//! - [`WaitQueue`]: tasks blocked on one object, in arrival order. Wake-up
//!   order (priority, then FIFO) is decided when a task is woken, because
//!   waiter priorities can change while they wait.

use heapless::{Deque, Vec};

use crate::config::{MAX_PRIORITIES, MAX_TASKS};
use crate::error::{fatal, Violation};
use crate::task::{Priority, TaskId};

/// Per-priority ready queues.
pub struct ReadyLists {
    levels: [Deque<TaskId, MAX_TASKS>; MAX_PRIORITIES],
    bitmap: u32,
}

impl ReadyLists {
    pub const fn new() -> Self {
        Self {
            levels: [const { Deque::new() }; MAX_PRIORITIES],
            bitmap: 0,
        }
    }

    /// Append `task` to the tail of its level.
    pub fn push_back(&mut self, task: TaskId, priority: Priority) {
        let level = &mut self.levels[priority as usize];
        if level.push_back(task).is_err() {
            fatal(Violation::ListOverflow);
        }
        self.bitmap |= 1 << priority;
    }

    /// Put `task` at the head of its level.
    pub fn push_front(&mut self, task: TaskId, priority: Priority) {
        let level = &mut self.levels[priority as usize];
        if level.push_front(task).is_err() {
            fatal(Violation::ListOverflow);
        }
        self.bitmap |= 1 << priority;
    }

    /// Remove `task` from `priority`'s level, keeping the others' order.
    pub fn remove(&mut self, task: TaskId, priority: Priority) -> bool {
        let level = &mut self.levels[priority as usize];
        let found = remove_from_deque(level, task);
        if level.is_empty() {
            self.bitmap &= !(1 << priority);
        }
        found
    }

    /// Move `task` from the head position to the tail of its level.
    pub fn rotate_to_back(&mut self, task: TaskId, priority: Priority) {
        if self.remove(task, priority) {
            self.push_back(task, priority);
        }
    }

    /// Highest priority with at least one ready task.
    #[inline]
    pub fn highest_priority(&self) -> Option<Priority> {
        if self.bitmap == 0 {
            None
        } else {
            Some((31 - self.bitmap.leading_zeros()) as Priority)
        }
    }

    /// The task that runs next at `priority`.
    pub fn head(&self, priority: Priority) -> Option<TaskId> {
        self.levels[priority as usize].front().copied()
    }

    pub fn len_at(&self, priority: Priority) -> usize {
        self.levels[priority as usize].len()
    }

    pub fn contains(&self, task: TaskId, priority: Priority) -> bool {
        self.levels[priority as usize].iter().any(|&t| t == task)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(Deque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Every ready task with the level it sits on, highest level first.
    pub fn iter(&self) -> impl Iterator<Item = (Priority, TaskId)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(p, level)| level.iter().map(move |&t| (p as Priority, t)))
    }

    /// Whether the bitmap mirrors which levels are non-empty.
    pub fn bitmap_consistent(&self) -> bool {
        self.levels
            .iter()
            .enumerate()
            .all(|(p, level)| level.is_empty() == (self.bitmap & (1 << p) == 0))
    }
}

impl Default for ReadyLists {
    fn default() -> Self {
        Self::new()
    }
}

/// Tasks blocked on one kernel object.
#[derive(Debug)]
pub struct WaitQueue {
    waiters: Vec<TaskId, MAX_TASKS>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    pub fn push(&mut self, task: TaskId) {
        if self.waiters.push(task).is_err() {
            fatal(Violation::ListOverflow);
        }
    }

    pub fn remove(&mut self, task: TaskId) -> bool {
        match self.waiters.iter().position(|&t| t == task) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// The waiter to wake next: highest priority, earliest arrival on ties.
    pub fn highest<F>(&self, mut priority_of: F) -> Option<TaskId>
    where
        F: FnMut(TaskId) -> Priority,
    {
        let mut best: Option<(TaskId, Priority)> = None;
        for &task in &self.waiters {
            let priority = priority_of(task);
            if best.map_or(true, |(_, p)| priority > p) {
                best = Some((task, priority));
            }
        }
        best.map(|(task, _)| task)
    }

    /// Highest priority among the waiters.
    pub fn highest_priority<F>(&self, priority_of: F) -> Option<Priority>
    where
        F: FnMut(TaskId) -> Priority,
    {
        self.waiters.iter().map(|&t| t).map(priority_of).max()
    }

    /// Remove and return the waiter [`highest`](Self::highest) selects.
    pub fn pop_highest<F>(&mut self, priority_of: F) -> Option<TaskId>
    where
        F: FnMut(TaskId) -> Priority,
    {
        let task = self.highest(priority_of)?;
        self.remove(task);
        Some(task)
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.waiters.contains(&task)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.waiters.iter().copied()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `task` from `deque`, keeping the relative order of the rest.
fn remove_from_deque<const N: usize>(deque: &mut Deque<TaskId, N>, task: TaskId) -> bool {
    let mut found = false;
    for _ in 0..deque.len() {
        if let Some(t) = deque.pop_front() {
            if t == task && !found {
                found = true;
            } else {
                // Can't fail: one element was just popped.
                let _ = deque.push_back(t);
            }
        }
    }
    found
}
