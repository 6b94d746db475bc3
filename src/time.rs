//! # Time
//!
//! Tick arithmetic, blocking timeouts, and the wrap-aware ordered list used
//! for both delayed tasks and armed software timers.
//!
//! The tick counter is 32 bits and wraps. A [`TickList`] keeps two sorted
//! lists: entries due in the current counter epoch, and entries whose wake
//! tick is numerically below "now" and therefore belong to the next epoch.
//! When the counter wraps to zero the owner swaps them.

use heapless::Vec;

use crate::error::{fatal, Violation};

/// Kernel tick count.
pub type Tick = u32;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Don't block; fail at once if the call can't complete.
    Poll,
    /// Block for at most this many ticks. `Ticks(0)` polls.
    Ticks(Tick),
    /// Block until the call completes.
    Forever,
}

impl Timeout {
    /// `0` polls and `Tick::MAX` waits forever.
    pub const fn ticks(ticks: Tick) -> Self {
        match ticks {
            0 => Self::Poll,
            Tick::MAX => Self::Forever,
            n => Self::Ticks(n),
        }
    }

    /// Fails at once instead of waiting.
    #[inline]
    pub const fn is_poll(self) -> bool {
        matches!(self, Self::Poll | Self::Ticks(0))
    }

    /// Absolute wake tick for a wait starting at `now`, if the wait is
    /// bounded. Polls have none.
    pub const fn deadline(self, now: Tick) -> Option<Tick> {
        match self {
            Self::Ticks(0) | Self::Poll | Self::Forever => None,
            Self::Ticks(n) => Some(now.wrapping_add(n)),
        }
    }
}

impl From<Tick> for Timeout {
    fn from(ticks: Tick) -> Self {
        Self::ticks(ticks)
    }
}

/// Wrap-aware list of `(wake tick, item)` pairs, sorted by wake tick.
#[derive(Debug)]
pub struct TickList<T, const N: usize> {
    current: Vec<(Tick, T), N>,
    overflow: Vec<(Tick, T), N>,
}

impl<T: Copy + PartialEq, const N: usize> TickList<T, N> {
    pub const fn new() -> Self {
        Self {
            current: Vec::new(),
            overflow: Vec::new(),
        }
    }

    /// Insert `item` to wake at the absolute tick `at`, as seen from `now`.
    ///
    /// Entries with the same wake tick keep insertion order.
    pub fn insert(&mut self, now: Tick, at: Tick, item: T) {
        let list = if at < now {
            &mut self.overflow
        } else {
            &mut self.current
        };
        let index = list.iter().position(|&(t, _)| t > at).unwrap_or(list.len());
        if list.insert(index, (at, item)).is_err() {
            fatal(Violation::ListOverflow);
        }
    }

    /// Remove `item`, returning the wake tick it was waiting for.
    pub fn remove(&mut self, item: T) -> Option<Tick> {
        for list in [&mut self.current, &mut self.overflow] {
            if let Some(index) = list.iter().position(|&(_, x)| x == item) {
                return Some(list.remove(index).0);
            }
        }
        None
    }

    /// Pop the earliest entry of the current epoch if it is due at `now`.
    pub fn pop_expired(&mut self, now: Tick) -> Option<(Tick, T)> {
        match self.current.first() {
            Some(&(at, _)) if at <= now => Some(self.current.remove(0)),
            _ => None,
        }
    }

    /// Pop the earliest entry of the current epoch regardless of its tick.
    /// Used to flush entries that became due just before a wrap.
    pub fn pop_current(&mut self) -> Option<(Tick, T)> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.current.remove(0))
        }
    }

    /// Start a new counter epoch: the overflow list becomes current.
    ///
    /// The current list must already be drained.
    pub fn switch_lists(&mut self) {
        if !self.current.is_empty() {
            fatal(Violation::TickWrap);
        }
        core::mem::swap(&mut self.current, &mut self.overflow);
    }

    /// Earliest wake tick in the current epoch, falling back to the next.
    pub fn next_wake(&self) -> Option<Tick> {
        self.current
            .first()
            .or_else(|| self.overflow.first())
            .map(|&(at, _)| at)
    }

    pub fn contains(&self, item: T) -> bool {
        self.iter().any(|(_, x)| x == item)
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, current epoch first.
    pub fn iter(&self) -> impl Iterator<Item = (Tick, T)> + '_ {
        self.current.iter().chain(self.overflow.iter()).copied()
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for TickList<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_from_ticks() {
        assert_eq!(Timeout::ticks(0), Timeout::Poll);
        assert_eq!(Timeout::ticks(5), Timeout::Ticks(5));
        assert_eq!(Timeout::from(u32::MAX), Timeout::Forever);
        assert_eq!(Timeout::Ticks(10).deadline(u32::MAX - 4), Some(5));
        assert_eq!(Timeout::Forever.deadline(3), None);
    }

    #[test]
    fn test_zero_ticks_polls() {
        assert!(Timeout::Poll.is_poll());
        assert!(Timeout::Ticks(0).is_poll());
        assert!(!Timeout::Ticks(1).is_poll());
        assert!(!Timeout::Forever.is_poll());
        assert_eq!(Timeout::Ticks(0).deadline(u32::MAX), None);
    }

    #[test]
    fn test_sorted_with_fifo_ties() {
        let mut list: TickList<u8, 8> = TickList::new();
        list.insert(0, 30, 1);
        list.insert(0, 10, 2);
        list.insert(0, 30, 3);
        list.insert(0, 20, 4);
        let order: std::vec::Vec<u8> = list.iter().map(|(_, x)| x).collect();
        assert_eq!(order, [2, 4, 1, 3]);
        assert_eq!(list.next_wake(), Some(10));
    }

    #[test]
    fn test_pop_expired_stops_at_future_entry() {
        let mut list: TickList<u8, 8> = TickList::new();
        list.insert(0, 5, 1);
        list.insert(0, 7, 2);
        assert_eq!(list.pop_expired(4), None);
        assert_eq!(list.pop_expired(6), Some((5, 1)));
        assert_eq!(list.pop_expired(6), None);
        assert_eq!(list.pop_expired(7), Some((7, 2)));
        assert!(list.is_empty());
    }

    #[test]
    fn test_wrapped_deadline_waits_for_next_epoch() {
        let mut list: TickList<u8, 8> = TickList::new();
        let now = u32::MAX - 1;
        list.insert(now, now.wrapping_add(4), 1); // wakes at tick 2
        list.insert(now, u32::MAX, 2);

        // The wrapped entry must not fire in this epoch.
        assert_eq!(list.pop_expired(u32::MAX), Some((u32::MAX, 2)));
        assert_eq!(list.pop_expired(u32::MAX), None);

        list.switch_lists();
        assert_eq!(list.pop_expired(1), None);
        assert_eq!(list.pop_expired(2), Some((2, 1)));
    }

    #[test]
    #[should_panic(expected = "TickWrap")]
    fn test_switch_with_pending_current_is_fatal() {
        let mut list: TickList<u8, 4> = TickList::new();
        list.insert(0, 10, 1);
        list.switch_lists();
    }

    #[test]
    fn test_remove_from_either_epoch() {
        let mut list: TickList<u8, 4> = TickList::new();
        list.insert(100, 200, 1);
        list.insert(100, 50, 2);
        assert!(list.contains(2));
        assert_eq!(list.remove(2), Some(50));
        assert_eq!(list.remove(2), None);
        assert_eq!(list.remove(1), Some(200));
        assert!(list.is_empty());
    }
}
