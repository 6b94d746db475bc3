//! Fixed-capacity object tables addressed by generation-checked handles.
//!
//! Every kernel object (task, mutex, semaphore, timer) lives in one of these
//! tables. A handle records the slot index and the slot's generation at
//! insertion time, so a handle kept after its object was deleted is
//! rejected instead of silently naming whichever object reused the slot.

use core::fmt;

/// Untyped slot reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    index: u16,
    generation: u16,
}

impl RawHandle {
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Declare a typed handle around [`RawHandle`].
macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) $crate::table::RawHandle);

        impl $name {
            /// Slot index inside the owning table.
            #[inline]
            pub const fn index(self) -> usize {
                self.0.index()
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }
    };
}
pub(crate) use define_handle;

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Table of at most `N` live values.
pub struct ObjectTable<T, const N: usize> {
    slots: [Slot<T>; N],
    len: usize,
}

impl<T, const N: usize> ObjectTable<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: [const {
                Slot {
                    generation: 0,
                    value: None,
                }
            }; N],
            len: 0,
        }
    }

    /// Store `value` in the first free slot. Hands the value back when the
    /// table is full.
    pub fn insert(&mut self, value: T) -> Result<RawHandle, T> {
        let Some(index) = self.slots.iter().position(|s| s.value.is_none()) else {
            return Err(value);
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.len += 1;
        Ok(RawHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    /// Remove the value, retiring the handle.
    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    RawHandle {
                        index: index as u16,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

impl<T, const N: usize> Default for ObjectTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_handle!(
        /// Handle used by the tests below.
        Thing
    );

    #[test]
    fn test_stale_handle_is_rejected_after_reuse() {
        let mut table: ObjectTable<&str, 2> = ObjectTable::new();
        let a = table.insert("a").unwrap();
        assert_eq!(table.remove(a), Some("a"));

        let b = table.insert("b").unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_returns_value() {
        let mut table: ObjectTable<u32, 2> = ObjectTable::new();
        table.insert(1).unwrap();
        table.insert(2).unwrap();
        assert_eq!(table.insert(3), Err(3));
        let values: std::vec::Vec<u32> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, [1, 2]);
    }

    #[test]
    fn test_typed_handle_debug() {
        let mut table: ObjectTable<(), 1> = ObjectTable::new();
        let thing = Thing(table.insert(()).unwrap());
        assert_eq!(std::format!("{thing:?}"), "Thing(0v0)");
        assert_eq!(thing.index(), 0);
    }
}
