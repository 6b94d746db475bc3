//! # Heap Allocator
//!
//! Fixed-capacity arena that backs every kernel object: task control
//! blocks, task stacks, and the control blocks of mutexes, semaphores and
//! timers. There is no growth; once the arena is exhausted, object creation
//! fails with [`KernelError::AllocationFailure`].
//!
//! ## Algorithm
//!
//! First fit over an address-ordered free list. Each block starts with an
//! 8-byte header stored inside the arena:
//!
//! ```text
//! +0  next free block offset (u32, NIL when allocated or last)
//! +4  block size including header (u32, MSB = allocated)
//! ```
//!
//! Oversized blocks are split when the remainder can hold a useful block,
//! and freed blocks are merged with adjacent free neighbours, so the heap
//! doesn't fragment under repeated create/delete cycles.

use crate::error::{fatal, kassert, KernelError, Violation};

const ALIGNMENT: usize = 8;
const HEADER_SIZE: usize = 8;
const MIN_BLOCK_SIZE: usize = HEADER_SIZE * 2;
const ALLOCATED_BIT: u32 = 1 << 31;
const NIL: usize = u32::MAX as usize;

/// A region handed out by [`Heap::allocate`]. Offsets are relative to the
/// arena start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    offset: u32,
    len: u32,
}

impl HeapBlock {
    /// Byte offset of the usable region inside the arena.
    #[inline]
    pub const fn offset(&self) -> usize {
        self.offset as usize
    }

    /// Usable size in bytes (at least the requested size).
    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Snapshot of allocator health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub free_bytes: usize,
    pub minimum_ever_free_bytes: usize,
    pub largest_free_block: usize,
    pub free_blocks: usize,
    pub allocations: usize,
    pub frees: usize,
}

#[repr(C, align(8))]
struct Arena<const N: usize>([u8; N]);

/// First-fit coalescing allocator over an `N`-byte arena.
pub struct Heap<const N: usize> {
    arena: Arena<N>,
    free_head: usize,
    free_bytes: usize,
    minimum_ever_free: usize,
    allocations: usize,
    frees: usize,
    initialized: bool,
}

impl<const N: usize> Heap<N> {
    /// Usable arena size (the tail that can't hold an aligned block is
    /// left unused).
    pub const CAPACITY: usize = N & !(ALIGNMENT - 1);

    pub const fn new() -> Self {
        Self {
            arena: Arena([0; N]),
            free_head: NIL,
            free_bytes: 0,
            minimum_ever_free: 0,
            allocations: 0,
            frees: 0,
            initialized: false,
        }
    }

    /// Lay down the single free block covering the arena. Deferred to the
    /// first allocation so `new` stays `const`.
    fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        if Self::CAPACITY < MIN_BLOCK_SIZE {
            return;
        }
        self.set_next(0, NIL);
        self.write_size(0, Self::CAPACITY as u32);
        self.free_head = 0;
        self.free_bytes = Self::CAPACITY;
        self.minimum_ever_free = Self::CAPACITY;
    }

    /// Allocate at least `wanted` bytes, 8-byte aligned.
    pub fn allocate(&mut self, wanted: usize) -> Result<HeapBlock, KernelError> {
        self.ensure_initialized();

        let total = match wanted
            .checked_add(HEADER_SIZE + ALIGNMENT - 1)
            .map(|t| t & !(ALIGNMENT - 1))
        {
            Some(total) if wanted > 0 && total <= self.free_bytes => total,
            _ => return Err(KernelError::AllocationFailure),
        };

        let mut prev = NIL;
        let mut block = self.free_head;
        while block != NIL && self.size(block) < total {
            prev = block;
            block = self.next(block);
        }
        if block == NIL {
            log::warn!("heap: no free block of {total} bytes ({} free)", self.free_bytes);
            return Err(KernelError::AllocationFailure);
        }

        let block_size = self.size(block);
        let successor = if block_size - total > MIN_BLOCK_SIZE {
            let split = block + total;
            self.set_next(split, self.next(block));
            self.write_size(split, (block_size - total) as u32);
            self.write_size(block, total as u32);
            split
        } else {
            self.next(block)
        };
        if prev == NIL {
            self.free_head = successor;
        } else {
            self.set_next(prev, successor);
        }

        let size = self.size(block);
        self.free_bytes -= size;
        self.minimum_ever_free = self.minimum_ever_free.min(self.free_bytes);
        self.allocations += 1;
        self.set_next(block, NIL);
        self.write_size(block, size as u32 | ALLOCATED_BIT);

        Ok(HeapBlock {
            offset: (block + HEADER_SIZE) as u32,
            len: (size - HEADER_SIZE) as u32,
        })
    }

    /// Return a block to the free list.
    ///
    /// Freeing a block twice or a forged block is a fatal violation.
    pub fn free(&mut self, block: HeapBlock) {
        let offset = block.offset();
        kassert!(
            self.initialized && offset >= HEADER_SIZE && offset <= Self::CAPACITY,
            Violation::HeapCorrupted
        );
        let at = offset - HEADER_SIZE;
        let raw = self.raw_size(at);
        kassert!(
            raw & ALLOCATED_BIT != 0 && self.next(at) == NIL,
            Violation::HeapCorrupted
        );
        let size = (raw & !ALLOCATED_BIT) as usize;
        kassert!(
            size >= MIN_BLOCK_SIZE && at + size <= Self::CAPACITY,
            Violation::HeapCorrupted
        );

        self.write_size(at, size as u32);
        self.free_bytes += size;
        self.frees += 1;
        self.insert_free(at);
    }

    fn insert_free(&mut self, mut block: usize) {
        let mut prev = NIL;
        let mut next = self.free_head;
        while next != NIL && next < block {
            prev = next;
            next = self.next(next);
        }
        if next == block {
            fatal(Violation::HeapCorrupted);
        }

        if prev != NIL && prev + self.size(prev) == block {
            let merged = self.size(prev) + self.size(block);
            self.write_size(prev, merged as u32);
            block = prev;
        }

        if next != NIL && block + self.size(block) == next {
            let merged = self.size(block) + self.size(next);
            self.write_size(block, merged as u32);
            self.set_next(block, self.next(next));
        } else {
            self.set_next(block, next);
        }

        if block != prev {
            if prev == NIL {
                self.free_head = block;
            } else {
                self.set_next(prev, block);
            }
        }
    }

    /// Usable bytes of an allocated block.
    pub fn bytes(&self, block: HeapBlock) -> &[u8] {
        &self.arena.0[block.offset()..block.offset() + block.len()]
    }

    /// Mutable view of an allocated block.
    pub fn bytes_mut(&mut self, block: HeapBlock) -> &mut [u8] {
        &mut self.arena.0[block.offset()..block.offset() + block.len()]
    }

    /// Address of the first arena byte. Only meaningful while the heap
    /// stays in place (it lives in a `static` on the target).
    pub fn base_address(&self) -> usize {
        self.arena.0.as_ptr() as usize
    }

    pub fn free_bytes(&self) -> usize {
        if self.initialized {
            self.free_bytes
        } else {
            Self::CAPACITY
        }
    }

    pub fn minimum_ever_free_bytes(&self) -> usize {
        if self.initialized {
            self.minimum_ever_free
        } else {
            Self::CAPACITY
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            free_bytes: self.free_bytes(),
            minimum_ever_free_bytes: self.minimum_ever_free_bytes(),
            allocations: self.allocations,
            frees: self.frees,
            ..HeapStats::default()
        };
        if !self.initialized {
            stats.largest_free_block = Self::CAPACITY;
            stats.free_blocks = 1;
            return stats;
        }
        let mut block = self.free_head;
        while block != NIL {
            stats.free_blocks += 1;
            stats.largest_free_block = stats.largest_free_block.max(self.size(block));
            block = self.next(block);
        }
        stats
    }

    // --- header access -----------------------------------------------------

    fn read_u32(&self, at: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.arena.0[at..at + 4]);
        u32::from_le_bytes(word)
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.arena.0[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn next(&self, block: usize) -> usize {
        let raw = self.read_u32(block);
        if raw == u32::MAX {
            NIL
        } else {
            raw as usize
        }
    }

    fn set_next(&mut self, block: usize, next: usize) {
        self.write_u32(block, next as u32);
    }

    fn raw_size(&self, block: usize) -> u32 {
        self.read_u32(block + 4)
    }

    fn size(&self, block: usize) -> usize {
        (self.raw_size(block) & !ALLOCATED_BIT) as usize
    }

    fn write_size(&mut self, block: usize, size: u32) {
        self.write_u32(block + 4, size);
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}
