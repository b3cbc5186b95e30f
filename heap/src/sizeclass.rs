use std::ptr::NonNull;

use crate::block::{Block, HeapError};

/// Shared-heap class index: 32 classes in 16-byte increments (16..=512).
#[inline(always)]
pub fn shared_class(size: usize) -> usize {
    debug_assert!(size % 16 == 0 && size > 0 && size <= 512);
    size / 16 - 1
}

/// Local chunk class index: 8 power-of-two classes (512..=65536).
#[inline(always)]
pub fn local_class(size: usize) -> usize {
    debug_assert!(size.is_power_of_two() && (512..=65536).contains(&size));
    size.trailing_zeros() as usize - 9
}

pub const SHARED_CLASSES: usize = 32;
pub const LOCAL_CLASSES: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct ClassHeapStats {
    pub blocks: usize,
    pub full_blocks: usize,
    pub empty_blocks: usize,
    pub used_bytes: usize,
    pub mapped_bytes: usize,
}

/// One tier of size-classed blocks. Each class keeps four singly linked
/// lists: the *head* currently serving allocations, *rest* (partially full),
/// *full* and *empty*.
pub struct ClassHeap<const N: usize> {
    shared: bool,
    heads: [*mut Block; N],
    rest: [*mut Block; N],
    full: [*mut Block; N],
    empty: [*mut Block; N],
}

// SAFETY: the class heap is only touched under its owning allocator's lock.
unsafe impl<const N: usize> Send for ClassHeap<N> {}

fn push(list: &mut *mut Block, block: NonNull<Block>) {
    // SAFETY: block is live; lists are only walked under the owner's lock.
    unsafe { block.as_ref().set_next(*list) };
    *list = block.as_ptr();
}

fn pop(list: &mut *mut Block) -> Option<NonNull<Block>> {
    NonNull::new(*list).inspect(|head| {
        // SAFETY: head is a live block.
        *list = unsafe { head.as_ref().next_block() };
    })
}

impl<const N: usize> ClassHeap<N> {
    pub fn new(shared: bool) -> Self {
        Self {
            shared,
            heads: [std::ptr::null_mut(); N],
            rest: [std::ptr::null_mut(); N],
            full: [std::ptr::null_mut(); N],
            empty: [std::ptr::null_mut(); N],
        }
    }

    #[inline(always)]
    pub fn valid_head(&self, class: usize) -> bool {
        let head = self.heads[class];
        // SAFETY: a non-null head is a live block.
        !head.is_null() && !unsafe { (*head).full() }
    }

    /// The current head block. Only valid after [`ClassHeap::valid_head`].
    #[inline(always)]
    pub fn head(&self, class: usize) -> &Block {
        debug_assert!(!self.heads[class].is_null());
        // SAFETY: heads hold live blocks.
        unsafe { &*self.heads[class] }
    }

    /// Promote the next head for `class`: take from rest, then empty, then
    /// create a fresh block. A full head is pushed onto the full list.
    pub fn next_head(
        &mut self,
        class: usize,
        size: usize,
        dirty: bool,
    ) -> Result<NonNull<Block>, HeapError> {
        loop {
            match NonNull::new(self.heads[class]) {
                None => {
                    let block = if let Some(b) = pop(&mut self.rest[class]) {
                        b
                    } else if let Some(b) = pop(&mut self.empty[class]) {
                        b
                    } else {
                        Block::create(self.shared, size, dirty)?
                    };
                    // SAFETY: freshly unlinked block.
                    unsafe { block.as_ref().set_next(std::ptr::null_mut()) };
                    self.heads[class] = block.as_ptr();
                }
                Some(head) => {
                    // SAFETY: head is live.
                    if unsafe { head.as_ref().full() } {
                        self.heads[class] = unsafe { head.as_ref().next_block() };
                        push(&mut self.full[class], head);
                    } else {
                        return Ok(head);
                    }
                }
            }
        }
    }

    /// Move every head to its rest list. Run at the second stop-the-world so
    /// new allocations promote (and amortized-sweep) fresh heads.
    pub fn redistribute_heads_to_rest(&mut self) {
        for class in 0..N {
            if let Some(head) = NonNull::new(self.heads[class]) {
                debug_assert!(unsafe { head.as_ref().next_block() }.is_null());
                self.heads[class] = std::ptr::null_mut();
                push(&mut self.rest[class], head);
            }
        }
    }

    /// Re-sort the full lists after a sweep; swept blocks may have become
    /// partially full or empty.
    pub fn redistribute_full_blocks(&mut self) {
        for class in 0..N {
            let mut src = std::mem::replace(&mut self.full[class], std::ptr::null_mut());
            while let Some(block) = pop(&mut src) {
                // SAFETY: block is live.
                let b = unsafe { block.as_ref() };
                if b.full() {
                    push(&mut self.full[class], block);
                } else if b.empty() {
                    push(&mut self.empty[class], block);
                } else {
                    push(&mut self.rest[class], block);
                }
            }
        }
    }

    /// Release all empty blocks back to the OS. Run under stop-the-world.
    pub fn pop_empty_blocks(&mut self) {
        for class in 0..N {
            while let Some(block) = pop(&mut self.empty[class]) {
                // SAFETY: empty blocks are unreferenced.
                unsafe { Block::destroy(block) };
            }
        }
    }

    /// Snapshot of the rest and full lists for the concurrent sweep.
    pub fn collect_rest_and_full(&self) -> Vec<NonNull<Block>> {
        let mut out = Vec::new();
        for class in 0..N {
            for list in [self.rest[class], self.full[class]] {
                let mut cur = list;
                while let Some(block) = NonNull::new(cur) {
                    out.push(block);
                    // SAFETY: blocks on the lists are live.
                    cur = unsafe { block.as_ref().next_block() };
                }
            }
        }
        out
    }

    /// Visit every block that may contain objects (heads, rest, full).
    pub fn for_each_block(&self, visit: &mut dyn FnMut(&Block)) {
        for class in 0..N {
            for list in [self.heads[class], self.rest[class], self.full[class]] {
                let mut cur = list;
                while let Some(block) = NonNull::new(cur) {
                    // SAFETY: blocks on the lists are live.
                    let b = unsafe { block.as_ref() };
                    visit(b);
                    cur = b.next_block();
                }
            }
        }
    }

    pub fn stats(&self) -> ClassHeapStats {
        let mut stats = ClassHeapStats::default();
        for class in 0..N {
            let mut count = |list: *mut Block, blocks: &mut usize| {
                let mut cur = list;
                while let Some(block) = NonNull::new(cur) {
                    // SAFETY: blocks on the lists are live.
                    let b = unsafe { block.as_ref() };
                    *blocks += 1;
                    stats.used_bytes += b.used_bytes();
                    stats.mapped_bytes += b.block_size();
                    cur = b.next_block();
                }
            };
            let mut blocks = 0;
            count(self.heads[class], &mut blocks);
            count(self.rest[class], &mut blocks);
            stats.blocks += blocks;
            let mut full = 0;
            count(self.full[class], &mut full);
            stats.full_blocks += full;
            let mut empty = 0;
            count(self.empty[class], &mut empty);
            stats.empty_blocks += empty;
        }
        stats
    }
}

impl<const N: usize> Drop for ClassHeap<N> {
    fn drop(&mut self) {
        for class in 0..N {
            for list in [
                &mut self.heads[class],
                &mut self.rest[class],
                &mut self.full[class],
                &mut self.empty[class],
            ] {
                while let Some(block) = pop(list) {
                    // SAFETY: the heap owns its blocks exclusively on drop.
                    unsafe { Block::destroy(block) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_indices() {
        assert_eq!(shared_class(16), 0);
        assert_eq!(shared_class(512), 31);
        assert_eq!(local_class(512), 0);
        assert_eq!(local_class(65536), 7);
    }

    #[test]
    fn head_promotion_at_block_boundary() {
        let mut heap: ClassHeap<SHARED_CLASSES> = ClassHeap::new(true);
        let class = shared_class(512);
        let head = heap.next_head(class, 512, false).unwrap();
        let capacity = unsafe { head.as_ref().capacity() };
        for _ in 0..capacity {
            assert!(heap.valid_head(class));
            heap.head(class).alloc(false, false);
        }
        // boundary: the filled head moves to the full list and a fresh block
        // takes over
        assert!(!heap.valid_head(class));
        let next = heap.next_head(class, 512, false).unwrap();
        assert_ne!(next, head);
        let stats = heap.stats();
        assert_eq!(stats.full_blocks, 1);
        assert_eq!(stats.blocks, 1);
    }
}
