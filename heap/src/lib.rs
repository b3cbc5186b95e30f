//! Two-tier heap and its collector.
//!
//! Tier one is a per-fiber bump-pointer nursery collected by a copying pass;
//! tier two is a size-classed, bitmap-allocated shared heap collected
//! concurrently with a snapshot-at-the-beginning write barrier.
//!
//! The crate is decoupled from any specific runtime. Consumers provide:
//! - a [`TraceFn`](object::TraceFn) to enumerate slot edges of heap objects,
//! - a [`FinalizeFn`](object::FinalizeFn) for objects with destructors,
//! - a [`CollectorHost`] supplying roots and stop-the-world hooks.

mod allocator;
mod block;
mod collector;
mod nursery;
mod sizeclass;
mod system;

pub use allocator::{align_size, AllocStats, Allocator, HeapSnapshot};
pub use block::{Block, HeapError, MAX_OBJECT_SIZE};
pub use collector::{Collector, CollectorHost, CollectorSettings, BLOCK_LOCKS};
pub use nursery::{ChunkHeader, Nursery, LOCAL_COLLECT_THRESHOLD, NURSERY_CHUNK_MAX, NURSERY_CHUNK_MIN};
pub use sizeclass::{local_class, shared_class, ClassHeapStats, LOCAL_CLASSES, SHARED_CLASSES};
pub use system::{map_memory, protect_memory_read_write_exec, unmap_memory, OS_PAGE_SIZE};

/// Root enumeration callback: the outer closure is called with a visitor to
/// apply to every root slot.
pub type RootWalker<'a> = &'a mut dyn FnMut(&mut dyn FnMut(&mut object::Slot));

#[cfg(test)]
mod tests {
    use super::*;
    use object::{GreyRef, Header, ObjRef, ObjectKind, Slot};
    use std::sync::Arc;

    /// Test object: header + two slot fields.
    #[repr(C)]
    struct Pair {
        header: Header,
        left: Slot,
        right: Slot,
    }

    unsafe fn trace_pair(obj: *mut Header, visitor: &mut dyn FnMut(&mut Slot)) {
        let pair = unsafe { &mut *(obj as *mut Pair) };
        visitor(&mut pair.left);
        visitor(&mut pair.right);
    }

    unsafe fn no_finalize(_: *mut Header) {}

    fn test_allocator() -> Arc<Allocator> {
        let collector = Collector::new(CollectorSettings::default(), trace_pair, no_finalize);
        Allocator::new(collector)
    }

    fn new_pair(alloc: &Allocator, left: Slot, right: Slot) -> Slot {
        let ptr = alloc.alloc_private(size_of::<Pair>()).unwrap() as *mut Pair;
        unsafe {
            std::ptr::write(
                ptr,
                Pair {
                    header: Header::new(ObjectKind::List),
                    left,
                    right,
                },
            );
            Slot::Ref(ObjRef::from_ptr(ptr as *mut Header))
        }
    }

    #[test]
    fn private_alloc_is_local() {
        let alloc = test_allocator();
        let slot = new_pair(&alloc, Slot::Int(1), Slot::Int(2));
        assert!(!slot.as_ref().unwrap().is_shared());
    }

    #[test]
    fn nursery_collect_preserves_live_graph() {
        let alloc = test_allocator();
        let inner = new_pair(&alloc, Slot::Int(10), Slot::Int(20));
        let mut root = new_pair(&alloc, inner, Slot::Bool(true));
        // garbage
        for i in 0..100 {
            let _ = new_pair(&alloc, Slot::Int(i), Slot::Undef);
        }

        let before = alloc.snapshot();
        alloc.collect_local(&mut |visit| visit(&mut root));
        let after = alloc.snapshot();
        assert!(after.nursery_used_bytes < before.nursery_used_bytes);
        // two live objects survive
        assert_eq!(after.nursery_used_bytes, 2 * heap_object_size() as u64);

        let root_ref = root.as_ref().unwrap();
        let pair: &Pair = unsafe { root_ref.cast() };
        let inner_ref = pair.left.as_ref().unwrap();
        let inner_pair: &Pair = unsafe { inner_ref.cast() };
        assert_eq!(inner_pair.left.as_int(), Some(10));
        assert_eq!(inner_pair.right.as_int(), Some(20));
    }

    #[test]
    fn nursery_collect_is_idempotent() {
        let alloc = test_allocator();
        let inner = new_pair(&alloc, Slot::Int(1), Slot::Undef);
        let mut root = new_pair(&alloc, inner, inner);
        alloc.collect_local(&mut |visit| visit(&mut root));
        let first = alloc.snapshot().nursery_used_bytes;
        alloc.collect_local(&mut |visit| visit(&mut root));
        let second = alloc.snapshot().nursery_used_bytes;
        assert_eq!(first, second);
    }

    #[test]
    fn shared_slot_aliasing_survives_copy() {
        // the same object referenced twice converges on one copy
        let alloc = test_allocator();
        let inner = new_pair(&alloc, Slot::Int(7), Slot::Undef);
        let mut root = new_pair(&alloc, inner, inner);
        alloc.collect_local(&mut |visit| visit(&mut root));
        let pair: &Pair = unsafe { root.as_ref().unwrap().cast() };
        assert_eq!(
            pair.left.as_ref().unwrap().as_ptr(),
            pair.right.as_ref().unwrap().as_ptr()
        );
    }

    #[test]
    fn promotion_moves_transitive_closure() {
        let alloc = test_allocator();
        let inner = new_pair(&alloc, Slot::Int(5), Slot::Undef);
        let mut root = new_pair(&alloc, inner, Slot::Int(9));
        alloc.share(&mut root);

        let root_ref = root.as_ref().unwrap();
        assert!(root_ref.is_shared());
        let pair: &Pair = unsafe { root_ref.cast() };
        // no shared object points into a nursery
        assert!(pair.left.as_ref().unwrap().is_shared());
        assert_eq!(pair.right.as_int(), Some(9));
    }

    #[test]
    fn write_barrier_retains_pre_image() {
        let alloc = test_allocator();
        let mut a = new_pair(&alloc, Slot::Int(1), Slot::Undef);
        let mut b = new_pair(&alloc, Slot::Int(2), Slot::Undef);
        alloc.share(&mut a);
        alloc.share(&mut b);

        alloc
            .write_barrier
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut field = a;
        alloc.ref_write(&mut field, b);
        let drained = alloc.drain_ref_list();
        // old value and new value both retained
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], GreyRef(a.as_ref().unwrap().as_ptr()));
        assert_eq!(drained[1], GreyRef(b.as_ref().unwrap().as_ptr()));

        // barrier idempotence: issuing the same store again yields the same
        // mark set once marked
        alloc.ref_write(&mut field, b);
        let again = alloc.drain_ref_list();
        assert_eq!(again.len(), 2);
        alloc
            .write_barrier
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn mark_and_sweep_reclaims_unreachable() {
        let collector = Collector::new(CollectorSettings::default(), trace_pair, no_finalize);
        let alloc = Allocator::new(Arc::clone(&collector));

        let mut live = new_pair(&alloc, Slot::Int(1), Slot::Undef);
        alloc.share(&mut live);
        for i in 0..64 {
            let mut dead = new_pair(&alloc, Slot::Int(i), Slot::Undef);
            alloc.share(&mut dead);
        }

        let used_before = alloc.snapshot().shared.used_bytes;

        collector.start();
        collector.mark_concurrent(vec![GreyRef(live.as_ref().unwrap().as_ptr())]);
        // simulate the second STW boundary then sweep
        let dirty = alloc.dirty_mask.load(std::sync::atomic::Ordering::Relaxed);
        alloc
            .dirty_mask
            .store(!dirty, std::sync::atomic::Ordering::Relaxed);
        alloc.sweep_heads();
        alloc.sweep_concurrent();

        let used_after = alloc.snapshot().shared.used_bytes;
        assert!(used_after < used_before);
        assert_eq!(used_after, heap_object_size());

        // the reachable object's alloc bit is still set
        let ptr = live.as_ref().unwrap().as_ptr() as *const u8;
        let (block, idx) = unsafe { Block::and_index_from_ptr(ptr) };
        assert!(block.used() >= 1);
        assert!(!block.is_marked(idx));
        collector.stop();
    }

    fn heap_object_size() -> usize {
        align_size(size_of::<Pair>())
    }
}
