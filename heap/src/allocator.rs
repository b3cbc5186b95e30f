use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use object::{is_shared_ptr, GreyRef, Header, ObjRef, Slot, TraceFn};

use crate::block::{Block, HeapError, MAX_OBJECT_SIZE};
use crate::collector::Collector;
use crate::nursery::{Nursery, LOCAL_COLLECT_THRESHOLD};
use crate::sizeclass::{
    local_class, shared_class, ClassHeap, ClassHeapStats, LOCAL_CLASSES, SHARED_CLASSES,
};
use crate::RootWalker;

/// Align a request to the next 16-byte boundary.
#[inline(always)]
pub const fn align_size(size: usize) -> usize {
    (size + 15) & !15
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllocStats {
    pub local_allocated: u64,
    pub local_allocated_bytes: u64,
    pub shared_allocated: u64,
    pub shared_allocated_bytes: u64,
    pub shared_freed: u64,
    pub shared_freed_bytes: u64,
    pub promoted: u64,
    pub nursery_collections: u64,
    pub nursery_collection_time: Duration,
    pub longest_pause: Duration,
    pub current_pause: Duration,
    last_shared_allocated_bytes: u64,
}

/// Point-in-time snapshot combining counters and block accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapSnapshot {
    pub stats: AllocStats,
    pub nursery_used_bytes: u64,
    pub local: ClassHeapStats,
    pub shared: ClassHeapStats,
}

pub struct AllocatorInner {
    pub nursery: Nursery,
    pub local: ClassHeap<LOCAL_CLASSES>,
    pub shared: ClassHeap<SHARED_CLASSES>,
    pub stats: AllocStats,
}

impl AllocatorInner {
    /// Allocate a chunk slot from the local block classes (512..=64 KiB).
    fn alloc_local_raw(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        self.stats.local_allocated += 1;
        self.stats.local_allocated_bytes += size as u64;
        let class = local_class(size);
        if self.local.valid_head(class) {
            return Ok(self.local.head(class).alloc(false, false));
        }
        let head = self.local.next_head(class, size, false)?;
        // SAFETY: next_head returns a live, non-full block.
        Ok(unsafe { head.as_ref() }.alloc(false, false))
    }

    /// Bump-allocate from the nursery, growing it by a fresh local chunk
    /// when headroom runs out.
    fn alloc_private_raw(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        while !self.nursery.has_room(size) {
            let chunk_size = self.nursery.next_chunk_size();
            let chunk = self.alloc_local_raw(chunk_size)?;
            // SAFETY: alloc_local_raw returns a non-null slot.
            self.nursery
                .add_chunk(unsafe { NonNull::new_unchecked(chunk) }, chunk_size);
        }
        // SAFETY: headroom established above.
        Ok(unsafe { self.nursery.bump(size) })
    }
}

/// Per-worker allocator binding the three memory tiers together. The bound
/// mutator is the only thread taking the fast paths; the collector reaches
/// in through the same lock for sweeping and barrier draining.
pub struct Allocator {
    pub collector: Arc<Collector>,
    inner: Mutex<AllocatorInner>,
    /// SATB barrier; raised during the concurrent mark phase.
    pub write_barrier: AtomicBool,
    /// Raised while the collector still holds raw pointers into nurseries
    /// (between the first snapshot and the end of snapshot marking).
    pub nursery_barrier: AtomicBool,
    /// Current sweep parity; flipped at the second stop-the-world.
    pub dirty_mask: AtomicBool,
    ref_list: Mutex<Vec<GreyRef>>,
}

// SAFETY: all shared state is behind locks or atomics.
unsafe impl Send for Allocator {}
// SAFETY: see above.
unsafe impl Sync for Allocator {}

impl Allocator {
    pub fn new(collector: Arc<Collector>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            inner: Mutex::new(AllocatorInner {
                nursery: Nursery::new(),
                local: ClassHeap::new(false),
                shared: ClassHeap::new(true),
                stats: AllocStats::default(),
            }),
            write_barrier: AtomicBool::new(false),
            nursery_barrier: AtomicBool::new(false),
            dirty_mask: AtomicBool::new(false),
            ref_list: Mutex::new(Vec::new()),
        })
    }

    /// Allocate `size` bytes in the bound fiber's nursery.
    pub fn alloc_private(&self, size: usize) -> Result<*mut u8, HeapError> {
        let size = align_size(size);
        assert!(size <= MAX_OBJECT_SIZE);
        self.inner.lock().alloc_private_raw(size)
    }

    /// Allocate a chunk (value stack storage, nursery backing) from the
    /// local block classes.
    pub fn alloc_chunk(&self, size: usize) -> Result<*mut u8, HeapError> {
        self.inner.lock().alloc_local_raw(size)
    }

    /// Free a chunk back to its local block.
    ///
    /// # Safety
    /// `ptr` must come from [`Allocator::alloc_chunk`] of this allocator's
    /// thread lineage and must not be used afterwards.
    pub unsafe fn free_chunk(ptr: *mut u8) {
        // SAFETY: per contract.
        unsafe {
            let (block, idx) = Block::and_index_from_ptr(ptr);
            block.free(idx);
        }
    }

    /// Allocate `size` bytes in the shared heap.
    pub fn alloc_shared(&self, size: usize, with_finalizer: bool) -> Result<*mut u8, HeapError> {
        let size = align_size(size);
        assert!(size <= MAX_OBJECT_SIZE);
        let mut inner = self.inner.lock();
        self.alloc_shared_locked(&mut inner, size, with_finalizer)
    }

    fn alloc_shared_locked(
        &self,
        inner: &mut AllocatorInner,
        size: usize,
        with_finalizer: bool,
    ) -> Result<*mut u8, HeapError> {
        inner.stats.shared_allocated += 1;
        inner.stats.shared_allocated_bytes += size as u64;
        // Objects allocated during concurrent mark start out black.
        let marked = self.write_barrier.load(Ordering::Relaxed);
        let class = shared_class(size);
        if inner.shared.valid_head(class) {
            return Ok(inner.shared.head(class).alloc(with_finalizer, marked));
        }
        // Amortized sweep: a freshly promoted head is swept once under its
        // block lock before serving allocations. This interleaves with the
        // collector's concurrent sweep; the dirty CAS keeps it single-shot.
        let head = inner.shared.next_head(class, size, false)?;
        let dirty = self.dirty_mask.load(Ordering::Relaxed);
        {
            let _guard = self.collector.block_lock(head.as_ptr() as *const u8).lock();
            // SAFETY: block lock held; finalize bits belong to dead objects.
            let b = unsafe { head.as_ref() };
            if b.dirty_cas(dirty) {
                let before = b.available();
                unsafe { b.sweep(self.collector.finalize_fn) };
                let freed = (b.available() - before) as u64;
                inner.stats.shared_freed += freed;
                inner.stats.shared_freed_bytes += freed * size as u64;
            }
        }
        // SAFETY: head is live and non-full.
        Ok(unsafe { head.as_ref() }.alloc(with_finalizer, marked))
    }

    /// Promote the value's transitive closure into the shared heap, leaving
    /// forwarding pointers behind so later traversals converge on one copy.
    /// Upholds the invariant that no shared object points into a nursery.
    pub fn share(&self, slot: &mut Slot) {
        let Some(r) = slot.as_ref() else { return };
        if r.is_shared() {
            return;
        }
        let mut inner = self.inner.lock();
        // SAFETY: the slot references a live nursery object of the bound
        // fiber.
        unsafe { self.promote(&mut inner, slot) };
    }

    unsafe fn promote(&self, inner: &mut AllocatorInner, slot: &mut Slot) {
        let Some(r) = slot.as_ref() else { return };
        let old = r.as_ptr() as *mut u8;
        if is_shared_ptr(old) {
            return;
        }
        // SAFETY: nursery payloads carry their headers 8 bytes back.
        let header = unsafe { Nursery::header_mut(old) };
        let new_ptr = if header.is_marked() {
            // SAFETY: marked means the forwarding pointer is in place.
            unsafe { Nursery::forwarded(old) }
        } else {
            let size = header.size();
            let new_ptr = self
                .alloc_shared_locked(inner, size, false)
                .expect("shared heap exhausted during promotion");
            // SAFETY: both regions are live and at least `size` bytes.
            unsafe {
                ptr::copy_nonoverlapping(old, new_ptr, size);
                Nursery::forward(old, new_ptr);
            }
            inner.stats.promoted += 1;
            let trace = self.collector.trace_fn;
            // SAFETY: the new copy is a valid object; visit its children.
            unsafe {
                trace(new_ptr as *mut Header, &mut |child| {
                    // SAFETY: children of a live object are live slots.
                    unsafe { self.promote(inner, child) }
                });
            }
            new_ptr
        };
        // SAFETY: new_ptr is a live shared object.
        *slot = Slot::Ref(unsafe { ObjRef::from_ptr(new_ptr as *mut Header) });
    }

    /// The write barrier. Promotes nursery values escaping into shared
    /// objects and, while the SATB barrier is raised, retains both the
    /// pre-image and the new value for the collector.
    pub fn ref_write(&self, slot: &mut Slot, mut value: Slot) {
        self.share(&mut value);
        if self.write_barrier.load(Ordering::Relaxed) {
            let mut list = self.ref_list.lock();
            if let Some(old) = slot.as_ref() {
                list.push(GreyRef(old.as_ptr()));
            }
            if let Some(new) = value.as_ref() {
                list.push(GreyRef(new.as_ptr()));
            }
        }
        *slot = value;
    }

    pub fn drain_ref_list(&self) -> Vec<GreyRef> {
        std::mem::take(&mut *self.ref_list.lock())
    }

    pub fn must_collect_local(&self) -> bool {
        if self.nursery_barrier.load(Ordering::Relaxed) {
            return false;
        }
        self.inner.lock().nursery.used_bytes() > LOCAL_COLLECT_THRESHOLD as u64
    }

    /// Cheney-style copying collect of the bound fiber's nursery. Roots are
    /// supplied by the fiber (value stack and frame defer lists); every live
    /// object moves to a fresh nursery and the old chunks go back to their
    /// blocks.
    pub fn collect_local(&self, for_each_root: RootWalker<'_>) {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        let trace = self.collector.trace_fn;
        let mut to = Nursery::new();

        let used_at_start = inner.nursery.allocated - inner.nursery.freed;
        let used_bytes_at_start = inner.nursery.used_bytes();

        for_each_root(&mut |slot| {
            // SAFETY: roots are well-formed slots of the bound fiber.
            unsafe { evacuate(&mut inner, &mut to, trace, slot) };
        });

        let freed = used_at_start - to.allocated;
        let freed_bytes = used_bytes_at_start - to.allocated_bytes;

        to.allocated = inner.nursery.allocated;
        to.allocated_bytes = inner.nursery.allocated_bytes;
        to.freed = inner.nursery.freed + freed;
        to.freed_bytes = inner.nursery.freed_bytes + freed_bytes;

        // dropping the old nursery releases its chunks to their blocks
        let _old = std::mem::replace(&mut inner.nursery, to);
        drop(_old);
        inner.local.redistribute_full_blocks();

        inner.stats.nursery_collections += 1;
        inner.stats.nursery_collection_time += start.elapsed();
    }

    /// Exchange the bound fiber's nursery with the allocator's. Part of the
    /// fiber attach/detach protocol.
    pub fn swap_nursery(&self, other: &mut Nursery) {
        std::mem::swap(&mut self.inner.lock().nursery, other);
    }

    /// Release every nursery chunk (fiber exit).
    pub fn clear_nursery(&self) {
        self.inner.lock().nursery.release_chunks();
    }

    /// Bytes newly shared-allocated since the last call. Feeds the shared
    /// collect trigger.
    pub fn take_shared_delta(&self) -> u64 {
        let mut inner = self.inner.lock();
        let delta =
            inner.stats.shared_allocated_bytes - inner.stats.last_shared_allocated_bytes;
        inner.stats.last_shared_allocated_bytes = inner.stats.shared_allocated_bytes;
        delta
    }

    pub fn note_pause(&self, pause: Duration) {
        let mut inner = self.inner.lock();
        if pause > inner.stats.longest_pause {
            inner.stats.longest_pause = pause;
        }
        inner.stats.current_pause = inner.stats.current_pause.mul_f64(0.9) + pause.mul_f64(0.1);
    }

    // ── collector entry points ─────────────────────────────────────

    pub fn pop_empty_blocks(&self) {
        let mut inner = self.inner.lock();
        inner.local.pop_empty_blocks();
        inner.shared.pop_empty_blocks();
    }

    /// Move shared heads to the rest lists so allocation after the second
    /// stop-the-world promotes (and sweeps) fresh heads.
    pub fn sweep_heads(&self) {
        self.inner.lock().shared.redistribute_heads_to_rest();
    }

    /// Sweep all rest/full shared blocks, interlocked with allocation
    /// through the per-block locks and the dirty CAS.
    pub fn sweep_concurrent(&self) {
        let dirty = self.dirty_mask.load(Ordering::Relaxed);
        let blocks = self.inner.lock().shared.collect_rest_and_full();
        let mut freed = 0u64;
        let mut freed_bytes = 0u64;
        for block in blocks {
            let _guard = self
                .collector
                .block_lock(block.as_ptr() as *const u8)
                .lock();
            // SAFETY: block lock held.
            let b = unsafe { block.as_ref() };
            if b.dirty_cas(dirty) {
                let before = b.available();
                unsafe { b.sweep(self.collector.finalize_fn) };
                let n = (b.available() - before) as u64;
                freed += n;
                freed_bytes += n * b.size() as u64;
            }
        }
        let mut inner = self.inner.lock();
        inner.stats.shared_freed += freed;
        inner.stats.shared_freed_bytes += freed_bytes;
        inner.shared.redistribute_full_blocks();
    }

    /// Final sweep at shutdown: run destructors for everything left.
    pub fn sweep_final(&self) {
        let inner = self.inner.lock();
        let finalize = self.collector.finalize_fn;
        inner.shared.for_each_block(&mut |block| {
            // SAFETY: shutdown, no mutators left.
            unsafe { block.sweep(finalize) };
        });
    }

    pub fn snapshot(&self) -> HeapSnapshot {
        let inner = self.inner.lock();
        HeapSnapshot {
            stats: inner.stats,
            nursery_used_bytes: inner.nursery.used_bytes(),
            local: inner.local.stats(),
            shared: inner.shared.stats(),
        }
    }
}

/// Copy one root into the new nursery, following or installing forwarding
/// pointers, then copy its children.
unsafe fn evacuate(
    inner: &mut AllocatorInner,
    to: &mut Nursery,
    trace: TraceFn,
    slot: &mut Slot,
) {
    let Some(r) = slot.as_ref() else { return };
    let old = r.as_ptr() as *mut u8;
    if is_shared_ptr(old) {
        return;
    }
    // SAFETY: nursery object headers sit 8 bytes before the payload.
    let header = unsafe { Nursery::header_mut(old) };
    let new_ptr = if header.is_marked() {
        // Already copied this cycle (or promoted to the shared heap); the
        // forwarding pointer leads to the surviving copy either way.
        unsafe { Nursery::forwarded(old) }
    } else {
        let size = header.size();
        while !to.has_room(size) {
            let chunk_size = to.next_chunk_size();
            let chunk = inner
                .alloc_local_raw(chunk_size)
                .expect("local heap exhausted during nursery collection");
            // SAFETY: chunk is non-null.
            to.add_chunk(unsafe { NonNull::new_unchecked(chunk) }, chunk_size);
        }
        // SAFETY: headroom established; regions don't overlap.
        let new_ptr = unsafe {
            let new_ptr = to.bump(size);
            ptr::copy_nonoverlapping(old, new_ptr, size);
            Nursery::forward(old, new_ptr);
            new_ptr
        };
        // SAFETY: the copy is a valid object.
        unsafe {
            trace(new_ptr as *mut Header, &mut |child| {
                // SAFETY: children of the copied object are live slots.
                unsafe { evacuate(inner, to, trace, child) }
            });
        }
        new_ptr
    };
    // SAFETY: the forwarding target is a live object (new nursery or, for
    // previously promoted objects, the shared heap).
    *slot = Slot::Ref(unsafe { ObjRef::from_ptr(new_ptr as *mut Header) });
}
