use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use object::{is_shared_ptr, FinalizeFn, GreyRef, Header, TraceFn};

use crate::allocator::Allocator;
use crate::block::Block;
use crate::RootWalker;

/// Work items split off during marking fan out through the shared deque once
/// a local grey list exceeds this many entries.
const GREY_SPLIT: usize = 128;

pub const BLOCK_LOCKS: usize = 1024;

type GcJob = Box<dyn FnOnce(&Collector) + Send>;

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    /// Shared-allocation delta that wakes the collector.
    pub shared_threshold: u64,
    /// Collect anyway after this long.
    pub timeout: Duration,
    /// GC worker thread count.
    pub workers: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            shared_threshold: 100 * 1024 * 1024,
            timeout: Duration::from_secs(10),
            workers: 4,
        }
    }
}

impl CollectorSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.workers == 0 {
            return Err("workers must be > 0");
        }
        if self.timeout.is_zero() {
            return Err("timeout must be > 0");
        }
        Ok(())
    }
}

/// Everything the collector needs from the runtime to drive a shared cycle:
/// when to keep running, how many mutators to park, the stop-the-world
/// hooks, root snapshots and the allocator roster.
pub trait CollectorHost: Send + Sync {
    fn collecting(&self) -> bool;
    fn mutators_to_stop(&self) -> usize;
    fn stw_start(&self, phase: u32);
    fn stw_end(&self, phase: u32);
    /// Pointer snapshots of the running fibers' and global root sets, taken
    /// during the first stop-the-world.
    fn snapshot_roots(&self) -> Vec<Vec<GreyRef>>;
    fn has_incremental_roots(&self) -> bool;
    /// Move a batch of sleeping-grey fibers to scanning and return their
    /// root pointer snapshots.
    fn incremental_roots(&self) -> Vec<Vec<GreyRef>>;
    /// The batch is fully marked; move scanning fibers to black.
    fn incremental_roots_done(&self);
    fn allocators(&self) -> Vec<Arc<Allocator>>;
}

struct CollectorState {
    work: VecDeque<GcJob>,
    busy: usize,
    stopped_mutators: usize,
    workers_started: bool,
    workers_stopped: bool,
    delta_shared_bytes: u64,
    cycles: u64,
}

/// The shared-heap collector: a small pool of GC workers draining a job
/// deque, the stop-the-world rendezvous, and the concurrent mark/sweep
/// cycle.
pub struct Collector {
    pub trace_fn: TraceFn,
    pub finalize_fn: FinalizeFn,
    pub settings: CollectorSettings,
    state: Mutex<CollectorState>,
    /// Raised while the collector wants the world stopped; mutators observe
    /// it at their safepoints.
    pub stw_mutators_wait: AtomicBool,
    /// Wakes the collector when the allocation delta crosses the threshold.
    alloc_cv: Condvar,
    /// Parks mutators during a stop-the-world.
    mutators_cv: Condvar,
    /// Wakes GC workers when jobs arrive.
    workers_cv: Condvar,
    /// Wakes the coordinator when work drains or mutators check in.
    collector_cv: Condvar,
    block_locks: Vec<Mutex<()>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(
        settings: CollectorSettings,
        trace_fn: TraceFn,
        finalize_fn: FinalizeFn,
    ) -> Arc<Self> {
        settings.validate().expect("invalid collector settings");
        let mut block_locks = Vec::with_capacity(BLOCK_LOCKS);
        block_locks.resize_with(BLOCK_LOCKS, || Mutex::new(()));
        Arc::new(Self {
            trace_fn,
            finalize_fn,
            settings,
            state: Mutex::new(CollectorState {
                work: VecDeque::new(),
                busy: 0,
                stopped_mutators: 0,
                workers_started: false,
                workers_stopped: false,
                delta_shared_bytes: 0,
                cycles: 0,
            }),
            stw_mutators_wait: AtomicBool::new(false),
            alloc_cv: Condvar::new(),
            mutators_cv: Condvar::new(),
            workers_cv: Condvar::new(),
            collector_cv: Condvar::new(),
            block_locks,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Hashed per-block lock; serializes sweep against allocation of the
    /// same block.
    #[inline]
    pub fn block_lock(&self, ptr: *const u8) -> &Mutex<()> {
        let block = ptr as usize & object::BLOCK_MASK;
        // multiply-shift over the block address; blocks are 1 MiB apart
        let hash = (block >> 20).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        &self.block_locks[(hash >> 32) as usize % BLOCK_LOCKS]
    }

    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.workers_started {
            return;
        }
        state.workers_started = true;
        drop(state);

        let mut handles = self.handles.lock();
        for i in 0..self.settings.workers {
            let me = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("gc-worker-{i}"))
                .spawn(move || me.worker_loop())
                .expect("spawn gc worker");
            handles.push(handle);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.workers_stopped = true;
            self.workers_cv.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        let mut state = self.state.lock();
        loop {
            if state.workers_stopped {
                break;
            }
            if let Some(job) = state.work.pop_front() {
                state.busy += 1;
                drop(state);
                job(self);
                state = self.state.lock();
                state.busy -= 1;
                self.collector_cv.notify_one();
            } else {
                self.workers_cv.wait(&mut state);
            }
        }
    }

    fn push_job(&self, job: GcJob) {
        let mut state = self.state.lock();
        state.work.push_back(job);
        self.workers_cv.notify_one();
    }

    /// Block until the job deque is empty and no worker is busy.
    fn perform_all_work(&self) {
        let mut state = self.state.lock();
        self.workers_cv.notify_all();
        while !(state.work.is_empty() && state.busy == 0) {
            self.collector_cv.wait(&mut state);
        }
    }

    /// Drain a grey list: mark each object, pushing unmarked children, and
    /// feed the shared deque when the local list grows past the split bound.
    pub fn mark_concurrent(&self, mut grey: Vec<GreyRef>) {
        while let Some(GreyRef(ptr)) = grey.pop() {
            debug_assert!(is_shared_ptr(ptr as *const u8));
            // SAFETY: grey entries are live shared objects.
            let (block, idx) = unsafe { Block::and_index_from_ptr(ptr as *const u8) };
            if !block.set_mark_concurrent(idx) {
                // SAFETY: shared objects only reference shared objects.
                unsafe {
                    (self.trace_fn)(ptr, &mut |slot| {
                        if let Some(r) = slot.as_ref() {
                            grey.push(GreyRef(r.as_ptr()));
                        }
                    });
                }
            }
            if grey.len() > GREY_SPLIT {
                let half = grey.split_off(grey.len() / 2);
                self.push_job(Box::new(move |c| c.mark_concurrent(half)));
            }
        }
    }

    /// Walk a root pointer down to the shared tier: shared roots go grey
    /// directly, nursery roots are traversed in place until their shared
    /// successors are found.
    fn scan_roots(&self, roots: Vec<GreyRef>) {
        unsafe fn scan(c: &Collector, ptr: *mut Header, grey: &mut Vec<GreyRef>) {
            if is_shared_ptr(ptr as *const u8) {
                grey.push(GreyRef(ptr));
                return;
            }
            // SAFETY: nursery objects are immobile while the nursery barrier
            // is up or their fiber is not running.
            unsafe {
                (c.trace_fn)(ptr, &mut |slot| {
                    if let Some(r) = slot.as_ref() {
                        // SAFETY: children of a live object.
                        unsafe { scan(c, r.as_ptr(), grey) };
                    }
                });
            }
        }

        let mut grey = Vec::new();
        for GreyRef(ptr) in roots {
            // SAFETY: root snapshots hold live objects.
            unsafe { scan(self, ptr, &mut grey) };
        }
        self.mark_concurrent(grey);
    }

    /// Scan-and-mark one root set per worker job, then wait for the marking
    /// to drain.
    fn parallel_scan(&self, root_sets: Vec<Vec<GreyRef>>) {
        for roots in root_sets {
            self.push_job(Box::new(move |c| c.scan_roots(roots)));
        }
        self.perform_all_work();
    }

    // ── mutator check-in ───────────────────────────────────────────

    /// Park at a stop-the-world request until the collector releases the
    /// world.
    pub fn checkin_shared(&self, allocator: &Allocator) {
        let start = Instant::now();
        let mut state = self.state.lock();
        state.stopped_mutators += 1;
        self.collector_cv.notify_one();
        while self.stw_mutators_wait.load(Ordering::SeqCst) {
            self.mutators_cv.wait(&mut state);
        }
        state.stopped_mutators -= 1;
        self.collector_cv.notify_one();
        drop(state);
        allocator.note_pause(start.elapsed());
    }

    /// Nursery-collect if over threshold, then report the shared-allocation
    /// delta toward the trigger.
    pub fn checkin_local(&self, allocator: &Allocator, for_each_root: RootWalker<'_>) {
        if allocator.must_collect_local() {
            allocator.collect_local(for_each_root);
            let delta = allocator.take_shared_delta();
            let mut state = self.state.lock();
            state.delta_shared_bytes += delta;
            self.alloc_cv.notify_one();
        }
    }

    /// Wake the collector regardless of the allocation delta (shutdown, or
    /// an explicit cycle request).
    pub fn notify(&self) {
        self.alloc_cv.notify_one();
    }

    /// The mutator roster changed (a worker exited); re-evaluate any pending
    /// stop-the-world rendezvous.
    pub fn rendezvous_changed(&self) {
        let _state = self.state.lock();
        self.collector_cv.notify_all();
    }

    /// Force the trigger on the next wake-up.
    pub fn request_cycle(&self) {
        let mut state = self.state.lock();
        state.delta_shared_bytes = u64::MAX;
        self.alloc_cv.notify_one();
    }

    pub fn cycles(&self) -> u64 {
        self.state.lock().cycles
    }

    // ── the shared cycle ───────────────────────────────────────────

    /// Run shared collections until `host.collecting()` turns false. This is
    /// the coordinator loop; it owns the cycle structure while workers do
    /// the scanning, marking and sweeping.
    pub fn collect_shared(&self, host: &dyn CollectorHost) {
        let mut state = self.state.lock();
        loop {
            // wait for the trigger
            let deadline = Instant::now() + self.settings.timeout;
            while state.delta_shared_bytes <= self.settings.shared_threshold && host.collecting()
            {
                let timeout = deadline.saturating_duration_since(Instant::now());
                if timeout.is_zero() {
                    tracing::debug!(
                        target: "gc",
                        delta = state.delta_shared_bytes,
                        "collecting on timeout"
                    );
                    break;
                }
                let _ = self.alloc_cv.wait_for(&mut state, timeout);
            }
            if !host.collecting() {
                break;
            }

            state.cycles += 1;
            state.delta_shared_bytes = 0;
            let cycle_start = Instant::now();

            // ── first stop-the-world ──
            self.stw_mutators_wait.store(true, Ordering::SeqCst);
            host.stw_start(1);
            while state.stopped_mutators != host.mutators_to_stop() {
                self.collector_cv.wait(&mut state);
            }

            let allocators = host.allocators();
            for a in &allocators {
                a.pop_empty_blocks();
            }

            // snapshot roots (pointer values only) and raise the barriers;
            // nursery collection stays off until the snapshots are marked,
            // because the snapshots alias nursery memory
            let snapshots = host.snapshot_roots();
            for a in &allocators {
                a.write_barrier.store(true, Ordering::SeqCst);
                a.nursery_barrier.store(true, Ordering::SeqCst);
            }
            let snapshot_time = cycle_start.elapsed();

            self.stw_mutators_wait.store(false, Ordering::SeqCst);
            host.stw_end(1);
            self.mutators_cv.notify_all();
            drop(state);

            // ── concurrent mark ──
            let mark_start = Instant::now();
            self.parallel_scan(snapshots);
            for a in &allocators {
                a.nursery_barrier.store(false, Ordering::SeqCst);
            }

            // sleeping fibers in batches, interleaved with barrier drains
            while host.has_incremental_roots() {
                self.parallel_scan(host.incremental_roots());
                host.incremental_roots_done();
                for a in &allocators {
                    let grey = a.drain_ref_list();
                    if !grey.is_empty() {
                        self.push_job(Box::new(move |c| c.mark_concurrent(grey)));
                    }
                }
                self.perform_all_work();
            }
            let mark_time = mark_start.elapsed();

            // ── second stop-the-world ──
            let remark_start = Instant::now();
            state = self.state.lock();
            self.stw_mutators_wait.store(true, Ordering::SeqCst);
            host.stw_start(2);
            while state.stopped_mutators != host.mutators_to_stop() {
                self.collector_cv.wait(&mut state);
            }
            drop(state);

            // whatever the barrier retained since the last drain
            for a in &allocators {
                let grey = a.drain_ref_list();
                if !grey.is_empty() {
                    self.push_job(Box::new(move |c| c.mark_concurrent(grey)));
                }
            }
            self.perform_all_work();

            for a in &allocators {
                debug_assert!(a.drain_ref_list().is_empty());
                a.write_barrier.store(false, Ordering::SeqCst);
                let dirty = a.dirty_mask.load(Ordering::Relaxed);
                a.dirty_mask.store(!dirty, Ordering::Relaxed);
                a.sweep_heads();
            }
            let remark_time = remark_start.elapsed();

            state = self.state.lock();
            self.stw_mutators_wait.store(false, Ordering::SeqCst);
            host.stw_end(2);
            self.mutators_cv.notify_all();
            drop(state);

            // ── concurrent sweep ──
            let sweep_start = Instant::now();
            for a in &allocators {
                let a = Arc::clone(a);
                self.push_job(Box::new(move |_| a.sweep_concurrent()));
            }
            self.perform_all_work();
            let sweep_time = sweep_start.elapsed();

            tracing::info!(
                target: "gc",
                cycle = self.cycles(),
                total_us = cycle_start.elapsed().as_micros() as u64,
                stw1_us = snapshot_time.as_micros() as u64,
                mark_us = mark_time.as_micros() as u64,
                stw2_us = remark_time.as_micros() as u64,
                sweep_us = sweep_time.as_micros() as u64,
                "shared collect done"
            );

            state = self.state.lock();
        }
    }

    /// Shutdown sweep: run remaining finalizers on every shared block.
    pub fn collect_shared_final(&self, host: &dyn CollectorHost) {
        for a in host.allocators() {
            let a = Arc::clone(&a);
            self.push_job(Box::new(move |_| a.sweep_final()));
        }
        self.perform_all_work();
    }
}
