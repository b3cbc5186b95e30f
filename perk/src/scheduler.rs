//! Worker pool and timer reactor.
//!
//! Workers drain a shared run queue of fiber continuations. They park at
//! stop-the-world requests exactly like a mutator at a safepoint, so an
//! idle worker never stalls a collection. The reactor is a single timer
//! thread; completions are posted back onto the run queue, never executed
//! on the reactor thread itself.

use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type Job = Box<dyn FnOnce() + Send>;

struct SchedulerQueue {
    items: std::collections::VecDeque<Job>,
    stopped: bool,
}

pub struct Scheduler {
    queue: Mutex<SchedulerQueue>,
    available: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    alive: std::sync::atomic::AtomicUsize,
}

impl Scheduler {
    pub fn new(worker_count: usize) -> Self {
        Self {
            queue: Mutex::new(SchedulerQueue {
                items: std::collections::VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            worker_count,
            alive: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Workers still participating in stop-the-world rendezvous.
    pub fn alive_workers(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, job: Job) {
        let mut queue = self.queue.lock();
        queue.items.push_back(job);
        self.available.notify_one();
    }

    /// Pop one job without blocking. Used by the boot loop before workers
    /// exist.
    pub fn try_pop(&self) -> Option<Job> {
        self.queue.lock().items.pop_front()
    }

    pub fn is_stopped(&self) -> bool {
        self.queue.lock().stopped
    }

    /// Spawn the worker pool. Each worker owns an allocator registered with
    /// the runtime beforehand.
    pub fn start(&self, runtime: &'static crate::runtime::Runtime) {
        let mut workers = self.workers.lock();
        self.alive
            .store(self.worker_count, Ordering::SeqCst);
        for i in 0..self.worker_count {
            let handle = thread::Builder::new()
                .name(format!("sched-worker-{i}"))
                .spawn(move || worker_loop(runtime, i))
                .expect("spawn scheduler worker");
            workers.push(handle);
        }
    }

    pub fn stop(&self) {
        let mut queue = self.queue.lock();
        queue.stopped = true;
        self.available.notify_all();
    }

    /// Clear the stop flag after an inline boot run.
    pub fn restart(&self) {
        self.queue.lock().stopped = false;
    }

    /// Wake every worker so it observes a stop-the-world request.
    pub fn interrupt(&self) {
        self.available.notify_all();
    }

    pub fn join(&self) {
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(runtime: &'static crate::runtime::Runtime, index: usize) {
    let allocator = runtime.worker_allocator(index);
    crate::runtime::set_current_allocator(Some(allocator));

    loop {
        // park for a stop-the-world like any mutator at a safepoint
        if runtime
            .collector
            .stw_mutators_wait
            .load(Ordering::SeqCst)
        {
            runtime.collector.checkin_shared(allocator);
            continue;
        }

        let job = {
            let mut queue = runtime.scheduler.queue.lock();
            if queue.stopped {
                drop(queue);
                // keep honoring stop-the-world requests during shutdown
                if runtime
                    .collector
                    .stw_mutators_wait
                    .load(Ordering::SeqCst)
                {
                    runtime.collector.checkin_shared(allocator);
                    continue;
                }
                break;
            }
            match queue.items.pop_front() {
                Some(job) => Some(job),
                None => {
                    runtime.scheduler.available.wait(&mut queue);
                    None
                }
            }
        };
        if let Some(job) = job {
            job();
        }
    }

    // leave the rendezvous roster before the thread exits
    runtime.scheduler.alive.fetch_sub(1, Ordering::SeqCst);
    runtime.collector.rendezvous_changed();
    crate::runtime::set_current_allocator(None);
}

// ── timer reactor ─────────────────────────────────────────────────────

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap on deadline
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ReactorState {
    timers: BinaryHeap<TimerEntry>,
    seq: u64,
    stopped: bool,
}

/// Deadline-heap timer thread. A fired timer's handler runs exactly once;
/// there is no cancellation.
pub struct Reactor {
    state: Mutex<ReactorState>,
    wakeup: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReactorState {
                timers: BinaryHeap::new(),
                seq: 0,
                stopped: false,
            }),
            wakeup: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&'static self) {
        let handle = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || self.run())
            .expect("spawn reactor");
        *self.handle.lock() = Some(handle);
    }

    pub fn schedule(&self, delay: Duration, job: Job) {
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;
        state.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            job,
        });
        self.wakeup.notify_one();
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.wakeup.notify_one();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                break;
            }
            let now = Instant::now();
            match state.timers.peek() {
                Some(entry) if entry.deadline <= now => {
                    let entry = state.timers.pop().expect("peeked entry");
                    drop(state);
                    (entry.job)();
                    state = self.state.lock();
                }
                Some(entry) => {
                    let timeout = entry.deadline - now;
                    let _ = self.wakeup.wait_for(&mut state, timeout);
                }
                None => {
                    self.wakeup.wait(&mut state);
                }
            }
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}
