//! Fibers: green threads owning a value stack, a frame stack and a nursery.
//!
//! A fiber is itself a shared-heap object so channels and the scheduler can
//! hold references to it. At any moment it is bound to at most one worker
//! thread; binding swaps the fiber's nursery into the worker's allocator
//! under the runtime lock.

use std::cell::Cell;
use std::ptr::NonNull;
use std::time::Duration;

use heap::Allocator;
use object::{Header, HeaderFlags, ObjRef, ObjectKind, Slot};

use crate::ast::{Apply, FunctionNode};
use crate::builtins::list;
use crate::frame::Frame;
use crate::objects::{self, alloc_fixed, new_error, Closure};
use crate::runtime::Runtime;
use crate::stack::ValueStack;

/// Spare slots the prolog demands beyond the declared locals, covering the
/// expression temporaries of one frame.
const FRAME_HEADROOM: usize = 64;

/// Continuation run by the trampoline; the return value is the exit code
/// fed to `post_exit`.
pub type Trampoline = Box<dyn FnOnce(&mut Fiber) -> i64 + Send>;

/// Resume callback stored by a blocking builtin. Returns true when the
/// fiber should resume immediately with the result already pushed.
pub type ResumeCallback = Box<dyn FnOnce(&mut Fiber) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberColor {
    Detached,
    Running,
    SleepingGrey,
    SleepingBlack,
    SleepingScanning,
}

/// One entry of the frame stack, pushed by the function prolog.
#[derive(Clone, Copy)]
pub struct FrameEntry {
    pub apply: *const Apply,
    pub base: usize,
    pub argument_count: usize,
    pub local_count: usize,
    /// Cons list of deferred closures, `Undef` until the first defer.
    pub defers: Slot,
}

#[repr(C)]
pub struct Fiber {
    pub header: Header,
    pub runtime: &'static Runtime,
    pub is_main: bool,
    pub stack: ValueStack,
    pub frames: Vec<FrameEntry>,
    /// Machine return addresses of the active compiled frames.
    pub links: Vec<*const u8>,
    nursery: heap::Nursery,
    checkpoint: u32,
    pub color: Cell<FiberColor>,
    allocator: Cell<Option<NonNull<Allocator>>>,
    cc_resume: Option<ResumeCallback>,
}

impl Fiber {
    pub fn create(runtime: &'static Runtime, is_main: bool) -> ObjRef {
        let fiber = Fiber {
            header: Header::with_flags(ObjectKind::Fiber, HeaderFlags::FINALIZER),
            runtime,
            is_main,
            stack: ValueStack::new(),
            frames: Vec::new(),
            links: Vec::new(),
            nursery: heap::Nursery::new(),
            checkpoint: 0,
            color: Cell::new(FiberColor::Detached),
            allocator: Cell::new(None),
            cc_resume: None,
        };
        let r = alloc_fixed(crate::runtime::current_allocator(), true, true, fiber)
            .expect("shared heap exhausted creating fiber");
        runtime.fiber_created(r);
        r
    }

    #[inline(always)]
    pub fn self_ref(&self) -> ObjRef {
        // SAFETY: fibers are heap objects led by their header.
        unsafe { ObjRef::from_ptr(self as *const Fiber as *mut Header) }
    }

    /// The allocator this fiber is currently bound to. Allocators live for
    /// the process lifetime.
    #[inline(always)]
    pub fn allocator(&self) -> &'static Allocator {
        let ptr = self.allocator.get().expect("fiber not bound to a worker");
        // SAFETY: allocators are owned by the runtime and never dropped.
        unsafe { &*ptr.as_ptr() }
    }

    /// Bind this fiber's nursery into the worker's allocator. Runtime-lock
    /// holder only.
    pub fn bind_allocator(&mut self, alloc: &Allocator) {
        debug_assert!(self.allocator.get().is_none());
        self.allocator.set(Some(NonNull::from(alloc)));
        alloc.swap_nursery(&mut self.nursery);
    }

    /// Inverse of [`Fiber::bind_allocator`].
    pub fn unbind_allocator(&mut self) {
        let alloc = self.allocator();
        alloc.swap_nursery(&mut self.nursery);
        self.allocator.set(None);
    }

    /// Visit the fiber's roots: every value stack slot plus the defer lists
    /// of the frame stack.
    pub fn roots(&mut self, visit: &mut dyn FnMut(&mut Slot)) {
        self.stack.each(visit);
        for frame in self.frames.iter_mut() {
            if frame.defers.is_ref() {
                visit(&mut frame.defers);
            }
        }
    }

    // ── symbol resolution ──────────────────────────────────────────

    fn current_closure_slot(&self) -> Slot {
        let frame = self.frames.last().expect("no active frame");
        self.stack.callable(frame.base)
    }

    pub fn current_closure(&self) -> &Closure {
        let slot = self.current_closure_slot();
        let r = slot.as_ref().expect("frame callable is not a closure");
        debug_assert_eq!(r.kind(), ObjectKind::Closure);
        // SAFETY: prolog validated the callable kind.
        unsafe { r.cast() }
    }

    /// Current frame's defer list; an empty list is materialized when none
    /// has been recorded yet.
    pub fn defers_list(&mut self) -> Slot {
        let frame = self.frames.last().expect("no active frame");
        if frame.defers.is_ref() {
            frame.defers
        } else {
            list::empty(self.allocator())
        }
    }

    pub fn lookup(&mut self, namei: usize) -> Option<Slot> {
        if !self.frames.is_empty() {
            let rt = self.runtime;
            if namei == rt.lambda_namei {
                return Some(self.current_closure_slot());
            }
            if namei == rt.defers_namei {
                return Some(self.defers_list());
            }
            let base = self.frames.last().expect("frame").base;
            let closure = self.current_closure();
            let function = closure.function();
            if let Some(index) = function.local_index(namei) {
                return Some(self.stack.local(base, index));
            }
            if let Some(index) = function.freevar_index(namei) {
                return Some(closure.freevars()[index]);
            }
        }
        self.runtime.find_builtin_namei(namei)
    }

    // ── helper bodies called from compiled code ────────────────────

    pub fn exec_literal(&mut self, value: Slot) {
        self.stack.push(value);
    }

    pub fn exec_symbol(&mut self, namei: usize, name: &str) {
        match self.lookup(namei) {
            Some(value) => self.stack.push(value),
            None => {
                let err = new_error(
                    self.allocator(),
                    "symbol-not-found",
                    &format!("symbol not found: {name}"),
                );
                self.stack.push(err);
            }
        }
    }

    pub fn exec_local(&mut self, index: usize) {
        let base = self.frames.last().expect("no active frame").base;
        self.stack.push_local(base, index);
    }

    pub fn exec_let(&mut self, namei: usize, name: &str) {
        let base = self.frames.last().expect("no active frame").base;
        let function = self.current_closure().function();
        match function.local_index(namei) {
            Some(index) => self.stack.set_local(base, index),
            None => panic!("let target is not a local of {}: {name}", function.name),
        }
    }

    pub fn exec_pop(&mut self) {
        debug_assert!(!self.stack.is_empty());
        self.stack.pop();
    }

    pub fn exec_bool(&mut self) -> i64 {
        self.stack.pop().truthy() as i64
    }

    pub fn exec_check_defers(&self) -> i64 {
        self.frames.last().expect("no active frame").defers.is_ref() as i64
    }

    pub fn exec_recur(&mut self, argument_count: usize) {
        let frame = self.frames.last_mut().expect("no active frame");
        debug_assert_eq!(argument_count, frame.argument_count);
        let local_count = frame.local_count;
        frame.defers = Slot::Undef;
        self.stack.recur(argument_count, local_count);
    }

    /// Build a closure for a function literal, capturing its free variables
    /// from the current scope.
    pub fn exec_function(&mut self, function: &'static FunctionNode) {
        let alloc = self.allocator();
        let nfree = function.freevars.len();
        let closure = objects::new_closure(alloc, function, nfree, false)
            .expect("allocation failed creating closure");
        for (i, namei) in function.freevars.iter().enumerate() {
            let value = self
                .lookup(*namei)
                .unwrap_or_else(|| panic!("unresolved free variable in {}", function.name));
            let r = closure.as_ref().expect("closure ref");
            // SAFETY: freshly created closure, owned by this fiber.
            unsafe { r.cast_mut::<Closure>() }.freevars_mut()[i] = value;
        }
        self.stack.push(closure);
    }

    /// Raise `tag` in place of a call: pushes a frame with no locals and the
    /// error as its only result, so the emitted return path unwinds it.
    fn raise_in_prolog(
        &mut self,
        apply: &Apply,
        base: usize,
        link: *const u8,
        tag: &'static str,
        message: &str,
    ) -> i64 {
        self.frames.push(FrameEntry {
            apply,
            base,
            argument_count: apply.argument_count(),
            local_count: 0,
            defers: Slot::Undef,
        });
        self.links.push(link);
        let err = new_error(self.allocator(), tag, message);
        self.stack.push(err);
        1
    }

    /// A stale cached target entered this stub. Re-resolve; if resolution
    /// itself fails, the error has already replaced the call on the stack,
    /// and this stub pushed no frame yet, so record an empty one for the
    /// emitted return path to unwind through.
    fn redispatch_in_prolog(&mut self, apply: &Apply, link: *const u8) -> i64 {
        let code = self.dispatch_and_install(apply);
        if code == 1 {
            self.frames.push(FrameEntry {
                apply,
                base: self.stack.size() - 1,
                argument_count: 0,
                local_count: 0,
                defers: Slot::Undef,
            });
            self.links.push(link);
        }
        code
    }

    pub fn exec_prolog(
        &mut self,
        apply: &Apply,
        function: &'static FunctionNode,
        link: *const u8,
    ) -> i64 {
        let argument_count = apply.argument_count();
        let base = self.stack.base(argument_count);
        let callable = self.stack.callable(base);

        let closure = match callable.as_ref() {
            Some(r) if r.kind() == ObjectKind::Closure => {
                // SAFETY: kind checked.
                unsafe { r.cast::<Closure>() }
            }
            // not a closure: some other callable kind, re-dispatch
            _ => return self.redispatch_in_prolog(apply, link),
        };
        if !std::ptr::eq(closure.function, function) {
            // a closure, but of a different function
            return self.redispatch_in_prolog(apply, link);
        }

        if argument_count != function.parameters.len() {
            let message = format!(
                "{} takes {} arguments, got {argument_count}",
                function.name,
                function.parameters.len()
            );
            return self.raise_in_prolog(apply, base, link, "bad-arity", &message);
        }

        let local_count = function.local_count();
        if !self.stack.ensure_capacity(local_count + FRAME_HEADROOM) {
            return self.raise_in_prolog(apply, base, link, "stack-overflow", "value stack overflow");
        }

        self.frames.push(FrameEntry {
            apply,
            base,
            argument_count,
            local_count,
            defers: Slot::Undef,
        });
        self.links.push(link);
        self.stack.init_locals(local_count);
        0
    }

    pub fn exec_checkpoint(&mut self) {
        self.checkpoint = self.checkpoint.wrapping_add(1);
        if self.checkpoint % 256 == 0 {
            let collector = &self.runtime.collector;
            let allocator = self.allocator();
            if collector
                .stw_mutators_wait
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                collector.checkin_shared(allocator);
            }
            // SAFETY: reborrow for the root walker; no other alias exists
            // while the checkpoint runs.
            let me = unsafe { &mut *(self as *mut Fiber) };
            collector.checkin_local(allocator, &mut |visit| me.roots(visit));
        }
    }

    fn pop_frame_with(&mut self, push_result: impl FnOnce(&mut Fiber)) -> *const u8 {
        let frame = *self.frames.last().expect("no active frame");
        self.stack.pop_frame(frame.base);
        push_result(self);
        let link = self.links.pop().expect("link stack underflow");
        self.frames.pop();
        link
    }

    pub fn exec_epilog(&mut self, link_out: *mut *const u8) -> i64 {
        let frame = *self.frames.last().expect("no active frame");
        // SAFETY: call-site nodes live for the process lifetime.
        let apply = unsafe { &*frame.apply };
        let result = self.stack.pop();
        self.stack.pop_n(frame.local_count);
        let link = self.pop_frame_with(|fbr| fbr.stack.push(result));
        // SAFETY: link_out points at the reserved machine-stack slot.
        unsafe { *link_out = link };
        if objects::is_error(result) && apply.throws {
            1
        } else {
            0
        }
    }

    /// Called when compiled code jumps out of the JIT: records the frame a
    /// builtin would not otherwise push and returns the address that leaves
    /// the outermost compiled frame.
    pub fn exec_exit(&mut self, apply: &Apply, link: *const u8) -> *const u8 {
        let argument_count = apply.argument_count();
        self.frames.push(FrameEntry {
            apply,
            base: self.stack.base(argument_count),
            argument_count,
            local_count: 0,
            defers: Slot::Undef,
        });
        self.links.push(link);
        self.links[0]
    }

    // ── dispatch ───────────────────────────────────────────────────

    /// The bootstrap target of every call site: resolve the callable against
    /// the argument shapes, install the method, and have the emitted code
    /// retry through the cache.
    pub fn dispatch_and_install(&mut self, apply: &Apply) -> i64 {
        let base = self.stack.base(apply.argument_count());
        let callable = self.stack.callable(base);
        match crate::builtins::resolve_dispatch(self, apply, callable) {
            Ok(method) => {
                apply.set_target(method);
                -1
            }
            Err(err) => {
                self.stack.pop_n(apply.argument_count() + 1);
                self.stack.push(err);
                1
            }
        }
    }

    // ── scheduling ─────────────────────────────────────────────────

    pub fn store_cc_resume(&mut self, callback: ResumeCallback) {
        debug_assert!(self.cc_resume.is_none());
        self.cc_resume = Some(callback);
    }

    fn resume(&mut self, link: *const u8, ret_code: i64) -> i64 {
        self.runtime.jit.reenter(self, link, ret_code)
    }

    /// Enqueue a continuation for this fiber on the scheduler.
    pub fn enqueue(&self, f: Trampoline) {
        let fiber = self.self_ref();
        self.runtime.scheduler.enqueue(Box::new(move || {
            // SAFETY: the fiber is kept alive by the runtime's fiber lists.
            let fbr = unsafe { &mut *(fiber.as_ptr() as *mut Fiber) };
            fbr.attach_and_exec(f);
        }));
    }

    /// Pop the blocked frame, push the result produced by `f`, and schedule
    /// the fiber to re-enter compiled code where it left off.
    pub fn resume_async(&mut self, f: impl FnOnce(&mut Fiber) + Send + 'static, ret_code: i64) {
        let link = self.pop_frame_with(f);
        let link_addr = link as usize;
        self.enqueue(Box::new(move |fbr| fbr.resume(link_addr as *const u8, ret_code)));
    }

    /// The worker-side trampoline: bind, run continuations until the fiber
    /// blocks or exits, unbind.
    pub fn attach_and_exec(&mut self, f: Trampoline) {
        let runtime = self.runtime;
        runtime.fiber_attach(self);
        let mut next = Some(f);
        while let Some(f) = next.take() {
            let code = f(self);
            next = self.post_exit(code);
        }
        runtime.fiber_detach(self);
    }

    /// Handle a trampoline exit code. Returns the next continuation, or
    /// `None` when the fiber blocked or exited.
    fn post_exit(&mut self, code: i64) -> Option<Trampoline> {
        match code {
            // 0 = normal exit, 1 = unhandled error, 2 = early exit
            0 | 1 | 2 => {
                if code == 1 {
                    let error = self.stack.back();
                    eprintln!("exit with unhandled error!: {}", objects::repr(error));
                    if self.is_main {
                        self.runtime.set_exit_code(1);
                    }
                }
                // note that pending defers are not run on the unhandled
                // error path; the stack is dropped as-is
                self.stack.clear();
                self.frames.clear();
                self.links.clear();
                if self.is_main {
                    self.runtime.stop();
                } else {
                    self.allocator().clear_nursery();
                }
                self.runtime.fiber_exited(self.self_ref());
                None
            }
            // blocked awaiting an external completion
            4 => {
                let callback = self.cc_resume.take().expect("cc resume callback missing");
                if callback(self) {
                    let result = self.stack.pop();
                    let link = self.pop_frame_with(|fbr| fbr.stack.push(result));
                    let link_addr = link as usize;
                    Some(Box::new(move |fbr| {
                        fbr.resume(link_addr as *const u8, 0)
                    }))
                } else {
                    None
                }
            }
            other => panic!("unexpected exit code {other}"),
        }
    }

    // ── blocking builtins ──────────────────────────────────────────

    pub fn sleep(&mut self, milliseconds: i64) {
        let fiber = self.self_ref();
        let runtime = self.runtime;
        runtime.reactor.schedule(
            Duration::from_millis(milliseconds.max(0) as u64),
            Box::new(move || {
                // SAFETY: sleeping fibers stay alive through the runtime's
                // fiber lists.
                let fbr = unsafe { &mut *(fiber.as_ptr() as *mut Fiber) };
                fbr.resume_async(|fbr| fbr.stack.push(Slot::Bool(true)), 0);
            }),
        );
    }

    pub fn spawn_closure(&mut self, mut closure: Slot) {
        self.allocator().share(&mut closure);
        let runtime = self.runtime;
        let fiber = Fiber::create(runtime, false);
        runtime.run_closure(fiber, closure);
    }

    pub fn push_defer(&mut self, closure: Slot) {
        let defers = self.defers_list();
        let new_list = list::conj(self.allocator(), defers, closure)
            .expect("allocation failed recording defer");
        self.frames.last_mut().expect("no active frame").defers = new_list;
    }
}

// ── fiber builtins ────────────────────────────────────────────────────

pub extern "C" fn bi_sleep(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let sleep = frame.fbr.runtime.wk().sleep;
    if !frame.matches_static(sleep) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(1) {
        return code;
    }
    let Some(ms) = frame.arg(1).to_index() else {
        return frame.raise("bad-argument", "sleep expects a millisecond count");
    };
    frame.cc_resume(Box::new(move |fbr: &mut Fiber| {
        fbr.sleep(ms);
        false
    }))
}

pub extern "C" fn bi_spawn(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let spawn = frame.fbr.runtime.wk().spawn;
    if !frame.matches_static(spawn) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(1) {
        return code;
    }
    let closure = frame.arg(1);
    if !matches!(closure.as_ref().map(|r| r.kind()), Some(ObjectKind::Closure)) {
        return frame.raise("bad-argument", "spawn expects a function");
    }
    frame.fbr.spawn_closure(closure);
    frame.result(closure)
}

pub extern "C" fn bi_defer(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let defer = frame.fbr.runtime.wk().defer;
    if !frame.matches_static(defer) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(1) {
        return code;
    }
    let closure = frame.arg(1);
    if !matches!(closure.as_ref().map(|r| r.kind()), Some(ObjectKind::Closure)) {
        return frame.raise("bad-argument", "defer expects a function");
    }
    frame.fbr.push_defer(closure);
    frame.result(closure)
}

pub extern "C" fn bi_exit(_fbr: *mut Fiber, _apply: *const Apply) -> i64 {
    2
}
