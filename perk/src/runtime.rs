//! The runtime: interned names, builtin/module/type registries, fiber color
//! lists, the collector host, and the module loader.
//!
//! There is one runtime per process and it is leaked at startup: compiled
//! code, AST nodes and allocators all assume process lifetime. The runtime
//! lock guards the registries and the color lists; it is never held across
//! blocking I/O or fiber execution.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};

use heap::{Allocator, Collector, CollectorHost, CollectorSettings, HeapError};
use object::{GreyRef, ObjRef, ObjectKind, Slot};

use crate::ast::{self, Apply, AstReader, ModuleNode, Node, ReadError};
use crate::builtins::{self, map as map_b, vector as vector_b, WellKnown};
use crate::fiber::{Fiber, FiberColor};
use crate::jit::Jit;
use crate::objects::{self, Closure};
use crate::pack::PackValue;
use crate::scheduler::{Reactor, Scheduler};

pub const OBJECT_LOCKS: usize = 1024;

static OBJECT_LOCK_ARRAY: [Mutex<()>; OBJECT_LOCKS] = [const { Mutex::new(()) }; OBJECT_LOCKS];

/// Hashed per-object lock; protects atom compare-and-set and channel queue
/// mutation.
pub fn object_lock(ptr: *const u8) -> &'static Mutex<()> {
    let hash = (ptr as usize >> 4).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    &OBJECT_LOCK_ARRAY[(hash >> 32) as usize % OBJECT_LOCKS]
}

// ── current allocator (per worker thread) ─────────────────────────────

thread_local! {
    static CURRENT_ALLOCATOR: Cell<Option<NonNull<Allocator>>> = const { Cell::new(None) };
}

pub fn set_current_allocator(alloc: Option<&'static Allocator>) {
    CURRENT_ALLOCATOR.with(|cell| cell.set(alloc.map(NonNull::from)));
}

/// The allocator bound to this worker thread.
pub fn current_allocator() -> &'static Allocator {
    let ptr = CURRENT_ALLOCATOR
        .with(|cell| cell.get())
        .expect("no allocator bound to this thread");
    // SAFETY: allocators live for the process lifetime.
    unsafe { &*ptr.as_ptr() }
}

// ── interning ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Interner {
    map: HashMap<&'static str, usize>,
    names: Vec<&'static str>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> usize {
        if let Some(&i) = self.map.get(name) {
            return i;
        }
        let name: &'static str = Box::leak(name.to_string().into_boxed_str());
        let i = self.names.len();
        self.names.push(name);
        self.map.insert(name, i);
        i
    }

    fn name(&self, namei: usize) -> &'static str {
        self.names[namei]
    }
}

// ── namespaces ────────────────────────────────────────────────────────

/// A loaded module's definitions, keyed by interned name.
pub struct Namespace {
    pub name: String,
    defs: Mutex<HashMap<usize, Slot>>,
}

impl Namespace {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            defs: Mutex::new(HashMap::new()),
        })
    }

    pub fn find(&self, namei: usize) -> Option<Slot> {
        self.defs.lock().get(&namei).copied()
    }

    pub fn define(&self, namei: usize, value: Slot) {
        self.defs.lock().insert(namei, value);
    }

    fn root_refs(&self) -> Vec<GreyRef> {
        self.defs
            .lock()
            .values()
            .filter_map(|slot| slot.as_ref().map(|r| GreyRef(r.as_ptr())))
            .collect()
    }
}

// ── color lists ───────────────────────────────────────────────────────

#[derive(Default)]
struct ColorSets {
    running: Vec<ObjRef>,
    grey: VecDeque<ObjRef>,
    black: Vec<ObjRef>,
    scanning: Vec<ObjRef>,
}

impl ColorSets {
    fn remove(&mut self, color: FiberColor, fiber: ObjRef) {
        let found = match color {
            FiberColor::Running => {
                Self::take(&mut self.running, fiber)
            }
            FiberColor::SleepingGrey => {
                if let Some(pos) = self.grey.iter().position(|f| *f == fiber) {
                    self.grey.remove(pos);
                    true
                } else {
                    false
                }
            }
            FiberColor::SleepingBlack => Self::take(&mut self.black, fiber),
            FiberColor::SleepingScanning => Self::take(&mut self.scanning, fiber),
            FiberColor::Detached => true,
        };
        debug_assert!(found, "fiber missing from its color list");
    }

    fn take(list: &mut Vec<ObjRef>, fiber: ObjRef) -> bool {
        if let Some(pos) = list.iter().position(|f| *f == fiber) {
            list.swap_remove(pos);
            true
        } else {
            false
        }
    }
}

struct RuntimeState {
    builtins: HashMap<usize, Slot>,
    modules: HashMap<String, Arc<Namespace>>,
    types: Vec<Slot>,
    roots: Vec<Slot>,
    module_nodes: Vec<&'static ModuleNode>,
    fibers: ColorSets,
}

static APPLY_DEFERS_NODE: OnceLock<&'static Node> = OnceLock::new();

/// The synthesized call site that applies a frame's defer list.
pub fn apply_defers_node() -> &'static Node {
    APPLY_DEFERS_NODE
        .get()
        .expect("runtime not initialized")
}

#[derive(Debug)]
pub enum LoadError {
    Io(String),
    Read(ReadError),
    Missing(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Read(e) => write!(f, "{e}"),
            Self::Missing(what) => write!(f, "{what}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<ReadError> for LoadError {
    fn from(e: ReadError) -> Self {
        Self::Read(e)
    }
}

pub struct Runtime {
    pub collector: Arc<Collector>,
    pub jit: Jit,
    pub scheduler: Scheduler,
    pub reactor: Reactor,
    allocators: Vec<Arc<Allocator>>,
    interns: Mutex<Interner>,
    state: Mutex<RuntimeState>,
    /// Signalled when a scanning/grey fiber turns black during concurrent
    /// mark.
    fiber_black_cv: Condvar,
    /// Signalled when a fiber's worker binding is fully released.
    fiber_released_cv: Condvar,
    stopped: AtomicBool,
    exit_code: AtomicI32,
    wk: OnceLock<WellKnown>,
    main_fiber: OnceLock<ObjRef>,
    boot_applies: OnceLock<[&'static Apply; 3]>,
    pub lambda_namei: usize,
    pub defers_namei: usize,
    pub apply_defers_namei: usize,
}

impl Runtime {
    /// Build and leak the process runtime.
    pub fn create() -> &'static Runtime {
        let settings = CollectorSettings::default();
        Self::create_with(settings)
    }

    pub fn create_with(settings: CollectorSettings) -> &'static Runtime {
        let collector = Collector::new(settings, objects::trace_object, objects::finalize_object);

        let workers = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(4);
        let mut allocators = Vec::with_capacity(workers + 1);
        for _ in 0..=workers {
            allocators.push(Allocator::new(Arc::clone(&collector)));
        }

        let mut interns = Interner::default();
        let lambda_namei = interns.intern("__lambda__");
        let defers_namei = interns.intern("__defers__");
        let apply_defers_namei = interns.intern("__apply_defers__");

        let runtime: &'static Runtime = Box::leak(Box::new(Runtime {
            collector,
            jit: Jit::new(),
            scheduler: Scheduler::new(workers),
            reactor: Reactor::new(),
            allocators,
            interns: Mutex::new(interns),
            state: Mutex::new(RuntimeState {
                builtins: HashMap::new(),
                modules: HashMap::new(),
                types: Vec::new(),
                roots: Vec::new(),
                module_nodes: Vec::new(),
                fibers: ColorSets::default(),
            }),
            fiber_black_cv: Condvar::new(),
            fiber_released_cv: Condvar::new(),
            stopped: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            wk: OnceLock::new(),
            main_fiber: OnceLock::new(),
            boot_applies: OnceLock::new(),
            lambda_namei,
            defers_namei,
            apply_defers_namei,
        }));

        // the main thread allocates through the base allocator during init
        // and loading
        set_current_allocator(Some(runtime.base_allocator()));

        let wk = builtins::install(runtime);
        runtime.wk.set(wk).ok().expect("install builtins once");

        let boot = [
            runtime.make_boot_apply(0),
            runtime.make_boot_apply(1),
            runtime.make_boot_apply(2),
        ];
        runtime.boot_applies.set(boot).ok().expect("boot applies once");

        APPLY_DEFERS_NODE
            .set(runtime.make_apply_defers_node())
            .ok()
            .expect("apply-defers node once");

        let main = Fiber::create(runtime, true);
        runtime.main_fiber.set(main).ok().expect("main fiber once");

        runtime.reactor.start();
        runtime
    }

    fn make_boot_apply(&'static self, argc: usize) -> &'static Apply {
        let arguments = (0..argc)
            .map(|_| {
                ast::leak(Node::Literal(ast::Literal { value: Slot::Undef }))
            })
            .collect();
        let node = ast::leak(Node::Apply(Apply::new(0, true, None, arguments)));
        match node {
            Node::Apply(apply) => apply,
            _ => unreachable!(),
        }
    }

    /// `Apply(Symbol(__apply_defers__), [Symbol(__defers__)])`: emitted on
    /// every defers path, resolved through the builtin registry.
    fn make_apply_defers_node(&'static self) -> &'static Node {
        let callee = ast::leak(Node::Symbol(ast::SymbolNode {
            name: "__apply_defers__".to_string(),
            namei: self.apply_defers_namei,
        }));
        let defers_sym = ast::leak(Node::Symbol(ast::SymbolNode {
            name: "__defers__".to_string(),
            namei: self.defers_namei,
        }));
        ast::leak(Node::Apply(Apply::new(
            0,
            true,
            Some(callee),
            vec![defers_sym],
        )))
    }

    pub fn boot_apply(&self, argc: usize) -> &'static Apply {
        self.boot_applies.get().expect("runtime initialized")[argc]
    }

    pub fn base_allocator(&self) -> &'static Allocator {
        // SAFETY: the runtime (and its allocators) are leaked.
        unsafe { &*(self.allocators[0].as_ref() as *const Allocator) }
    }

    pub fn worker_allocator(&self, index: usize) -> &'static Allocator {
        // SAFETY: as above.
        unsafe { &*(self.allocators[index + 1].as_ref() as *const Allocator) }
    }

    pub fn wk(&self) -> &WellKnown {
        self.wk.get().expect("runtime initialized")
    }

    pub fn main_fiber(&self) -> ObjRef {
        *self.main_fiber.get().expect("runtime initialized")
    }

    // ── interning and registries ───────────────────────────────────

    pub fn intern(&self, name: &str) -> usize {
        self.interns.lock().intern(name)
    }

    pub fn name_of(&self, namei: usize) -> &'static str {
        self.interns.lock().name(namei)
    }

    pub fn register_builtin(&self, name: &str, value: Slot) {
        let namei = self.intern(name);
        let mut state = self.state.lock();
        if state.builtins.insert(namei, value).is_some() {
            panic!("cannot redefine builtin: {name}");
        }
    }

    pub fn find_builtin(&self, name: &str) -> Option<Slot> {
        let namei = self.intern(name);
        self.find_builtin_namei(namei)
    }

    pub fn find_builtin_namei(&self, namei: usize) -> Option<Slot> {
        self.state.lock().builtins.get(&namei).copied()
    }

    /// Create a type descriptor object and register it as a root.
    pub fn create_type(&self, name: &'static str) -> ObjRef {
        let r = objects::alloc_fixed(
            current_allocator(),
            true,
            false,
            objects::TypeObj {
                header: object::Header::new(ObjectKind::Type),
                name,
            },
        )
        .expect("shared heap exhausted creating type");
        self.state.lock().types.push(Slot::Ref(r));
        r
    }

    pub fn add_root(&self, slot: Slot) {
        self.state.lock().roots.push(slot);
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Per-allocator heap statistics snapshots.
    pub fn heap_snapshots(&self) -> Vec<heap::HeapSnapshot> {
        self.allocators.iter().map(|a| a.snapshot()).collect()
    }

    /// Stop the scheduler event loop; called when the main fiber exits.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.scheduler.stop();
        self.collector.notify();
    }

    // ── value helpers for the loader ───────────────────────────────

    pub fn shared_str(&self, s: &str) -> Result<Slot, HeapError> {
        objects::new_str(current_allocator(), s, true)
    }

    pub fn empty_vector(&self) -> Result<Slot, HeapError> {
        vector_b::empty(current_allocator(), true)
    }

    pub fn empty_map(&self) -> Result<Slot, HeapError> {
        map_b::empty(current_allocator(), true)
    }

    /// Convert a packed data value into a (shared) runtime value.
    pub fn pack_to_slot(&self, value: &PackValue) -> Result<Slot, String> {
        let alloc = current_allocator();
        match value {
            PackValue::Int(i) => Ok(Slot::Int(*i)),
            PackValue::Bool(b) => Ok(Slot::Bool(*b)),
            PackValue::Str(s) => objects::new_str(alloc, s, true).map_err(|e| e.to_string()),
            PackValue::Atom(inner) => self.pack_to_slot(inner),
            PackValue::Array(items) => {
                let mut vec = vector_b::empty(alloc, true).map_err(|e| e.to_string())?;
                for item in items {
                    let slot = self.pack_to_slot(item)?;
                    vec = vector_b::conj(alloc, vec, slot, true).map_err(|e| e.to_string())?;
                }
                Ok(vec)
            }
            PackValue::Map(entries) => {
                let mut map = map_b::empty(alloc, true).map_err(|e| e.to_string())?;
                for (k, v) in entries {
                    let key = self.pack_to_slot(k)?;
                    let value = self.pack_to_slot(v)?;
                    map = map_b::assoc(alloc, map, key, value, true)
                        .map_err(|e| format!("{e:?}"))?;
                }
                Ok(map)
            }
        }
    }

    // ── fibers and color lists ─────────────────────────────────────

    pub fn fiber_created(&self, fiber: ObjRef) {
        let mut state = self.state.lock();
        // SAFETY: fiber objects are led by their header.
        let fbr = unsafe { &*(fiber.as_ptr() as *const Fiber) };
        debug_assert_eq!(fbr.color.get(), FiberColor::Detached);
        if self.base_allocator().write_barrier.load(Ordering::SeqCst) {
            // born black during concurrent mark: the stacks are empty, and
            // anything stored into them later is retained by the barrier or
            // allocated marked. Grey would stall an attach that races the
            // end of the incremental scan.
            fbr.color.set(FiberColor::SleepingBlack);
            state.fibers.black.push(fiber);
        } else {
            fbr.color.set(FiberColor::SleepingGrey);
            state.fibers.grey.push_back(fiber);
        }
    }

    pub fn fiber_exited(&self, fiber: ObjRef) {
        let mut state = self.state.lock();
        // SAFETY: as above.
        let fbr = unsafe { &*(fiber.as_ptr() as *const Fiber) };
        state.fibers.remove(fbr.color.get(), fiber);
        fbr.color.set(FiberColor::Detached);
        self.fiber_released_cv.notify_all();
    }

    /// Bind a fiber to the calling worker. During concurrent mark an
    /// unscanned fiber first waits until the collector has traced it.
    pub fn fiber_attach(&self, fbr: &mut Fiber) {
        let alloc = current_allocator();
        let fiber = fbr.self_ref();
        let mut state = self.state.lock();

        // a resume can race the releasing worker's detach; wait it out
        while fbr.color.get() == FiberColor::Running {
            self.fiber_released_cv.wait(&mut state);
        }

        if alloc.write_barrier.load(Ordering::SeqCst) {
            let color = fbr.color.get();
            if color == FiberColor::SleepingGrey || color == FiberColor::SleepingScanning {
                if color == FiberColor::SleepingGrey {
                    // move to the front of the grey list so the collector
                    // picks it up quickly
                    state.fibers.remove(color, fiber);
                    state.fibers.grey.push_front(fiber);
                }
                while fbr.color.get() != FiberColor::SleepingBlack {
                    self.fiber_black_cv.wait(&mut state);
                }
            }
        }

        state.fibers.remove(fbr.color.get(), fiber);
        fbr.color.set(FiberColor::Running);
        state.fibers.running.push(fiber);
        drop(state);

        fbr.bind_allocator(alloc);
    }

    pub fn fiber_detach(&self, fbr: &mut Fiber) {
        if fbr.color.get() == FiberColor::Detached {
            // the fiber exited inside the trampoline
            return;
        }
        let barrier_on = fbr.allocator().write_barrier.load(Ordering::SeqCst);
        fbr.unbind_allocator();
        let fiber = fbr.self_ref();
        let mut state = self.state.lock();
        state.fibers.remove(FiberColor::Running, fiber);
        if barrier_on {
            // this fiber's roots were snapshotted while it ran; it is clean
            // for this cycle
            fbr.color.set(FiberColor::SleepingBlack);
            state.fibers.black.push(fiber);
        } else {
            fbr.color.set(FiberColor::SleepingGrey);
            state.fibers.grey.push_back(fiber);
        }
        self.fiber_released_cv.notify_all();
    }

    /// Push a closure call onto a (detached) fiber and schedule it.
    pub fn run_closure(&'static self, fiber: ObjRef, closure: Slot) {
        debug_assert!(closure.as_ref().map(|r| r.is_shared()).unwrap_or(false));
        // SAFETY: the fiber was just created and is not bound anywhere.
        let fbr = unsafe { &mut *(fiber.as_ptr() as *mut Fiber) };
        fbr.stack.push(closure);
        let r = closure.as_ref().expect("closure ref");
        // SAFETY: kind validated by the callers.
        let function = unsafe { r.cast::<Closure>() }.function();
        let code = self.jit.code(function);
        let apply = self.boot_apply(0);
        fbr.enqueue(Box::new(move |f| f.runtime.jit.enter(f, apply, code)));
    }

    // ── module loading ─────────────────────────────────────────────

    /// Ensure `path`'s `.pck` is current, rebuilding through the registered
    /// compiler entry point when it is missing or stale.
    fn compile_if_stale(&'static self, path: &Path) -> Result<std::path::PathBuf, LoadError> {
        let path_prk = path.with_extension("prk");
        let path_pck = path.with_extension("pck");

        let pck_meta = std::fs::metadata(&path_pck).ok();
        let prk_meta = std::fs::metadata(&path_prk).ok();

        let stale = match (&pck_meta, &prk_meta) {
            (None, None) => {
                return Err(LoadError::Missing(format!(
                    "cannot find {} or {}",
                    path_prk.display(),
                    path_pck.display()
                )))
            }
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(pck), Some(prk)) => match (prk.modified(), pck.modified()) {
                (Ok(src), Ok(out)) => src > out,
                _ => false,
            },
        };

        if stale {
            let compile = self.find_builtin("__compile__").ok_or_else(|| {
                LoadError::Missing(format!(
                    "{} is stale and no compiler module is loaded",
                    path_pck.display()
                ))
            })?;
            let r = compile
                .as_ref()
                .filter(|r| r.kind() == ObjectKind::Closure)
                .ok_or_else(|| LoadError::Missing("__compile__ is not a function".into()))?;
            // SAFETY: kind checked.
            let function = unsafe { r.cast::<Closure>() }.function();
            let code = self.jit.code(function);

            let main = self.main_fiber();
            // SAFETY: the loader owns the main fiber.
            let fbr = unsafe { &mut *(main.as_ptr() as *mut Fiber) };
            fbr.stack.push(compile);
            fbr.stack
                .push(self.shared_str(&path_prk.display().to_string()).map_err(|e| {
                    LoadError::Io(e.to_string())
                })?);
            fbr.stack
                .push(self.shared_str(&path_pck.display().to_string()).map_err(|e| {
                    LoadError::Io(e.to_string())
                })?);
            self.run_boot(main, self.boot_apply(2), code);
        }

        Ok(path_pck)
    }

    /// Drive a single call on the given fiber to completion with an inline
    /// event loop. Used during loading, before the worker pool exists.
    fn run_boot(&'static self, fiber: ObjRef, apply: &'static Apply, code: ast::MethodImpl) {
        // SAFETY: loader-owned fiber.
        let fbr = unsafe { &mut *(fiber.as_ptr() as *mut Fiber) };
        self.fiber_detach(fbr);
        fbr.enqueue(Box::new(move |f| f.runtime.jit.enter(f, apply, code)));

        while !self.stopped.load(Ordering::SeqCst) {
            match self.scheduler.try_pop() {
                Some(job) => job(),
                None => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        // the boot call "stopped" the runtime on completion; restart
        self.stopped.store(false, Ordering::SeqCst);
        self.scheduler.restart();
        self.fiber_attach(fbr);
    }

    fn read_module_file(
        &'static self,
        path: &Path,
        name: &str,
    ) -> Result<&'static ModuleNode, LoadError> {
        let pck = self.compile_if_stale(path)?;
        let bytes = std::fs::read(&pck).map_err(|e| LoadError::Io(e.to_string()))?;
        self.read_module_bytes(&bytes, name)
    }

    pub fn read_module_bytes(
        &'static self,
        bytes: &[u8],
        name: &str,
    ) -> Result<&'static ModuleNode, LoadError> {
        let module = AstReader::new(self, bytes).read_module(name)?;
        self.state.lock().module_nodes.push(module);
        Ok(module)
    }

    /// Two-stage load: read and evaluate defines for the dependency graph,
    /// then link imports.
    pub fn load_main_module(&'static self, path: &str) -> Result<Arc<Namespace>, LoadError> {
        let mut todo: Vec<(std::path::PathBuf, String)> =
            vec![(Path::new(path).to_path_buf(), "__main__".to_string())];
        let mut visited: std::collections::HashSet<String> = Default::default();
        let mut order: Vec<String> = Vec::new();

        // stage 0: load and evaluate defines
        while let Some((current_path, current_name)) = todo.pop() {
            if !visited.insert(current_name.clone()) {
                continue;
            }
            order.push(current_name.clone());
            let module = self.read_module_file(&current_path, &current_name)?;
            tracing::debug!(target: "loader", module = %current_name, "loaded module");
            let ns = Namespace::new(&current_name);
            module.ns.set(Arc::clone(&ns)).ok();
            self.state
                .lock()
                .modules
                .insert(current_name.clone(), Arc::clone(&ns));

            for &node in module.expressions.get().expect("module expressions") {
                match node {
                    Node::Import(import) => {
                        let from_path = Path::new(&import.from).to_path_buf();
                        todo.push((from_path, import.from.clone()));
                    }
                    _ => self.load_define(&ns, node)?,
                }
            }
        }

        // stage 1: link imports
        for name in &order {
            let (module, ns) = {
                let state = self.state.lock();
                let ns = state.modules.get(name).expect("loaded module").clone();
                let module = *state
                    .module_nodes
                    .iter()
                    .find(|m| m.name == *name)
                    .expect("loaded module node");
                (module, ns)
            };
            for &node in module.expressions.get().expect("module expressions") {
                if let Node::Import(import) = node {
                    let from_ns = self
                        .state
                        .lock()
                        .modules
                        .get(&import.from)
                        .cloned()
                        .ok_or_else(|| {
                            LoadError::Missing(format!("module not loaded: {}", import.from))
                        })?;
                    for (sym_name, namei) in &import.imports {
                        match from_ns.find(*namei) {
                            Some(value) => ns.define(*namei, value),
                            None => {
                                return Err(LoadError::Missing(format!(
                                    "could not find {} in {}",
                                    sym_name, import.from
                                )))
                            }
                        }
                    }
                }
            }
        }

        let state = self.state.lock();
        Ok(state.modules.get("__main__").expect("main module").clone())
    }

    fn load_define(&'static self, ns: &Namespace, node: &'static Node) -> Result<(), LoadError> {
        match node {
            Node::Define(define) => {
                if let Some(mut data) = define.data {
                    current_allocator().share(&mut data);
                    ns.define(define.namei, data);
                    return Ok(());
                }
                match define.expr {
                    Some(Node::Function(function)) => {
                        debug_assert!(function.freevars.is_empty());
                        let mut closure =
                            objects::new_closure(current_allocator(), function, 0, true)
                                .map_err(|e| LoadError::Io(e.to_string()))?;
                        current_allocator().share(&mut closure);
                        ns.define(define.namei, closure);
                        Ok(())
                    }
                    Some(Node::Struct(struct_node)) => {
                        let value = builtins::structs::new_struct_type(struct_node)
                            .map_err(|e| LoadError::Io(e.to_string()))?;
                        ns.define(define.namei, value);
                        Ok(())
                    }
                    Some(_) => Err(LoadError::Missing(format!(
                        "define {} must hold data, a function or a struct",
                        define.name
                    ))),
                    None => Err(LoadError::Missing(format!(
                        "define {} has neither expression nor data",
                        define.name
                    ))),
                }
            }
            Node::Struct(struct_node) => {
                let value = builtins::structs::new_struct_type(struct_node)
                    .map_err(|e| LoadError::Io(e.to_string()))?;
                ns.define(struct_node.namei, value);
                Ok(())
            }
            _ => Err(LoadError::Missing(
                "unsupported module-level expression".into(),
            )),
        }
    }

    // ── the top-level run ──────────────────────────────────────────

    /// Load and run `path`'s `main`. Returns the process exit code.
    pub fn run(&'static self, path: &str) -> i32 {
        let main_fiber = self.main_fiber();
        // SAFETY: the main fiber is exclusively ours until workers start.
        let fbr = unsafe { &mut *(main_fiber.as_ptr() as *mut Fiber) };
        self.fiber_attach(fbr);

        let ns = match self.load_main_module(path) {
            Ok(ns) => ns,
            Err(e) => {
                eprintln!("error loading {path}: {e}");
                return 1;
            }
        };

        let main_namei = self.intern("main");
        let Some(main_value) = ns.find(main_namei) else {
            eprintln!("could not find function main in {path}");
            return 1;
        };
        if !matches!(
            main_value.as_ref().map(|r| r.kind()),
            Some(ObjectKind::Closure)
        ) {
            eprintln!("main is not a function in {path}");
            return 1;
        }

        self.fiber_detach(fbr);
        self.run_main_closure(main_value)
    }

    /// Schedule `closure` as the main fiber's entry point and drive the
    /// whole lifecycle: worker pool, collector coordination, shutdown.
    pub fn run_main_closure(&'static self, mut closure: Slot) -> i32 {
        current_allocator().share(&mut closure);
        self.add_root(closure);

        let main_fiber = self.main_fiber();
        // SAFETY: the main fiber is not bound to any worker yet.
        let fbr = unsafe { &mut *(main_fiber.as_ptr() as *mut Fiber) };
        let r = closure
            .as_ref()
            .filter(|r| r.kind() == ObjectKind::Closure)
            .expect("main entry is not a function");
        // SAFETY: kind checked.
        let function = unsafe { r.cast::<Closure>() }.function();
        let code = self.jit.code(function);

        fbr.stack.push(closure);
        let apply = self.boot_apply(0);
        fbr.enqueue(Box::new(move |f| f.runtime.jit.enter(f, apply, code)));

        self.scheduler.start(self);
        self.collector.start();
        // the calling thread becomes the collector coordinator
        self.collector.collect_shared(&RuntimeHost(self));

        self.scheduler.join();
        self.reactor.stop();
        self.collector.collect_shared_final(&RuntimeHost(self));
        self.collector.stop();

        self.exit_code()
    }
}

// ── collector host ────────────────────────────────────────────────────

pub struct RuntimeHost(pub &'static Runtime);

fn fiber_root_refs(fiber: ObjRef) -> Vec<GreyRef> {
    let mut refs = vec![GreyRef(fiber.as_ptr())];
    // SAFETY: fibers on the color lists are live; the fiber is either
    // parked at a safepoint or sleeping while we read its roots.
    let fbr = unsafe { &mut *(fiber.as_ptr() as *mut Fiber) };
    fbr.roots(&mut |slot| {
        if let Some(r) = slot.as_ref() {
            refs.push(GreyRef(r.as_ptr()));
        }
    });
    refs
}

impl CollectorHost for RuntimeHost {
    fn collecting(&self) -> bool {
        !self.0.stopped.load(Ordering::SeqCst)
    }

    fn mutators_to_stop(&self) -> usize {
        self.0.scheduler.alive_workers()
    }

    fn stw_start(&self, _phase: u32) {
        self.0.scheduler.interrupt();
    }

    fn stw_end(&self, phase: u32) {
        if phase == 2 {
            // re-whiten: the black list becomes the next cycle's grey list.
            // A fiber spawned after the last incremental batch may still sit
            // on the grey list; it stays grey, which is the conservative
            // color.
            let mut state = self.0.state.lock();
            debug_assert!(state.fibers.scanning.is_empty());
            let black = std::mem::take(&mut state.fibers.black);
            for fiber in black {
                // SAFETY: live fiber.
                let fbr = unsafe { &*(fiber.as_ptr() as *const Fiber) };
                fbr.color.set(FiberColor::SleepingGrey);
                state.fibers.grey.push_back(fiber);
            }
        }
    }

    fn snapshot_roots(&self) -> Vec<Vec<GreyRef>> {
        let state = self.0.state.lock();
        let mut sets = Vec::new();

        let builtin_refs: Vec<GreyRef> = state
            .builtins
            .values()
            .filter_map(|slot| slot.as_ref().map(|r| GreyRef(r.as_ptr())))
            .collect();
        sets.push(builtin_refs);

        let mut global_refs: Vec<GreyRef> = state
            .types
            .iter()
            .chain(state.roots.iter())
            .filter_map(|slot| slot.as_ref().map(|r| GreyRef(r.as_ptr())))
            .collect();
        for module in &state.module_nodes {
            for slot in module.roots.lock().iter() {
                if let Some(r) = slot.as_ref() {
                    global_refs.push(GreyRef(r.as_ptr()));
                }
            }
        }
        sets.push(global_refs);

        for ns in state.modules.values() {
            sets.push(ns.root_refs());
        }

        for fiber in &state.fibers.running {
            sets.push(fiber_root_refs(*fiber));
        }
        sets
    }

    fn has_incremental_roots(&self) -> bool {
        !self.0.state.lock().fibers.grey.is_empty()
    }

    fn incremental_roots(&self) -> Vec<Vec<GreyRef>> {
        let mut state = self.0.state.lock();
        let mut sets = Vec::new();
        for _ in 0..100 {
            let Some(fiber) = state.fibers.grey.pop_front() else {
                break;
            };
            // SAFETY: live fiber.
            let fbr = unsafe { &*(fiber.as_ptr() as *const Fiber) };
            debug_assert_eq!(fbr.color.get(), FiberColor::SleepingGrey);
            fbr.color.set(FiberColor::SleepingScanning);
            state.fibers.scanning.push(fiber);
            sets.push(fiber_root_refs(fiber));
        }
        sets
    }

    fn incremental_roots_done(&self) {
        let mut state = self.0.state.lock();
        let scanning = std::mem::take(&mut state.fibers.scanning);
        for fiber in scanning {
            // SAFETY: live fiber.
            let fbr = unsafe { &*(fiber.as_ptr() as *const Fiber) };
            fbr.color.set(FiberColor::SleepingBlack);
            state.fibers.black.push(fiber);
        }
        self.0.fiber_black_cv.notify_all();
    }

    fn allocators(&self) -> Vec<Arc<Allocator>> {
        self.0.allocators.clone()
    }
}

// ── test support ──────────────────────────────────────────────────────

#[cfg(test)]
pub fn test_allocator() -> Arc<Allocator> {
    let collector = Collector::new(
        CollectorSettings::default(),
        objects::trace_object,
        objects::finalize_object,
    );
    Allocator::new(collector)
}

#[cfg(test)]
pub fn with_test_allocator(f: impl FnOnce()) {
    // leak: unit tests share the process-lifetime assumption
    let arc: &'static Arc<Allocator> = Box::leak(Box::new(test_allocator()));
    set_current_allocator(Some(arc.as_ref()));
    f();
    set_current_allocator(None);
}
