//! Builtin callables and their dispatch tables.
//!
//! Builtins come in three dispatch kinds: *static* (one implementation,
//! validated by callable identity), *single* (on the type of argument 1)
//! and *binary* (on the pair of arguments 1 and 2). Method implementations
//! re-validate the shape they were registered for and fall back to
//! re-resolution on mismatch, which is what keeps the call-site caches
//! honest.

pub mod arith;
pub mod atom;
pub mod channel;
pub mod list;
pub mod map;
pub mod random;
pub mod string;
pub mod structs;
pub mod vector;

use object::{Header, HeaderFlags, ObjRef, ObjectKind, Slot, SlotKind};

use crate::ast::{self, Apply, FunctionNode, MethodImpl, ModuleNode, Node};
use crate::fiber::{self, Fiber};
use crate::frame::Frame;
use crate::objects::{self, alloc_fixed, display, new_error, Builtin, Closure, DispatchTable, TypeObj};
use crate::runtime::{current_allocator, Runtime};

/// Well-known builtins and type descriptors, resolved once at startup.
pub struct WellKnown {
    pub sleep: ObjRef,
    pub spawn: ObjRef,
    pub defer: ObjRef,
    pub exit: ObjRef,
    pub print: ObjRef,
    pub typeof_: ObjRef,
    pub not: ObjRef,
    pub str_: ObjRef,
    pub length: ObjRef,
    pub get: ObjRef,
    pub assoc: ObjRef,
    pub contains: ObjRef,
    pub conj: ObjRef,
    pub first: ObjRef,
    pub next: ObjRef,
    pub channel: ObjRef,
    pub send: ObjRef,
    pub recv: ObjRef,
    pub atom: ObjRef,
    pub deref: ObjRef,
    pub compare_and_set: ObjRef,
    pub add: ObjRef,
    pub subtract: ObjRef,
    pub multiply: ObjRef,
    pub modulo: ObjRef,
    pub equals: ObjRef,
    pub not_equals: ObjRef,
    pub lessthan: ObjRef,
    pub greaterthan: ObjRef,
    pub random: ObjRef,
    pub undef_type: ObjRef,
    pub int_type: ObjRef,
    pub bool_type: ObjRef,
    pub float_type: ObjRef,
    pub type_by_kind: [ObjRef; ObjectKind::COUNT],
}

impl WellKnown {
    /// The type descriptor of any value.
    pub fn type_of(&self, slot: Slot) -> *const TypeObj {
        let r = match slot {
            Slot::Undef => self.undef_type,
            Slot::Int(_) => self.int_type,
            Slot::Bool(_) => self.bool_type,
            Slot::Float(_) => self.float_type,
            Slot::Ref(r) => self.type_by_kind[r.kind() as usize],
        };
        r.as_ptr() as *const TypeObj
    }
}

// ── builtin construction ──────────────────────────────────────────────

fn new_builtin(rt: &'static Runtime, name: &'static str, dispatch: DispatchTable) -> ObjRef {
    let r = alloc_fixed(
        current_allocator(),
        true,
        true,
        Builtin {
            header: Header::with_flags(ObjectKind::Builtin, HeaderFlags::FINALIZER),
            name,
            dispatch,
        },
    )
    .expect("shared heap exhausted creating builtin");
    rt.register_builtin(name, Slot::Ref(r));
    r
}

pub fn static_builtin(rt: &'static Runtime, name: &'static str, method: MethodImpl) -> ObjRef {
    new_builtin(rt, name, DispatchTable::Static(method))
}

pub fn single_builtin(rt: &'static Runtime, name: &'static str) -> ObjRef {
    new_builtin(rt, name, DispatchTable::Single(Vec::new()))
}

pub fn binary_builtin(rt: &'static Runtime, name: &'static str) -> ObjRef {
    new_builtin(
        rt,
        name,
        DispatchTable::Binary {
            kk: Vec::new(),
            tk: Vec::new(),
            kt: Vec::new(),
            tt: Vec::new(),
        },
    )
}

pub fn register_single(builtin: ObjRef, type_: ObjRef, method: MethodImpl) {
    // SAFETY: init-time mutation, before any dispatch can observe the table.
    let b = unsafe { builtin.cast_mut::<Builtin>() };
    match &mut b.dispatch {
        DispatchTable::Single(table) => table.push((type_.as_ptr() as *const TypeObj, method)),
        _ => panic!("{} is not a single-dispatch builtin", b.name),
    }
}

pub fn register_binary_kk(builtin: ObjRef, lhs: SlotKind, rhs: SlotKind, method: MethodImpl) {
    // SAFETY: as above.
    let b = unsafe { builtin.cast_mut::<Builtin>() };
    match &mut b.dispatch {
        DispatchTable::Binary { kk, .. } => kk.push(((lhs, rhs), method)),
        _ => panic!("{} is not a binary-dispatch builtin", b.name),
    }
}

pub fn register_binary_tt(builtin: ObjRef, lhs: ObjRef, rhs: ObjRef, method: MethodImpl) {
    // SAFETY: as above.
    let b = unsafe { builtin.cast_mut::<Builtin>() };
    match &mut b.dispatch {
        DispatchTable::Binary { tt, .. } => tt.push((
            (
                lhs.as_ptr() as *const TypeObj,
                rhs.as_ptr() as *const TypeObj,
            ),
            method,
        )),
        _ => panic!("{} is not a binary-dispatch builtin", b.name),
    }
}

// ── dispatch resolution ───────────────────────────────────────────────

/// Resolve the callable against this call's argument shapes. The bootstrap
/// target of every call site funnels through here; a `Err` carries the
/// error value to raise.
pub fn resolve_dispatch(
    fbr: &mut Fiber,
    apply: &Apply,
    callable: Slot,
) -> Result<MethodImpl, Slot> {
    let rt = fbr.runtime;
    let Some(r) = callable.as_ref() else {
        return Err(new_error(
            fbr.allocator(),
            "not-a-function",
            &format!("{} is not callable", objects::repr(callable)),
        ));
    };
    match r.kind() {
        ObjectKind::Closure => {
            // first dispatch to a user function compiles it
            // SAFETY: kind checked.
            let function = unsafe { r.cast::<Closure>() }.function();
            Ok(rt.jit.code(function))
        }
        ObjectKind::StructType => Ok(structs::bi_construct as MethodImpl),
        ObjectKind::Builtin => {
            // SAFETY: kind checked.
            let builtin = unsafe { r.cast::<Builtin>() };
            let wk = rt.wk();
            let argc = apply.argument_count();
            let base = fbr.stack.base(argc);
            match &builtin.dispatch {
                DispatchTable::Static(method) => Ok(*method),
                DispatchTable::Single(table) => {
                    if argc < 1 {
                        return Err(not_defined(fbr, builtin.name));
                    }
                    let t1 = wk.type_of(fbr.stack.argument(base, 1));
                    table
                        .iter()
                        .find(|(t, _)| *t == t1)
                        .map(|(_, m)| *m)
                        .ok_or_else(|| not_defined(fbr, builtin.name))
                }
                DispatchTable::Binary { kk, tk, kt, tt } => {
                    if argc != 2 {
                        return Err(not_defined(fbr, builtin.name));
                    }
                    let a = fbr.stack.argument(base, 1);
                    let b = fbr.stack.argument(base, 2);
                    let (k1, k2) = (a.kind(), b.kind());
                    let (t1, t2) = (wk.type_of(a), wk.type_of(b));
                    kk.iter()
                        .find(|((x, y), _)| *x == k1 && *y == k2)
                        .map(|(_, m)| *m)
                        .or_else(|| {
                            tk.iter()
                                .find(|((x, y), _)| *x == t1 && *y == k2)
                                .map(|(_, m)| *m)
                        })
                        .or_else(|| {
                            kt.iter()
                                .find(|((x, y), _)| *x == k1 && *y == t2)
                                .map(|(_, m)| *m)
                        })
                        .or_else(|| {
                            tt.iter()
                                .find(|((x, y), _)| *x == t1 && *y == t2)
                                .map(|(_, m)| *m)
                        })
                        .ok_or_else(|| not_defined(fbr, builtin.name))
                }
            }
        }
        _ => Err(new_error(
            fbr.allocator(),
            "not-a-function",
            &format!("{} is not callable", objects::repr(callable)),
        )),
    }
}

fn not_defined(fbr: &mut Fiber, name: &str) -> Slot {
    new_error(
        fbr.allocator(),
        "not-defined-for-argument-types",
        &format!("{name} is not defined for these argument types"),
    )
}

// ── core builtins ─────────────────────────────────────────────────────

pub extern "C" fn bi_print(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let print = frame.fbr.runtime.wk().print;
    if !frame.matches_static(print) {
        return frame.bad_dispatch();
    }
    let parts: Vec<String> = (1..=frame.argc()).map(|i| display(frame.arg(i))).collect();
    println!("{}", parts.join(" "));
    frame.result(Slot::Undef)
}

pub extern "C" fn bi_typeof(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let typeof_ = frame.fbr.runtime.wk().typeof_;
    if !frame.matches_static(typeof_) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(1) {
        return code;
    }
    let t = frame.fbr.runtime.wk().type_of(frame.arg(1));
    // SAFETY: type descriptors are live heap objects.
    let slot = Slot::Ref(unsafe { ObjRef::from_ptr(t as *mut Header) });
    frame.result(slot)
}

pub extern "C" fn bi_not(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let not = frame.fbr.runtime.wk().not;
    if !frame.matches_static(not) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(1) {
        return code;
    }
    let value = !frame.arg(1).truthy();
    frame.result(Slot::Bool(value))
}

pub extern "C" fn bi_str(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let str_ = frame.fbr.runtime.wk().str_;
    if !frame.matches_static(str_) {
        return frame.bad_dispatch();
    }
    let text: String = (1..=frame.argc()).map(|i| display(frame.arg(i))).collect();
    match objects::new_str(frame.fbr.allocator(), &text, false) {
        Ok(slot) => frame.result(slot),
        Err(_) => frame.raise("allocation-failed", "string too large"),
    }
}

// ── installation ──────────────────────────────────────────────────────

const KIND_TYPE_NAMES: [&str; ObjectKind::COUNT] = [
    "String",
    "Function",
    "Builtin",
    "Type",
    "Map",
    "MapNode",
    "Vector",
    "VectorNode",
    "List",
    "Channel",
    "Atom",
    "Error",
    "Fiber",
    "Struct",
    "StructInstance",
];

pub fn install(rt: &'static Runtime) -> WellKnown {
    use SlotKind::{Float, Int};

    let type_by_kind: [ObjRef; ObjectKind::COUNT] =
        std::array::from_fn(|i| rt.create_type(KIND_TYPE_NAMES[i]));
    let undef_type = rt.create_type("Undefined");
    let int_type = rt.create_type("Integer");
    let bool_type = rt.create_type("Boolean");
    let float_type = rt.create_type("Float");

    let str_type = type_by_kind[ObjectKind::Str as usize];
    let map_type = type_by_kind[ObjectKind::Map as usize];
    let vector_type = type_by_kind[ObjectKind::Vector as usize];
    let list_type = type_by_kind[ObjectKind::List as usize];
    let channel_type = type_by_kind[ObjectKind::Channel as usize];
    let atom_type = type_by_kind[ObjectKind::Atom as usize];
    let struct_inst_type = type_by_kind[ObjectKind::StructInst as usize];

    // fiber control
    let sleep = static_builtin(rt, "sleep", fiber::bi_sleep);
    let spawn = static_builtin(rt, "spawn", fiber::bi_spawn);
    let defer = static_builtin(rt, "defer", fiber::bi_defer);
    let exit = static_builtin(rt, "exit", fiber::bi_exit);

    // core
    let print = static_builtin(rt, "print", bi_print);
    let typeof_ = static_builtin(rt, "typeof", bi_typeof);
    let not = static_builtin(rt, "not", bi_not);
    let str_ = static_builtin(rt, "str", bi_str);
    let random = static_builtin(rt, "random", random::bi_random);

    // collections
    let length = single_builtin(rt, "length");
    register_single(length, str_type, string::bi_length);
    register_single(length, list_type, list::bi_length);
    register_single(length, map_type, map::bi_length);
    register_single(length, vector_type, vector::bi_length);

    let get = single_builtin(rt, "get");
    register_single(get, str_type, string::bi_get);
    register_single(get, map_type, map::bi_get);
    register_single(get, vector_type, vector::bi_get);
    register_single(get, struct_inst_type, structs::bi_get);

    let assoc = single_builtin(rt, "assoc");
    register_single(assoc, map_type, map::bi_assoc);

    let contains = single_builtin(rt, "contains");
    register_single(contains, map_type, map::bi_contains);

    let conj = single_builtin(rt, "conj");
    register_single(conj, list_type, list::bi_conj);
    register_single(conj, vector_type, vector::bi_conj);

    let first = single_builtin(rt, "first");
    register_single(first, list_type, list::bi_first);

    let next = single_builtin(rt, "next");
    register_single(next, list_type, list::bi_next);

    // channels
    let channel = static_builtin(rt, "channel", channel::bi_channel);
    let send = single_builtin(rt, "send");
    register_single(send, channel_type, channel::bi_send);
    let recv = single_builtin(rt, "recv");
    register_single(recv, channel_type, channel::bi_recv);

    // atoms
    let atom = static_builtin(rt, "atom", atom::bi_atom);
    let deref = single_builtin(rt, "deref");
    register_single(deref, atom_type, atom::bi_deref);
    let compare_and_set = single_builtin(rt, "compare_and_set");
    register_single(compare_and_set, atom_type, atom::bi_compare_and_set);

    // arithmetic and comparison
    let numeric = [(Int, Int), (Int, Float), (Float, Int), (Float, Float)];

    let add = binary_builtin(rt, "add");
    for (l, r) in numeric {
        register_binary_kk(add, l, r, arith::bi_add_num);
    }
    register_binary_tt(add, str_type, str_type, arith::bi_add_str);

    let subtract = binary_builtin(rt, "subtract");
    let multiply = binary_builtin(rt, "multiply");
    let modulo = binary_builtin(rt, "modulo");
    for (l, r) in numeric {
        register_binary_kk(subtract, l, r, arith::bi_sub_num);
        register_binary_kk(multiply, l, r, arith::bi_mul_num);
        register_binary_kk(modulo, l, r, arith::bi_mod_num);
    }

    let equals = binary_builtin(rt, "equals");
    let not_equals = binary_builtin(rt, "not_equals");
    for l in [
        SlotKind::Undef,
        SlotKind::Int,
        SlotKind::Bool,
        SlotKind::Float,
        SlotKind::Ref,
    ] {
        for r in [
            SlotKind::Undef,
            SlotKind::Int,
            SlotKind::Bool,
            SlotKind::Float,
            SlotKind::Ref,
        ] {
            register_binary_kk(equals, l, r, arith::bi_equals);
            register_binary_kk(not_equals, l, r, arith::bi_not_equals);
        }
    }

    let lessthan = binary_builtin(rt, "lessthan");
    let greaterthan = binary_builtin(rt, "greaterthan");
    for (l, r) in numeric {
        register_binary_kk(lessthan, l, r, arith::bi_lt_num);
        register_binary_kk(greaterthan, l, r, arith::bi_gt_num);
    }
    register_binary_tt(lessthan, str_type, str_type, arith::bi_lt_str);
    register_binary_tt(greaterthan, str_type, str_type, arith::bi_gt_str);

    let wk = WellKnown {
        sleep,
        spawn,
        defer,
        exit,
        print,
        typeof_,
        not,
        str_,
        length,
        get,
        assoc,
        contains,
        conj,
        first,
        next,
        channel,
        send,
        recv,
        atom,
        deref,
        compare_and_set,
        add,
        subtract,
        multiply,
        modulo,
        equals,
        not_equals,
        lessthan,
        greaterthan,
        random,
        undef_type,
        int_type,
        bool_type,
        float_type,
        type_by_kind,
    };

    install_apply_defers(rt, first, next);
    wk
}

/// Synthesize the `__apply_defers__` function: walk the defer list calling
/// each closure, last-deferred first, entirely in compiled code.
fn install_apply_defers(rt: &'static Runtime, first: ObjRef, next: ObjRef) {
    let module = match ast::leak(Node::Module(ModuleNode {
        name: "__runtime__".to_string(),
        expressions: std::sync::OnceLock::new(),
        ns: std::sync::OnceLock::new(),
        roots: parking_lot::Mutex::new(Vec::new()),
    })) {
        Node::Module(m) => m,
        _ => unreachable!(),
    };

    let ds_namei = rt.intern("ds");
    let local_ds = || {
        ast::leak(Node::Local(ast::LocalNode {
            name: "ds".to_string(),
            namei: ds_namei,
            index: std::sync::atomic::AtomicUsize::new(1),
        }))
    };

    // first(ds)
    let first_call = ast::leak(Node::Apply(Apply::new(
        0,
        true,
        Some(ast::leak(Node::Builtin(ast::BuiltinNode {
            value: Slot::Ref(first),
        }))),
        vec![local_ds()],
    )));
    // (first(ds))()
    let invoke = ast::leak(Node::Apply(Apply::new(0, true, Some(first_call), vec![])));
    // next(ds)
    let next_call = ast::leak(Node::Apply(Apply::new(
        0,
        true,
        Some(ast::leak(Node::Builtin(ast::BuiltinNode {
            value: Slot::Ref(next),
        }))),
        vec![local_ds()],
    )));
    // __apply_defers__(next(ds)), resolved through the builtin registry
    let self_sym = ast::leak(Node::Symbol(ast::SymbolNode {
        name: "__apply_defers__".to_string(),
        namei: rt.apply_defers_namei,
    }));
    let recurse = ast::leak(Node::Apply(Apply::new(0, true, Some(self_sym), vec![next_call])));

    let body = ast::leak(Node::Branch(ast::BranchNode {
        condition: local_ds(),
        on_true: ast::leak(Node::Do(ast::DoNode {
            statements: vec![invoke, recurse],
        })),
        on_false: ast::leak(Node::Literal(ast::Literal {
            value: Slot::Bool(false),
        })),
    }));

    let function: &'static FunctionNode = match ast::leak(Node::Function(FunctionNode::new(
        0,
        "__apply_defers__".to_string(),
        module,
        vec![ds_namei],
        Vec::new(),
        Vec::new(),
        body,
    ))) {
        Node::Function(f) => f,
        _ => unreachable!(),
    };

    let closure = objects::new_closure(current_allocator(), function, 0, true)
        .expect("shared heap exhausted creating __apply_defers__");
    rt.register_builtin("__apply_defers__", closure);
}
