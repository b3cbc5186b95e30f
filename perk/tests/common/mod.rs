//! AST-building helpers for the end-to-end tests. The parser is an external
//! collaborator, so test programs are assembled directly as node graphs and
//! run through the full JIT/scheduler/collector stack.
#![allow(dead_code)]

use std::sync::atomic::AtomicUsize;
use std::sync::OnceLock;

use object::{ObjRef, ObjectKind, Slot};
use perk::ast::{
    self, Apply, BranchNode, BuiltinNode, DoNode, FunctionNode, LetNode, Literal, LocalNode,
    ModuleNode, Node, RecurNode, ReturnNode, SymbolNode,
};
use perk::builtins::atom::new_atom_for_test;
use perk::objects::{self, Atom};
use perk::runtime::{current_allocator, object_lock, Runtime};

pub fn leak(node: Node) -> &'static Node {
    ast::leak(node)
}

pub fn test_module(name: &str) -> &'static ModuleNode {
    match leak(Node::Module(ModuleNode {
        name: name.to_string(),
        expressions: OnceLock::new(),
        ns: OnceLock::new(),
        roots: parking_lot::Mutex::new(Vec::new()),
    })) {
        Node::Module(m) => m,
        _ => unreachable!(),
    }
}

pub fn lit_int(value: i64) -> &'static Node {
    leak(Node::Literal(Literal {
        value: Slot::Int(value),
    }))
}

pub fn lit_bool(value: bool) -> &'static Node {
    leak(Node::Literal(Literal {
        value: Slot::Bool(value),
    }))
}

pub fn lit_undef() -> &'static Node {
    leak(Node::Literal(Literal { value: Slot::Undef }))
}

pub fn lit_str(rt: &'static Runtime, text: &str) -> &'static Node {
    let slot = rt.shared_str(text).expect("string literal");
    rt.add_root(slot);
    leak(Node::Literal(Literal { value: slot }))
}

/// A pre-resolved builtin (or any shared value) as a callable/argument.
pub fn value_node(slot: Slot) -> &'static Node {
    leak(Node::Builtin(BuiltinNode { value: slot }))
}

pub fn builtin(rt: &'static Runtime, name: &str) -> &'static Node {
    value_node(rt.find_builtin(name).expect("builtin"))
}

pub fn local(rt: &'static Runtime, name: &str, index: usize) -> &'static Node {
    leak(Node::Local(LocalNode {
        name: name.to_string(),
        namei: rt.intern(name),
        index: AtomicUsize::new(index),
    }))
}

pub fn symbol(rt: &'static Runtime, name: &str) -> &'static Node {
    leak(Node::Symbol(SymbolNode {
        name: name.to_string(),
        namei: rt.intern(name),
    }))
}

pub fn apply(callable: &'static Node, arguments: Vec<&'static Node>) -> &'static Node {
    leak(Node::Apply(Apply::new(0, true, Some(callable), arguments)))
}

pub fn branch(
    condition: &'static Node,
    on_true: &'static Node,
    on_false: &'static Node,
) -> &'static Node {
    leak(Node::Branch(BranchNode {
        condition,
        on_true,
        on_false,
    }))
}

pub fn do_(statements: Vec<&'static Node>) -> &'static Node {
    leak(Node::Do(DoNode { statements }))
}

pub fn let_(rt: &'static Runtime, name: &str, expr: &'static Node) -> &'static Node {
    leak(Node::Let(LetNode {
        name: name.to_string(),
        namei: rt.intern(name),
        expr,
    }))
}

pub fn recur(arguments: Vec<&'static Node>) -> &'static Node {
    leak(Node::Recur(RecurNode { arguments }))
}

pub fn ret(expr: &'static Node) -> &'static Node {
    leak(Node::Return(ReturnNode { expr }))
}

/// Define a function node; `params`/`locals`/`freevars` are name lists.
pub fn function(
    rt: &'static Runtime,
    module: &'static ModuleNode,
    name: &str,
    params: &[&str],
    locals: &[&str],
    freevars: &[&str],
    body: &'static Node,
) -> &'static Node {
    let intern = |names: &[&str]| names.iter().map(|n| rt.intern(n)).collect::<Vec<_>>();
    leak(Node::Function(FunctionNode::new(
        0,
        name.to_string(),
        module,
        intern(params),
        intern(locals),
        intern(freevars),
        body,
    )))
}

/// Instantiate a (freevar-free) function as a shared closure and keep it
/// rooted.
pub fn make_closure(rt: &'static Runtime, node: &'static Node) -> Slot {
    let function = match node {
        Node::Function(f) => f,
        _ => panic!("not a function node"),
    };
    assert!(function.freevars.is_empty());
    let closure = objects::new_closure(current_allocator(), function, 0, true)
        .expect("closure allocation");
    rt.add_root(closure);
    closure
}

/// A rooted atom initialized to `undefined`, for observing results from
/// inside test programs.
pub fn result_atom(rt: &'static Runtime) -> Slot {
    let atom = new_atom_for_test(current_allocator(), Slot::Undef);
    rt.add_root(atom);
    atom
}

/// `compare_and_set(atom, undefined, <expr>)` — the usual way a test
/// program publishes its result.
pub fn publish(rt: &'static Runtime, atom: Slot, expr: &'static Node) -> &'static Node {
    apply(
        builtin(rt, "compare_and_set"),
        vec![value_node(atom), lit_undef(), expr],
    )
}

pub fn atom_value(atom: Slot) -> Slot {
    let r = atom.as_ref().expect("atom ref");
    assert_eq!(r.kind(), ObjectKind::Atom);
    let _guard = object_lock(r.as_ptr() as *const u8).lock();
    // SAFETY: kind checked; read under the object lock.
    unsafe { r.cast::<Atom>() }.value
}

pub fn as_apply(node: &'static Node) -> &'static Apply {
    match node {
        Node::Apply(a) => a,
        _ => panic!("not an apply node"),
    }
}

pub fn str_value(slot: Slot) -> String {
    let r = slot.as_ref().expect("str ref");
    assert_eq!(r.kind(), ObjectKind::Str);
    // SAFETY: kind checked.
    unsafe { r.cast::<objects::Str>() }.as_str().to_string()
}

pub fn obj_ref(slot: Slot) -> ObjRef {
    slot.as_ref().expect("heap value")
}
