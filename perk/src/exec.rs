//! The C-ABI helper surface called from compiled code.
//!
//! Every compiled function is a sequence of calls into these helpers, one
//! per AST node, with control flow lowered to native branches. Helpers take
//! `(fiber, node)` plus an occasional extra argument; status-returning
//! helpers follow the 0 / <0 / 1 / >1 protocol described on
//! [`MethodImpl`](crate::ast::MethodImpl).

use crate::ast::{Apply, BranchNode, BuiltinNode, FunctionNode, GlobalNode, LetNode, Literal, LocalNode, SymbolNode};
use crate::fiber::Fiber;
use crate::objects::new_error;

pub extern "C" fn exec_literal(fbr: *mut Fiber, node: *const Literal) {
    // SAFETY: compiled code passes a live fiber and a process-lifetime node.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_literal(node.value);
}

pub extern "C" fn exec_symbol(fbr: *mut Fiber, node: *const SymbolNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_symbol(node.namei, &node.name);
}

pub extern "C" fn exec_builtin(fbr: *mut Fiber, node: *const BuiltinNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_literal(node.value);
}

pub extern "C" fn exec_let(fbr: *mut Fiber, node: *const LetNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_let(node.namei, &node.name);
}

pub extern "C" fn exec_local(fbr: *mut Fiber, node: *const LocalNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_local(node.index.load(std::sync::atomic::Ordering::Relaxed));
}

pub extern "C" fn exec_global(fbr: *mut Fiber, node: *const GlobalNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    match node.value() {
        Ok(value) => fbr.stack.push(value),
        Err(message) => {
            let err = new_error(fbr.allocator(), "symbol-not-found", &message);
            fbr.stack.push(err);
        }
    }
}

pub extern "C" fn exec_pop(fbr: *mut Fiber, _node: *const u8) {
    // SAFETY: as above.
    let fbr = unsafe { &mut *fbr };
    fbr.exec_pop();
}

pub extern "C" fn exec_bool(fbr: *mut Fiber, _node: *const BranchNode) -> i64 {
    // SAFETY: as above.
    let fbr = unsafe { &mut *fbr };
    fbr.exec_bool()
}

pub extern "C" fn exec_check_defers(fbr: *mut Fiber, _node: *const u8) -> i64 {
    // SAFETY: as above.
    let fbr = unsafe { &mut *fbr };
    fbr.exec_check_defers()
}

pub extern "C" fn exec_recur(fbr: *mut Fiber, node: *const crate::ast::RecurNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_recur(node.arguments.len());
}

pub extern "C" fn exec_function(fbr: *mut Fiber, node: *const FunctionNode) {
    // SAFETY: as above.
    let (fbr, node) = unsafe { (&mut *fbr, &*node) };
    fbr.exec_function(node);
}

pub extern "C" fn exec_function_prolog(
    fbr: *mut Fiber,
    apply: *const Apply,
    function: *const FunctionNode,
    link: *const u8,
) -> i64 {
    // SAFETY: as above.
    let (fbr, apply, function) = unsafe { (&mut *fbr, &*apply, &*function) };
    fbr.exec_prolog(apply, function, link)
}

pub extern "C" fn exec_function_checkpoint(fbr: *mut Fiber, _node: *const FunctionNode) {
    // SAFETY: as above.
    let fbr = unsafe { &mut *fbr };
    fbr.exec_checkpoint();
}

pub extern "C" fn exec_function_epilog(
    fbr: *mut Fiber,
    _node: *const FunctionNode,
    link_out: *mut *const u8,
) -> i64 {
    // SAFETY: as above.
    let fbr = unsafe { &mut *fbr };
    fbr.exec_epilog(link_out)
}

pub extern "C" fn exec_exit(fbr: *mut Fiber, apply: *const Apply, link: *const u8) -> *const u8 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    fbr.exec_exit(apply, link)
}

/// Bootstrap value of every call site's target cell.
pub extern "C" fn exec_dispatch_target(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    fbr.dispatch_and_install(apply)
}
