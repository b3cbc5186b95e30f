//! Per-function code generation and the trampoline thunks.
//!
//! Compiled code performs no inline arithmetic: each AST node lowers to a
//! call into a fixed runtime helper, while control flow (branches, returns,
//! tail self-calls) and function application become direct native branches
//! and indirect calls through the call-site cache. The fiber pointer lives
//! in rbx (callee-save) for the whole compiled extent; helpers receive it in
//! rdi with the node pointer in rsi.

use std::collections::HashSet;

use assembler::{Assembler, CodeArena, Reg};
use parking_lot::{Condvar, Mutex};

use crate::ast::{Apply, FunctionNode, MethodImpl, Node};
use crate::exec;
use crate::fiber::Fiber;

const CODE_ARENA_BYTES: usize = 4 * 1024 * 1024;

type EntryThunk = extern "C" fn(*mut Fiber, *const Apply, MethodImpl) -> i64;
type ReentryThunk = extern "C" fn(*mut Fiber, *const u8, i64) -> i64;

struct JitState {
    arena: CodeArena,
    compiling: HashSet<usize>,
}

/// The compiler: an executable arena written under the compile lock, the
/// three trampoline thunks, and the per-function code cache published on
/// the function nodes.
pub struct Jit {
    state: Mutex<JitState>,
    compiled_cv: Condvar,
    entry: EntryThunk,
    reentry: ReentryThunk,
    exit_thunk: usize,
}

// SAFETY: arena writes are serialized by the state lock; published entry
// points are immutable.
unsafe impl Send for Jit {}
// SAFETY: see above.
unsafe impl Sync for Jit {}

impl Jit {
    pub fn new() -> Self {
        let mut arena = CodeArena::new(CODE_ARENA_BYTES).expect("map executable memory");

        let entry = {
            let code = emit_entry_thunk().finish().expect("entry thunk");
            let ptr = arena.install(&code).expect("install entry thunk");
            // SAFETY: the thunk follows the C ABI laid out above.
            unsafe { std::mem::transmute::<*mut u8, EntryThunk>(ptr.as_ptr()) }
        };
        let reentry = {
            let code = emit_reentry_thunk().finish().expect("reentry thunk");
            let ptr = arena.install(&code).expect("install reentry thunk");
            // SAFETY: as above.
            unsafe { std::mem::transmute::<*mut u8, ReentryThunk>(ptr.as_ptr()) }
        };
        let exit_thunk = {
            let code = emit_exit_thunk().finish().expect("exit thunk");
            arena.install(&code).expect("install exit thunk").as_ptr() as usize
        };

        Self {
            state: Mutex::new(JitState {
                arena,
                compiling: HashSet::new(),
            }),
            compiled_cv: Condvar::new(),
            entry,
            reentry,
            exit_thunk,
        }
    }

    /// Enter compiled code at `code` for the call framed by `apply`.
    pub fn enter(&self, fbr: &mut Fiber, apply: &Apply, code: MethodImpl) -> i64 {
        (self.entry)(fbr, apply, code)
    }

    /// Re-enter compiled code at a saved instruction pointer with a result
    /// code in hand.
    pub fn reenter(&self, fbr: &mut Fiber, ip: *const u8, ret_code: i64) -> i64 {
        (self.reentry)(fbr, ip, ret_code)
    }

    /// Compiled entry point for `function`, compiling on first request.
    /// Concurrent requests for the same function wait on the in-progress
    /// compile.
    pub fn code(&self, function: &'static FunctionNode) -> MethodImpl {
        if let Some(code) = function.published_code() {
            return code;
        }
        let key = function as *const FunctionNode as usize;
        let mut state = self.state.lock();
        loop {
            if let Some(code) = function.published_code() {
                return code;
            }
            if state.compiling.contains(&key) {
                self.compiled_cv.wait(&mut state);
                continue;
            }
            state.compiling.insert(key);
            drop(state);

            let code_bytes = {
                let mut backend = Backend::new(self.exit_thunk, function);
                backend.compile();
                backend.finish()
            };

            tracing::debug!(
                target: "jit",
                function = %function.name,
                bytes = code_bytes.len(),
                "compiled function"
            );

            state = self.state.lock();
            let entry = state
                .arena
                .install(&code_bytes)
                .expect("executable code arena exhausted");
            // SAFETY: the emitted stub follows the MethodImpl ABI.
            let method =
                unsafe { std::mem::transmute::<*mut u8, MethodImpl>(entry.as_ptr()) };
            function.publish_code(method);
            state.compiling.remove(&key);
            self.compiled_cv.notify_all();
            return method;
        }
    }
}

impl Default for Jit {
    fn default() -> Self {
        Self::new()
    }
}

// ── thunks ────────────────────────────────────────────────────────────

/// `entry(fbr, apply, code)`: park the fiber in rbx, align, and call into
/// the stub with rdi/rsi already holding fiber and call site.
fn emit_entry_thunk() -> Assembler {
    let mut asm = Assembler::new();
    asm.push_r(Reg::Rbx);
    asm.mov_rr(Reg::Rbx, Reg::Rdi);
    asm.mov_rr(Reg::Rax, Reg::Rdx);
    asm.sub_ri8(Reg::Rsp, 0x10);
    asm.call_r(Reg::Rax);
    asm.add_ri8(Reg::Rsp, 0x10);
    asm.pop_r(Reg::Rbx);
    asm.ret();
    asm
}

/// `reentry(fbr, ip, ret_code)`: rebuild the machine frame the stub expects
/// and jump straight to the saved instruction pointer with the result code
/// in rax.
fn emit_reentry_thunk() -> Assembler {
    let mut asm = Assembler::new();
    asm.push_r(Reg::Rbx);
    asm.mov_rr(Reg::Rbx, Reg::Rdi);
    asm.mov_rr(Reg::Rax, Reg::Rdx);
    asm.mov_rr(Reg::Rdx, Reg::Rsi);
    asm.sub_ri8(Reg::Rsp, 0x10);
    asm.jmp_r(Reg::Rdx);
    asm
}

/// The exit path out of nested compiled frames: hand the return address to
/// `exec_exit`, which records the blocked frame and yields the address that
/// leaves the outermost stub; the final `ret` jumps there with the exit
/// code back in rax.
fn emit_exit_thunk() -> Assembler {
    let mut asm = Assembler::new();
    asm.mov_rr(Reg::Rcx, Reg::Rdx); // save exit code
    asm.pop_r(Reg::Rdx); // return address, 3rd arg to exec_exit
    asm.push_r(Reg::Rcx); // keep exit code across the call
    asm.mov_rr(Reg::Rdi, Reg::Rbx); // fiber
    // rsi already holds the apply node
    asm.sub_ri8(Reg::Rsp, 8);
    asm.mov_ri64(Reg::Rax, exec::exec_exit as usize as i64);
    asm.call_r(Reg::Rax);
    asm.add_ri8(Reg::Rsp, 8);
    asm.pop_r(Reg::Rcx); // exit code back
    asm.push_r(Reg::Rax); // the jump-out address
    asm.mov_rr(Reg::Rax, Reg::Rcx); // return the exit code
    asm.ret();
    asm
}

// ── per-function backend ──────────────────────────────────────────────

struct Backend {
    asm: Assembler,
    exit_thunk: usize,
    function: &'static FunctionNode,
    return_label: assembler::Label,
    recur_label: assembler::Label,
}

impl Backend {
    fn new(exit_thunk: usize, function: &'static FunctionNode) -> Self {
        let mut asm = Assembler::new();
        let return_label = asm.create_label();
        let recur_label = asm.create_label();
        Self {
            asm,
            exit_thunk,
            function,
            return_label,
            recur_label,
        }
    }

    fn emit_call(&mut self, node: *const u8, helper: usize) {
        self.asm.mov_rr(Reg::Rdi, Reg::Rbx);
        self.asm.mov_ri64(Reg::Rsi, node as i64);
        self.asm.mov_ri64(Reg::Rax, helper as i64);
        self.asm.call_r(Reg::Rax);
    }

    fn emit(&mut self, node: &'static Node) {
        match node {
            Node::Literal(lit) => {
                self.emit_call(lit as *const _ as *const u8, exec::exec_literal as usize);
            }
            Node::Symbol(sym) => {
                self.emit_call(sym as *const _ as *const u8, exec::exec_symbol as usize);
            }
            Node::Builtin(b) => {
                self.emit_call(b as *const _ as *const u8, exec::exec_builtin as usize);
            }
            Node::Local(local) => {
                self.emit_call(local as *const _ as *const u8, exec::exec_local as usize);
            }
            Node::Global(global) => {
                self.emit_call(global as *const _ as *const u8, exec::exec_global as usize);
            }
            Node::Let(let_node) => {
                self.emit(let_node.expr);
                self.emit_call(
                    let_node as *const _ as *const u8,
                    exec::exec_let as usize,
                );
            }
            Node::Do(do_node) => {
                let last = do_node.statements.len().saturating_sub(1);
                for (i, stmt) in do_node.statements.iter().enumerate() {
                    self.emit(stmt);
                    // discard every intermediate result; the last one is the
                    // value of the do expression
                    if i != last {
                        self.emit_call(std::ptr::null(), exec::exec_pop as usize);
                    }
                }
            }
            Node::Branch(branch) => {
                let false_label = self.asm.create_label();
                let end_label = self.asm.create_label();
                self.emit(branch.condition);
                self.emit_call(branch as *const _ as *const u8, exec::exec_bool as usize);
                self.asm.test_rr(Reg::Rax, Reg::Rax);
                self.asm.jz(false_label);
                self.emit(branch.on_true);
                self.asm.jmp(end_label);
                self.asm.bind_label(false_label).expect("bind false label");
                self.emit(branch.on_false);
                self.asm.bind_label(end_label).expect("bind end label");
            }
            Node::Return(ret) => {
                self.emit(ret.expr);
                // defers run just after the return label
                self.asm.jmp(self.return_label);
            }
            Node::Recur(recur) => {
                let do_recur = self.asm.create_label();
                for argument in &recur.arguments {
                    self.emit(argument);
                }
                self.emit_call(std::ptr::null(), exec::exec_check_defers as usize);
                self.asm.test_rr(Reg::Rax, Reg::Rax);
                self.asm.jz(do_recur);
                self.emit_defers();
                self.asm.bind_label(do_recur).expect("bind recur label");
                self.emit_call(recur as *const _ as *const u8, exec::exec_recur as usize);
                self.asm.jmp(self.recur_label);
            }
            Node::Function(function) => {
                self.emit_call(
                    function as *const _ as *const u8,
                    exec::exec_function as usize,
                );
            }
            Node::Apply(apply) => self.emit_apply(apply),
            Node::Define(_) | Node::Import(_) | Node::Struct(_) | Node::Module(_) => {
                panic!("module-level node reached the code generator")
            }
        }
    }

    /// The defers sequence: apply the recorded closures (last-deferred
    /// first) through the synthesized apply node, then drop its result.
    fn emit_defers(&mut self) {
        let apply_defers = crate::runtime::apply_defers_node();
        self.emit(apply_defers);
        self.emit_call(std::ptr::null(), exec::exec_pop as usize);
    }

    fn emit_apply(&mut self, apply: &'static Apply) {
        let apply_label = self.asm.create_label();
        let check_return_label = self.asm.create_label();
        let end_label = self.asm.create_label();
        let exit_label = self.asm.create_label();

        // evaluate the callable, then the arguments
        if let Some(callable) = apply.callable {
            self.emit(callable);
        }
        for argument in &apply.arguments {
            self.emit(argument);
        }

        // indirect call through the call site's published target
        self.asm.bind_label(apply_label).expect("bind apply label");
        self.asm.mov_rr(Reg::Rdi, Reg::Rbx);
        self.asm.mov_ri64(Reg::Rsi, apply as *const Apply as i64);
        self.asm
            .mov_rax_abs(&apply.target as *const _ as u64);
        self.asm.call_r(Reg::Rax);

        // almost always 0: fall through fast
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        self.asm.jz(end_label);
        // negative: mis-dispatch, the target was refreshed, retry
        self.asm.js(apply_label);
        self.asm.jmp(check_return_label);

        // exit path: leave the JIT with the status code
        self.asm.bind_label(exit_label).expect("bind exit label");
        self.asm.mov_ri64(Reg::Rsi, apply as *const Apply as i64);
        self.asm.mov_rr(Reg::Rdx, Reg::Rax);
        self.asm.mov_ri64(Reg::Rax, self.exit_thunk as i64);
        self.asm.call_r(Reg::Rax);

        // resumed (or returned) with a status in rax:
        // 0 = result pushed, 1 = unwind this function, >1 = exit again
        self.asm
            .bind_label(check_return_label)
            .expect("bind check label");
        self.asm.cmp_ri8(Reg::Rax, 1);
        self.asm.js(end_label);
        self.asm.jz(self.return_label);
        self.asm.jmp(exit_label);

        self.asm.bind_label(end_label).expect("bind end label");
    }

    fn compile(&mut self) {
        let function = self.function;
        let exit_label = self.asm.create_label();
        let epilog_label = self.asm.create_label();

        // prolog: rdi = fiber, rsi = apply on entry; pass the function and
        // the machine return address, which becomes the frame's link
        self.asm.mov_ri64(Reg::Rdx, function as *const FunctionNode as i64);
        self.asm.mov_r_rsp_ind(Reg::Rcx);
        self.asm.sub_ri8(Reg::Rsp, 8);
        self.asm
            .mov_ri64(Reg::Rax, exec::exec_function_prolog as usize as i64);
        self.asm.call_r(Reg::Rax);
        self.asm.add_ri8(Reg::Rsp, 8);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        // negative: wrong callable for this stub, return to retry dispatch
        self.asm.js(exit_label);
        // the prolog captured the link; keep the machine stack flat
        self.asm.add_ri8(Reg::Rsp, 8);
        // 1: the prolog raised (arity, stack overflow) with the error pushed
        self.asm.cmp_ri8(Reg::Rax, 1);
        self.asm.jz(self.return_label);

        // tail self-calls land here, skipping the prolog
        self.asm.bind_label(self.recur_label).expect("bind recur");
        self.emit_call(
            function as *const FunctionNode as *const u8,
            exec::exec_function_checkpoint as usize,
        );

        self.emit(function.body);

        self.asm.bind_label(self.return_label).expect("bind return");
        self.emit_call(std::ptr::null(), exec::exec_check_defers as usize);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        self.asm.jz(epilog_label);
        self.emit_defers();

        self.asm.bind_label(epilog_label).expect("bind epilog");
        // reserve a machine-stack slot for the link, let the epilog fill it,
        // then ret through it
        self.asm.sub_ri8(Reg::Rsp, 8);
        self.asm.mov_rr(Reg::Rdx, Reg::Rsp);
        self.asm.mov_rr(Reg::Rdi, Reg::Rbx);
        self.asm.mov_ri64(Reg::Rsi, function as *const FunctionNode as i64);
        self.asm
            .mov_ri64(Reg::Rax, exec::exec_function_epilog as usize as i64);
        self.asm.sub_ri8(Reg::Rsp, 8);
        self.asm.call_r(Reg::Rax);
        self.asm.add_ri8(Reg::Rsp, 8);
        self.asm.bind_label(exit_label).expect("bind exit");
        self.asm.ret();
    }

    fn finish(self) -> Vec<u8> {
        self.asm
            .finish()
            .unwrap_or_else(|e| panic!("code generation failed for {}: {e}", self.function.name))
    }
}
