//! Builtin-side view of the current call: argument access, dispatch
//! validation and the result/throws/block return protocol.

use object::{ObjRef, Slot, SlotKind};

use crate::ast::Apply;
use crate::fiber::{Fiber, ResumeCallback};
use crate::objects::new_error;

pub struct Frame<'a> {
    pub fbr: &'a mut Fiber,
    pub apply: &'a Apply,
    pub base: usize,
}

impl<'a> Frame<'a> {
    pub fn new(fbr: &'a mut Fiber, apply: &'a Apply) -> Self {
        let base = fbr.stack.base(apply.argument_count());
        Self { fbr, apply, base }
    }

    #[inline(always)]
    pub fn argc(&self) -> usize {
        self.apply.argument_count()
    }

    /// Argument `index` (1-based; 0 is the callable).
    #[inline(always)]
    pub fn arg(&self, index: usize) -> Slot {
        self.fbr.stack.argument(self.base, index)
    }

    #[inline(always)]
    pub fn arg_kind(&self, index: usize) -> SlotKind {
        self.arg(index).kind()
    }

    /// Identity check against the builtin this method was registered on.
    pub fn matches_static(&self, expected: ObjRef) -> bool {
        match self.fbr.stack.callable(self.base).as_ref() {
            Some(r) => r.as_ptr() == expected.as_ptr(),
            None => false,
        }
    }

    /// The cached target no longer fits this invocation: re-resolve.
    pub fn bad_dispatch(&mut self) -> i64 {
        self.fbr.dispatch_and_install(self.apply)
    }

    /// Pop callable and arguments, push the result, continue.
    pub fn result(&mut self, value: Slot) -> i64 {
        self.fbr.stack.pop_n(self.argc() + 1);
        self.fbr.stack.push(value);
        0
    }

    /// Pop callable and arguments, push the error, unwind one frame.
    pub fn throws(&mut self, value: Slot) -> i64 {
        self.fbr.stack.pop_n(self.argc() + 1);
        self.fbr.stack.push(value);
        1
    }

    pub fn raise(&mut self, tag: &'static str, message: &str) -> i64 {
        let err = new_error(self.fbr.allocator(), tag, message);
        self.throws(err)
    }

    pub fn require_argc(&mut self, expected: usize) -> Result<(), i64> {
        if self.argc() == expected {
            Ok(())
        } else {
            Err(self.raise(
                "bad-arity",
                &format!("expected {expected} arguments, got {}", self.argc()),
            ))
        }
    }

    /// Block: store the resume callback and exit the JIT with code 4. The
    /// callback runs on the trampoline once the stub has unwound; returning
    /// false parks the fiber until a counterparty resumes it.
    pub fn cc_resume(&mut self, callback: ResumeCallback) -> i64 {
        self.fbr.store_cc_resume(callback);
        4
    }
}
