//! The `random` builtin: a float drawn uniformly from [0, 1).

use object::Slot;

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;

pub extern "C" fn bi_random(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().random;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(0) {
        return code;
    }
    frame.result(Slot::Float(rand::random::<f64>()))
}
