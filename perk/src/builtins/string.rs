//! String methods for the single-dispatch builtins.

use object::{ObjectKind, Slot};

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{new_str, Str};

fn str_arg<'a>(frame: &Frame<'a>) -> Option<&'a Str> {
    let r = frame.arg(1).as_ref()?;
    if r.kind() != ObjectKind::Str {
        return None;
    }
    // SAFETY: kind checked; strings are immutable.
    Some(unsafe { &*(r.as_ptr() as *const Str) })
}

/// `length(s)`: character count.
pub extern "C" fn bi_length(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().length;
    if !frame.matches_static(expected) || frame.argc() != 1 {
        return frame.bad_dispatch();
    }
    let Some(s) = str_arg(&frame) else {
        return frame.bad_dispatch();
    };
    let count = s.as_str().chars().count() as i64;
    frame.result(Slot::Int(count))
}

/// `get(s, i)`: the i-th character as a one-character string.
pub extern "C" fn bi_get(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().get;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(2) {
        return code;
    }
    let Some(s) = str_arg(&frame) else {
        return frame.bad_dispatch();
    };
    let Some(index) = frame.arg(2).to_index() else {
        return frame.raise("bad-argument", "string index must be an integer");
    };
    let Some(c) = (index >= 0)
        .then(|| s.as_str().chars().nth(index as usize))
        .flatten()
    else {
        return frame.raise("key-not-found", &format!("index {index} out of bounds"));
    };
    match new_str(frame.fbr.allocator(), &c.to_string(), false) {
        Ok(slot) => frame.result(slot),
        Err(_) => frame.raise("allocation-failed", "out of memory"),
    }
}
