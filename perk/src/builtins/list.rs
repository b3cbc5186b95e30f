//! Immutable cons lists. The defer mechanism leans on these: `conj`
//! prepends, so walking with `first`/`next` yields last-in first-out order.

use heap::{Allocator, HeapError};
use object::{Header, ObjectKind, Slot};

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{alloc_fixed, List};

pub fn empty(alloc: &Allocator) -> Slot {
    new_list(alloc, 0, Slot::Undef, Slot::Undef).expect("allocation failed creating list")
}

fn new_list(alloc: &Allocator, len: u64, head: Slot, tail: Slot) -> Result<Slot, HeapError> {
    let r = alloc_fixed(
        alloc,
        false,
        false,
        List {
            header: Header::new(ObjectKind::List),
            len,
            head,
            tail,
        },
    )?;
    Ok(Slot::Ref(r))
}

fn as_list<'a>(slot: Slot) -> Option<&'a List> {
    let r = slot.as_ref()?;
    if r.kind() != ObjectKind::List {
        return None;
    }
    // SAFETY: kind checked; lists are immutable.
    Some(unsafe { &*(r.as_ptr() as *const List) })
}

/// Prepend `value`.
pub fn conj(alloc: &Allocator, listish: Slot, value: Slot) -> Result<Slot, HeapError> {
    let (len, tail) = match as_list(listish) {
        Some(list) if list.len > 0 => (list.len + 1, listish),
        _ => (1, Slot::Undef),
    };
    new_list(alloc, len, value, tail)
}

pub extern "C" fn bi_conj(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().conj;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(2) {
        return code;
    }
    let list = frame.arg(1);
    if as_list(list).is_none() {
        return frame.bad_dispatch();
    }
    match conj(frame.fbr.allocator(), list, frame.arg(2)) {
        Ok(slot) => frame.result(slot),
        Err(_) => frame.raise("allocation-failed", "out of memory"),
    }
}

pub extern "C" fn bi_first(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().first;
    if !frame.matches_static(expected) || frame.argc() != 1 {
        return frame.bad_dispatch();
    }
    let Some(list) = as_list(frame.arg(1)) else {
        return frame.bad_dispatch();
    };
    if list.len == 0 {
        return frame.raise("key-not-found", "first of an empty list");
    }
    let head = list.head;
    frame.result(head)
}

/// The tail, or `undefined` once exhausted.
pub extern "C" fn bi_next(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().next;
    if !frame.matches_static(expected) || frame.argc() != 1 {
        return frame.bad_dispatch();
    }
    let Some(list) = as_list(frame.arg(1)) else {
        return frame.bad_dispatch();
    };
    let tail = list.tail;
    frame.result(tail)
}

pub extern "C" fn bi_length(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().length;
    if !frame.matches_static(expected) || frame.argc() != 1 {
        return frame.bad_dispatch();
    }
    let Some(list) = as_list(frame.arg(1)) else {
        return frame.bad_dispatch();
    };
    let len = list.len as i64;
    frame.result(Slot::Int(len))
}
