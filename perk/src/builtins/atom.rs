//! Atoms: shared mutable cells with compare-and-set, guarded by the hashed
//! object lock. The stored reference goes through the allocator's write
//! barrier, which both promotes escaping nursery values and feeds the SATB
//! retention during concurrent mark.

use object::{Header, ObjRef, ObjectKind, Slot};

use crate::ast::Apply;
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{alloc_fixed, eq_value, Atom};
use crate::runtime::object_lock;

pub fn new_atom(fbr: &mut Fiber, mut value: Slot) -> Slot {
    fbr.allocator().share(&mut value);
    new_atom_for_test(fbr.allocator(), value)
}

/// Atom construction without a fiber, for tests and bootstrap code. The
/// value must already be shared (or unboxed).
pub fn new_atom_for_test(alloc: &heap::Allocator, value: Slot) -> Slot {
    debug_assert!(value.as_ref().map(|r| r.is_shared()).unwrap_or(true));
    let r = alloc_fixed(
        alloc,
        true,
        false,
        Atom {
            header: Header::new(ObjectKind::Atom),
            value,
        },
    )
    .expect("shared heap exhausted creating atom");
    Slot::Ref(r)
}

fn atom_arg(frame: &Frame<'_>) -> Option<ObjRef> {
    frame
        .arg(1)
        .as_ref()
        .filter(|r| r.kind() == ObjectKind::Atom)
}

pub extern "C" fn bi_atom(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().atom;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(1) {
        return code;
    }
    let value = frame.arg(1);
    let atom = new_atom(frame.fbr, value);
    frame.result(atom)
}

pub extern "C" fn bi_deref(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().deref;
    if !frame.matches_static(expected) || frame.argc() != 1 {
        return frame.bad_dispatch();
    }
    let Some(atom) = atom_arg(&frame) else {
        return frame.bad_dispatch();
    };
    let value = {
        let _guard = object_lock(atom.as_ptr() as *const u8).lock();
        // SAFETY: atom reads happen under the object lock.
        unsafe { atom.cast::<Atom>() }.value
    };
    frame.result(value)
}

pub extern "C" fn bi_compare_and_set(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: as above.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);
    let expected = frame.fbr.runtime.wk().compare_and_set;
    if !frame.matches_static(expected) {
        return frame.bad_dispatch();
    }
    if let Err(code) = frame.require_argc(3) {
        return code;
    }
    let Some(atom) = atom_arg(&frame) else {
        return frame.bad_dispatch();
    };
    let old = frame.arg(2);
    let new = frame.arg(3);

    let swapped = {
        let allocator = frame.fbr.allocator();
        let _guard = object_lock(atom.as_ptr() as *const u8).lock();
        // SAFETY: atom mutation happens under the object lock.
        let cell = unsafe { atom.cast_mut::<Atom>() };
        if eq_value(cell.value, old) {
            allocator.ref_write(&mut cell.value, new);
            true
        } else {
            false
        }
    };
    frame.result(Slot::Bool(swapped))
}
