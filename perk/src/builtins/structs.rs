//! Struct types and instances. A struct type is a callable that constructs
//! an instance from positional field values; `get` retrieves fields by
//! name.

use object::{Header, HeaderFlags, ObjectKind, Slot};

use crate::ast::{Apply, StructNode};
use crate::fiber::Fiber;
use crate::frame::Frame;
use crate::objects::{alloc_fixed, alloc_with_tail, Str, StructInst, StructType};

/// Create the struct type value for a loaded struct declaration.
pub fn new_struct_type(node: &'static StructNode) -> Result<Slot, heap::HeapError> {
    let mut fields = Vec::with_capacity(node.fields.len());
    for &field in &node.fields {
        if let crate::ast::Node::Define(define) = field {
            fields.push(define.namei);
        }
    }
    let r = alloc_fixed(
        crate::runtime::current_allocator(),
        true,
        true,
        StructType {
            header: Header::with_flags(ObjectKind::StructType, HeaderFlags::FINALIZER),
            namei: node.namei as u64,
            name: node.name.clone(),
            fields,
        },
    )?;
    Ok(Slot::Ref(r))
}

/// The dispatch target installed when a struct type is called.
pub extern "C" fn bi_construct(fbr: *mut Fiber, apply: *const Apply) -> i64 {
    // SAFETY: called from compiled code with live fiber and call site.
    let (fbr, apply) = unsafe { (&mut *fbr, &*apply) };
    let mut frame = Frame::new(fbr, apply);

    let callable = frame.fbr.stack.callable(frame.base);
    let Some(stype_ref) = callable
        .as_ref()
        .filter(|r| r.kind() == ObjectKind::StructType)
    else {
        return frame.bad_dispatch();
    };
    // SAFETY: kind checked; struct types are immutable after load.
    let stype = unsafe { stype_ref.cast::<StructType>() };
    if let Err(code) = frame.require_argc(stype.fields.len()) {
        return code;
    }

    let len = stype.fields.len();
    let inst = alloc_with_tail(
        frame.fbr.allocator(),
        false,
        len * size_of::<Slot>(),
        StructInst {
            header: Header::new(ObjectKind::StructInst),
            stype: callable,
            len: len as u64,
        },
    );
    let Ok(inst) = inst else {
        return frame.raise("allocation-failed", "out of memory");
    };
    for i in 0..len {
        let value = frame.arg(i + 1);
        // SAFETY: freshly allocated instance owned by this fiber.
        unsafe { inst.cast_mut::<StructInst>() }.fields_mut()[i] = value;
    }
    frame.result(Slot::Ref(inst))
}

/// `get(instance, "field")`.
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
    let Some(inst_ref) = frame
        .arg(1)
        .as_ref()
        .filter(|r| r.kind() == ObjectKind::StructInst)
    else {
        return frame.bad_dispatch();
    };
    let Some(name_ref) = frame
        .arg(2)
        .as_ref()
        .filter(|r| r.kind() == ObjectKind::Str)
    else {
        return frame.raise("bad-argument", "field name must be a string");
    };
    // SAFETY: kinds checked.
    let inst = unsafe { inst_ref.cast::<StructInst>() };
    let name = unsafe { name_ref.cast::<Str>() }.as_str();
    let namei = frame.fbr.runtime.intern(name);

    let stype_ref = inst.stype.as_ref().expect("instance type");
    // SAFETY: instances always reference their struct type.
    let stype = unsafe { stype_ref.cast::<StructType>() };
    match stype.fields.iter().position(|f| *f == namei) {
        Some(index) => {
            let value = inst.fields()[index];
            frame.result(value)
        }
        None => frame.raise(
            "key-not-found",
            &format!("no field {name} in struct {}", stype.name),
        ),
    }
}
