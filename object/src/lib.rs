//! Object model shared by the heap and the runtime.
//!
//! A [`Slot`] is the 16-byte tagged variant that lives on value stacks, in
//! frames and inside heap objects. A [`Header`] is the 8-byte prefix of every
//! heap object carrying its [`ObjectKind`]. The heap itself stays decoupled
//! from concrete object layouts: consumers hand it a [`TraceFn`] and a
//! [`FinalizeFn`] keyed off the header kind.

mod header;
mod slot;

pub use header::{
    is_shared_ptr, Header, HeaderFlags, ObjectKind, BLOCK_ALIGN, BLOCK_MASK,
    OFFSET_MASK, SHARED_BIT_MASK,
};
pub use slot::{ObjRef, Slot, SlotKind};

/// Function that visits every outgoing heap reference of an object.
///
/// Given a pointer to a heap object (whose first bytes are a [`Header`]),
/// the function must call `visitor` for every [`Slot`] field that may hold a
/// heap reference. The visitor may rewrite the slot in place (the nursery
/// collector relocates objects this way).
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub type TraceFn = unsafe fn(obj: *mut Header, visitor: &mut dyn FnMut(&mut Slot));

/// Function that runs the destructor of an object whose finalize bit is set.
///
/// # Safety
///
/// `obj` must point to a dead heap object that was allocated with a
/// finalizer and has not been finalized yet.
pub type FinalizeFn = unsafe fn(obj: *mut Header);

/// A raw object pointer that may cross thread boundaries inside the
/// collector's work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GreyRef(pub *mut Header);

// SAFETY: grey refs are only dereferenced by GC workers under the collector's
// phase protocol; the pointer itself is plain data.
unsafe impl Send for GreyRef {}
