use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

/// Blocks are carved out of 2 MiB allocations aligned to 2 MiB. A shared
/// block lives in the upper 1 MiB half, a local block in the lower half, so
/// bit 20 of any object address tells the two tiers apart without touching
/// the object header.
pub const BLOCK_ALIGN: usize = 1 << 20;
pub const SHARED_BIT_MASK: usize = BLOCK_ALIGN;
pub const BLOCK_MASK: usize = !(BLOCK_ALIGN - 1);
pub const OFFSET_MASK: usize = BLOCK_ALIGN - 1;

/// Shared-vs-local discriminator. Hot path of the write barrier and of
/// tracing.
#[inline(always)]
pub fn is_shared_ptr(ptr: *const u8) -> bool {
    ptr as usize & SHARED_BIT_MASK != 0
}

/// Object kind stored in the first header byte. Dispatch, tracing and
/// finalization all key off this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Str = 0,
    Closure,
    Builtin,
    Type,
    Map,
    MapNode,
    Vector,
    VecNode,
    List,
    Channel,
    Atom,
    Error,
    Fiber,
    StructType,
    StructInst,
}

impl ObjectKind {
    pub const COUNT: usize = Self::StructInst as usize + 1;

    pub fn from_u8(raw: u8) -> Option<Self> {
        if (raw as usize) < Self::COUNT {
            // SAFETY: raw is a valid discriminant, checked above.
            Some(unsafe { core::mem::transmute::<u8, ObjectKind>(raw) })
        } else {
            None
        }
    }
}

bitflags! {
    /// Bookkeeping flags stored atomically in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Set when the object was allocated with a finalizer. Such objects
        /// may only live in the shared heap; promotion asserts on it.
        const FINALIZER = 1 << 0;
    }
}

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// byte 0:    object kind
/// byte 1:    flags (atomic)
/// bytes 2‥7: reserved (zero)
/// ```
#[repr(C)]
pub struct Header {
    kind: u8,
    flags: AtomicU8,
    _reserved: [u8; 6],
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind: kind as u8,
            flags: AtomicU8::new(0),
            _reserved: [0; 6],
        }
    }

    pub fn with_flags(kind: ObjectKind, flags: HeaderFlags) -> Self {
        Self {
            kind: kind as u8,
            flags: AtomicU8::new(flags.bits()),
            _reserved: [0; 6],
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        debug_assert!((self.kind as usize) < ObjectKind::COUNT);
        // SAFETY: headers are only constructed through `new`/`with_flags`,
        // which take a valid kind.
        unsafe { core::mem::transmute::<u8, ObjectKind>(self.kind) }
    }

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        let h = Header::new(ObjectKind::Channel);
        assert_eq!(h.kind(), ObjectKind::Channel);
        assert!(h.flags().is_empty());
    }

    #[test]
    fn finalizer_flag() {
        let h = Header::with_flags(ObjectKind::Str, HeaderFlags::FINALIZER);
        assert!(h.has_flag(HeaderFlags::FINALIZER));
    }

    #[test]
    fn shared_bit() {
        assert!(is_shared_ptr((BLOCK_ALIGN | 0x40) as *const u8));
        assert!(!is_shared_ptr(((BLOCK_ALIGN << 1) | 0x40) as *const u8));
    }
}
