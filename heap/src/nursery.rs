use std::ptr::NonNull;

use crate::block::Block;

pub const NURSERY_CHUNK_MIN: usize = 512;
pub const NURSERY_CHUNK_MAX: usize = 65536;

/// Nursery live-bytes threshold that arms `must_collect_local`.
pub const LOCAL_COLLECT_THRESHOLD: usize = 4 * 1024 * 1024;

const MARKED_BIT: u32 = 1;

/// 8-byte header written 8 bytes before every nursery payload (one 16-byte
/// aligned unit in total). The marked bit doubles as the forwarding flag
/// during the copying collect; the forwarding pointer overwrites the first
/// payload word.
#[repr(C)]
pub struct ChunkHeader {
    size: u32,
    bits: u32,
}

const _: () = assert!(size_of::<ChunkHeader>() == 8);

impl ChunkHeader {
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.bits & MARKED_BIT != 0
    }

    #[inline(always)]
    pub fn set_marked(&mut self) {
        self.bits |= MARKED_BIT;
    }
}

/// Per-fiber bump-pointer heap. Chunks are slots of the allocator's local
/// block classes; the nursery itself never touches the OS.
pub struct Nursery {
    begin: *mut u8,
    end: *mut u8,
    cur: *mut u8,
    chunks: Vec<NonNull<u8>>,
    pub allocated: u64,
    pub allocated_bytes: u64,
    pub freed: u64,
    pub freed_bytes: u64,
}

// SAFETY: a nursery is only touched by the thread its fiber is bound to.
unsafe impl Send for Nursery {}

impl Nursery {
    pub fn new() -> Self {
        Self {
            begin: std::ptr::null_mut(),
            end: std::ptr::null_mut(),
            cur: std::ptr::null_mut(),
            chunks: Vec::new(),
            allocated: 0,
            allocated_bytes: 0,
            freed: 0,
            freed_bytes: 0,
        }
    }

    #[inline(always)]
    pub fn has_room(&self, size: usize) -> bool {
        (self.end as usize).wrapping_sub(self.cur as usize) >= size + 16
    }

    /// Size for the next chunk: 512 bytes to start, then double the last
    /// chunk's class up to 64 KiB.
    pub fn next_chunk_size(&self) -> usize {
        match self.chunks.last() {
            None => NURSERY_CHUNK_MIN,
            Some(chunk) => {
                // SAFETY: chunks live inside local blocks.
                let block = unsafe { Block::from_ptr(chunk.as_ptr()) };
                usize::min(block.size() * 2, NURSERY_CHUNK_MAX)
            }
        }
    }

    pub fn add_chunk(&mut self, chunk: NonNull<u8>, size: usize) {
        self.chunks.push(chunk);
        self.begin = chunk.as_ptr();
        self.end = (chunk.as_ptr() as usize + size) as *mut u8;
        self.cur = self.begin;
    }

    /// Bump-allocate `size` bytes (16-byte aligned) after writing the header.
    ///
    /// # Safety
    /// The caller checked [`Nursery::has_room`].
    pub unsafe fn bump(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size % 16 == 0);
        debug_assert!(self.has_room(size));
        debug_assert!(self.cur as usize % 16 == 0);
        // SAFETY: in-bounds by has_room.
        unsafe {
            self.cur = self.cur.add(8);
            *(self.cur as *mut ChunkHeader) = ChunkHeader {
                size: size as u32,
                bits: 0,
            };
            self.cur = self.cur.add(8);
            let ptr = self.cur;
            self.cur = self.cur.add(size);
            self.allocated += 1;
            self.allocated_bytes += size as u64;
            ptr
        }
    }

    #[inline(always)]
    pub fn used_bytes(&self) -> u64 {
        debug_assert!(self.allocated_bytes >= self.freed_bytes);
        self.allocated_bytes - self.freed_bytes
    }

    /// # Safety
    /// `ptr` must be a live nursery payload pointer.
    #[inline(always)]
    pub unsafe fn header<'a>(ptr: *const u8) -> &'a ChunkHeader {
        // SAFETY: the header sits 8 bytes before the payload.
        unsafe { &*(ptr.sub(8) as *const ChunkHeader) }
    }

    /// # Safety
    /// As [`Nursery::header`].
    #[inline(always)]
    pub unsafe fn header_mut<'a>(ptr: *mut u8) -> &'a mut ChunkHeader {
        // SAFETY: the header sits 8 bytes before the payload.
        unsafe { &mut *(ptr.sub(8) as *mut ChunkHeader) }
    }

    /// Read the forwarding pointer of a marked (already copied) object.
    ///
    /// # Safety
    /// The object at `ptr` must be marked.
    #[inline(always)]
    pub unsafe fn forwarded(ptr: *const u8) -> *mut u8 {
        // SAFETY: the first payload word holds the forwarding pointer once
        // the marked bit is set.
        unsafe { *(ptr as *const *mut u8) }
    }

    /// Mark the object at `ptr` as copied and leave the forwarding pointer
    /// in its first payload word.
    ///
    /// # Safety
    /// `ptr` must be a live, unmarked nursery payload pointer.
    #[inline(always)]
    pub unsafe fn forward(ptr: *mut u8, to: *mut u8) {
        // SAFETY: per contract.
        unsafe {
            Nursery::header_mut(ptr).set_marked();
            *(ptr as *mut *mut u8) = to;
        }
    }

    /// Free all chunks back to their local blocks.
    pub fn release_chunks(&mut self) {
        for chunk in self.chunks.drain(..) {
            // SAFETY: chunks are slots of live local blocks.
            unsafe {
                let (block, idx) = Block::and_index_from_ptr(chunk.as_ptr());
                block.free(idx);
            }
        }
        self.begin = std::ptr::null_mut();
        self.end = std::ptr::null_mut();
        self.cur = std::ptr::null_mut();
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| {
                // SAFETY: chunks live inside local blocks.
                unsafe { Block::from_ptr(c.as_ptr()).size() }
            })
            .sum()
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        self.release_chunks();
    }
}
