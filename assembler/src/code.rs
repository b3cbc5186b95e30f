use std::ptr::NonNull;

use heap::{map_memory, protect_memory_read_write_exec, unmap_memory};

use crate::AssemblerError;

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Executable memory arena for compiled functions and thunks.
///
/// The mapping stays read-write-execute for the process lifetime; writes
/// only happen under the runtime's compile lock, and function entry points
/// are published through atomics, so readers need no synchronization.
pub struct CodeArena {
    base: NonNull<u8>,
    size: usize,
    cursor: usize,
}

// SAFETY: mutation is confined to the compile lock holder.
unsafe impl Send for CodeArena {}

impl CodeArena {
    pub fn new(size: usize) -> Result<Self, AssemblerError> {
        let base = map_memory(size).ok_or(AssemblerError::MapExecutableFailed)?;
        if !protect_memory_read_write_exec(base, size) {
            unmap_memory(base, size);
            return Err(AssemblerError::MapExecutableFailed);
        }
        Ok(Self {
            base,
            size,
            cursor: 0,
        })
    }

    /// Copy finished code into the arena and return its entry address.
    pub fn install(&mut self, code: &[u8]) -> Result<NonNull<u8>, AssemblerError> {
        if code.is_empty() {
            return Err(AssemblerError::EmptyFunction);
        }
        if self.size - self.cursor < code.len() {
            return Err(AssemblerError::CodeArenaExhausted);
        }
        // SAFETY: in-bounds by the check above; the region is RWX.
        let entry = unsafe {
            let dst = self.base.as_ptr().add(self.cursor);
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            NonNull::new_unchecked(dst)
        };
        self.cursor += align8(code.len());
        Ok(entry)
    }

    pub fn used(&self) -> usize {
        self.cursor
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unmap_memory(self.base, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Assembler, Reg};

    #[test]
    fn install_and_run() {
        let mut arena = CodeArena::new(4096).unwrap();
        // fn(x) -> x + 3
        let mut asm = Assembler::new();
        asm.mov_rr(Reg::Rax, Reg::Rdi);
        asm.add_ri8(Reg::Rax, 3);
        asm.ret();
        let entry = arena.install(&asm.finish().unwrap()).unwrap();

        type Fn1 = extern "C" fn(i64) -> i64;
        // SAFETY: the arena is executable and the code follows the C ABI.
        let f: Fn1 = unsafe { std::mem::transmute(entry.as_ptr()) };
        assert_eq!(f(39), 42);
        assert_eq!(arena.used(), 16);
    }

    #[test]
    fn conditional_branch_runs() {
        let mut arena = CodeArena::new(4096).unwrap();
        // fn(x) -> if x == 0 { 1 } else { 2 }
        let mut asm = Assembler::new();
        let zero = asm.create_label();
        asm.test_rr(Reg::Rdi, Reg::Rdi);
        asm.jz(zero);
        asm.mov_ri64(Reg::Rax, 2);
        asm.ret();
        asm.bind_label(zero).unwrap();
        asm.mov_ri64(Reg::Rax, 1);
        asm.ret();
        let entry = arena.install(&asm.finish().unwrap()).unwrap();

        type Fn1 = extern "C" fn(i64) -> i64;
        // SAFETY: as above.
        let f: Fn1 = unsafe { std::mem::transmute(entry.as_ptr()) };
        assert_eq!(f(0), 1);
        assert_eq!(f(7), 2);
    }
}
