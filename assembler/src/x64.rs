use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerError {
    LabelAlreadyBound { label: usize },
    LabelUnbound { label: usize },
    RelativeOutOfRange { label: usize },
    EmptyFunction,
    MapExecutableFailed,
    CodeArenaExhausted,
}

impl fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LabelAlreadyBound { label } => write!(f, "label L{label} bound twice"),
            Self::LabelUnbound { label } => write!(f, "label L{label} was never bound"),
            Self::RelativeOutOfRange { label } => {
                write!(f, "branch to L{label} does not fit in rel32")
            }
            Self::EmptyFunction => write!(f, "no code emitted"),
            Self::MapExecutableFailed => write!(f, "could not map executable memory"),
            Self::CodeArenaExhausted => write!(f, "executable code arena exhausted"),
        }
    }
}

impl std::error::Error for AssemblerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fixup {
    label: Label,
    disp_offset: usize,
    instr_end: usize,
}

/// General-purpose registers in machine-encoding order: the discriminant is
/// the 4-bit register number, bit 3 selecting the REX extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    #[inline]
    fn low3(self) -> u8 {
        self as u8 & 0b111
    }

    #[inline]
    fn high(self) -> bool {
        self as u8 & 0b1000 != 0
    }
}

/// Byte-buffer assembler with labels and rel32 fixups.
pub struct Assembler {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn create_label(&mut self) -> Label {
        let idx = self.labels.len();
        self.labels.push(None);
        Label(idx)
    }

    pub fn bind_label(&mut self, label: Label) -> Result<(), AssemblerError> {
        let Some(slot) = self.labels.get_mut(label.0) else {
            return Err(AssemblerError::LabelUnbound { label: label.0 });
        };
        if slot.is_some() {
            return Err(AssemblerError::LabelAlreadyBound { label: label.0 });
        }
        *slot = Some(self.bytes.len());
        Ok(())
    }

    // ── raw emission ───────────────────────────────────────────────

    #[inline]
    fn emit_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    #[inline]
    fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn emit_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn emit_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let mut rex = 0x40u8;
        if w {
            rex |= 0b1000;
        }
        if r {
            rex |= 0b100;
        }
        if x {
            rex |= 0b10;
        }
        if b {
            rex |= 0b1;
        }
        self.emit_u8(rex);
    }

    #[inline]
    fn emit_modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.emit_u8((md << 6) | (reg << 3) | rm);
    }

    #[inline]
    fn emit_rel32_fixup(&mut self, label: Label) {
        let disp_offset = self.bytes.len();
        self.emit_u32(0);
        self.fixups.push(Fixup {
            label,
            disp_offset,
            instr_end: self.bytes.len(),
        });
    }

    // ── instructions ───────────────────────────────────────────────

    /// mov reg, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex(true, false, false, dst.high());
        self.emit_u8(0xB8 + dst.low3());
        self.emit_u64(imm as u64);
    }

    /// mov dst, src
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(true, src.high(), false, dst.high());
        self.emit_u8(0x89);
        self.emit_modrm(0b11, src.low3(), dst.low3());
    }

    /// mov rax, [addr] — the moffs64 form, used to read a call site's
    /// published target.
    pub fn mov_rax_abs(&mut self, addr: u64) {
        self.emit_rex(true, false, false, false);
        self.emit_u8(0xA1);
        self.emit_u64(addr);
    }

    /// mov dst, [rsp]
    pub fn mov_r_rsp_ind(&mut self, dst: Reg) {
        self.emit_rex(true, dst.high(), false, false);
        self.emit_u8(0x8B);
        self.emit_modrm(0b00, dst.low3(), 0b100);
        self.emit_u8(0x24); // SIB: base = rsp
    }

    /// call reg
    pub fn call_r(&mut self, target: Reg) {
        if target.high() {
            self.emit_rex(false, false, false, true);
        }
        self.emit_u8(0xFF);
        self.emit_modrm(0b11, 2, target.low3());
    }

    /// jmp reg
    pub fn jmp_r(&mut self, target: Reg) {
        if target.high() {
            self.emit_rex(false, false, false, true);
        }
        self.emit_u8(0xFF);
        self.emit_modrm(0b11, 4, target.low3());
    }

    /// test reg, reg
    pub fn test_rr(&mut self, lhs: Reg, rhs: Reg) {
        self.emit_rex(true, rhs.high(), false, lhs.high());
        self.emit_u8(0x85);
        self.emit_modrm(0b11, rhs.low3(), lhs.low3());
    }

    /// cmp reg, imm8
    pub fn cmp_ri8(&mut self, reg: Reg, imm: i8) {
        self.emit_rex(true, false, false, reg.high());
        self.emit_u8(0x83);
        self.emit_modrm(0b11, 7, reg.low3());
        self.emit_u8(imm as u8);
    }

    /// sub reg, imm8
    pub fn sub_ri8(&mut self, reg: Reg, imm: i8) {
        self.emit_rex(true, false, false, reg.high());
        self.emit_u8(0x83);
        self.emit_modrm(0b11, 5, reg.low3());
        self.emit_u8(imm as u8);
    }

    /// add reg, imm8
    pub fn add_ri8(&mut self, reg: Reg, imm: i8) {
        self.emit_rex(true, false, false, reg.high());
        self.emit_u8(0x83);
        self.emit_modrm(0b11, 0, reg.low3());
        self.emit_u8(imm as u8);
    }

    pub fn push_r(&mut self, reg: Reg) {
        if reg.high() {
            self.emit_rex(false, false, false, true);
        }
        self.emit_u8(0x50 + reg.low3());
    }

    pub fn pop_r(&mut self, reg: Reg) {
        if reg.high() {
            self.emit_rex(false, false, false, true);
        }
        self.emit_u8(0x58 + reg.low3());
    }

    /// jz rel32
    pub fn jz(&mut self, label: Label) {
        self.emit_u8(0x0F);
        self.emit_u8(0x84);
        self.emit_rel32_fixup(label);
    }

    /// js rel32
    pub fn js(&mut self, label: Label) {
        self.emit_u8(0x0F);
        self.emit_u8(0x88);
        self.emit_rel32_fixup(label);
    }

    /// jmp rel32
    pub fn jmp(&mut self, label: Label) {
        self.emit_u8(0xE9);
        self.emit_rel32_fixup(label);
    }

    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }

    pub fn int3(&mut self) {
        self.emit_u8(0xCC);
    }

    /// Patch all fixups and return the finished code buffer.
    pub fn finish(self) -> Result<Vec<u8>, AssemblerError> {
        if self.bytes.is_empty() {
            return Err(AssemblerError::EmptyFunction);
        }
        let mut bytes = self.bytes;
        for fixup in &self.fixups {
            let Some(Some(target)) = self.labels.get(fixup.label.0) else {
                return Err(AssemblerError::LabelUnbound {
                    label: fixup.label.0,
                });
            };
            let disp = *target as i64 - fixup.instr_end as i64;
            let disp32 = i32::try_from(disp).map_err(|_| AssemblerError::RelativeOutOfRange {
                label: fixup.label.0,
            })?;
            bytes[fixup.disp_offset..fixup.disp_offset + 4]
                .copy_from_slice(&disp32.to_le_bytes());
        }
        Ok(bytes)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_ri64_encoding() {
        let mut asm = Assembler::new();
        asm.mov_ri64(Reg::Rdi, 0x1122334455667788);
        let code = asm.finish().unwrap();
        assert_eq!(
            code,
            vec![0x48, 0xBF, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn mov_rr_encoding() {
        let mut asm = Assembler::new();
        asm.mov_rr(Reg::Rdi, Reg::Rbx); // mov rdi, rbx
        asm.mov_rr(Reg::Rdx, Reg::Rax); // mov rdx, rax
        asm.mov_rr(Reg::Rdx, Reg::Rsp); // mov rdx, rsp
        let code = asm.finish().unwrap();
        assert_eq!(
            code,
            vec![0x48, 0x89, 0xDF, 0x48, 0x89, 0xC2, 0x48, 0x89, 0xE2]
        );
    }

    #[test]
    fn call_and_test() {
        let mut asm = Assembler::new();
        asm.call_r(Reg::Rax);
        asm.test_rr(Reg::Rax, Reg::Rax);
        asm.cmp_ri8(Reg::Rax, 1);
        let code = asm.finish().unwrap();
        assert_eq!(
            code,
            vec![0xFF, 0xD0, 0x48, 0x85, 0xC0, 0x48, 0x83, 0xF8, 0x01]
        );
    }

    #[test]
    fn stack_adjustment() {
        let mut asm = Assembler::new();
        asm.sub_ri8(Reg::Rsp, 8);
        asm.add_ri8(Reg::Rsp, 8);
        asm.mov_r_rsp_ind(Reg::Rcx);
        let code = asm.finish().unwrap();
        assert_eq!(
            code,
            vec![0x48, 0x83, 0xEC, 0x08, 0x48, 0x83, 0xC4, 0x08, 0x48, 0x8B, 0x0C, 0x24]
        );
    }

    #[test]
    fn forward_branch_fixup() {
        let mut asm = Assembler::new();
        let end = asm.create_label();
        asm.jz(end); // 6 bytes
        asm.int3(); // 1 byte
        asm.bind_label(end).unwrap();
        asm.ret();
        let code = asm.finish().unwrap();
        // jz over the int3: displacement 1 from instruction end (offset 6)
        assert_eq!(code, vec![0x0F, 0x84, 0x01, 0x00, 0x00, 0x00, 0xCC, 0xC3]);
    }

    #[test]
    fn backward_branch_fixup() {
        let mut asm = Assembler::new();
        let top = asm.create_label();
        asm.bind_label(top).unwrap();
        asm.jmp(top);
        let code = asm.finish().unwrap();
        assert_eq!(code, vec![0xE9, 0xFB, 0xFF, 0xFF, 0xFF]); // -5
    }

    #[test]
    fn double_bind_is_an_error() {
        let mut asm = Assembler::new();
        let l = asm.create_label();
        asm.bind_label(l).unwrap();
        assert_eq!(
            asm.bind_label(l),
            Err(AssemblerError::LabelAlreadyBound { label: 0 })
        );
    }
}
