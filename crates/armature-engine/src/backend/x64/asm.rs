//! x64 instruction encoder
//!
//! A small fixed vocabulary of encodings, exactly the forms the emitter
//! uses. Code is produced into a byte buffer together with the final
//! virtual address it will be copied to, so rel32 references to absolute
//! targets (dispatcher stubs, already-compiled blocks) are resolved during
//! emission; labels cover forward references within one emission unit.
//!
//! Encoding corners handled centrally in `mem_operand`: RSP/R12 bases force
//! a SIB byte, RBP/R13 bases cannot use disp-less mod=00, and byte-register
//! access to SPL/BPL/SIL/DIL needs a bare REX prefix.

/// A host general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(pub u8);

pub const RAX: Gpr = Gpr(0);
pub const RCX: Gpr = Gpr(1);
pub const RDX: Gpr = Gpr(2);
pub const RBX: Gpr = Gpr(3);
pub const RSP: Gpr = Gpr(4);
pub const RBP: Gpr = Gpr(5);
pub const RSI: Gpr = Gpr(6);
pub const RDI: Gpr = Gpr(7);
pub const R8: Gpr = Gpr(8);
pub const R9: Gpr = Gpr(9);
pub const R10: Gpr = Gpr(10);
pub const R11: Gpr = Gpr(11);
pub const R12: Gpr = Gpr(12);
pub const R13: Gpr = Gpr(13);
pub const R14: Gpr = Gpr(14);
pub const R15: Gpr = Gpr(15);

impl Gpr {
    fn low3(self) -> u8 {
        self.0 & 7
    }

    fn high(self) -> bool {
        self.0 >= 8
    }
}

/// Operand size for the sized instruction forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    B8,
    B16,
    B32,
    B64,
}

/// Host condition codes (the cc nibble of Jcc/SETcc/CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cc {
    pub fn invert(self) -> Cc {
        // Flip the low bit: O<->NO, B<->AE, ...
        unsafe { std::mem::transmute((self as u8) ^ 1) }
    }
}

/// The ALU group sharing the 0x81 /digit immediate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// A memory operand: [base + index*scale + disp].
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: Gpr,
    pub index: Option<(Gpr, u8)>,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Gpr) -> Mem {
        Mem {
            base,
            index: None,
            disp: 0,
        }
    }

    pub fn base_disp(base: Gpr, disp: i32) -> Mem {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    /// [base + index * 2^scale_log2 + disp]
    pub fn base_index(base: Gpr, index: Gpr, scale_log2: u8, disp: i32) -> Mem {
        assert!(index != RSP, "RSP cannot be an index register");
        assert!(scale_log2 <= 3);
        Mem {
            base,
            index: Some((index, scale_log2)),
            disp,
        }
    }
}

/// A forward-reference label within one emission unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct Assembler {
    code: Vec<u8>,
    /// Final virtual address of code[0] once copied into the arena.
    base: u64,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    pub fn new(base: u64) -> Assembler {
        Assembler {
            code: Vec::with_capacity(256),
            base,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Final address of the current position.
    pub fn current_address(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    /// Resolve labels and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for (pos, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].expect("unbound label");
            let rel = target as i64 - (pos as i64 + 4);
            self.code[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.code
    }

    // ---- Raw emission ----

    fn u8(&mut self, b: u8) {
        self.code.push(b);
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// REX prefix; emitted only when needed unless `force`.
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool, force: bool) {
        let byte = 0x40
            | (w as u8) << 3
            | (r as u8) << 2
            | (x as u8) << 1
            | b as u8;
        if byte != 0x40 || force {
            self.u8(byte);
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.u8(md << 6 | (reg & 7) << 3 | (rm & 7));
    }

    /// Prefixes + ModRM + SIB + disp for a memory operand with `reg` in the
    /// reg field. `opcode` is emitted between REX and ModRM.
    fn mem_op(&mut self, size: Size, reg: Gpr, mem: Mem, opcode: &[u8], byte_force_rex: bool) {
        if size == Size::B16 {
            self.u8(0x66);
        }
        let w = size == Size::B64;
        let x = mem.index.map(|(i, _)| i.high()).unwrap_or(false);
        let force = size == Size::B8 && byte_force_rex && (4..8).contains(&reg.0);
        self.rex(w, reg.high(), x, mem.base.high(), force);
        self.code.extend_from_slice(opcode);
        self.mem_tail(reg, mem);
    }

    /// Prefixes + ModRM for a register-register form.
    fn rr_op(&mut self, size: Size, reg: Gpr, rm: Gpr, opcode: &[u8], byte_force_rex: bool) {
        if size == Size::B16 {
            self.u8(0x66);
        }
        let w = size == Size::B64;
        let force = size == Size::B8
            && byte_force_rex
            && ((4..8).contains(&reg.0) || (4..8).contains(&rm.0));
        self.rex(w, reg.high(), false, rm.high(), force);
        self.code.extend_from_slice(opcode);
        self.modrm(3, reg.0, rm.0);
    }

    // ---- Moves ----

    pub fn mov_ri64(&mut self, dst: Gpr, imm: u64) {
        self.rex(true, false, false, dst.high(), false);
        self.u8(0xb8 + dst.low3());
        self.u64(imm);
    }

    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        self.rex(false, false, false, dst.high(), false);
        self.u8(0xb8 + dst.low3());
        self.u32(imm);
    }

    pub fn mov_rr(&mut self, size: Size, dst: Gpr, src: Gpr) {
        let op: &[u8] = if size == Size::B8 { &[0x88] } else { &[0x89] };
        self.rr_op(size, src, dst, op, true);
    }

    /// Load: dst = [mem]
    pub fn mov_rm(&mut self, size: Size, dst: Gpr, mem: Mem) {
        let op: &[u8] = if size == Size::B8 { &[0x8a] } else { &[0x8b] };
        self.mem_op(size, dst, mem, op, true);
    }

    /// Store: [mem] = src
    pub fn mov_mr(&mut self, size: Size, mem: Mem, src: Gpr) {
        let op: &[u8] = if size == Size::B8 { &[0x88] } else { &[0x89] };
        self.mem_op(size, src, mem, op, true);
    }

    /// Store immediate: [mem] = imm (sign-extended imm32 for B64).
    pub fn mov_mi(&mut self, size: Size, mem: Mem, imm: u32) {
        let op: &[u8] = if size == Size::B8 { &[0xc6] } else { &[0xc7] };
        self.mem_op(size, Gpr(0), mem, op, false);
        match size {
            Size::B8 => self.u8(imm as u8),
            Size::B16 => self.code.extend_from_slice(&(imm as u16).to_le_bytes()),
            _ => self.u32(imm),
        }
    }

    pub fn movzx8(&mut self, dst: Gpr, src: Gpr) {
        self.rr_op(Size::B32, dst, src, &[0x0f, 0xb6], true);
    }

    pub fn movzx16(&mut self, dst: Gpr, src: Gpr) {
        self.rr_op(Size::B32, dst, src, &[0x0f, 0xb7], false);
    }

    pub fn movzx8_m(&mut self, dst: Gpr, mem: Mem) {
        self.mem_op(Size::B32, dst, mem, &[0x0f, 0xb6], false);
    }

    pub fn movsx8(&mut self, dst: Gpr, src: Gpr) {
        self.rr_op(Size::B32, dst, src, &[0x0f, 0xbe], true);
    }

    pub fn movsx16(&mut self, dst: Gpr, src: Gpr) {
        self.rr_op(Size::B32, dst, src, &[0x0f, 0xbf], false);
    }

    /// movsxd dst64, src32
    pub fn movsxd(&mut self, dst: Gpr, src: Gpr) {
        self.rr_op(Size::B64, dst, src, &[0x63], false);
    }

    // ---- ALU ----

    pub fn alu_rr(&mut self, op: Alu, size: Size, dst: Gpr, src: Gpr) {
        // opcode base: op*8 + 1 (r/m, r), byte form op*8
        let opcode = (op as u8) * 8 + if size == Size::B8 { 0 } else { 1 };
        self.rr_op(size, src, dst, &[opcode], true);
    }

    pub fn alu_ri(&mut self, op: Alu, size: Size, dst: Gpr, imm: i32) {
        if size == Size::B16 {
            self.u8(0x66);
        }
        self.rex(size == Size::B64, false, false, dst.high(), false);
        if i8::try_from(imm).is_ok() {
            self.u8(0x83);
            self.modrm(3, op as u8, dst.0);
            self.u8(imm as i8 as u8);
        } else {
            self.u8(0x81);
            self.modrm(3, op as u8, dst.0);
            self.u32(imm as u32);
        }
    }

    pub fn alu_rm(&mut self, op: Alu, size: Size, dst: Gpr, mem: Mem) {
        // r, r/m form: opcode base op*8 + 3
        let opcode = (op as u8) * 8 + 3;
        self.mem_op(size, dst, mem, &[opcode], false);
    }

    pub fn alu_mi(&mut self, op: Alu, size: Size, mem: Mem, imm: i32) {
        if i8::try_from(imm).is_ok() {
            self.mem_op(size, Gpr(op as u8), mem, &[0x83], false);
            self.u8(imm as i8 as u8);
        } else {
            self.mem_op(size, Gpr(op as u8), mem, &[0x81], false);
            self.u32(imm as u32);
        }
    }

    /// ALU to memory: [mem] = [mem] OP src.
    pub fn alu_mr(&mut self, op: Alu, size: Size, mem: Mem, src: Gpr) {
        let opcode = (op as u8) * 8 + if size == Size::B8 { 0 } else { 1 };
        self.mem_op(size, src, mem, &[opcode], true);
    }

    /// ALU with byte memory operand and imm8.
    pub fn alu_mi8(&mut self, op: Alu, mem: Mem, imm: u8) {
        self.mem_op(Size::B8, Gpr(op as u8), mem, &[0x80], false);
        self.u8(imm);
    }

    pub fn movzx16_m(&mut self, dst: Gpr, mem: Mem) {
        self.mem_op(Size::B32, dst, mem, &[0x0f, 0xb7], false);
    }

    pub fn test_rr(&mut self, size: Size, a: Gpr, b: Gpr) {
        self.rr_op(size, b, a, &[0x85], true);
    }

    pub fn not_r(&mut self, size: Size, r: Gpr) {
        self.rr_op(size, Gpr(2), r, &[0xf7], false);
    }

    pub fn neg_r(&mut self, size: Size, r: Gpr) {
        self.rr_op(size, Gpr(3), r, &[0xf7], false);
    }

    pub fn imul_rr(&mut self, size: Size, dst: Gpr, src: Gpr) {
        self.rr_op(size, dst, src, &[0x0f, 0xaf], false);
    }

    pub fn bsr(&mut self, size: Size, dst: Gpr, src: Gpr) {
        self.rr_op(size, dst, src, &[0x0f, 0xbd], false);
    }

    // ---- Shifts ----

    fn shift_group(&mut self, size: Size, digit: u8, r: Gpr, imm: Option<u8>) {
        match imm {
            Some(1) => self.rr_op(size, Gpr(digit), r, &[0xd1], false),
            Some(n) => {
                self.rr_op(size, Gpr(digit), r, &[0xc1], false);
                self.u8(n);
            }
            None => self.rr_op(size, Gpr(digit), r, &[0xd3], false),
        }
    }

    pub fn shl_ri(&mut self, size: Size, r: Gpr, imm: u8) {
        self.shift_group(size, 4, r, Some(imm));
    }

    pub fn shr_ri(&mut self, size: Size, r: Gpr, imm: u8) {
        self.shift_group(size, 5, r, Some(imm));
    }

    pub fn sar_ri(&mut self, size: Size, r: Gpr, imm: u8) {
        self.shift_group(size, 7, r, Some(imm));
    }

    pub fn ror_ri(&mut self, size: Size, r: Gpr, imm: u8) {
        self.shift_group(size, 1, r, Some(imm));
    }

    /// Shift by CL.
    pub fn shl_cl(&mut self, size: Size, r: Gpr) {
        self.shift_group(size, 4, r, None);
    }

    pub fn shr_cl(&mut self, size: Size, r: Gpr) {
        self.shift_group(size, 5, r, None);
    }

    pub fn sar_cl(&mut self, size: Size, r: Gpr) {
        self.shift_group(size, 7, r, None);
    }

    pub fn ror_cl(&mut self, size: Size, r: Gpr) {
        self.shift_group(size, 1, r, None);
    }

    /// rcr r, 1 (rotate through carry).
    pub fn rcr1(&mut self, size: Size, r: Gpr) {
        self.rr_op(size, Gpr(3), r, &[0xd1], false);
    }

    /// bt r, imm8 (sets CF to the bit).
    pub fn bt_ri(&mut self, size: Size, r: Gpr, bit: u8) {
        self.rr_op(size, Gpr(4), r, &[0x0f, 0xba], false);
        self.u8(bit);
    }

    pub fn stc(&mut self) {
        self.u8(0xf9);
    }

    pub fn clc(&mut self) {
        self.u8(0xf8);
    }

    pub fn cmc(&mut self) {
        self.u8(0xf5);
    }

    // ---- Conditionals ----

    pub fn setcc(&mut self, cc: Cc, dst: Gpr) {
        // setcc r/m8
        let force = (4..8).contains(&dst.0);
        self.rex(false, false, false, dst.high(), force);
        self.u8(0x0f);
        self.u8(0x90 + cc as u8);
        self.modrm(3, 0, dst.0);
    }

    pub fn cmovcc(&mut self, cc: Cc, size: Size, dst: Gpr, src: Gpr) {
        self.rr_op(size, dst, src, &[0x0f, 0x40 + cc as u8], false);
    }

    // ---- Control flow ----

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn jcc_label(&mut self, cc: Cc, label: Label) {
        self.u8(0x0f);
        self.u8(0x80 + cc as u8);
        self.fixups.push((self.code.len(), label));
        self.u32(0);
    }

    pub fn jmp_label(&mut self, label: Label) {
        self.u8(0xe9);
        self.fixups.push((self.code.len(), label));
        self.u32(0);
    }

    /// jmp rel32 to an absolute address.
    pub fn jmp_addr(&mut self, target: u64) {
        self.u8(0xe9);
        let rel = target as i64 - (self.current_address() as i64 + 4);
        self.u32(rel as i32 as u32);
    }

    /// jcc rel32 to an absolute address.
    pub fn jcc_addr(&mut self, cc: Cc, target: u64) {
        self.u8(0x0f);
        self.u8(0x80 + cc as u8);
        let rel = target as i64 - (self.current_address() as i64 + 4);
        self.u32(rel as i32 as u32);
    }

    pub fn jmp_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.high(), false);
        self.u8(0xff);
        self.modrm(3, 4, r.0);
    }

    pub fn jmp_m(&mut self, mem: Mem) {
        self.mem_op(Size::B32, Gpr(4), mem, &[0xff], false);
    }

    pub fn call_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.high(), false);
        self.u8(0xff);
        self.modrm(3, 2, r.0);
    }

    pub fn push_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.high(), false);
        self.u8(0x50 + r.low3());
    }

    pub fn pop_r(&mut self, r: Gpr) {
        self.rex(false, false, false, r.high(), false);
        self.u8(0x58 + r.low3());
    }

    pub fn ret(&mut self) {
        self.u8(0xc3);
    }

    pub fn int3(&mut self) {
        self.u8(0xcc);
    }

    pub fn ud2(&mut self) {
        self.u8(0x0f);
        self.u8(0x0b);
    }

    pub fn nop(&mut self) {
        self.u8(0x90);
    }

    // ---- System ----

    pub fn mfence(&mut self) {
        self.code.extend_from_slice(&[0x0f, 0xae, 0xf0]);
    }

    pub fn stmxcsr(&mut self, mem: Mem) {
        self.mem_op(Size::B32, Gpr(3), mem, &[0x0f, 0xae], false);
    }

    pub fn ldmxcsr(&mut self, mem: Mem) {
        self.mem_op(Size::B32, Gpr(2), mem, &[0x0f, 0xae], false);
    }

    /// crc32 dst, src (64-bit operands, CRC32-C polynomial).
    pub fn crc32_rr64(&mut self, dst: Gpr, src: Gpr) {
        self.u8(0xf2);
        self.rex(true, dst.high(), false, src.high(), true);
        self.code.extend_from_slice(&[0x0f, 0x38, 0xf1]);
        self.modrm(3, dst.0, src.0);
    }

    pub fn lea(&mut self, dst: Gpr, mem: Mem) {
        self.mem_op(Size::B64, dst, mem, &[0x8d], false);
    }

    // ---- Vector moves (the only xmm forms the backend needs) ----

    /// movdqu xmm, [mem]
    pub fn movdqu_rm(&mut self, dst: Fpr, mem: Mem) {
        self.u8(0xf3);
        let x = mem.index.map(|(i, _)| i.high()).unwrap_or(false);
        self.rex(false, dst.0 >= 8, x, mem.base.high(), false);
        self.code.extend_from_slice(&[0x0f, 0x6f]);
        self.mem_tail(Gpr(dst.0), mem);
    }

    /// movdqu [mem], xmm
    pub fn movdqu_mr(&mut self, mem: Mem, src: Fpr) {
        self.u8(0xf3);
        let x = mem.index.map(|(i, _)| i.high()).unwrap_or(false);
        self.rex(false, src.0 >= 8, x, mem.base.high(), false);
        self.code.extend_from_slice(&[0x0f, 0x7f]);
        self.mem_tail(Gpr(src.0), mem);
    }

    /// ModRM + SIB + disp shared by forms that emit prefixes themselves.
    fn mem_tail(&mut self, reg: Gpr, mem: Mem) {
        let need_sib = mem.index.is_some() || mem.base.low3() == 4;
        let (md, disp_bytes): (u8, usize) = if mem.disp == 0 && mem.base.low3() != 5 {
            (0, 0)
        } else if i8::try_from(mem.disp).is_ok() {
            (1, 1)
        } else {
            (2, 4)
        };
        if need_sib {
            self.modrm(md, reg.0, 4);
            let (index_bits, scale) = match mem.index {
                Some((i, s)) => (i.low3(), s),
                None => (4, 0),
            };
            self.u8(scale << 6 | index_bits << 3 | mem.base.low3());
        } else {
            self.modrm(md, reg.0, mem.base.low3());
        }
        match disp_bytes {
            1 => self.u8(mem.disp as i8 as u8),
            4 => self.u32(mem.disp as u32),
            _ => {}
        }
    }
}

/// A host vector register (xmm0-xmm15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fpr(pub u8);

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut a = Assembler::new(0);
        f(&mut a);
        a.finish()
    }

    #[test]
    fn test_mov_imm() {
        assert_eq!(
            emit(|a| a.mov_ri64(RAX, 0x1122_3344_5566_7788)),
            vec![0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            emit(|a| a.mov_ri32(RAX, 0x1234_5678)),
            vec![0xb8, 0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            emit(|a| a.mov_ri32(R9, 1)),
            vec![0x41, 0xb9, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_rr() {
        // mov rcx, rax
        assert_eq!(emit(|a| a.mov_rr(Size::B64, RCX, RAX)), vec![0x48, 0x89, 0xc1]);
        // mov ecx, eax
        assert_eq!(emit(|a| a.mov_rr(Size::B32, RCX, RAX)), vec![0x89, 0xc1]);
        // mov r8d, eax
        assert_eq!(emit(|a| a.mov_rr(Size::B32, R8, RAX)), vec![0x41, 0x89, 0xc0]);
    }

    #[test]
    fn test_loads_stores() {
        // mov eax, [r15+0x10]
        assert_eq!(
            emit(|a| a.mov_rm(Size::B32, RAX, Mem::base_disp(R15, 0x10))),
            vec![0x41, 0x8b, 0x47, 0x10]
        );
        // mov [r15+0x10], eax
        assert_eq!(
            emit(|a| a.mov_mr(Size::B32, Mem::base_disp(R15, 0x10), RAX)),
            vec![0x41, 0x89, 0x47, 0x10]
        );
        // mov rax, [r15]
        assert_eq!(
            emit(|a| a.mov_rm(Size::B64, RAX, Mem::base(R15))),
            vec![0x49, 0x8b, 0x07]
        );
        // mov [rsp+8], rax needs a SIB byte
        assert_eq!(
            emit(|a| a.mov_mr(Size::B64, Mem::base_disp(RSP, 8), RAX)),
            vec![0x48, 0x89, 0x44, 0x24, 0x08]
        );
        // movzx eax, byte [r15+5]
        assert_eq!(
            emit(|a| a.movzx8_m(RAX, Mem::base_disp(R15, 5))),
            vec![0x41, 0x0f, 0xb6, 0x47, 0x05]
        );
        // mov [rbp], eax cannot use mod=00
        assert_eq!(
            emit(|a| a.mov_mr(Size::B32, Mem::base(RBP), RAX)),
            vec![0x89, 0x45, 0x00]
        );
        // large displacement
        assert_eq!(
            emit(|a| a.mov_rm(Size::B32, RAX, Mem::base_disp(R15, 0x1234))),
            vec![0x41, 0x8b, 0x87, 0x34, 0x12, 0x00, 0x00]
        );
    }

    #[test]
    fn test_scaled_index() {
        // mov rcx, [r15 + rax*8 + 0x20]
        assert_eq!(
            emit(|a| a.mov_rm(Size::B64, RCX, Mem::base_index(R15, RAX, 3, 0x20))),
            vec![0x49, 0x8b, 0x4c, 0xc7, 0x20]
        );
    }

    #[test]
    fn test_alu() {
        // add ecx, edx
        assert_eq!(emit(|a| a.alu_rr(Alu::Add, Size::B32, RCX, RDX)), vec![0x01, 0xd1]);
        // add rcx, rdx
        assert_eq!(
            emit(|a| a.alu_rr(Alu::Add, Size::B32, RCX, RDX)),
            vec![0x01, 0xd1]
        );
        // sub rax, rbx
        assert_eq!(
            emit(|a| a.alu_rr(Alu::Sub, Size::B64, RAX, RBX)),
            vec![0x48, 0x29, 0xd8]
        );
        // cmp eax, 0x100
        assert_eq!(
            emit(|a| a.alu_ri(Alu::Cmp, Size::B32, RAX, 0x100)),
            vec![0x81, 0xf8, 0x00, 0x01, 0x00, 0x00]
        );
        // and eax, 1 uses the imm8 form
        assert_eq!(
            emit(|a| a.alu_ri(Alu::And, Size::B32, RAX, 1)),
            vec![0x83, 0xe0, 0x01]
        );
        // adc eax, ecx
        assert_eq!(emit(|a| a.alu_rr(Alu::Adc, Size::B32, RAX, RCX)), vec![0x11, 0xc8]);
        // cmp qword [r15+0x40], 0
        assert_eq!(
            emit(|a| a.alu_mi(Alu::Cmp, Size::B64, Mem::base_disp(R15, 0x40), 0)),
            vec![0x49, 0x83, 0x7f, 0x40, 0x00]
        );
    }

    #[test]
    fn test_shifts() {
        // shl eax, 5
        assert_eq!(emit(|a| a.shl_ri(Size::B32, RAX, 5)), vec![0xc1, 0xe0, 0x05]);
        // shl rax, cl
        assert_eq!(emit(|a| a.shl_cl(Size::B64, RAX)), vec![0x48, 0xd3, 0xe0]);
        // sar eax, 1
        assert_eq!(emit(|a| a.sar_ri(Size::B32, RAX, 1)), vec![0xd1, 0xf8]);
        // ror ecx, 4
        assert_eq!(emit(|a| a.ror_ri(Size::B32, RCX, 4)), vec![0xc1, 0xc9, 0x04]);
        // bt eax, 0
        assert_eq!(emit(|a| a.bt_ri(Size::B32, RAX, 0)), vec![0x0f, 0xba, 0xe0, 0x00]);
    }

    #[test]
    fn test_setcc_cmov() {
        // setc al
        assert_eq!(emit(|a| a.setcc(Cc::B, RAX)), vec![0x0f, 0x92, 0xc0]);
        // seto sil needs bare REX
        assert_eq!(emit(|a| a.setcc(Cc::O, RSI)), vec![0x40, 0x0f, 0x90, 0xc6]);
        // cmovo eax, ecx
        assert_eq!(
            emit(|a| a.cmovcc(Cc::O, Size::B32, RAX, RCX)),
            vec![0x0f, 0x40, 0xc1]
        );
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(emit(|a| a.ret()), vec![0xc3]);
        assert_eq!(emit(|a| a.push_r(RBP)), vec![0x55]);
        assert_eq!(emit(|a| a.push_r(R15)), vec![0x41, 0x57]);
        assert_eq!(emit(|a| a.pop_r(R15)), vec![0x41, 0x5f]);
        assert_eq!(emit(|a| a.call_r(RAX)), vec![0xff, 0xd0]);
        assert_eq!(emit(|a| a.jmp_r(RAX)), vec![0xff, 0xe0]);
        // jmp to self at base 0: rel32 = -5
        assert_eq!(
            emit(|a| a.jmp_addr(0)),
            vec![0xe9, 0xfb, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_labels() {
        // jz +0 over a nop: 0f 84 01 00 00 00 90
        let bytes = emit(|a| {
            let l = a.new_label();
            a.jcc_label(Cc::E, l);
            a.nop();
            a.bind(l);
        });
        assert_eq!(bytes, vec![0x0f, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn test_misc() {
        assert_eq!(emit(|a| a.mfence()), vec![0x0f, 0xae, 0xf0]);
        // imul eax, ecx
        assert_eq!(emit(|a| a.imul_rr(Size::B32, RAX, RCX)), vec![0x0f, 0xaf, 0xc1]);
        // bsr eax, ecx
        assert_eq!(emit(|a| a.bsr(Size::B32, RAX, RCX)), vec![0x0f, 0xbd, 0xc1]);
        // crc32 rax, rcx
        assert_eq!(
            emit(|a| a.crc32_rr64(RAX, RCX)),
            vec![0xf2, 0x48, 0x0f, 0x38, 0xf1, 0xc1]
        );
        // movsxd rax, ecx
        assert_eq!(emit(|a| a.movsxd(RAX, RCX)), vec![0x48, 0x63, 0xc1]);
        // test eax, eax
        assert_eq!(emit(|a| a.test_rr(Size::B32, RAX, RAX)), vec![0x85, 0xc0]);
        // neg ecx / not ecx
        assert_eq!(emit(|a| a.neg_r(Size::B32, RCX)), vec![0xf7, 0xd9]);
        assert_eq!(emit(|a| a.not_r(Size::B32, RCX)), vec![0xf7, 0xd1]);
        // stmxcsr [r15+0x30] / ldmxcsr [r15+0x34]
        assert_eq!(
            emit(|a| a.stmxcsr(Mem::base_disp(R15, 0x30))),
            vec![0x41, 0x0f, 0xae, 0x5f, 0x30]
        );
        assert_eq!(
            emit(|a| a.ldmxcsr(Mem::base_disp(R15, 0x34))),
            vec![0x41, 0x0f, 0xae, 0x57, 0x34]
        );
        // movzx eax, cl / movsx eax, cx
        assert_eq!(emit(|a| a.movzx8(RAX, RCX)), vec![0x0f, 0xb6, 0xc1]);
        assert_eq!(emit(|a| a.movsx16(RAX, RCX)), vec![0x0f, 0xbf, 0xc1]);
    }

    #[test]
    fn test_byte_mem_forms() {
        // or byte [r15+0x44], al
        assert_eq!(
            emit(|a| a.alu_mr(Alu::Or, Size::B8, Mem::base_disp(R15, 0x44), RAX)),
            vec![0x41, 0x08, 0x47, 0x44]
        );
        // cmp byte [r15+0x41], 0
        assert_eq!(
            emit(|a| a.alu_mi8(Alu::Cmp, Mem::base_disp(R15, 0x41), 0)),
            vec![0x41, 0x80, 0x7f, 0x41, 0x00]
        );
        // movzx eax, word [r15+2]
        assert_eq!(
            emit(|a| a.movzx16_m(RAX, Mem::base_disp(R15, 2))),
            vec![0x41, 0x0f, 0xb7, 0x47, 0x02]
        );
        // rcr eax, 1 / stc / clc / cmc
        assert_eq!(emit(|a| a.rcr1(Size::B32, RAX)), vec![0xd1, 0xd8]);
        assert_eq!(emit(|a| a.stc()), vec![0xf9]);
        assert_eq!(emit(|a| a.clc()), vec![0xf8]);
        assert_eq!(emit(|a| a.cmc()), vec![0xf5]);
    }

    #[test]
    fn test_movdqu() {
        // movdqu xmm0, [r15+0x100]
        assert_eq!(
            emit(|a| a.movdqu_rm(Fpr(0), Mem::base_disp(R15, 0x100))),
            vec![0xf3, 0x41, 0x0f, 0x6f, 0x87, 0x00, 0x01, 0x00, 0x00]
        );
        // movdqu [rsp+0x10], xmm1
        assert_eq!(
            emit(|a| a.movdqu_mr(Mem::base_disp(RSP, 0x10), Fpr(1))),
            vec![0xf3, 0x0f, 0x7f, 0x4c, 0x24, 0x10]
        );
    }
}
