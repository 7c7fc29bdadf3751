//! Per-opcode x64 lowering and terminal emission
//!
//! The emitter walks a block's instructions in order, dispatching on the
//! opcode with an exhaustive match: a new opcode that lacks a lowering
//! fails to compile. Registers come from the allocator; memory and system
//! opcodes lower to `extern "C"` shims whose addresses arrive through
//! `RuntimeHandles`.
//!
//! Flag-producing operations fuse their pseudo-operation consumers: when an
//! Add32 carries a carry or overflow link, the matching SETcc is emitted
//! immediately after the ALU instruction, while the host flags are still
//! live. Scalar values obey one invariant throughout: every GPR value is
//! zero-extended to 64 bits.

use rustc_hash::FxHashSet;

use super::asm::{Alu, Assembler, Cc, Gpr, Mem, Size, RAX, RCX, RDX, RSI, RSP, R15};
use super::regalloc::RegAlloc;
use armature_isa::Cond;

use crate::ir::{Block, InstId, Opcode, Terminal, Value};
use crate::loc::LocationDescriptor;
use crate::runtime::state::{Arch, StateInfo, RSB_PTR_MASK};

/// Addresses of the `extern "C"` entry points emitted code calls into.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShimTable {
    pub read8: u64,
    pub read16: u64,
    pub read32: u64,
    pub read64: u64,
    pub write8: u64,
    pub write16: u64,
    pub write32: u64,
    pub write64: u64,
    pub ex_read8: u64,
    pub ex_read16: u64,
    pub ex_read32: u64,
    pub ex_read64: u64,
    pub ex_write8: u64,
    pub ex_write16: u64,
    pub ex_write32: u64,
    pub ex_write64: u64,
    pub clear_exclusive: u64,
    pub call_svc: u64,
    pub exception_raised: u64,
    pub interpret: u64,
    pub coproc_word: u64,
    pub coproc_double: u64,
    pub lookup_code: u64,
    pub lsl32_c: u64,
    pub lsr32_c: u64,
    pub asr32_c: u64,
    pub ror32_c: u64,
    pub shift64: u64,
    pub aes_encrypt: u64,
    pub aes_decrypt: u64,
    pub aes_mix: u64,
    pub aes_inverse_mix: u64,
}

/// Everything about the runtime the emitter bakes into code.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHandles {
    /// Opaque engine pointer passed as the first shim argument.
    pub core_ptr: u64,
    /// Dispatcher epilogue: jump here to return to the host.
    pub epilogue: u64,
    pub shims: ShimTable,
    /// Fast-dispatch table base, or 0 when disabled.
    pub fast_dispatch_table: u64,
    /// Entry count minus one (table is a power of two).
    pub fast_dispatch_mask: u32,
    /// Direct guest-memory base for fastmem, if configured.
    pub fastmem_base: Option<u64>,
    /// Single-step blocks never link or predict.
    pub single_step: bool,
}

/// A patchable site referencing another block.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    /// Byte offset of the patch region within the block's code.
    pub offset: usize,
    pub kind: PatchKind,
    pub target: LocationDescriptor,
    /// Byte image of the unpatched form, for SMC rollback.
    pub unpatched: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// 6-byte region: `jg target` when patched, nops otherwise.
    Jg,
    /// 5-byte region: `jmp target` when patched, `jmp fallthrough` otherwise.
    Jmp,
    /// 8-byte immediate holding a code pointer (RSB push sites).
    Imm64,
}

/// Byte length of each patch region.
impl PatchKind {
    pub fn len(self) -> usize {
        match self {
            PatchKind::Jg => 6,
            PatchKind::Jmp => 5,
            PatchKind::Imm64 => 8,
        }
    }
}

/// A fastmem access site: the handler overwrites the region with
/// `slow_bytes` on the first fault.
#[derive(Debug, Clone)]
pub struct FastmemSite {
    pub offset: usize,
    pub inst: u32,
    pub slow_bytes: Vec<u8>,
}

/// Fixed size of a fastmem patch region.
pub const FASTMEM_REGION: usize = 20;

/// Output of block emission, positioned for `base`.
pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub base: u64,
    pub patches: Vec<PatchRecord>,
    pub fastmem: Vec<FastmemSite>,
}

pub fn emit_block(
    block: &Block,
    info: StateInfo,
    rt: &RuntimeHandles,
    base: u64,
    do_not_fastmem: &FxHashSet<(LocationDescriptor, u32)>,
) -> CompiledBlock {
    let mut e = Emitter {
        asm: Assembler::new(base),
        ra: RegAlloc::new(info, block),
        info,
        rt,
        block,
        patches: Vec::new(),
        fastmem: Vec::new(),
        rsb_stubs: Vec::new(),
        do_not_fastmem,
    };
    e.emit();
    e.finish()
}

struct Emitter<'a> {
    asm: Assembler,
    ra: RegAlloc,
    info: StateInfo,
    rt: &'a RuntimeHandles,
    block: &'a Block,
    patches: Vec<PatchRecord>,
    fastmem: Vec<FastmemSite>,
    /// (imm64 offset, descriptor) pairs awaiting their deferred-exit stub.
    rsb_stubs: Vec<(usize, LocationDescriptor)>,
    do_not_fastmem: &'a FxHashSet<(LocationDescriptor, u32)>,
}

impl Emitter<'_> {
    fn emit(&mut self) {
        // Consume this block's cycles up front; skipped conditional bodies
        // still pay for their instructions.
        self.asm.alu_mi(
            Alu::Sub,
            Size::B64,
            Mem::base_disp(R15, self.info.cycles_off),
            self.block.cycle_count as i32,
        );

        // Conditional-body prelude: skip straight to the condition-failed
        // exit when the block condition does not hold.
        if self.block.cond != Cond::Al {
            let body = self.asm.new_label();
            let cc = self.emit_cond(self.block.cond);
            self.asm.jcc_label(cc, body);
            let fail = Terminal::LinkBlock {
                next: self
                    .block
                    .cond_failed
                    .expect("conditional block without fail location"),
            };
            self.emit_terminal(&fail);
            self.asm.bind(body);
        }

        for id in self.block.inst_ids() {
            let inst = self.block.inst(id);
            if inst.is_void() || inst.op.info().pseudo {
                continue;
            }
            self.ra.set_current(id.0);
            self.emit_inst(id);
            self.ra.end_of_alloc_scope();
        }

        let terminal = self.block.terminal.clone();
        self.emit_terminal(&terminal);
        self.ra.assert_no_more_uses();
    }

    fn finish(mut self) -> CompiledBlock {
        // Deferred-exit stubs for RSB pushes: materialize the return
        // location and bail to the dispatcher. Patched to the real entry
        // point once the return target compiles.
        let stubs = std::mem::take(&mut self.rsb_stubs);
        let base = self.asm.base_address();
        let mut resolved = Vec::new();
        for (imm_off, desc) in stubs {
            let stub_addr = self.asm.current_address();
            self.store_location(desc);
            self.asm.jmp_addr(self.rt.epilogue);
            resolved.push((imm_off, desc, stub_addr));
        }
        let mut code = self.asm.finish();
        for (imm_off, desc, stub_addr) in resolved {
            code[imm_off..imm_off + 8].copy_from_slice(&stub_addr.to_le_bytes());
            self.patches.push(PatchRecord {
                offset: imm_off,
                kind: PatchKind::Imm64,
                target: desc,
                unpatched: stub_addr.to_le_bytes().to_vec(),
            });
        }
        CompiledBlock {
            code,
            base,
            patches: self.patches,
            fastmem: self.fastmem,
        }
    }

    // ---- Shared helpers ----

    fn state(&self, off: i32) -> Mem {
        Mem::base_disp(R15, off)
    }

    fn call_shim(&mut self, shim: u64) {
        self.asm.mov_ri64(RAX, shim);
        self.asm.call_r(RAX);
    }

    /// Evaluate an A32 condition from the state flag bytes; returns the
    /// host condition meaning "passed". AL/NV must be handled by callers.
    fn emit_cond(&mut self, cond: Cond) -> Cc {
        let n = self.state(self.info.n_off);
        let z = self.state(self.info.z_off);
        let c = self.state(self.info.c_off);
        let v = self.state(self.info.v_off);
        match cond {
            Cond::Eq => {
                self.asm.alu_mi8(Alu::Cmp, z, 0);
                Cc::Ne
            }
            Cond::Ne => {
                self.asm.alu_mi8(Alu::Cmp, z, 0);
                Cc::E
            }
            Cond::Cs => {
                self.asm.alu_mi8(Alu::Cmp, c, 0);
                Cc::Ne
            }
            Cond::Cc => {
                self.asm.alu_mi8(Alu::Cmp, c, 0);
                Cc::E
            }
            Cond::Mi => {
                self.asm.alu_mi8(Alu::Cmp, n, 0);
                Cc::Ne
            }
            Cond::Pl => {
                self.asm.alu_mi8(Alu::Cmp, n, 0);
                Cc::E
            }
            Cond::Vs => {
                self.asm.alu_mi8(Alu::Cmp, v, 0);
                Cc::Ne
            }
            Cond::Vc => {
                self.asm.alu_mi8(Alu::Cmp, v, 0);
                Cc::E
            }
            Cond::Hi | Cond::Ls => {
                // passed(HI) = ((!C) | Z) == 0
                self.asm.movzx8_m(RAX, c);
                self.asm.alu_ri(Alu::Xor, Size::B32, RAX, 1);
                self.asm.movzx8_m(RCX, z);
                self.asm.alu_rr(Alu::Or, Size::B32, RAX, RCX);
                if cond == Cond::Hi {
                    Cc::E
                } else {
                    Cc::Ne
                }
            }
            Cond::Ge | Cond::Lt => {
                // passed(GE) = (N ^ V) == 0
                self.asm.movzx8_m(RAX, n);
                self.asm.movzx8_m(RCX, v);
                self.asm.alu_rr(Alu::Xor, Size::B32, RAX, RCX);
                if cond == Cond::Ge {
                    Cc::E
                } else {
                    Cc::Ne
                }
            }
            Cond::Gt | Cond::Le => {
                // passed(GT) = ((N ^ V) | Z) == 0
                self.asm.movzx8_m(RAX, n);
                self.asm.movzx8_m(RCX, v);
                self.asm.alu_rr(Alu::Xor, Size::B32, RAX, RCX);
                self.asm.movzx8_m(RCX, z);
                self.asm.alu_rr(Alu::Or, Size::B32, RAX, RCX);
                if cond == Cond::Gt {
                    Cc::E
                } else {
                    Cc::Ne
                }
            }
            Cond::Al | Cond::Nv => unreachable!("trivial condition reached the emitter"),
        }
    }

    /// Store the state fields that identify `desc` so the dispatcher can
    /// resume there. Registers RAX may be clobbered.
    fn store_location(&mut self, desc: LocationDescriptor) {
        match self.info.arch {
            Arch::A32 => {
                let loc = crate::loc::a32::A32Location::from_descriptor(desc);
                self.asm
                    .mov_mi(Size::B32, self.state(self.info.pc_off), loc.pc);
                self.asm
                    .mov_mi(Size::B8, self.state(self.info.t_off), loc.thumb as u32);
            }
            Arch::A64 => {
                let loc = crate::loc::a64::A64Location::from_descriptor(desc);
                if loc.pc < 0x8000_0000 {
                    self.asm
                        .mov_mi(Size::B64, self.state(self.info.pc_off), loc.pc as u32);
                } else {
                    self.asm.mov_ri64(RAX, loc.pc);
                    self.asm.mov_mr(Size::B64, self.state(self.info.pc_off), RAX);
                }
            }
        }
    }

    /// Rebuild the current location descriptor into RDX (clobbers RCX).
    fn reconstruct_descriptor(&mut self) {
        match self.info.arch {
            Arch::A32 => {
                self.asm.mov_rm(Size::B32, RDX, self.state(self.info.pc_off));
                self.asm.movzx8_m(RCX, self.state(self.info.t_off));
                self.asm.shl_ri(Size::B64, RCX, crate::loc::a32::T_BIT as u8);
                self.asm.alu_rr(Alu::Or, Size::B64, RDX, RCX);
                self.asm
                    .alu_rm(Alu::Or, Size::B64, RDX, self.state(self.info.desc_hi_off));
            }
            Arch::A64 => {
                self.asm.mov_rm(Size::B64, RDX, self.state(self.info.pc_off));
                self.asm.mov_ri64(RCX, crate::loc::a64::PC_MASK);
                self.asm.alu_rr(Alu::And, Size::B64, RDX, RCX);
                self.asm
                    .alu_rm(Alu::Or, Size::B64, RDX, self.state(self.info.desc_hi_off));
            }
        }
    }

    /// Acquire the operands of a binary op: the read-only right operand
    /// first (so a value used as both operands is still mapped), then the
    /// clobberable destination. Returns (dst, Some(rhs)) or (dst, None)
    /// when the right operand should be used as an immediate.
    fn acquire_binary(&mut self, size: Size, a: Value, b: Value) -> (Gpr, Option<Gpr>) {
        let rhs = match b {
            Value::Inst(_) => Some(self.ra.use_gpr(&mut self.asm, b)),
            imm => {
                let raw = imm.imm_u64();
                let fits = size != Size::B64 || i32::try_from(raw as i64).is_ok();
                if fits {
                    None
                } else {
                    Some(self.ra.use_gpr(&mut self.asm, imm))
                }
            }
        };
        let dst = self.ra.use_scratch_gpr(&mut self.asm, a);
        (dst, rhs)
    }

    /// Apply `op` to an already-acquired operand pair.
    fn alu_acquired(&mut self, op: Alu, size: Size, dst: Gpr, rhs: Option<Gpr>, b: Value) {
        match rhs {
            Some(r) => self.asm.alu_rr(op, size, dst, r),
            None => self.asm.alu_ri(op, size, dst, b.imm_u64() as i32),
        }
    }

    /// Emit SETcc materializations for the carry/overflow consumers of
    /// `id`, immediately after the flag-producing instruction. `carry_cc`
    /// is the host condition representing the guest carry-out.
    fn fuse_flag_outputs(&mut self, id: InstId, carry_cc: Option<Cc>, overflow_cc: Option<Cc>) {
        let inst = self.block.inst(id);
        if let Some(pseudo) = inst.carry_out {
            let cc = carry_cc.expect("carry consumer on an op without carry");
            let r = self.ra.scratch_gpr(&mut self.asm);
            self.asm.setcc(cc, r);
            self.asm.movzx8(r, r);
            self.ra.define_gpr(pseudo, r);
        }
        if let Some(pseudo) = inst.overflow_out {
            let cc = overflow_cc.expect("overflow consumer on an op without overflow");
            let r = self.ra.scratch_gpr(&mut self.asm);
            self.asm.setcc(cc, r);
            self.asm.movzx8(r, r);
            self.ra.define_gpr(pseudo, r);
        }
    }

    /// Materialize a flag-comparison result: `dst != orig` into the
    /// overflow consumer (saturation Q).
    fn fuse_q_from_difference(&mut self, id: InstId, result: Gpr, original: Gpr, size: Size) {
        if self.block.inst(id).overflow_out.is_some() {
            self.asm.alu_rr(Alu::Cmp, size, result, original);
            self.fuse_flag_outputs(id, None, Some(Cc::Ne));
        }
    }

    // ---- Instruction dispatch ----

    fn emit_inst(&mut self, id: InstId) {
        let inst = self.block.inst(id);
        let op = inst.op;
        let args = inst.args.clone();
        use Opcode::*;
        match op {
            Void | GetCarryFromOp | GetOverflowFromOp => {
                unreachable!("{} reached the emitter walk", op.name())
            }

            // ---- Guest state ----
            GetRegister => {
                let idx = args[0].imm_u64() as u8;
                let r = self.ra.scratch_gpr(&mut self.asm);
                self.asm
                    .mov_rm(Size::B32, r, self.state(self.info.reg_offset(idx)));
                self.ra.define_gpr(id, r);
            }
            GetRegister64 => {
                let idx = args[0].imm_u64() as u8;
                let r = self.ra.scratch_gpr(&mut self.asm);
                self.asm
                    .mov_rm(Size::B64, r, self.state(self.info.reg_offset(idx)));
                self.ra.define_gpr(id, r);
            }
            SetRegister => {
                let idx = args[0].imm_u64() as u8;
                let mem = self.state(self.info.reg_offset(idx));
                match args[1] {
                    Value::Inst(_) => {
                        let r = self.ra.use_gpr(&mut self.asm, args[1]);
                        self.asm.mov_mr(Size::B32, mem, r);
                    }
                    imm => self.asm.mov_mi(Size::B32, mem, imm.imm_u64() as u32),
                }
            }
            SetRegister64 => {
                let idx = args[0].imm_u64() as u8;
                let mem = self.state(self.info.reg_offset(idx));
                let r = self.ra.use_gpr(&mut self.asm, args[1]);
                self.asm.mov_mr(Size::B64, mem, r);
            }
            GetVector => {
                let idx = args[0].imm_u64() as u8;
                let f = self.ra.scratch_fpr(&mut self.asm);
                self.asm
                    .movdqu_rm(f, self.state(self.info.vec_reg_offset(idx)));
                self.ra.define_fpr(id, f);
            }
            SetVector => {
                let idx = args[0].imm_u64() as u8;
                let f = self.ra.use_fpr(&mut self.asm, args[1]);
                self.asm
                    .movdqu_mr(self.state(self.info.vec_reg_offset(idx)), f);
            }
            GetNFlag | GetZFlag | GetCFlag | GetVFlag => {
                let off = match op {
                    GetNFlag => self.info.n_off,
                    GetZFlag => self.info.z_off,
                    GetCFlag => self.info.c_off,
                    _ => self.info.v_off,
                };
                let r = self.ra.scratch_gpr(&mut self.asm);
                self.asm.movzx8_m(r, self.state(off));
                self.ra.define_gpr(id, r);
            }
            SetNFlag | SetZFlag | SetCFlag | SetVFlag | SetTFlag | SetCheckBit => {
                let off = match op {
                    SetNFlag => self.info.n_off,
                    SetZFlag => self.info.z_off,
                    SetCFlag => self.info.c_off,
                    SetVFlag => self.info.v_off,
                    SetTFlag => self.info.t_off,
                    _ => self.info.check_bit_off,
                };
                assert!(off >= 0, "flag not present in this state layout");
                let mem = self.state(off);
                match args[0] {
                    Value::Inst(_) => {
                        let r = self.ra.use_gpr(&mut self.asm, args[0]);
                        self.asm.mov_mr(Size::B8, mem, r);
                    }
                    imm => self.asm.mov_mi(Size::B8, mem, imm.imm_u64() as u32),
                }
            }
            OrQFlag => {
                assert!(self.info.q_off >= 0);
                let mem = self.state(self.info.q_off);
                match args[0] {
                    Value::U1(false) => {}
                    Value::U1(true) => self.asm.mov_mi(Size::B8, mem, 1),
                    _ => {
                        let r = self.ra.use_gpr(&mut self.asm, args[0]);
                        self.asm.alu_mr(Alu::Or, Size::B8, mem, r);
                    }
                }
            }

            // ---- Arithmetic ----
            Add32 | Add64 => {
                let size = if op == Add32 { Size::B32 } else { Size::B64 };
                self.emit_add_sub(id, size, &args, false);
            }
            Sub32 | Sub64 => {
                let size = if op == Sub32 { Size::B32 } else { Size::B64 };
                self.emit_add_sub(id, size, &args, true);
            }
            Mul32 | Mul64 => {
                let size = if op == Mul32 { Size::B32 } else { Size::B64 };
                let b = self.ra.use_gpr(&mut self.asm, args[1]);
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.imul_rr(size, r, b);
                self.ra.define_gpr(id, r);
            }
            SignedMultiplyLong | UnsignedMultiplyLong => {
                let a = self.ra.use_gpr(&mut self.asm, args[0]);
                let b = self.ra.use_gpr(&mut self.asm, args[1]);
                let r = self.ra.scratch_gpr(&mut self.asm);
                let t = self.ra.scratch_gpr(&mut self.asm);
                if op == SignedMultiplyLong {
                    self.asm.movsxd(r, a);
                    self.asm.movsxd(t, b);
                } else {
                    self.asm.mov_rr(Size::B32, r, a);
                    self.asm.mov_rr(Size::B32, t, b);
                }
                self.asm.imul_rr(Size::B64, r, t);
                self.ra.define_gpr(id, r);
            }
            And32 | And64 | Or32 | Or64 | Eor32 | Eor64 => {
                let (alu, size) = match op {
                    And32 => (Alu::And, Size::B32),
                    And64 => (Alu::And, Size::B64),
                    Or32 => (Alu::Or, Size::B32),
                    Or64 => (Alu::Or, Size::B64),
                    Eor32 => (Alu::Xor, Size::B32),
                    _ => (Alu::Xor, Size::B64),
                };
                let (r, rhs) = self.acquire_binary(size, args[0], args[1]);
                self.alu_acquired(alu, size, r, rhs, args[1]);
                self.ra.define_gpr(id, r);
            }
            Not32 | Not64 => {
                let size = if op == Not32 { Size::B32 } else { Size::B64 };
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.not_r(size, r);
                self.ra.define_gpr(id, r);
            }
            CountLeadingZeros32 => {
                let x = self.ra.use_gpr(&mut self.asm, args[0]);
                let t = self.ra.scratch_gpr(&mut self.asm);
                let r = self.ra.scratch_gpr(&mut self.asm);
                self.asm.bsr(Size::B32, t, x);
                self.asm.mov_ri32(r, 0xffff_ffff);
                self.asm.cmovcc(Cc::Ne, Size::B32, r, t);
                self.asm.neg_r(Size::B32, r);
                self.asm.alu_ri(Alu::Add, Size::B32, r, 31);
                self.ra.define_gpr(id, r);
            }

            // ---- Shifts ----
            LogicalShiftLeft32 | LogicalShiftRight32 | ArithmeticShiftRight32
            | RotateRight32 => self.emit_shift32(id, op, &args),
            RotateRightExtended => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                match args[1] {
                    Value::U1(true) => self.asm.stc(),
                    Value::U1(false) => self.asm.clc(),
                    carry => {
                        let c = self.ra.use_gpr(&mut self.asm, carry);
                        self.asm.bt_ri(Size::B32, c, 0);
                    }
                }
                self.asm.rcr1(Size::B32, r);
                self.fuse_flag_outputs(id, Some(Cc::B), None);
                self.ra.define_gpr(id, r);
            }
            LogicalShiftLeft64 | LogicalShiftRight64 | ArithmeticShiftRight64 => {
                self.emit_shift64(id, op, &args)
            }

            // ---- Extension and extraction ----
            SignExtend8To32 => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.movsx8(r, r);
                self.ra.define_gpr(id, r);
            }
            SignExtend16To32 => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.movsx16(r, r);
                self.ra.define_gpr(id, r);
            }
            ZeroExtend8To32 | ZeroExtend16To32 | ZeroExtend32To64 => {
                // Values are already zero-extended to 64 bits
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.ra.define_gpr(id, r);
            }
            SignExtend32To64 => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.movsxd(r, r);
                self.ra.define_gpr(id, r);
            }
            LeastSignificantWord => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.mov_rr(Size::B32, r, r);
                self.ra.define_gpr(id, r);
            }
            MostSignificantWord => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.shr_ri(Size::B64, r, 32);
                self.ra.define_gpr(id, r);
            }
            LeastSignificantByte => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.movzx8(r, r);
                self.ra.define_gpr(id, r);
            }
            LeastSignificantHalf => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.movzx16(r, r);
                self.ra.define_gpr(id, r);
            }
            MostSignificantBit32 => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.shr_ri(Size::B32, r, 31);
                self.ra.define_gpr(id, r);
            }
            MostSignificantBit64 => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                self.asm.shr_ri(Size::B64, r, 63);
                self.ra.define_gpr(id, r);
            }
            IsZero32 | IsZero64 => {
                let size = if op == IsZero32 { Size::B32 } else { Size::B64 };
                let x = self.ra.use_gpr(&mut self.asm, args[0]);
                let r = self.ra.scratch_gpr(&mut self.asm);
                self.asm.test_rr(size, x, x);
                self.asm.setcc(Cc::E, r);
                self.asm.movzx8(r, r);
                self.ra.define_gpr(id, r);
            }
            TestBit32 => {
                let bit = args[1].imm_u64() as u8;
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                if bit != 0 {
                    self.asm.shr_ri(Size::B32, r, bit);
                }
                self.asm.alu_ri(Alu::And, Size::B32, r, 1);
                self.ra.define_gpr(id, r);
            }

            // ---- Saturating arithmetic ----
            SignedSaturatedAdd32 | SignedSaturatedSub32 => {
                self.emit_signed_sat32_64(id, Size::B32, &args, op == SignedSaturatedSub32)
            }
            SignedSaturatedAdd64 | SignedSaturatedSub64 => {
                self.emit_signed_sat32_64(id, Size::B64, &args, op == SignedSaturatedSub64)
            }
            SignedSaturatedAdd8 | SignedSaturatedSub8 => {
                self.emit_signed_sat_narrow(id, 8, &args, op == SignedSaturatedSub8)
            }
            SignedSaturatedAdd16 | SignedSaturatedSub16 => {
                self.emit_signed_sat_narrow(id, 16, &args, op == SignedSaturatedSub16)
            }
            UnsignedSaturatedAdd8 | UnsignedSaturatedAdd16 => {
                self.emit_unsigned_sat_add_narrow(id, if op == UnsignedSaturatedAdd8 { 8 } else { 16 }, &args)
            }
            UnsignedSaturatedAdd32 | UnsignedSaturatedAdd64 => {
                let size = if op == UnsignedSaturatedAdd32 {
                    Size::B32
                } else {
                    Size::B64
                };
                let (r, rhs) = self.acquire_binary(size, args[0], args[1]);
                let ones = self.ra.scratch_gpr(&mut self.asm);
                if size == Size::B64 {
                    self.asm.mov_ri64(ones, u64::MAX);
                } else {
                    self.asm.mov_ri32(ones, u32::MAX);
                }
                self.alu_acquired(Alu::Add, size, r, rhs, args[1]);
                self.fuse_flag_outputs(id, None, Some(Cc::B));
                self.asm.cmovcc(Cc::B, size, r, ones);
                self.ra.define_gpr(id, r);
            }
            UnsignedSaturatedSub8 | UnsignedSaturatedSub16 | UnsignedSaturatedSub32
            | UnsignedSaturatedSub64 => {
                let size = if op == UnsignedSaturatedSub64 {
                    Size::B64
                } else {
                    Size::B32
                };
                let (r, rhs) = self.acquire_binary(size, args[0], args[1]);
                let zero = self.ra.scratch_gpr(&mut self.asm);
                self.asm.mov_ri32(zero, 0);
                self.alu_acquired(Alu::Sub, size, r, rhs, args[1]);
                self.fuse_flag_outputs(id, None, Some(Cc::B));
                self.asm.cmovcc(Cc::B, size, r, zero);
                self.ra.define_gpr(id, r);
            }
            SignedSaturatedDouble32 => {
                // sat(a + a)
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                let clamp = self.ra.scratch_gpr(&mut self.asm);
                self.asm.mov_rr(Size::B32, clamp, r);
                self.asm.sar_ri(Size::B32, clamp, 31);
                self.asm.alu_ri(Alu::Xor, Size::B32, clamp, 0x7fff_ffff);
                self.asm.alu_rr(Alu::Add, Size::B32, r, r);
                self.fuse_flag_outputs(id, None, Some(Cc::O));
                self.asm.cmovcc(Cc::O, Size::B32, r, clamp);
                self.ra.define_gpr(id, r);
            }
            SignedSaturatedDoublingMultiplyHigh16 => {
                let a = self.ra.use_gpr(&mut self.asm, args[0]);
                let b = self.ra.use_gpr(&mut self.asm, args[1]);
                let r = self.ra.scratch_gpr(&mut self.asm);
                let t = self.ra.scratch_gpr(&mut self.asm);
                self.asm.movsx16(r, a);
                self.asm.movsx16(t, b);
                self.asm.imul_rr(Size::B32, r, t);
                // high half of the doubled product = product >> 15
                self.asm.sar_ri(Size::B32, r, 15);
                self.clamp_signed(id, r, t, 0x7fff, -0x8000);
                self.asm.alu_ri(Alu::And, Size::B32, r, 0xffff);
                self.ra.define_gpr(id, r);
            }
            SignedSaturatedDoublingMultiplyHigh32 => {
                let a = self.ra.use_gpr(&mut self.asm, args[0]);
                let b = self.ra.use_gpr(&mut self.asm, args[1]);
                let r = self.ra.scratch_gpr(&mut self.asm);
                let t = self.ra.scratch_gpr(&mut self.asm);
                self.asm.movsxd(r, a);
                self.asm.movsxd(t, b);
                self.asm.imul_rr(Size::B64, r, t);
                self.asm.sar_ri(Size::B64, r, 31);
                self.clamp_signed64(id, r, t, 0x7fff_ffff, -0x8000_0000);
                self.asm.mov_rr(Size::B32, r, r);
                self.ra.define_gpr(id, r);
            }
            SignedSaturation => {
                let n = args[1].imm_u64() as u32;
                assert!((1..=32).contains(&n));
                if n == 32 {
                    let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                    if let Some(pseudo) = self.block.inst(id).overflow_out {
                        let q = self.ra.scratch_gpr(&mut self.asm);
                        self.asm.mov_ri32(q, 0);
                        self.ra.define_gpr(pseudo, q);
                    }
                    self.ra.define_gpr(id, r);
                } else {
                    let max = (1i32 << (n - 1)) - 1;
                    let min = -(1i32 << (n - 1));
                    let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                    let t = self.ra.scratch_gpr(&mut self.asm);
                    self.clamp_signed(id, r, t, max, min);
                    self.ra.define_gpr(id, r);
                }
            }
            UnsignedSaturation => {
                let n = args[1].imm_u64() as u32;
                assert!(n <= 31);
                let max = ((1u64 << n) - 1) as i32;
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                let t = self.ra.scratch_gpr(&mut self.asm);
                self.clamp_signed(id, r, t, max, 0);
                self.ra.define_gpr(id, r);
            }

            // ---- Memory ----
            ReadMemory8 | ReadMemory16 | ReadMemory32 | ReadMemory64 => {
                let bits = match op {
                    ReadMemory8 => 8,
                    ReadMemory16 => 16,
                    ReadMemory32 => 32,
                    _ => 64,
                };
                self.emit_read_memory(id, bits, &args);
            }
            WriteMemory8 | WriteMemory16 | WriteMemory32 | WriteMemory64 => {
                let bits = match op {
                    WriteMemory8 => 8,
                    WriteMemory16 => 16,
                    WriteMemory32 => 32,
                    _ => 64,
                };
                self.emit_write_memory(id, bits, &args);
            }
            ExclusiveReadMemory8 | ExclusiveReadMemory16 | ExclusiveReadMemory32
            | ExclusiveReadMemory64 => {
                let shim = match op {
                    ExclusiveReadMemory8 => self.rt.shims.ex_read8,
                    ExclusiveReadMemory16 => self.rt.shims.ex_read16,
                    ExclusiveReadMemory32 => self.rt.shims.ex_read32,
                    _ => self.rt.shims.ex_read64,
                };
                self.ra.host_call(
                    &mut self.asm,
                    &[Some(Value::U64(self.rt.core_ptr)), Some(args[0])],
                );
                self.call_shim(shim);
                self.ra.define_call_result(id);
            }
            ExclusiveWriteMemory8 | ExclusiveWriteMemory16 | ExclusiveWriteMemory32
            | ExclusiveWriteMemory64 => {
                let shim = match op {
                    ExclusiveWriteMemory8 => self.rt.shims.ex_write8,
                    ExclusiveWriteMemory16 => self.rt.shims.ex_write16,
                    ExclusiveWriteMemory32 => self.rt.shims.ex_write32,
                    _ => self.rt.shims.ex_write64,
                };
                self.ra.host_call(
                    &mut self.asm,
                    &[
                        Some(Value::U64(self.rt.core_ptr)),
                        Some(args[0]),
                        Some(args[1]),
                    ],
                );
                self.call_shim(shim);
                self.ra.define_call_result(id);
            }
            ClearExclusive => {
                self.ra
                    .host_call(&mut self.asm, &[Some(Value::U64(self.rt.core_ptr))]);
                self.call_shim(self.rt.shims.clear_exclusive);
            }

            // ---- Barriers ----
            DataMemoryBarrier | DataSynchronizationBarrier => {
                self.asm.mfence();
            }
            InstructionSynchronizationBarrier => {
                // Straight-line host code needs no action
            }

            // ---- System ----
            CallSupervisor => {
                self.ra.host_call(
                    &mut self.asm,
                    &[Some(Value::U64(self.rt.core_ptr)), Some(args[0])],
                );
                self.call_shim(self.rt.shims.call_svc);
            }
            ExceptionRaised => {
                self.ra.host_call(
                    &mut self.asm,
                    &[
                        Some(Value::U64(self.rt.core_ptr)),
                        Some(args[0]),
                        Some(args[1]),
                    ],
                );
                self.call_shim(self.rt.shims.exception_raised);
            }
            PushRSB => {
                let desc = args[0].imm_u64();
                let idx = self.ra.scratch_gpr(&mut self.asm);
                let val = self.ra.scratch_gpr(&mut self.asm);
                self.asm
                    .mov_rm(Size::B64, idx, self.state(self.info.rsb_ptr_off));
                self.asm.mov_ri64(val, desc);
                self.asm.mov_mr(
                    Size::B64,
                    Mem::base_index(R15, idx, 3, self.info.rsb_descs_off),
                    val,
                );
                // Code pointer: patched to the target entry once compiled;
                // starts as the deferred-exit stub
                let imm_off = self.asm.offset() + 2;
                self.asm.mov_ri64(val, 0);
                self.rsb_stubs.push((imm_off, LocationDescriptor(desc)));
                self.asm.mov_mr(
                    Size::B64,
                    Mem::base_index(R15, idx, 3, self.info.rsb_ptrs_off),
                    val,
                );
                self.asm.alu_ri(Alu::Add, Size::B64, idx, 1);
                self.asm
                    .alu_ri(Alu::And, Size::B64, idx, RSB_PTR_MASK as i32);
                self.asm
                    .mov_mr(Size::B64, self.state(self.info.rsb_ptr_off), idx);
            }
            CoprocCallbackWord | CoprocCallbackDouble => {
                let shim = if op == CoprocCallbackWord {
                    self.rt.shims.coproc_word
                } else {
                    self.rt.shims.coproc_double
                };
                self.ra.host_call(
                    &mut self.asm,
                    &[
                        Some(Value::U64(self.rt.core_ptr)),
                        Some(args[0]),
                        Some(args[1]),
                        Some(args[2]),
                    ],
                );
                self.call_shim(shim);
                self.ra.define_call_result(id);
            }
            ReadHostWord => {
                let ptr = args[0].imm_u64();
                let r = self.ra.scratch_gpr(&mut self.asm);
                self.asm.mov_ri64(r, ptr);
                self.asm.mov_rm(Size::B32, r, Mem::base(r));
                self.ra.define_gpr(id, r);
            }
            WriteHostWord => {
                let ptr = args[0].imm_u64();
                let v = self.ra.use_gpr(&mut self.asm, args[1]);
                let p = self.ra.scratch_gpr(&mut self.asm);
                self.asm.mov_ri64(p, ptr);
                self.asm.mov_mr(Size::B32, Mem::base(p), v);
            }

            // ---- AES (software trampoline through a stack shadow) ----
            AESEncryptSingleRound | AESDecryptSingleRound | AESMixColumns
            | AESInverseMixColumns => {
                let shim = match op {
                    AESEncryptSingleRound => self.rt.shims.aes_encrypt,
                    AESDecryptSingleRound => self.rt.shims.aes_decrypt,
                    AESMixColumns => self.rt.shims.aes_mix,
                    _ => self.rt.shims.aes_inverse_mix,
                };
                self.asm.alu_ri(Alu::Sub, Size::B64, RSP, 32);
                let f = self.ra.use_fpr(&mut self.asm, args[0]);
                self.asm.movdqu_mr(Mem::base(RSP), f);
                self.ra.end_of_alloc_scope();
                self.ra.set_current(id.0);
                self.ra.host_call(&mut self.asm, &[]);
                // out = [rsp+16], in = [rsp]
                self.asm.lea(super::asm::RDI, Mem::base_disp(RSP, 16));
                self.asm.lea(RSI, Mem::base(RSP));
                self.call_shim(shim);
                let out = self.ra.scratch_fpr(&mut self.asm);
                self.asm.movdqu_rm(out, Mem::base_disp(RSP, 16));
                self.asm.alu_ri(Alu::Add, Size::B64, RSP, 32);
                self.ra.define_fpr(id, out);
            }
        }
    }

    // ---- Grouped lowerings ----

    fn emit_add_sub(&mut self, id: InstId, size: Size, args: &[Value], sub: bool) {
        // Reads first, clobberable destination last, and all register
        // traffic before anything touches the host flags
        let carry_reg = match args[2] {
            Value::U1(_) => None,
            c => Some(self.ra.use_gpr(&mut self.asm, c)),
        };
        let (r, b_reg) = self.acquire_binary(size, args[0], args[1]);

        // Establish host CF, then a single ADC/SBB computes the result with
        // architectural flag outputs
        let (alu_plain, alu_carry) = if sub {
            (Alu::Sub, Alu::Sbb)
        } else {
            (Alu::Add, Alu::Adc)
        };
        let alu = match (sub, args[2], carry_reg) {
            // add with no carry-in / sub with no borrow
            (false, Value::U1(false), _) => alu_plain,
            (true, Value::U1(true), _) => alu_plain,
            // constant carries
            (false, Value::U1(true), _) => {
                self.asm.stc();
                alu_carry
            }
            (true, Value::U1(false), _) => {
                self.asm.stc();
                alu_carry
            }
            // dynamic carry: CF = carry bit; subtraction borrows on !C
            (_, _, Some(c)) => {
                self.asm.bt_ri(Size::B32, c, 0);
                if sub {
                    self.asm.cmc();
                }
                alu_carry
            }
            _ => unreachable!(),
        };

        match b_reg {
            Some(b) => self.asm.alu_rr(alu, size, r, b),
            None => self.asm.alu_ri(alu, size, r, args[1].imm_u64() as i32),
        }

        // ARM carry for subtraction is "no borrow"
        let carry_cc = if sub { Cc::Ae } else { Cc::B };
        self.fuse_flag_outputs(id, Some(carry_cc), Some(Cc::O));
        self.ra.define_gpr(id, r);
    }

    fn emit_shift32(&mut self, id: InstId, op: Opcode, args: &[Value]) {
        let needs_carry = self.block.inst(id).carry_out.is_some();
        match args[1] {
            Value::U8(amount) => self.emit_shift32_imm(id, op, args, amount as u32),
            _ => {
                // Dynamic amount: the ARM semantics for counts >= 32 and the
                // carry channel do not map onto the host shifter; call the
                // reference helper
                let shim = match op {
                    Opcode::LogicalShiftLeft32 => self.rt.shims.lsl32_c,
                    Opcode::LogicalShiftRight32 => self.rt.shims.lsr32_c,
                    Opcode::ArithmeticShiftRight32 => self.rt.shims.asr32_c,
                    _ => self.rt.shims.ror32_c,
                };
                self.ra
                    .host_call(&mut self.asm, &[Some(args[0]), Some(args[1]), Some(args[2])]);
                self.call_shim(shim);
                // Claim RAX for the result before any scratch allocation can
                // take it
                self.ra.define_call_result(id);
                let r = self.ra.use_gpr(&mut self.asm, Value::Inst(id));
                // Result in the low word, carry in bit 32
                if needs_carry {
                    let pseudo = self.block.inst(id).carry_out.unwrap();
                    let q = self.ra.scratch_gpr(&mut self.asm);
                    self.asm.mov_rr(Size::B64, q, r);
                    self.asm.shr_ri(Size::B64, q, 32);
                    self.asm.alu_ri(Alu::And, Size::B32, q, 1);
                    self.ra.define_gpr(pseudo, q);
                }
                // Truncate to the declared 32-bit value
                self.asm.mov_rr(Size::B32, r, r);
            }
        }
    }

    fn emit_shift32_imm(&mut self, id: InstId, op: Opcode, args: &[Value], amount: u32) {
        use Opcode::*;
        let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
        let carry_link = self.block.inst(id).carry_out;

        if amount == 0 {
            // Identity; carry-out is the carry-in
            if let Some(pseudo) = carry_link {
                let q = self.ra.use_scratch_gpr(&mut self.asm, args[2]);
                self.ra.define_gpr(pseudo, q);
            }
            self.ra.define_gpr(id, r);
            return;
        }

        match op {
            LogicalShiftLeft32 => {
                if amount < 32 {
                    self.asm.shl_ri(Size::B32, r, amount as u8);
                    self.fuse_flag_outputs(id, Some(Cc::B), None);
                } else {
                    if let Some(pseudo) = carry_link {
                        let q = self.ra.scratch_gpr(&mut self.asm);
                        if amount == 32 {
                            self.asm.mov_rr(Size::B32, q, r);
                            self.asm.alu_ri(Alu::And, Size::B32, q, 1);
                        } else {
                            self.asm.mov_ri32(q, 0);
                        }
                        self.ra.define_gpr(pseudo, q);
                    }
                    self.asm.mov_ri32(r, 0);
                }
            }
            LogicalShiftRight32 => {
                if amount < 32 {
                    self.asm.shr_ri(Size::B32, r, amount as u8);
                    self.fuse_flag_outputs(id, Some(Cc::B), None);
                } else {
                    if let Some(pseudo) = carry_link {
                        let q = self.ra.scratch_gpr(&mut self.asm);
                        if amount == 32 {
                            self.asm.mov_rr(Size::B32, q, r);
                            self.asm.shr_ri(Size::B32, q, 31);
                        } else {
                            self.asm.mov_ri32(q, 0);
                        }
                        self.ra.define_gpr(pseudo, q);
                    }
                    self.asm.mov_ri32(r, 0);
                }
            }
            ArithmeticShiftRight32 => {
                let amt = amount.min(31) as u8;
                if amount < 32 {
                    self.asm.sar_ri(Size::B32, r, amt);
                    self.fuse_flag_outputs(id, Some(Cc::B), None);
                } else {
                    self.asm.sar_ri(Size::B32, r, 31);
                    if let Some(pseudo) = carry_link {
                        let q = self.ra.scratch_gpr(&mut self.asm);
                        self.asm.mov_rr(Size::B32, q, r);
                        self.asm.alu_ri(Alu::And, Size::B32, q, 1);
                        self.ra.define_gpr(pseudo, q);
                    }
                }
            }
            RotateRight32 => {
                let rot = amount % 32;
                if rot != 0 {
                    self.asm.ror_ri(Size::B32, r, rot as u8);
                }
                if let Some(pseudo) = carry_link {
                    let q = self.ra.scratch_gpr(&mut self.asm);
                    self.asm.mov_rr(Size::B32, q, r);
                    self.asm.shr_ri(Size::B32, q, 31);
                    self.ra.define_gpr(pseudo, q);
                }
            }
            _ => unreachable!(),
        }
        self.ra.define_gpr(id, r);
    }

    fn emit_shift64(&mut self, id: InstId, op: Opcode, args: &[Value]) {
        match args[1] {
            Value::U8(amount) => {
                let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
                if amount > 0 {
                    match op {
                        Opcode::LogicalShiftLeft64 => self.asm.shl_ri(Size::B64, r, amount),
                        Opcode::LogicalShiftRight64 => self.asm.shr_ri(Size::B64, r, amount),
                        _ => self.asm.sar_ri(Size::B64, r, amount),
                    }
                }
                self.ra.define_gpr(id, r);
            }
            _ => {
                // kind: 0 = lsl, 1 = lsr, 2 = asr
                let kind = match op {
                    Opcode::LogicalShiftLeft64 => 0u64,
                    Opcode::LogicalShiftRight64 => 1,
                    _ => 2,
                };
                self.ra.host_call(
                    &mut self.asm,
                    &[Some(args[0]), Some(args[1]), Some(Value::U64(kind))],
                );
                self.call_shim(self.rt.shims.shift64);
                self.ra.define_call_result(id);
            }
        }
    }

    fn emit_signed_sat32_64(&mut self, id: InstId, size: Size, args: &[Value], sub: bool) {
        let b = self.ra.use_gpr(&mut self.asm, args[1]);
        let r = self.ra.use_scratch_gpr(&mut self.asm, args[0]);
        let clamp = self.ra.scratch_gpr(&mut self.asm);
        // clamp = a < 0 ? MIN : MAX
        self.asm.mov_rr(size, clamp, r);
        if size == Size::B64 {
            self.asm.sar_ri(Size::B64, clamp, 63);
            let big = self.ra.scratch_gpr(&mut self.asm);
            self.asm.mov_ri64(big, i64::MAX as u64);
            self.asm.alu_rr(Alu::Xor, Size::B64, clamp, big);
        } else {
            self.asm.sar_ri(Size::B32, clamp, 31);
            self.asm.alu_ri(Alu::Xor, Size::B32, clamp, 0x7fff_ffff);
        }
        let alu = if sub { Alu::Sub } else { Alu::Add };
        self.asm.alu_rr(alu, size, r, b);
        self.fuse_flag_outputs(id, None, Some(Cc::O));
        self.asm.cmovcc(Cc::O, size, r, clamp);
        self.ra.define_gpr(id, r);
    }

    fn emit_signed_sat_narrow(&mut self, id: InstId, bits: u32, args: &[Value], sub: bool) {
        let a = self.ra.use_gpr(&mut self.asm, args[0]);
        let b = self.ra.use_gpr(&mut self.asm, args[1]);
        let r = self.ra.scratch_gpr(&mut self.asm);
        let t = self.ra.scratch_gpr(&mut self.asm);
        if bits == 8 {
            self.asm.movsx8(r, a);
            self.asm.movsx8(t, b);
        } else {
            self.asm.movsx16(r, a);
            self.asm.movsx16(t, b);
        }
        let alu = if sub { Alu::Sub } else { Alu::Add };
        self.asm.alu_rr(alu, Size::B32, r, t);
        let (max, min) = if bits == 8 {
            (127, -128)
        } else {
            (0x7fff, -0x8000)
        };
        self.clamp_signed(id, r, t, max, min);
        let mask = if bits == 8 { 0xff } else { 0xffff };
        self.asm.alu_ri(Alu::And, Size::B32, r, mask);
        self.ra.define_gpr(id, r);
    }

    fn emit_unsigned_sat_add_narrow(&mut self, id: InstId, bits: u32, args: &[Value]) {
        // Inputs are zero-extended; compute in the 32-bit domain
        let (r, rhs) = self.acquire_binary(Size::B32, args[0], args[1]);
        let clamp = self.ra.scratch_gpr(&mut self.asm);
        let max = if bits == 8 { 0xffu32 } else { 0xffff };
        self.asm.mov_ri32(clamp, max);
        self.alu_acquired(Alu::Add, Size::B32, r, rhs, args[1]);
        self.asm.alu_ri(Alu::Cmp, Size::B32, r, max as i32);
        self.fuse_flag_outputs(id, None, Some(Cc::A));
        self.asm.cmovcc(Cc::A, Size::B32, r, clamp);
        self.ra.define_gpr(id, r);
    }

    /// Clamp `r` (signed 32-bit domain) to [min, max] using `t` as the
    /// bound register, setting the overflow consumer if clamping occurred.
    fn clamp_signed(&mut self, id: InstId, r: Gpr, t: Gpr, max: i32, min: i32) {
        let orig = self.ra.scratch_gpr(&mut self.asm);
        self.asm.mov_rr(Size::B32, orig, r);
        self.asm.mov_ri32(t, max as u32);
        self.asm.alu_ri(Alu::Cmp, Size::B32, r, max);
        self.asm.cmovcc(Cc::G, Size::B32, r, t);
        self.asm.mov_ri32(t, min as u32);
        self.asm.alu_ri(Alu::Cmp, Size::B32, r, min);
        self.asm.cmovcc(Cc::L, Size::B32, r, t);
        self.fuse_q_from_difference(id, r, orig, Size::B32);
    }

    fn clamp_signed64(&mut self, id: InstId, r: Gpr, t: Gpr, max: i64, min: i64) {
        let orig = self.ra.scratch_gpr(&mut self.asm);
        self.asm.mov_rr(Size::B64, orig, r);
        self.asm.mov_ri64(t, max as u64);
        self.asm.alu_rr(Alu::Cmp, Size::B64, r, t);
        // r > max (signed)
        let skip_hi = self.asm.new_label();
        self.asm.jcc_label(Cc::Le, skip_hi);
        self.asm.mov_rr(Size::B64, r, t);
        self.asm.bind(skip_hi);
        self.asm.mov_ri64(t, min as u64);
        self.asm.alu_rr(Alu::Cmp, Size::B64, r, t);
        let skip_lo = self.asm.new_label();
        self.asm.jcc_label(Cc::Ge, skip_lo);
        self.asm.mov_rr(Size::B64, r, t);
        self.asm.bind(skip_lo);
        self.fuse_q_from_difference(id, r, orig, Size::B64);
    }

    // ---- Memory lowerings ----

    fn fastmem_enabled_for(&self, id: InstId) -> Option<u64> {
        let base = self.rt.fastmem_base?;
        if self
            .do_not_fastmem
            .contains(&(self.block.location, id.0))
        {
            return None;
        }
        Some(base)
    }

    fn emit_read_memory(&mut self, id: InstId, bits: u32, args: &[Value]) {
        let shim = match bits {
            8 => self.rt.shims.read8,
            16 => self.rt.shims.read16,
            32 => self.rt.shims.read32,
            _ => self.rt.shims.read64,
        };
        match self.fastmem_enabled_for(id) {
            Some(base) => {
                self.ra.host_call(
                    &mut self.asm,
                    &[Some(Value::U64(self.rt.core_ptr)), Some(args[0])],
                );
                let region = self.asm.offset();
                // Fast form: direct load through base + vaddr
                self.asm.mov_ri64(RAX, base);
                let mem = Mem::base_index(RAX, RSI, 0, 0);
                match bits {
                    8 => self.asm.movzx8_m(RAX, mem),
                    16 => self.asm.movzx16_m(RAX, mem),
                    32 => self.asm.mov_rm(Size::B32, RAX, mem),
                    _ => self.asm.mov_rm(Size::B64, RAX, mem),
                }
                self.finish_fastmem_region(id, region, shim);
                self.ra.define_call_result(id);
            }
            None => {
                self.ra.host_call(
                    &mut self.asm,
                    &[Some(Value::U64(self.rt.core_ptr)), Some(args[0])],
                );
                self.call_shim(shim);
                self.ra.define_call_result(id);
            }
        }
    }

    fn emit_write_memory(&mut self, id: InstId, bits: u32, args: &[Value]) {
        let shim = match bits {
            8 => self.rt.shims.write8,
            16 => self.rt.shims.write16,
            32 => self.rt.shims.write32,
            _ => self.rt.shims.write64,
        };
        match self.fastmem_enabled_for(id) {
            Some(base) => {
                self.ra.host_call(
                    &mut self.asm,
                    &[
                        Some(Value::U64(self.rt.core_ptr)),
                        Some(args[0]),
                        Some(args[1]),
                    ],
                );
                let region = self.asm.offset();
                self.asm.mov_ri64(RAX, base);
                let mem = Mem::base_index(RAX, RSI, 0, 0);
                match bits {
                    8 => self.asm.mov_mr(Size::B8, mem, RDX),
                    16 => self.asm.mov_mr(Size::B16, mem, RDX),
                    32 => self.asm.mov_mr(Size::B32, mem, RDX),
                    _ => self.asm.mov_mr(Size::B64, mem, RDX),
                }
                self.finish_fastmem_region(id, region, shim);
            }
            None => {
                self.ra.host_call(
                    &mut self.asm,
                    &[
                        Some(Value::U64(self.rt.core_ptr)),
                        Some(args[0]),
                        Some(args[1]),
                    ],
                );
                self.call_shim(shim);
            }
        }
    }

    /// Pad the fastmem fast path to its fixed region size and record the
    /// demoted (callback) byte image the fault handler swaps in.
    fn finish_fastmem_region(&mut self, id: InstId, region: usize, shim: u64) {
        // Jump over the padding to the region end
        let used = self.asm.offset() - region;
        let remaining = FASTMEM_REGION - used - 5;
        self.asm.jmp_addr(self.asm.current_address() + 5 + remaining as u64);
        for _ in 0..remaining {
            self.asm.int3();
        }
        debug_assert_eq!(self.asm.offset() - region, FASTMEM_REGION);

        // Demoted form: call the shim, then jump to the region end
        let mut slow = Vec::with_capacity(FASTMEM_REGION);
        slow.push(0x48);
        slow.push(0xb8);
        slow.extend_from_slice(&shim.to_le_bytes()); // mov rax, shim
        slow.extend_from_slice(&[0xff, 0xd0]); // call rax
        let jmp_rel = (FASTMEM_REGION - slow.len() - 5) as i32;
        slow.push(0xe9);
        slow.extend_from_slice(&jmp_rel.to_le_bytes());
        while slow.len() < FASTMEM_REGION {
            slow.push(0xcc);
        }
        self.fastmem.push(FastmemSite {
            offset: region,
            inst: id.0,
            slow_bytes: slow,
        });
    }

    // ---- Terminals ----

    fn emit_terminal(&mut self, term: &Terminal) {
        match term {
            Terminal::Invalid => unreachable!("invalid terminal survived to emission"),
            Terminal::ReturnToDispatch => {
                self.asm.jmp_addr(self.rt.epilogue);
            }
            Terminal::LinkBlock { next } => {
                if self.rt.single_step {
                    self.store_location(*next);
                    self.asm.jmp_addr(self.rt.epilogue);
                    return;
                }
                self.asm.alu_mi(
                    Alu::Cmp,
                    Size::B64,
                    self.state(self.info.cycles_off),
                    0,
                );
                // Patchable: jg -> target entry once it exists
                let region = self.asm.offset();
                for _ in 0..PatchKind::Jg.len() {
                    self.asm.nop();
                }
                self.patches.push(PatchRecord {
                    offset: region,
                    kind: PatchKind::Jg,
                    target: *next,
                    unpatched: vec![0x90; PatchKind::Jg.len()],
                });
                self.store_location(*next);
                self.asm.jmp_addr(self.rt.epilogue);
            }
            Terminal::LinkBlockFast { next } => {
                if self.rt.single_step {
                    self.store_location(*next);
                    self.asm.jmp_addr(self.rt.epilogue);
                    return;
                }
                // Patchable: jmp -> target entry; initially falls through
                let region = self.asm.offset();
                self.asm.jmp_addr(self.asm.current_address() + 5);
                self.patches.push(PatchRecord {
                    offset: region,
                    kind: PatchKind::Jmp,
                    target: *next,
                    unpatched: vec![0xe9, 0, 0, 0, 0],
                });
                self.store_location(*next);
                self.asm.jmp_addr(self.rt.epilogue);
            }
            Terminal::PopRSBHint => {
                if self.rt.single_step {
                    self.asm.jmp_addr(self.rt.epilogue);
                    return;
                }
                // Predicted jumps must not outrun the cycle budget
                self.asm
                    .alu_mi(Alu::Cmp, Size::B64, self.state(self.info.cycles_off), 0);
                self.asm.jcc_addr(Cc::Le, self.rt.epilogue);
                self.reconstruct_descriptor();
                // Pop: ptr = (ptr - 1) & mask
                self.asm
                    .mov_rm(Size::B64, RCX, self.state(self.info.rsb_ptr_off));
                self.asm.alu_ri(Alu::Sub, Size::B64, RCX, 1);
                self.asm
                    .alu_ri(Alu::And, Size::B64, RCX, RSB_PTR_MASK as i32);
                self.asm
                    .mov_mr(Size::B64, self.state(self.info.rsb_ptr_off), RCX);
                self.asm.mov_rm(
                    Size::B64,
                    RAX,
                    Mem::base_index(R15, RCX, 3, self.info.rsb_descs_off),
                );
                self.asm.alu_rr(Alu::Cmp, Size::B64, RAX, RDX);
                let miss = self.asm.new_label();
                self.asm.jcc_label(Cc::Ne, miss);
                self.asm.jmp_m(Mem::base_index(R15, RCX, 3, self.info.rsb_ptrs_off));
                self.asm.bind(miss);
                // Invalidate the mispredicted entry, then fall to the slow
                // path
                self.asm.mov_mi(
                    Size::B64,
                    Mem::base_index(R15, RCX, 3, self.info.rsb_descs_off),
                    u32::MAX,
                );
                self.emit_fast_dispatch_tail();
            }
            Terminal::FastDispatchHint => {
                if self.rt.single_step {
                    self.asm.jmp_addr(self.rt.epilogue);
                    return;
                }
                self.asm
                    .alu_mi(Alu::Cmp, Size::B64, self.state(self.info.cycles_off), 0);
                self.asm.jcc_addr(Cc::Le, self.rt.epilogue);
                self.reconstruct_descriptor();
                self.emit_fast_dispatch_tail();
            }
            Terminal::If { cond, then_, else_ } => match cond {
                Cond::Al => self.emit_terminal(then_),
                Cond::Nv => self.emit_terminal(else_),
                _ => {
                    let cc = self.emit_cond(*cond);
                    let taken = self.asm.new_label();
                    self.asm.jcc_label(cc, taken);
                    self.emit_terminal(else_);
                    self.asm.bind(taken);
                    self.emit_terminal(then_);
                }
            },
            Terminal::CheckBit { then_, else_ } => {
                self.asm
                    .alu_mi8(Alu::Cmp, self.state(self.info.check_bit_off), 0);
                let clear = self.asm.new_label();
                self.asm.jcc_label(Cc::E, clear);
                self.emit_terminal(then_);
                self.asm.bind(clear);
                self.emit_terminal(else_);
            }
            Terminal::CheckHalt { else_ } => {
                self.asm
                    .alu_mi8(Alu::Cmp, self.state(self.info.halt_off), 0);
                self.asm.jcc_addr(Cc::Ne, self.rt.epilogue);
                self.emit_terminal(else_);
            }
            Terminal::Interpret {
                next,
                num_instructions,
            } => {
                self.store_location(*next);
                let pc = match self.info.arch {
                    Arch::A32 => crate::loc::a32::A32Location::from_descriptor(*next).pc as u64,
                    Arch::A64 => crate::loc::a64::A64Location::from_descriptor(*next).pc,
                };
                self.asm.mov_ri64(super::asm::RDI, self.rt.core_ptr);
                self.asm.mov_ri64(RSI, pc);
                self.asm.mov_ri64(RDX, *num_instructions as u64);
                self.call_shim(self.rt.shims.interpret);
                self.asm.jmp_addr(self.rt.epilogue);
            }
        }
    }

    /// The descriptor is in RDX. Probe the fast-dispatch table; on miss,
    /// consult the block lookup shim and tail-jump, or return to the
    /// dispatcher when the block is not compiled.
    fn emit_fast_dispatch_tail(&mut self) {
        if self.rt.fast_dispatch_table == 0 {
            self.asm.jmp_addr(self.rt.epilogue);
            return;
        }
        // index = crc32c(0, desc) & mask, scaled by entry size (16 bytes)
        self.asm.alu_rr(Alu::Xor, Size::B32, RAX, RAX);
        self.asm.crc32_rr64(RAX, RDX);
        self.asm
            .alu_ri(Alu::And, Size::B32, RAX, self.rt.fast_dispatch_mask as i32);
        self.asm.shl_ri(Size::B64, RAX, 4);
        self.asm.mov_ri64(RCX, self.rt.fast_dispatch_table);
        self.asm
            .alu_rm(Alu::Cmp, Size::B64, RDX, Mem::base_index(RCX, RAX, 0, 0));
        let miss = self.asm.new_label();
        self.asm.jcc_label(Cc::Ne, miss);
        self.asm.jmp_m(Mem::base_index(RCX, RAX, 0, 8));
        self.asm.bind(miss);
        // Slow path: lookup updates the table and returns the entry, or
        // null for a cold block
        self.asm.mov_ri64(super::asm::RDI, self.rt.core_ptr);
        self.asm.mov_rr(Size::B64, RSI, RDX);
        self.call_shim(self.rt.shims.lookup_code);
        self.asm.test_rr(Size::B64, RAX, RAX);
        let cold = self.asm.new_label();
        self.asm.jcc_label(Cc::E, cold);
        self.asm.jmp_r(RAX);
        self.asm.bind(cold);
        self.asm.jmp_addr(self.rt.epilogue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, Terminal};

    fn handles() -> RuntimeHandles {
        RuntimeHandles {
            core_ptr: 0x7000_0000,
            epilogue: 0x6000_0000,
            shims: ShimTable {
                read32: 0x6100_0000,
                write32: 0x6100_0100,
                ..Default::default()
            },
            fast_dispatch_table: 0x6200_0000,
            fast_dispatch_mask: 1023,
            fastmem_base: None,
            single_step: false,
        }
    }

    fn compile(block: &Block) -> CompiledBlock {
        let none = FxHashSet::default();
        emit_block(block, StateInfo::a32(), &handles(), 0x5000_0000, &none)
    }

    #[test]
    fn test_emit_simple_block() {
        let mut b = IrBuilder::new(LocationDescriptor(0x1000));
        let r0 = b.get_register(0);
        let sum = b.add32(r0, Value::U32(2), Value::U1(false));
        b.set_register(0, sum);
        let block = b.finish(Terminal::ReturnToDispatch);
        let compiled = compile(&block);
        assert!(!compiled.code.is_empty());
        assert!(compiled.patches.is_empty());
    }

    #[test]
    fn test_link_block_records_patch() {
        let b = IrBuilder::new(LocationDescriptor(0x1000));
        let block = b.finish(Terminal::LinkBlock {
            next: LocationDescriptor(0x2000),
        });
        let compiled = compile(&block);
        assert_eq!(compiled.patches.len(), 1);
        let p = &compiled.patches[0];
        assert_eq!(p.kind, PatchKind::Jg);
        assert_eq!(p.target, LocationDescriptor(0x2000));
        // Region currently holds the unpatched image
        assert_eq!(&compiled.code[p.offset..p.offset + 6], &p.unpatched[..]);
    }

    #[test]
    fn test_link_block_fast_unpatched_falls_through() {
        let b = IrBuilder::new(LocationDescriptor(0x1000));
        let block = b.finish(Terminal::LinkBlockFast {
            next: LocationDescriptor(0x2000),
        });
        let compiled = compile(&block);
        let p = &compiled.patches[0];
        assert_eq!(p.kind, PatchKind::Jmp);
        // jmp rel32 with displacement 0
        assert_eq!(&compiled.code[p.offset..p.offset + 5], &[0xe9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_push_rsb_emits_stub_patch() {
        let mut b = IrBuilder::new(LocationDescriptor(0x1000));
        b.push_rsb(LocationDescriptor(0x1004));
        b.set_register(14, Value::U32(0x1004));
        let block = b.finish(Terminal::LinkBlock {
            next: LocationDescriptor(0x3000),
        });
        let compiled = compile(&block);
        let imm = compiled
            .patches
            .iter()
            .find(|p| p.kind == PatchKind::Imm64)
            .expect("rsb push must record an imm64 patch");
        // The imm64 must point inside this block's code (the exit stub)
        let ptr = u64::from_le_bytes(compiled.code[imm.offset..imm.offset + 8].try_into().unwrap());
        assert!(ptr >= compiled.base && ptr < compiled.base + compiled.code.len() as u64);
        assert_eq!(imm.target, LocationDescriptor(0x1004));
    }

    #[test]
    fn test_fastmem_region_size_and_slow_bytes() {
        let mut rt = handles();
        rt.fastmem_base = Some(0x1_0000_0000);
        let mut b = IrBuilder::new(LocationDescriptor(0x1000));
        let addr = b.zext32_64(Value::U32(0x80));
        let v = b.read_memory(32, addr);
        b.set_register(0, v);
        let block = b.finish(Terminal::ReturnToDispatch);
        let none = FxHashSet::default();
        let compiled = emit_block(&block, StateInfo::a32(), &rt, 0x5000_0000, &none);
        assert_eq!(compiled.fastmem.len(), 1);
        let site = &compiled.fastmem[0];
        assert_eq!(site.slow_bytes.len(), FASTMEM_REGION);
        // The demoted image starts with mov rax, shim
        assert_eq!(&site.slow_bytes[..2], &[0x48, 0xb8]);
    }

    #[test]
    fn test_demoted_site_compiles_to_callback() {
        let mut rt = handles();
        rt.fastmem_base = Some(0x1_0000_0000);
        let mut b = IrBuilder::new(LocationDescriptor(0x1000));
        let addr = b.zext32_64(Value::U32(0x80));
        let v = b.read_memory(32, addr);
        b.set_register(0, v);
        let block = b.finish(Terminal::ReturnToDispatch);
        let mut denied = FxHashSet::default();
        // Find the read's inst id by scanning
        let read_id = block
            .inst_ids()
            .find(|&id| block.inst(id).op == Opcode::ReadMemory32)
            .unwrap();
        denied.insert((LocationDescriptor(0x1000), read_id.0));
        let compiled = emit_block(&block, StateInfo::a32(), &rt, 0x5000_0000, &denied);
        assert!(compiled.fastmem.is_empty(), "demoted site must not use fastmem");
    }

    #[test]
    fn test_single_step_has_no_patches() {
        let mut rt = handles();
        rt.single_step = true;
        let b = IrBuilder::new(LocationDescriptor(0x1000));
        let block = b.finish(Terminal::LinkBlock {
            next: LocationDescriptor(0x2000),
        });
        let none = FxHashSet::default();
        let compiled = emit_block(&block, StateInfo::a32(), &rt, 0x5000_0000, &none);
        assert!(compiled.patches.is_empty());
    }
}
