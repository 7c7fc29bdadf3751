//! A32 lifter
//!
//! Translates a run of A32 instructions at a guest location into one IR
//! block. Instructions are batched while they share a condition code; a
//! conditional run also stops after its first flag-writing instruction,
//! since that may change the outcome for the rest of the run. PC reads see
//! the architectural PC (instruction address + 8); PC writes become
//! terminals.

use std::sync::Arc;

use armature_isa::a32::{A32Instr, DpOp, HalfKind, ShiftType, A32_TABLE};
use armature_isa::bits::{arm_expand_imm, sign_extend};
use armature_isa::{Cond, Reg};

use crate::env::{CoprocAction, Coprocessor, CoprocCallback, Environment, ExceptionKind};
use crate::ir::{Block, IrBuilder, Terminal, Value};
use crate::loc::a32::A32Location;

/// Shared translation-time context handed to the lifters.
pub struct LiftContext<'a> {
    pub env: &'a mut dyn Environment,
    pub coprocessors: &'a [Option<Arc<dyn Coprocessor + Send + Sync>>; 16],
    /// Callback slots referenced by CoprocCallback* instructions.
    pub coproc_slots: &'a mut Vec<CoprocCallback>,
    pub max_instructions: usize,
}

/// Outcome of lifting one instruction.
enum Step {
    Continue,
    Term(Terminal),
}

struct Lifter<'a, 'c> {
    b: IrBuilder,
    loc: A32Location,
    ctx: &'a mut LiftContext<'c>,
    /// Set when the lifted instruction wrote the N/Z/C/V flags.
    wrote_flags: bool,
}

/// Lift a block starting at `start`.
pub fn lift(ctx: &mut LiftContext<'_>, start: A32Location) -> Block {
    if start.thumb {
        return super::thumb::lift(ctx, start);
    }

    let max = if start.single_step {
        1
    } else {
        ctx.max_instructions
    };

    let mut lifter = Lifter {
        b: IrBuilder::new(start.descriptor()),
        loc: start,
        ctx,
        wrote_flags: false,
    };
    let mut block_cond = Cond::Al;
    let mut cycle_count = 0u64;
    let mut terminal = None;

    for i in 0..max {
        let word = lifter.ctx.env.read_code32(lifter.loc.pc as u64);
        let cond_bits = word >> 28;
        let instr = A32_TABLE.decode(word);
        let cond = instr_cond(&instr).unwrap_or(Cond::Al);

        if i == 0 {
            block_cond = cond;
        } else if cond != block_cond {
            break;
        }

        lifter.wrote_flags = false;
        let step = if cond == Cond::Nv && cond_bits == 0xf {
            // Unconditional space we do not translate
            lifter.exception(ExceptionKind::UndefinedInstruction)
        } else {
            lifter.lift_instruction(instr)
        };
        cycle_count += 1;
        lifter.loc = lifter.loc.advance(4);

        match step {
            Step::Term(t) => {
                terminal = Some(t);
                break;
            }
            Step::Continue => {
                // A conditional run ends at its first flag writer
                if block_cond != Cond::Al && lifter.wrote_flags {
                    break;
                }
            }
        }
    }

    let end = lifter.loc;
    let terminal = terminal.unwrap_or(Terminal::LinkBlock {
        next: end.descriptor(),
    });

    let mut block = lifter.b.finish(terminal);
    block.cond = block_cond;
    if block_cond != Cond::Al {
        block.cond_failed = Some(end.descriptor());
    }
    block.end_location = end.descriptor();
    block.cycle_count = cycle_count;
    block.pc_range = (start.pc as u64, end.pc as u64);
    block
}

fn instr_cond(instr: &A32Instr) -> Option<Cond> {
    use A32Instr::*;
    match instr {
        DataProcImm { cond, .. }
        | DataProcReg { cond, .. }
        | DataProcRsr { cond, .. }
        | Movw { cond, .. }
        | Movt { cond, .. }
        | Clz { cond, .. }
        | Mul { cond, .. }
        | Mla { cond, .. }
        | Umull { cond, .. }
        | Smull { cond, .. }
        | Qadd { cond, .. }
        | Qsub { cond, .. }
        | Qdadd { cond, .. }
        | Qdsub { cond, .. }
        | Ssat { cond, .. }
        | Usat { cond, .. }
        | B { cond, .. }
        | Bl { cond, .. }
        | Bx { cond, .. }
        | BlxReg { cond, .. }
        | SingleTransferImm { cond, .. }
        | HalfTransferImm { cond, .. }
        | Ldrex { cond, .. }
        | Strex { cond, .. }
        | Svc { cond, .. }
        | Bkpt { cond, .. }
        | Mcr { cond, .. }
        | Mrc { cond, .. }
        | Mrs { cond, .. }
        | MsrReg { cond, .. }
        | MsrImm { cond, .. }
        | Hint { cond, .. } => Some(*cond),
        Clrex | Dmb { .. } | Dsb { .. } | Isb { .. } | Udf { .. } => None,
    }
}

impl Lifter<'_, '_> {
    /// Architectural PC as seen by this instruction.
    fn pc(&self) -> u32 {
        self.loc.pc.wrapping_add(8)
    }

    fn next_loc(&self) -> A32Location {
        self.loc.advance(4)
    }

    fn reg_read(&mut self, r: Reg) -> Value {
        if r.is_pc() {
            Value::U32(self.pc())
        } else {
            self.b.get_register(r.0)
        }
    }

    fn addr64(&mut self, addr32: Value) -> Value {
        self.b.zext32_64(addr32)
    }

    /// Branch to a value with interworking: bit 0 selects Thumb.
    fn bx_write_pc(&mut self, target: Value) {
        let t = self.b.test_bit(target, 0);
        self.b.set_t_flag(t);
        let masked = self.b.and32(target, Value::U32(0xffff_fffe));
        self.b.set_register(15, masked);
    }

    fn exception(&mut self, kind: ExceptionKind) -> Step {
        let pc = self.loc.pc;
        self.b.set_register(15, Value::U32(pc));
        self.b.exception_raised(pc as u64, kind);
        Step::Term(Terminal::CheckHalt {
            else_: Box::new(Terminal::ReturnToDispatch),
        })
    }

    fn interpret_one(&mut self) -> Step {
        Step::Term(Terminal::Interpret {
            next: self.loc.descriptor(),
            num_instructions: 1,
        })
    }

    /// Compute a shifted register operand, returning (result, carry-out).
    /// The carry-out is only materialized when `need_carry`.
    fn shifted_reg(
        &mut self,
        m: Reg,
        shift: ShiftType,
        imm5: u32,
        need_carry: bool,
    ) -> (Value, Option<Value>) {
        let x = self.reg_read(m);
        let cin = self.b.get_c_flag();
        let (result, producer) = match (shift, imm5) {
            (ShiftType::Lsl, 0) => return (x, if need_carry { Some(cin) } else { None }),
            (ShiftType::Lsl, n) => {
                let v = self.b.lsl32(x, Value::U8(n as u8), cin);
                (v, v)
            }
            (ShiftType::Lsr, n) => {
                let amount = if n == 0 { 32 } else { n };
                let v = self.b.lsr32(x, Value::U8(amount as u8), cin);
                (v, v)
            }
            (ShiftType::Asr, n) => {
                let amount = if n == 0 { 32 } else { n };
                let v = self.b.asr32(x, Value::U8(amount as u8), cin);
                (v, v)
            }
            (ShiftType::Ror, 0) => {
                let v = self.b.rrx(x, cin);
                (v, v)
            }
            (ShiftType::Ror, n) => {
                let v = self.b.ror32(x, Value::U8(n as u8), cin);
                (v, v)
            }
        };
        let carry = if need_carry {
            Some(self.b.carry_from(producer))
        } else {
            None
        };
        (result, carry)
    }

    /// Register-shifted-register operand (amount from the low byte of Rs).
    fn rsr_operand(
        &mut self,
        m: Reg,
        shift: ShiftType,
        s_reg: Reg,
        need_carry: bool,
    ) -> (Value, Option<Value>) {
        let x = self.reg_read(m);
        let s = self.reg_read(s_reg);
        let amount = self.b.low_byte(s);
        let cin = self.b.get_c_flag();
        let v = match shift {
            ShiftType::Lsl => self.b.lsl32(x, amount, cin),
            ShiftType::Lsr => self.b.lsr32(x, amount, cin),
            ShiftType::Asr => self.b.asr32(x, amount, cin),
            ShiftType::Ror => self.b.ror32(x, amount, cin),
        };
        let carry = if need_carry {
            Some(self.b.carry_from(v))
        } else {
            None
        };
        (v, carry)
    }

    /// Common tail of all data-processing forms.
    fn data_processing(
        &mut self,
        op: DpOp,
        s: bool,
        n: Reg,
        d: Reg,
        op2: Value,
        shifter_carry: Option<Value>,
    ) -> Step {
        let is_logical = matches!(
            op,
            DpOp::And
                | DpOp::Eor
                | DpOp::Tst
                | DpOp::Teq
                | DpOp::Orr
                | DpOp::Mov
                | DpOp::Bic
                | DpOp::Mvn
        );

        // TST/TEQ/CMP/CMN have no destination; MOV/MVN no first operand
        let n_val = if matches!(op, DpOp::Mov | DpOp::Mvn) {
            Value::U32(0)
        } else {
            self.reg_read(n)
        };

        let (result, carry, overflow) = match op {
            DpOp::And | DpOp::Tst => (self.b.and32(n_val, op2), None, None),
            DpOp::Eor | DpOp::Teq => (self.b.eor32(n_val, op2), None, None),
            DpOp::Orr => (self.b.or32(n_val, op2), None, None),
            DpOp::Bic => {
                let inv = self.b.not32(op2);
                (self.b.and32(n_val, inv), None, None)
            }
            DpOp::Mov => (op2, None, None),
            DpOp::Mvn => (self.b.not32(op2), None, None),
            DpOp::Add | DpOp::Cmn => {
                let r = self.b.add32(n_val, op2, Value::U1(false));
                self.flags_from(r, s)
            }
            DpOp::Adc => {
                let c = self.b.get_c_flag();
                let r = self.b.add32(n_val, op2, c);
                self.flags_from(r, s)
            }
            DpOp::Sub | DpOp::Cmp => {
                let r = self.b.sub32(n_val, op2, Value::U1(true));
                self.flags_from(r, s)
            }
            DpOp::Sbc => {
                let c = self.b.get_c_flag();
                let r = self.b.sub32(n_val, op2, c);
                self.flags_from(r, s)
            }
            DpOp::Rsb => {
                let r = self.b.sub32(op2, n_val, Value::U1(true));
                self.flags_from(r, s)
            }
            DpOp::Rsc => {
                let c = self.b.get_c_flag();
                let r = self.b.sub32(op2, n_val, c);
                self.flags_from(r, s)
            }
        };

        if s {
            self.wrote_flags = true;
            self.b.set_nz_from(result);
            if is_logical {
                if let Some(c) = shifter_carry {
                    self.b.set_c_flag(c);
                }
            } else {
                if let Some(c) = carry {
                    self.b.set_c_flag(c);
                }
                if let Some(v) = overflow {
                    self.b.set_v_flag(v);
                }
            }
        }

        if op.is_compare() {
            return Step::Continue;
        }

        if d.is_pc() {
            if s {
                // The SPSR-restoring form; not supported in user-mode
                return self.exception(ExceptionKind::UnpredictableInstruction);
            }
            self.bx_write_pc(result);
            return Step::Term(if matches!(op, DpOp::Mov) {
                Terminal::PopRSBHint
            } else {
                Terminal::FastDispatchHint
            });
        }
        self.b.set_register(d.0, result);
        Step::Continue
    }

    fn flags_from(&mut self, r: Value, s: bool) -> (Value, Option<Value>, Option<Value>) {
        if s {
            let c = self.b.carry_from(r);
            let v = self.b.overflow_from(r);
            (r, Some(c), Some(v))
        } else {
            (r, None, None)
        }
    }

    fn lift_instruction(&mut self, instr: A32Instr) -> Step {
        use A32Instr::*;
        match instr {
            DataProcImm { op, s, n, d, rotate, imm8, .. } => {
                let (imm, carry) = arm_expand_imm(rotate, imm8);
                let need_carry = s;
                let shifter_carry = if need_carry {
                    Some(match carry {
                        Some(c) => Value::U1(c),
                        None => self.b.get_c_flag(),
                    })
                } else {
                    None
                };
                self.data_processing(op, s, n, d, Value::U32(imm), shifter_carry)
            }
            DataProcReg { op, s, n, d, imm5, shift, m, .. } => {
                let (op2, carry) = self.shifted_reg(m, shift, imm5, s);
                self.data_processing(op, s, n, d, op2, carry)
            }
            DataProcRsr { op, s, n, d, s_reg, shift, m, .. } => {
                if n.is_pc() || d.is_pc() || m.is_pc() || s_reg.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let (op2, carry) = self.rsr_operand(m, shift, s_reg, s);
                self.data_processing(op, s, n, d, op2, carry)
            }
            Movw { d, imm16, .. } => {
                self.b.set_register(d.0, Value::U32(imm16));
                Step::Continue
            }
            Movt { d, imm16, .. } => {
                let old = self.reg_read(d);
                let low = self.b.and32(old, Value::U32(0xffff));
                let merged = self.b.or32(low, Value::U32(imm16 << 16));
                self.b.set_register(d.0, merged);
                Step::Continue
            }
            Clz { d, m, .. } => {
                if d.is_pc() || m.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let x = self.reg_read(m);
                let r = self.b.clz32(x);
                self.b.set_register(d.0, r);
                Step::Continue
            }

            Mul { s, d, m, n, .. } => {
                if d.is_pc() || m.is_pc() || n.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let a = self.reg_read(n);
                let b = self.reg_read(m);
                let r = self.b.mul32(a, b);
                self.b.set_register(d.0, r);
                if s {
                    self.wrote_flags = true;
                    self.b.set_nz_from(r);
                }
                Step::Continue
            }
            Mla { s, d, a, m, n, .. } => {
                if d.is_pc() || a.is_pc() || m.is_pc() || n.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let x = self.reg_read(n);
                let y = self.reg_read(m);
                let acc = self.reg_read(a);
                let prod = self.b.mul32(x, y);
                let r = self.b.add32(prod, acc, Value::U1(false));
                self.b.set_register(d.0, r);
                if s {
                    self.wrote_flags = true;
                    self.b.set_nz_from(r);
                }
                Step::Continue
            }
            Umull { s, dhi, dlo, m, n, .. } | Smull { s, dhi, dlo, m, n, .. } => {
                if dhi.is_pc() || dlo.is_pc() || m.is_pc() || n.is_pc() || dhi == dlo {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let x = self.reg_read(n);
                let y = self.reg_read(m);
                let signed = matches!(instr, Smull { .. });
                let wide = if signed {
                    self.b.signed_multiply_long(x, y)
                } else {
                    self.b.unsigned_multiply_long(x, y)
                };
                let lo = self.b.low_word(wide);
                let hi = self.b.high_word(wide);
                self.b.set_register(dlo.0, lo);
                self.b.set_register(dhi.0, hi);
                if s {
                    self.wrote_flags = true;
                    self.b.set_nz_from64(wide);
                }
                Step::Continue
            }

            Qadd { n, d, m, .. } | Qsub { n, d, m, .. } => {
                if d.is_pc() || n.is_pc() || m.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let first = self.reg_read(m);
                let second = self.reg_read(n);
                let r = if matches!(instr, Qadd { .. }) {
                    self.b.signed_saturated_add32(first, second)
                } else {
                    self.b.signed_saturated_sub32(first, second)
                };
                let q = self.b.overflow_from(r);
                self.b.or_q_flag(q);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            Qdadd { n, d, m, .. } | Qdsub { n, d, m, .. } => {
                if d.is_pc() || n.is_pc() || m.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let doubled_src = self.reg_read(n);
                let doubled = self.b.signed_saturated_double32(doubled_src);
                let q1 = self.b.overflow_from(doubled);
                self.b.or_q_flag(q1);
                let first = self.reg_read(m);
                let r = if matches!(instr, Qdadd { .. }) {
                    self.b.signed_saturated_add32(first, doubled)
                } else {
                    self.b.signed_saturated_sub32(first, doubled)
                };
                let q2 = self.b.overflow_from(r);
                self.b.or_q_flag(q2);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            Ssat { sat_to, d, imm5, arith, n, .. } => {
                if d.is_pc() || n.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let (operand, _) = self.shifted_reg(
                    n,
                    if arith { ShiftType::Asr } else { ShiftType::Lsl },
                    imm5,
                    false,
                );
                let r = self.b.signed_saturation(operand, sat_to as u8);
                let q = self.b.overflow_from(r);
                self.b.or_q_flag(q);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            Usat { sat_to, d, imm5, arith, n, .. } => {
                if d.is_pc() || n.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let (operand, _) = self.shifted_reg(
                    n,
                    if arith { ShiftType::Asr } else { ShiftType::Lsl },
                    imm5,
                    false,
                );
                let r = self.b.unsigned_saturation(operand, sat_to as u8);
                let q = self.b.overflow_from(r);
                self.b.or_q_flag(q);
                self.b.set_register(d.0, r);
                Step::Continue
            }

            B { imm24, .. } => {
                let offset = (sign_extend(imm24, 24) << 2) as i64;
                let target = self.pc().wrapping_add(offset as u32);
                Step::Term(Terminal::LinkBlock {
                    next: A32Location { pc: target, ..self.loc }.descriptor(),
                })
            }
            Bl { imm24, .. } => {
                let offset = (sign_extend(imm24, 24) << 2) as i64;
                let target = self.pc().wrapping_add(offset as u32);
                let ret = self.next_loc();
                self.b.set_register(14, Value::U32(ret.pc));
                self.b.push_rsb(ret.descriptor());
                Step::Term(Terminal::LinkBlock {
                    next: A32Location { pc: target, ..self.loc }.descriptor(),
                })
            }
            Bx { m, .. } => {
                let target = self.reg_read(m);
                self.bx_write_pc(target);
                Step::Term(if m == Reg::LR {
                    Terminal::PopRSBHint
                } else {
                    Terminal::FastDispatchHint
                })
            }
            BlxReg { m, .. } => {
                if m.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let target = self.reg_read(m);
                let ret = self.next_loc();
                self.b.set_register(14, Value::U32(ret.pc));
                self.b.push_rsb(ret.descriptor());
                self.bx_write_pc(target);
                Step::Term(Terminal::FastDispatchHint)
            }

            SingleTransferImm { p, u, byte, w, load, n, d, imm12, .. } => {
                self.single_transfer(p, u, byte, w, load, n, d, imm12)
            }
            HalfTransferImm { p, u, w, load, kind, n, d, imm8, .. } => {
                self.half_transfer(p, u, w, load, kind, n, d, imm8)
            }
            Ldrex { n, d, .. } => {
                if d.is_pc() || n.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let addr32 = self.reg_read(n);
                let addr = self.addr64(addr32);
                let val = self.b.exclusive_read_memory(32, addr);
                self.b.set_register(d.0, val);
                Step::Continue
            }
            Strex { n, d, m, .. } => {
                if d.is_pc() || n.is_pc() || m.is_pc() || d == n || d == m {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let addr32 = self.reg_read(n);
                let addr = self.addr64(addr32);
                let value = self.reg_read(m);
                let status = self.b.exclusive_write_memory(32, addr, value);
                self.b.set_register(d.0, status);
                Step::Continue
            }
            Clrex => {
                self.b.clear_exclusive();
                Step::Continue
            }
            Dmb { .. } => {
                self.b.data_memory_barrier();
                Step::Continue
            }
            Dsb { .. } => {
                self.b.data_synchronization_barrier();
                Step::Continue
            }
            Isb { .. } => {
                self.b.instruction_synchronization_barrier();
                Step::Continue
            }

            Svc { imm24, .. } => {
                let next = self.next_loc();
                self.b.set_register(15, Value::U32(next.pc));
                self.b.call_supervisor(Value::U32(imm24));
                Step::Term(Terminal::CheckHalt {
                    else_: Box::new(Terminal::LinkBlockFast {
                        next: next.descriptor(),
                    }),
                })
            }
            Bkpt { .. } => self.exception(ExceptionKind::Breakpoint),
            Mcr { opc1, crn, t, coproc, opc2, crm, .. } => {
                self.coproc_send(coproc, opc1, crn, crm, opc2, t)
            }
            Mrc { opc1, crn, t, coproc, opc2, crm, .. } => {
                self.coproc_get(coproc, opc1, crn, crm, opc2, t)
            }
            Mrs { .. } | MsrReg { .. } | MsrImm { .. } => self.interpret_one(),
            Hint { .. } => Step::Continue,

            Udf { .. } => self.exception(ExceptionKind::UndefinedInstruction),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn single_transfer(
        &mut self,
        p: bool,
        u: bool,
        byte: bool,
        w: bool,
        load: bool,
        n: Reg,
        d: Reg,
        imm12: u32,
    ) -> Step {
        if d.is_pc() && (!load || byte) {
            return self.exception(ExceptionKind::UnpredictableInstruction);
        }
        if (w || !p) && (n.is_pc() || n == d) {
            return self.exception(ExceptionKind::UnpredictableInstruction);
        }

        let base = self.reg_read(n);
        let offset_applied = if u {
            self.b.add32(base, Value::U32(imm12), Value::U1(false))
        } else {
            self.b.sub32(base, Value::U32(imm12), Value::U1(true))
        };
        let addr32 = if p { offset_applied } else { base };
        let addr = self.addr64(addr32);

        if load {
            let val = if byte {
                let v = self.b.read_memory(8, addr);
                self.b.zext8_32(v)
            } else {
                self.b.read_memory(32, addr)
            };
            if d.is_pc() {
                // Writeback combinations with the PC were rejected above
                self.bx_write_pc(val);
                self.write_back(p, w, n, offset_applied);
                return Step::Term(Terminal::PopRSBHint);
            }
            self.b.set_register(d.0, val);
        } else {
            let val = self.reg_read(d);
            if byte {
                let v = self.b.low_byte(val);
                self.b.write_memory(8, addr, v);
            } else {
                self.b.write_memory(32, addr, val);
            }
        }
        self.write_back(p, w, n, offset_applied);
        Step::Continue
    }

    #[allow(clippy::too_many_arguments)]
    fn half_transfer(
        &mut self,
        p: bool,
        u: bool,
        w: bool,
        load: bool,
        kind: HalfKind,
        n: Reg,
        d: Reg,
        imm8: u32,
    ) -> Step {
        if d.is_pc() || ((w || !p) && (n.is_pc() || n == d)) {
            return self.exception(ExceptionKind::UnpredictableInstruction);
        }

        let base = self.reg_read(n);
        let offset_applied = if u {
            self.b.add32(base, Value::U32(imm8), Value::U1(false))
        } else {
            self.b.sub32(base, Value::U32(imm8), Value::U1(true))
        };
        let addr32 = if p { offset_applied } else { base };
        let addr = self.addr64(addr32);

        if load {
            let val = match kind {
                HalfKind::Half => {
                    let v = self.b.read_memory(16, addr);
                    self.b.zext16_32(v)
                }
                HalfKind::SignedByte => {
                    let v = self.b.read_memory(8, addr);
                    self.b.sext8_32(v)
                }
                HalfKind::SignedHalf => {
                    let v = self.b.read_memory(16, addr);
                    self.b.sext16_32(v)
                }
            };
            self.b.set_register(d.0, val);
        } else {
            let val = self.reg_read(d);
            let v = self.b.low_half(val);
            self.b.write_memory(16, addr, v);
        }
        self.write_back(p, w, n, offset_applied);
        Step::Continue
    }

    fn write_back(&mut self, p: bool, w: bool, n: Reg, updated: Value) {
        if !p || w {
            self.b.set_register(n.0, updated);
        }
    }

    fn coproc_send(&mut self, cp: u32, opc1: u32, crn: u32, crm: u32, opc2: u32, t: Reg) -> Step {
        if t.is_pc() {
            return self.exception(ExceptionKind::UnpredictableInstruction);
        }
        let action = match &self.ctx.coprocessors[cp as usize] {
            None => CoprocAction::Unhandled,
            Some(coproc) => coproc.compile_send_one_word(false, opc1, crn, crm, opc2),
        };
        match action {
            CoprocAction::Unhandled => self.exception(ExceptionKind::UndefinedInstruction),
            CoprocAction::Callback(cb) => {
                let slot = self.ctx.coproc_slots.len() as u32;
                self.ctx.coproc_slots.push(cb);
                let value = self.reg_read(t);
                self.b.coproc_callback_word(slot, value, Value::U32(0));
                Step::Continue
            }
            CoprocAction::Ptr(p) => {
                let value = self.reg_read(t);
                self.b.write_host_word(p as u64, value);
                Step::Continue
            }
        }
    }

    fn coproc_get(&mut self, cp: u32, opc1: u32, crn: u32, crm: u32, opc2: u32, t: Reg) -> Step {
        if t.is_pc() {
            return self.exception(ExceptionKind::UnpredictableInstruction);
        }
        let action = match &self.ctx.coprocessors[cp as usize] {
            None => CoprocAction::Unhandled,
            Some(coproc) => coproc.compile_get_one_word(false, opc1, crn, crm, opc2),
        };
        match action {
            CoprocAction::Unhandled => self.exception(ExceptionKind::UndefinedInstruction),
            CoprocAction::Callback(cb) => {
                let slot = self.ctx.coproc_slots.len() as u32;
                self.ctx.coproc_slots.push(cb);
                let value = self
                    .b
                    .coproc_callback_word(slot, Value::U32(0), Value::U32(0));
                self.b.set_register(t.0, value);
                Step::Continue
            }
            CoprocAction::Ptr(p) => {
                let value = self.b.read_host_word(p as u64);
                self.b.set_register(t.0, value);
                Step::Continue
            }
        }
    }
}
