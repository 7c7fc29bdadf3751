//! Thumb-16 lifter
//!
//! Entered through the A32 frontend when the location descriptor carries the
//! T bit. Thumb data-processing instructions set flags unconditionally, so
//! blocks here are always AL and conditionality only appears on branch
//! terminals.

use armature_isa::bits::sign_extend;
use armature_isa::thumb::{ThumbAluOp, ThumbInstr, THUMB_TABLE};
use armature_isa::Reg;

use crate::env::ExceptionKind;
use crate::frontend::a32::LiftContext;
use crate::ir::{Block, IrBuilder, Terminal, Value};
use crate::loc::a32::A32Location;

enum Step {
    Continue,
    Term(Terminal),
}

struct Lifter<'a, 'c> {
    b: IrBuilder,
    loc: A32Location,
    #[allow(dead_code)]
    ctx: &'a mut LiftContext<'c>,
}

pub(crate) fn lift(ctx: &mut LiftContext<'_>, start: A32Location) -> Block {
    debug_assert!(start.thumb);
    let max = if start.single_step {
        1
    } else {
        ctx.max_instructions
    };

    let word0 = ctx.env.read_code16(start.pc as u64);
    let mut lifter = Lifter {
        b: IrBuilder::new(start.descriptor()),
        loc: start,
        ctx,
    };
    let mut cycle_count = 0u64;
    let mut terminal = None;
    let mut word = word0;

    for i in 0..max {
        if i > 0 {
            word = lifter.ctx.env.read_code16(lifter.loc.pc as u64);
        }
        let instr = THUMB_TABLE.decode(word);
        let step = lifter.lift_instruction(instr);
        cycle_count += 1;
        lifter.loc = lifter.loc.advance(2);
        if let Step::Term(t) = step {
            terminal = Some(t);
            break;
        }
    }

    let end = lifter.loc;
    let terminal = terminal.unwrap_or(Terminal::LinkBlock {
        next: end.descriptor(),
    });
    let mut block = lifter.b.finish(terminal);
    block.end_location = end.descriptor();
    block.cycle_count = cycle_count;
    block.pc_range = (start.pc as u64, end.pc as u64);
    block
}

impl Lifter<'_, '_> {
    fn pc(&self) -> u32 {
        self.loc.pc.wrapping_add(4)
    }

    fn next_loc(&self) -> A32Location {
        self.loc.advance(2)
    }

    fn reg_read(&mut self, r: Reg) -> Value {
        if r.is_pc() {
            Value::U32(self.pc())
        } else {
            self.b.get_register(r.0)
        }
    }

    fn branch_loc(&self, target: u32) -> A32Location {
        A32Location {
            pc: target,
            ..self.loc
        }
    }

    fn exception(&mut self, kind: ExceptionKind) -> Step {
        let pc = self.loc.pc;
        self.b.set_register(15, Value::U32(pc));
        self.b.exception_raised(pc as u64, kind);
        Step::Term(Terminal::CheckHalt {
            else_: Box::new(Terminal::ReturnToDispatch),
        })
    }

    /// Flag-setting add; returns the result.
    fn adds(&mut self, a: Value, b: Value) -> Value {
        let r = self.b.add32(a, b, Value::U1(false));
        let c = self.b.carry_from(r);
        let v = self.b.overflow_from(r);
        self.b.set_nz_from(r);
        self.b.set_c_flag(c);
        self.b.set_v_flag(v);
        r
    }

    fn subs(&mut self, a: Value, b: Value) -> Value {
        let r = self.b.sub32(a, b, Value::U1(true));
        let c = self.b.carry_from(r);
        let v = self.b.overflow_from(r);
        self.b.set_nz_from(r);
        self.b.set_c_flag(c);
        self.b.set_v_flag(v);
        r
    }

    /// Branch within Thumb (bit 0 ignored, mode unchanged).
    fn branch_write_pc(&mut self, target: Value) {
        let masked = self.b.and32(target, Value::U32(0xffff_fffe));
        self.b.set_register(15, masked);
    }

    /// Interworking branch (bit 0 selects the mode).
    fn bx_write_pc(&mut self, target: Value) {
        let t = self.b.test_bit(target, 0);
        self.b.set_t_flag(t);
        let masked = self.b.and32(target, Value::U32(0xffff_fffe));
        self.b.set_register(15, masked);
    }

    fn lift_instruction(&mut self, instr: ThumbInstr) -> Step {
        use ThumbInstr::*;
        match instr {
            ShiftImm { op, imm5, m, d } => {
                let x = self.reg_read(m);
                let cin = self.b.get_c_flag();
                let (r, carry) = match (op, imm5) {
                    (ThumbAluOp::Lsl, 0) => (x, cin),
                    (ThumbAluOp::Lsl, n) => {
                        let v = self.b.lsl32(x, Value::U8(n as u8), cin);
                        (v, self.b.carry_from(v))
                    }
                    (ThumbAluOp::Lsr, n) => {
                        let amount = if n == 0 { 32 } else { n };
                        let v = self.b.lsr32(x, Value::U8(amount as u8), cin);
                        (v, self.b.carry_from(v))
                    }
                    (ThumbAluOp::Asr, n) => {
                        let amount = if n == 0 { 32 } else { n };
                        let v = self.b.asr32(x, Value::U8(amount as u8), cin);
                        (v, self.b.carry_from(v))
                    }
                    _ => unreachable!("decoder only emits shift opcodes here"),
                };
                self.b.set_nz_from(r);
                self.b.set_c_flag(carry);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            AddReg { m, n, d } => {
                let a = self.reg_read(n);
                let b = self.reg_read(m);
                let r = self.adds(a, b);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            SubReg { m, n, d } => {
                let a = self.reg_read(n);
                let b = self.reg_read(m);
                let r = self.subs(a, b);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            AddImm3 { imm3, n, d } => {
                let a = self.reg_read(n);
                let r = self.adds(a, Value::U32(imm3));
                self.b.set_register(d.0, r);
                Step::Continue
            }
            SubImm3 { imm3, n, d } => {
                let a = self.reg_read(n);
                let r = self.subs(a, Value::U32(imm3));
                self.b.set_register(d.0, r);
                Step::Continue
            }
            MovImm8 { d, imm8 } => {
                let r = Value::U32(imm8);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
                Step::Continue
            }
            CmpImm8 { n, imm8 } => {
                let a = self.reg_read(n);
                self.subs(a, Value::U32(imm8));
                Step::Continue
            }
            AddImm8 { d, imm8 } => {
                let a = self.reg_read(d);
                let r = self.adds(a, Value::U32(imm8));
                self.b.set_register(d.0, r);
                Step::Continue
            }
            SubImm8 { d, imm8 } => {
                let a = self.reg_read(d);
                let r = self.subs(a, Value::U32(imm8));
                self.b.set_register(d.0, r);
                Step::Continue
            }
            AluReg { op, m, d } => self.alu_reg(op, m, d),
            AddHi { m, d } => {
                let a = self.reg_read(d);
                let b = self.reg_read(m);
                let r = self.b.add32(a, b, Value::U1(false));
                if d.is_pc() {
                    self.branch_write_pc(r);
                    return Step::Term(Terminal::FastDispatchHint);
                }
                self.b.set_register(d.0, r);
                Step::Continue
            }
            CmpHi { m, n } => {
                let a = self.reg_read(n);
                let b = self.reg_read(m);
                self.subs(a, b);
                Step::Continue
            }
            MovHi { m, d } => {
                let r = self.reg_read(m);
                if d.is_pc() {
                    self.branch_write_pc(r);
                    return Step::Term(Terminal::FastDispatchHint);
                }
                self.b.set_register(d.0, r);
                Step::Continue
            }
            Bx { m } => {
                let target = self.reg_read(m);
                self.bx_write_pc(target);
                Step::Term(if m == Reg::LR {
                    Terminal::PopRSBHint
                } else {
                    Terminal::FastDispatchHint
                })
            }
            BlxReg { m } => {
                if m.is_pc() {
                    return self.exception(ExceptionKind::UnpredictableInstruction);
                }
                let target = self.reg_read(m);
                let ret = self.next_loc();
                self.b.set_register(14, Value::U32(ret.pc | 1));
                self.b.push_rsb(ret.descriptor());
                self.bx_write_pc(target);
                Step::Term(Terminal::FastDispatchHint)
            }
            LdrLit { t, imm8 } => {
                let base = self.pc() & !3;
                let addr32 = Value::U32(base.wrapping_add(imm8 * 4));
                let addr = self.b.zext32_64(addr32);
                let val = self.b.read_memory(32, addr);
                self.b.set_register(t.0, val);
                Step::Continue
            }
            StrImm5 { imm5, n, t } => self.load_store(32, false, n, t, imm5 * 4),
            LdrImm5 { imm5, n, t } => self.load_store(32, true, n, t, imm5 * 4),
            StrbImm5 { imm5, n, t } => self.load_store(8, false, n, t, imm5),
            LdrbImm5 { imm5, n, t } => self.load_store(8, true, n, t, imm5),
            StrhImm5 { imm5, n, t } => self.load_store(16, false, n, t, imm5 * 2),
            LdrhImm5 { imm5, n, t } => self.load_store(16, true, n, t, imm5 * 2),
            Hint { .. } => Step::Continue,
            BCond { cond, imm8 } => {
                let offset = (sign_extend(imm8, 8) << 1) as i64;
                let target = self.pc().wrapping_add(offset as u32);
                let next = self.next_loc();
                Step::Term(Terminal::If {
                    cond,
                    then_: Box::new(Terminal::LinkBlock {
                        next: self.branch_loc(target).descriptor(),
                    }),
                    else_: Box::new(Terminal::LinkBlock {
                        next: next.descriptor(),
                    }),
                })
            }
            B { imm11 } => {
                let offset = (sign_extend(imm11, 11) << 1) as i64;
                let target = self.pc().wrapping_add(offset as u32);
                Step::Term(Terminal::LinkBlock {
                    next: self.branch_loc(target).descriptor(),
                })
            }
            Svc { imm8 } => {
                let next = self.next_loc();
                self.b.set_register(15, Value::U32(next.pc));
                self.b.call_supervisor(Value::U32(imm8));
                Step::Term(Terminal::CheckHalt {
                    else_: Box::new(Terminal::LinkBlockFast {
                        next: next.descriptor(),
                    }),
                })
            }
            Udf { .. } => self.exception(ExceptionKind::UndefinedInstruction),
        }
    }

    fn alu_reg(&mut self, op: ThumbAluOp, m: Reg, d: Reg) -> Step {
        let dv = self.reg_read(d);
        let mv = self.reg_read(m);
        match op {
            ThumbAluOp::And => {
                let r = self.b.and32(dv, mv);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Eor => {
                let r = self.b.eor32(dv, mv);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Lsl | ThumbAluOp::Lsr | ThumbAluOp::Asr | ThumbAluOp::Ror => {
                let amount = self.b.low_byte(mv);
                let cin = self.b.get_c_flag();
                let r = match op {
                    ThumbAluOp::Lsl => self.b.lsl32(dv, amount, cin),
                    ThumbAluOp::Lsr => self.b.lsr32(dv, amount, cin),
                    ThumbAluOp::Asr => self.b.asr32(dv, amount, cin),
                    _ => self.b.ror32(dv, amount, cin),
                };
                let carry = self.b.carry_from(r);
                self.b.set_nz_from(r);
                self.b.set_c_flag(carry);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Adc => {
                let c = self.b.get_c_flag();
                let r = self.b.add32(dv, mv, c);
                let carry = self.b.carry_from(r);
                let overflow = self.b.overflow_from(r);
                self.b.set_nz_from(r);
                self.b.set_c_flag(carry);
                self.b.set_v_flag(overflow);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Sbc => {
                let c = self.b.get_c_flag();
                let r = self.b.sub32(dv, mv, c);
                let carry = self.b.carry_from(r);
                let overflow = self.b.overflow_from(r);
                self.b.set_nz_from(r);
                self.b.set_c_flag(carry);
                self.b.set_v_flag(overflow);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Tst => {
                let r = self.b.and32(dv, mv);
                self.b.set_nz_from(r);
            }
            ThumbAluOp::Rsb => {
                let r = self.subs(Value::U32(0), mv);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Cmp => {
                self.subs(dv, mv);
            }
            ThumbAluOp::Cmn => {
                self.adds(dv, mv);
            }
            ThumbAluOp::Orr => {
                let r = self.b.or32(dv, mv);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Mul => {
                let r = self.b.mul32(dv, mv);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Bic => {
                let inv = self.b.not32(mv);
                let r = self.b.and32(dv, inv);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
            }
            ThumbAluOp::Mvn => {
                let r = self.b.not32(mv);
                self.b.set_nz_from(r);
                self.b.set_register(d.0, r);
            }
        }
        Step::Continue
    }

    fn load_store(&mut self, bits: u32, load: bool, n: Reg, t: Reg, offset: u32) -> Step {
        let base = self.reg_read(n);
        let addr32 = self.b.add32(base, Value::U32(offset), Value::U1(false));
        let addr = self.b.zext32_64(addr32);
        if load {
            let val = match bits {
                8 => {
                    let v = self.b.read_memory(8, addr);
                    self.b.zext8_32(v)
                }
                16 => {
                    let v = self.b.read_memory(16, addr);
                    self.b.zext16_32(v)
                }
                _ => self.b.read_memory(32, addr),
            };
            self.b.set_register(t.0, val);
        } else {
            let val = self.reg_read(t);
            match bits {
                8 => {
                    let v = self.b.low_byte(val);
                    self.b.write_memory(8, addr, v);
                }
                16 => {
                    let v = self.b.low_half(val);
                    self.b.write_memory(16, addr, v);
                }
                _ => self.b.write_memory(32, addr, val),
            }
        }
        Step::Continue
    }
}
