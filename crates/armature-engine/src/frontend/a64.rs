//! A64 lifter
//!
//! A64 has no per-instruction conditions, so blocks are always AL and
//! conditionality shows up only in terminals (B.cond via `If`, CBZ/CBNZ via
//! the check bit). W-register forms compute in the 32-bit IR domain and
//! zero-extend on writeback. Guest register indices 0-30 are X0-X30, 31 is
//! SP, and 32 is the PC slot.

use armature_isa::a64::{A64Instr, A64Shift, LogicalOp, MovWideOp, A64_TABLE};
use armature_isa::bits::sign_extend;
use armature_isa::XReg;

use crate::env::ExceptionKind;
use crate::frontend::a32::LiftContext;
use crate::ir::{Block, IrBuilder, Terminal, Value};
use crate::loc::a64::A64Location;

/// Guest register slot of the stack pointer.
pub const REG_SP: u8 = 31;
/// Guest register slot of the program counter.
pub const REG_PC: u8 = 32;

enum Step {
    Continue,
    Term(Terminal),
}

struct Lifter<'a, 'c> {
    b: IrBuilder,
    loc: A64Location,
    #[allow(dead_code)]
    ctx: &'a mut LiftContext<'c>,
}

pub fn lift(ctx: &mut LiftContext<'_>, start: A64Location) -> Block {
    let max = if start.single_step {
        1
    } else {
        ctx.max_instructions
    };

    let mut lifter = Lifter {
        b: IrBuilder::new(start.descriptor()),
        loc: start,
        ctx,
    };
    let mut cycle_count = 0u64;
    let mut terminal = None;

    for _ in 0..max {
        let word = lifter.ctx.env.read_code32(lifter.loc.pc);
        let instr = A64_TABLE.decode(word);
        let step = lifter.lift_instruction(instr);
        cycle_count += 1;
        lifter.loc = lifter.loc.advance(4);
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
    block.pc_range = (start.pc, end.pc);
    block
}

impl Lifter<'_, '_> {
    fn next_loc(&self) -> A64Location {
        self.loc.advance(4)
    }

    fn branch_loc(&self, target: u64) -> A64Location {
        A64Location {
            pc: target,
            ..self.loc
        }
    }

    /// 64-bit register read; ZR reads as zero.
    fn xread(&mut self, r: XReg) -> Value {
        if r.is_zr() {
            Value::U64(0)
        } else if r.is_sp() {
            self.b.get_register64(REG_SP)
        } else {
            self.b.get_register64(r.index() as u8)
        }
    }

    /// 32-bit view of a register.
    fn wread(&mut self, r: XReg) -> Value {
        let x = self.xread(r);
        self.b.low_word(x)
    }

    /// Write a 64-bit value; writes to ZR vanish.
    fn xwrite(&mut self, r: XReg, v: Value) {
        if r.is_zr() {
            return;
        }
        let slot = if r.is_sp() { REG_SP } else { r.index() as u8 };
        self.b.set_register64(slot, v);
    }

    /// Write a 32-bit result, zero-extending into the X register.
    fn wwrite(&mut self, r: XReg, v: Value) {
        if r.is_zr() {
            return;
        }
        let wide = self.b.zext32_64(v);
        self.xwrite(r, wide);
    }

    fn set_pc(&mut self, v: Value) {
        self.b.set_register64(REG_PC, v);
    }

    fn exception(&mut self, kind: ExceptionKind) -> Step {
        let pc = self.loc.pc;
        self.set_pc(Value::U64(pc));
        self.b.exception_raised(pc, kind);
        Step::Term(Terminal::CheckHalt {
            else_: Box::new(Terminal::ReturnToDispatch),
        })
    }

    fn shifted_operand(&mut self, sf: bool, r: XReg, shift: A64Shift, amount: u32) -> Value {
        let x = if sf { self.xread(r) } else { self.wread(r) };
        if amount == 0 && shift == A64Shift::Lsl {
            return x;
        }
        let amt = Value::U8(amount as u8);
        if sf {
            match shift {
                A64Shift::Lsl => self.b.lsl64(x, amt),
                A64Shift::Lsr => self.b.lsr64(x, amt),
                A64Shift::Asr => self.b.asr64(x, amt),
                A64Shift::Ror => unreachable!("ROR rejected before operand build"),
            }
        } else {
            let cin = Value::U1(false);
            match shift {
                A64Shift::Lsl => self.b.lsl32(x, amt, cin),
                A64Shift::Lsr => self.b.lsr32(x, amt, cin),
                A64Shift::Asr => self.b.asr32(x, amt, cin),
                A64Shift::Ror => unreachable!("ROR rejected before operand build"),
            }
        }
    }

    /// Flag-setting add/sub shared by immediate and register forms.
    fn add_sub(
        &mut self,
        sf: bool,
        sub: bool,
        set_flags: bool,
        a: Value,
        b: Value,
        d: XReg,
    ) -> Step {
        let r = if sf {
            if sub {
                self.b.sub64(a, b, Value::U1(true))
            } else {
                self.b.add64(a, b, Value::U1(false))
            }
        } else if sub {
            self.b.sub32(a, b, Value::U1(true))
        } else {
            self.b.add32(a, b, Value::U1(false))
        };
        if set_flags {
            let c = self.b.carry_from(r);
            let v = self.b.overflow_from(r);
            if sf {
                self.b.set_nz_from64(r);
            } else {
                self.b.set_nz_from(r);
            }
            self.b.set_c_flag(c);
            self.b.set_v_flag(v);
        }
        if sf {
            self.xwrite(d, r);
        } else {
            self.wwrite(d, r);
        }
        Step::Continue
    }

    fn lift_instruction(&mut self, instr: A64Instr) -> Step {
        use A64Instr::*;
        match instr {
            AddSubImm { sf, sub, set_flags, imm12, shift12, n, d } => {
                let imm = (imm12 as u64) << if shift12 { 12 } else { 0 };
                let a = if sf { self.xread(n) } else { self.wread(n) };
                let b = if sf {
                    Value::U64(imm)
                } else {
                    Value::U32(imm as u32)
                };
                self.add_sub(sf, sub, set_flags, a, b, d)
            }
            AddSubShifted { sf, sub, set_flags, shift, m, imm6, n, d } => {
                if shift == A64Shift::Ror || (!sf && imm6 >= 32) {
                    return self.exception(ExceptionKind::UndefinedInstruction);
                }
                let a = if sf { self.xread(n) } else { self.wread(n) };
                let b = self.shifted_operand(sf, m, shift, imm6);
                self.add_sub(sf, sub, set_flags, a, b, d)
            }
            LogicalShifted { sf, op, invert, shift, m, imm6, n, d } => {
                if !sf && imm6 >= 32 {
                    return self.exception(ExceptionKind::UndefinedInstruction);
                }
                let a = if sf { self.xread(n) } else { self.wread(n) };
                let b = self.shifted_operand_any(sf, m, shift, imm6);
                let b = if invert {
                    if sf {
                        self.b.not64(b)
                    } else {
                        self.b.not32(b)
                    }
                } else {
                    b
                };
                self.logical(sf, op, a, b, d)
            }
            LogicalImm { sf, op, imm, n, d } => {
                let imm = match imm {
                    Some(v) => v,
                    None => return self.exception(ExceptionKind::UndefinedInstruction),
                };
                let a = if sf { self.xread(n) } else { self.wread(n) };
                let b = if sf {
                    Value::U64(imm)
                } else {
                    Value::U32(imm as u32)
                };
                self.logical(sf, op, a, b, d)
            }
            MovWide { sf, op, hw, imm16, d } => {
                if !sf && hw > 1 {
                    return self.exception(ExceptionKind::UndefinedInstruction);
                }
                let shift = hw * 16;
                match op {
                    MovWideOp::Movz => {
                        let v = (imm16 as u64) << shift;
                        if sf {
                            self.xwrite(d, Value::U64(v));
                        } else {
                            self.wwrite(d, Value::U32(v as u32));
                        }
                    }
                    MovWideOp::Movn => {
                        let v = !((imm16 as u64) << shift);
                        if sf {
                            self.xwrite(d, Value::U64(v));
                        } else {
                            self.wwrite(d, Value::U32(v as u32));
                        }
                    }
                    MovWideOp::Movk => {
                        let old = if sf { self.xread(d) } else { self.wread(d) };
                        let hole = !(0xffffu64 << shift);
                        let insert = (imm16 as u64) << shift;
                        if sf {
                            let masked = self.b.and64(old, Value::U64(hole));
                            let merged = self.b.or64(masked, Value::U64(insert));
                            self.xwrite(d, merged);
                        } else {
                            let masked = self.b.and32(old, Value::U32(hole as u32));
                            let merged = self.b.or32(masked, Value::U32(insert as u32));
                            self.wwrite(d, merged);
                        }
                    }
                }
                Step::Continue
            }
            Madd { sf, sub, m, a, n, d } => {
                let x = if sf { self.xread(n) } else { self.wread(n) };
                let y = if sf { self.xread(m) } else { self.wread(m) };
                let acc = if sf { self.xread(a) } else { self.wread(a) };
                let prod = if sf {
                    self.b.mul64(x, y)
                } else {
                    self.b.mul32(x, y)
                };
                let r = if sf {
                    if sub {
                        self.b.sub64(acc, prod, Value::U1(true))
                    } else {
                        self.b.add64(acc, prod, Value::U1(false))
                    }
                } else if sub {
                    self.b.sub32(acc, prod, Value::U1(true))
                } else {
                    self.b.add32(acc, prod, Value::U1(false))
                };
                if sf {
                    self.xwrite(d, r);
                } else {
                    self.wwrite(d, r);
                }
                Step::Continue
            }

            B { imm26 } => {
                let offset = sign_extend(imm26, 26) << 2;
                let target = self.loc.pc.wrapping_add(offset as u64);
                Step::Term(Terminal::LinkBlock {
                    next: self.branch_loc(target).descriptor(),
                })
            }
            Bl { imm26 } => {
                let offset = sign_extend(imm26, 26) << 2;
                let target = self.loc.pc.wrapping_add(offset as u64);
                let ret = self.next_loc();
                self.b.set_register64(30, Value::U64(ret.pc));
                self.b.push_rsb(ret.descriptor());
                Step::Term(Terminal::LinkBlock {
                    next: self.branch_loc(target).descriptor(),
                })
            }
            BCond { imm19, cond } => {
                let offset = sign_extend(imm19, 19) << 2;
                let target = self.loc.pc.wrapping_add(offset as u64);
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
            Cbz { sf, imm19, t } | Cbnz { sf, imm19, t } => {
                let offset = sign_extend(imm19, 19) << 2;
                let target = self.loc.pc.wrapping_add(offset as u64);
                let next = self.next_loc();
                let v = if sf { self.xread(t) } else { self.wread(t) };
                let is_zero = if sf {
                    self.b.block.push(crate::ir::Opcode::IsZero64, vec![v])
                } else {
                    self.b.block.push(crate::ir::Opcode::IsZero32, vec![v])
                };
                self.b.set_check_bit(Value::Inst(is_zero));
                let (on_set, on_clear) = (
                    Terminal::LinkBlock {
                        next: self.branch_loc(target).descriptor(),
                    },
                    Terminal::LinkBlock {
                        next: next.descriptor(),
                    },
                );
                let (then_, else_) = if matches!(instr, Cbz { .. }) {
                    (on_set, on_clear)
                } else {
                    (on_clear, on_set)
                };
                Step::Term(Terminal::CheckBit {
                    then_: Box::new(then_),
                    else_: Box::new(else_),
                })
            }
            Br { n } => {
                let target = self.xread(n);
                self.set_pc(target);
                Step::Term(Terminal::FastDispatchHint)
            }
            Blr { n } => {
                let target = self.xread(n);
                let ret = self.next_loc();
                self.b.set_register64(30, Value::U64(ret.pc));
                self.b.push_rsb(ret.descriptor());
                self.set_pc(target);
                Step::Term(Terminal::FastDispatchHint)
            }
            Ret { n } => {
                let target = self.xread(n);
                self.set_pc(target);
                Step::Term(Terminal::PopRSBHint)
            }

            LdrStrImm { size, load, imm12, n, t } => {
                let base = self.xread(n);
                let offset = (imm12 as u64) << size;
                let addr = self.b.add64(base, Value::U64(offset), Value::U1(false));
                let bits = 8u32 << size;
                if load {
                    let val = self.b.read_memory(bits, addr);
                    match bits {
                        8 => {
                            let w = self.b.zext8_32(val);
                            self.wwrite(t, w);
                        }
                        16 => {
                            let w = self.b.zext16_32(val);
                            self.wwrite(t, w);
                        }
                        32 => self.wwrite(t, val),
                        _ => self.xwrite(t, val),
                    }
                } else {
                    let val = self.xread(t);
                    match bits {
                        8 => {
                            let w = self.b.low_word(val);
                            let v = self.b.low_byte(w);
                            self.b.write_memory(8, addr, v);
                        }
                        16 => {
                            let w = self.b.low_word(val);
                            let v = self.b.low_half(w);
                            self.b.write_memory(16, addr, v);
                        }
                        32 => {
                            let v = self.b.low_word(val);
                            self.b.write_memory(32, addr, v);
                        }
                        _ => self.b.write_memory(64, addr, val),
                    }
                }
                Step::Continue
            }
            Ldxr { size, n, t } => {
                let addr = self.xread(n);
                let bits = 8u32 << size;
                let val = self.b.exclusive_read_memory(bits, addr);
                match bits {
                    8 => {
                        let w = self.b.zext8_32(val);
                        self.wwrite(t, w);
                    }
                    16 => {
                        let w = self.b.zext16_32(val);
                        self.wwrite(t, w);
                    }
                    32 => self.wwrite(t, val),
                    _ => self.xwrite(t, val),
                }
                Step::Continue
            }
            Stxr { size, s, n, t } => {
                let addr = self.xread(n);
                let bits = 8u32 << size;
                let status = match bits {
                    8 => {
                        let w = self.wread(t);
                        let v = self.b.low_byte(w);
                        self.b.exclusive_write_memory(8, addr, v)
                    }
                    16 => {
                        let w = self.wread(t);
                        let v = self.b.low_half(w);
                        self.b.exclusive_write_memory(16, addr, v)
                    }
                    32 => {
                        let val = self.wread(t);
                        self.b.exclusive_write_memory(32, addr, val)
                    }
                    _ => {
                        let val = self.xread(t);
                        self.b.exclusive_write_memory(64, addr, val)
                    }
                };
                self.wwrite(s, status);
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

            Svc { imm16 } => {
                let next = self.next_loc();
                self.set_pc(Value::U64(next.pc));
                self.b.call_supervisor(Value::U32(imm16));
                Step::Term(Terminal::CheckHalt {
                    else_: Box::new(Terminal::LinkBlockFast {
                        next: next.descriptor(),
                    }),
                })
            }
            Brk { .. } => self.exception(ExceptionKind::Breakpoint),
            Hint { .. } => Step::Continue,
            Udf { .. } => self.exception(ExceptionKind::UndefinedInstruction),
        }
    }

    /// Shifted operand that also permits ROR (logical forms).
    fn shifted_operand_any(&mut self, sf: bool, r: XReg, shift: A64Shift, amount: u32) -> Value {
        if shift != A64Shift::Ror {
            return self.shifted_operand(sf, r, shift, amount);
        }
        if sf {
            // 64-bit rotate via shifts: (x >> n) | (x << (64 - n))
            let x = self.xread(r);
            if amount == 0 {
                return x;
            }
            let lo = self.b.lsr64(x, Value::U8(amount as u8));
            let hi = self.b.lsl64(x, Value::U8((64 - amount) as u8));
            self.b.or64(lo, hi)
        } else {
            let x = self.wread(r);
            if amount == 0 {
                return x;
            }
            self.b.ror32(x, Value::U8(amount as u8), Value::U1(false))
        }
    }

    fn logical(&mut self, sf: bool, op: LogicalOp, a: Value, b: Value, d: XReg) -> Step {
        let r = match (op, sf) {
            (LogicalOp::And | LogicalOp::Ands, true) => self.b.and64(a, b),
            (LogicalOp::And | LogicalOp::Ands, false) => self.b.and32(a, b),
            (LogicalOp::Orr, true) => self.b.or64(a, b),
            (LogicalOp::Orr, false) => self.b.or32(a, b),
            (LogicalOp::Eor, true) => self.b.eor64(a, b),
            (LogicalOp::Eor, false) => self.b.eor32(a, b),
        };
        if op == LogicalOp::Ands {
            // A64 flag-setting logicals zero C and V
            if sf {
                self.b.set_nz_from64(r);
            } else {
                self.b.set_nz_from(r);
            }
            self.b.set_c_flag(Value::U1(false));
            self.b.set_v_flag(Value::U1(false));
        }
        if sf {
            self.xwrite(d, r);
        } else {
            self.wwrite(d, r);
        }
        Step::Continue
    }
}
