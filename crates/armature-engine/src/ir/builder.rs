//! IR construction helpers
//!
//! Thin typed wrappers over `Block::push` used by the lifters. Every helper
//! returns the produced `Value` so lifter code reads like dataflow. Argument
//! types are checked in debug builds against the opcode table.

use super::block::{Block, Terminal};
use super::opcode::Opcode;
use super::value::{InstId, SideChannel, Value};
use crate::loc::LocationDescriptor;

/// Builder owning the block under construction.
pub struct IrBuilder {
    pub block: Block,
}

impl IrBuilder {
    pub fn new(location: LocationDescriptor) -> IrBuilder {
        IrBuilder {
            block: Block::new(location),
        }
    }

    pub fn finish(mut self, terminal: Terminal) -> Block {
        assert!(self.block.terminal.is_invalid(), "terminal already set");
        self.block.terminal = terminal;
        self.block
    }

    fn push(&mut self, op: Opcode, args: Vec<Value>) -> Value {
        #[cfg(debug_assertions)]
        {
            let info = op.info();
            assert_eq!(info.args.len(), args.len(), "arity mismatch for {}", op.name());
            for (arg, slot) in args.iter().zip(info.args) {
                assert!(
                    arg.matches_arg(*slot, &self.block),
                    "argument type mismatch for {}: {:?} in slot {:?}",
                    op.name(),
                    arg,
                    slot
                );
            }
        }
        Value::Inst(self.block.push(op, args))
    }

    fn producer(v: Value) -> InstId {
        match v {
            Value::Inst(id) => id,
            other => panic!("pseudo-operation needs a producing inst, got {:?}", other),
        }
    }

    // ---- Guest state ----

    pub fn get_register(&mut self, r: u8) -> Value {
        self.push(Opcode::GetRegister, vec![Value::GuestReg(r)])
    }

    pub fn set_register(&mut self, r: u8, v: Value) {
        self.push(Opcode::SetRegister, vec![Value::GuestReg(r), v]);
    }

    pub fn get_register64(&mut self, r: u8) -> Value {
        self.push(Opcode::GetRegister64, vec![Value::GuestReg(r)])
    }

    pub fn set_register64(&mut self, r: u8, v: Value) {
        self.push(Opcode::SetRegister64, vec![Value::GuestReg(r), v]);
    }

    pub fn get_vector(&mut self, r: u8) -> Value {
        self.push(Opcode::GetVector, vec![Value::GuestReg(r)])
    }

    pub fn set_vector(&mut self, r: u8, v: Value) {
        self.push(Opcode::SetVector, vec![Value::GuestReg(r), v]);
    }

    pub fn get_n_flag(&mut self) -> Value {
        self.push(Opcode::GetNFlag, vec![])
    }

    pub fn get_z_flag(&mut self) -> Value {
        self.push(Opcode::GetZFlag, vec![])
    }

    pub fn get_c_flag(&mut self) -> Value {
        self.push(Opcode::GetCFlag, vec![])
    }

    pub fn get_v_flag(&mut self) -> Value {
        self.push(Opcode::GetVFlag, vec![])
    }

    pub fn set_n_flag(&mut self, v: Value) {
        self.push(Opcode::SetNFlag, vec![v]);
    }

    pub fn set_z_flag(&mut self, v: Value) {
        self.push(Opcode::SetZFlag, vec![v]);
    }

    pub fn set_c_flag(&mut self, v: Value) {
        self.push(Opcode::SetCFlag, vec![v]);
    }

    pub fn set_v_flag(&mut self, v: Value) {
        self.push(Opcode::SetVFlag, vec![v]);
    }

    pub fn or_q_flag(&mut self, v: Value) {
        self.push(Opcode::OrQFlag, vec![v]);
    }

    pub fn set_t_flag(&mut self, v: Value) {
        self.push(Opcode::SetTFlag, vec![v]);
    }

    pub fn set_check_bit(&mut self, v: Value) {
        self.push(Opcode::SetCheckBit, vec![v]);
    }

    pub fn test_bit(&mut self, v: Value, bit: u8) -> Value {
        self.push(Opcode::TestBit32, vec![v, Value::U8(bit)])
    }

    /// Set NZ from a 32-bit result.
    pub fn set_nz_from(&mut self, result: Value) {
        let n = self.push(Opcode::MostSignificantBit32, vec![result]);
        self.set_n_flag(n);
        let z = self.push(Opcode::IsZero32, vec![result]);
        self.set_z_flag(z);
    }

    /// Set NZ from a value of either width (A64).
    pub fn set_nz_from64(&mut self, result: Value) {
        let n = self.push(Opcode::MostSignificantBit64, vec![result]);
        self.set_n_flag(n);
        let z = self.push(Opcode::IsZero64, vec![result]);
        self.set_z_flag(z);
    }

    // ---- Pseudo-operations ----

    pub fn carry_from(&mut self, producer: Value) -> Value {
        let id = Self::producer(producer);
        Value::Inst(
            self.block
                .push_pseudo(Opcode::GetCarryFromOp, id, SideChannel::Carry),
        )
    }

    pub fn overflow_from(&mut self, producer: Value) -> Value {
        let id = Self::producer(producer);
        Value::Inst(
            self.block
                .push_pseudo(Opcode::GetOverflowFromOp, id, SideChannel::Overflow),
        )
    }

    // ---- Arithmetic ----

    pub fn add32(&mut self, a: Value, b: Value, carry_in: Value) -> Value {
        self.push(Opcode::Add32, vec![a, b, carry_in])
    }

    pub fn add64(&mut self, a: Value, b: Value, carry_in: Value) -> Value {
        self.push(Opcode::Add64, vec![a, b, carry_in])
    }

    pub fn sub32(&mut self, a: Value, b: Value, borrow_flag: Value) -> Value {
        self.push(Opcode::Sub32, vec![a, b, borrow_flag])
    }

    pub fn sub64(&mut self, a: Value, b: Value, borrow_flag: Value) -> Value {
        self.push(Opcode::Sub64, vec![a, b, borrow_flag])
    }

    pub fn mul32(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::Mul32, vec![a, b])
    }

    pub fn mul64(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::Mul64, vec![a, b])
    }

    pub fn signed_multiply_long(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::SignedMultiplyLong, vec![a, b])
    }

    pub fn unsigned_multiply_long(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::UnsignedMultiplyLong, vec![a, b])
    }

    pub fn and32(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::And32, vec![a, b])
    }

    pub fn and64(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::And64, vec![a, b])
    }

    pub fn or32(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::Or32, vec![a, b])
    }

    pub fn or64(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::Or64, vec![a, b])
    }

    pub fn eor32(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::Eor32, vec![a, b])
    }

    pub fn eor64(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::Eor64, vec![a, b])
    }

    pub fn not32(&mut self, a: Value) -> Value {
        self.push(Opcode::Not32, vec![a])
    }

    pub fn not64(&mut self, a: Value) -> Value {
        self.push(Opcode::Not64, vec![a])
    }

    pub fn clz32(&mut self, a: Value) -> Value {
        self.push(Opcode::CountLeadingZeros32, vec![a])
    }

    // ---- Shifts ----

    pub fn lsl32(&mut self, x: Value, amount: Value, carry_in: Value) -> Value {
        self.push(Opcode::LogicalShiftLeft32, vec![x, amount, carry_in])
    }

    pub fn lsr32(&mut self, x: Value, amount: Value, carry_in: Value) -> Value {
        self.push(Opcode::LogicalShiftRight32, vec![x, amount, carry_in])
    }

    pub fn asr32(&mut self, x: Value, amount: Value, carry_in: Value) -> Value {
        self.push(Opcode::ArithmeticShiftRight32, vec![x, amount, carry_in])
    }

    pub fn ror32(&mut self, x: Value, amount: Value, carry_in: Value) -> Value {
        self.push(Opcode::RotateRight32, vec![x, amount, carry_in])
    }

    pub fn rrx(&mut self, x: Value, carry_in: Value) -> Value {
        self.push(Opcode::RotateRightExtended, vec![x, carry_in])
    }

    pub fn lsl64(&mut self, x: Value, amount: Value) -> Value {
        self.push(Opcode::LogicalShiftLeft64, vec![x, amount])
    }

    pub fn lsr64(&mut self, x: Value, amount: Value) -> Value {
        self.push(Opcode::LogicalShiftRight64, vec![x, amount])
    }

    pub fn asr64(&mut self, x: Value, amount: Value) -> Value {
        self.push(Opcode::ArithmeticShiftRight64, vec![x, amount])
    }

    // ---- Extension and extraction ----

    pub fn sext8_32(&mut self, v: Value) -> Value {
        self.push(Opcode::SignExtend8To32, vec![v])
    }

    pub fn sext16_32(&mut self, v: Value) -> Value {
        self.push(Opcode::SignExtend16To32, vec![v])
    }

    pub fn zext8_32(&mut self, v: Value) -> Value {
        self.push(Opcode::ZeroExtend8To32, vec![v])
    }

    pub fn zext16_32(&mut self, v: Value) -> Value {
        self.push(Opcode::ZeroExtend16To32, vec![v])
    }

    pub fn sext32_64(&mut self, v: Value) -> Value {
        self.push(Opcode::SignExtend32To64, vec![v])
    }

    pub fn zext32_64(&mut self, v: Value) -> Value {
        self.push(Opcode::ZeroExtend32To64, vec![v])
    }

    pub fn low_word(&mut self, v: Value) -> Value {
        self.push(Opcode::LeastSignificantWord, vec![v])
    }

    pub fn high_word(&mut self, v: Value) -> Value {
        self.push(Opcode::MostSignificantWord, vec![v])
    }

    pub fn low_byte(&mut self, v: Value) -> Value {
        self.push(Opcode::LeastSignificantByte, vec![v])
    }

    pub fn low_half(&mut self, v: Value) -> Value {
        self.push(Opcode::LeastSignificantHalf, vec![v])
    }

    // ---- Saturating arithmetic ----

    pub fn signed_saturated_add32(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::SignedSaturatedAdd32, vec![a, b])
    }

    pub fn signed_saturated_sub32(&mut self, a: Value, b: Value) -> Value {
        self.push(Opcode::SignedSaturatedSub32, vec![a, b])
    }

    pub fn signed_saturated_double32(&mut self, a: Value) -> Value {
        self.push(Opcode::SignedSaturatedDouble32, vec![a])
    }

    pub fn signed_saturation(&mut self, v: Value, bit_size: u8) -> Value {
        self.push(Opcode::SignedSaturation, vec![v, Value::U8(bit_size)])
    }

    pub fn unsigned_saturation(&mut self, v: Value, bit_size: u8) -> Value {
        self.push(Opcode::UnsignedSaturation, vec![v, Value::U8(bit_size)])
    }

    // ---- Memory ----

    pub fn read_memory(&mut self, bits: u32, vaddr: Value) -> Value {
        let op = match bits {
            8 => Opcode::ReadMemory8,
            16 => Opcode::ReadMemory16,
            32 => Opcode::ReadMemory32,
            _ => Opcode::ReadMemory64,
        };
        self.push(op, vec![vaddr])
    }

    pub fn write_memory(&mut self, bits: u32, vaddr: Value, value: Value) {
        let op = match bits {
            8 => Opcode::WriteMemory8,
            16 => Opcode::WriteMemory16,
            32 => Opcode::WriteMemory32,
            _ => Opcode::WriteMemory64,
        };
        self.push(op, vec![vaddr, value]);
    }

    pub fn exclusive_read_memory(&mut self, bits: u32, vaddr: Value) -> Value {
        let op = match bits {
            8 => Opcode::ExclusiveReadMemory8,
            16 => Opcode::ExclusiveReadMemory16,
            32 => Opcode::ExclusiveReadMemory32,
            _ => Opcode::ExclusiveReadMemory64,
        };
        self.push(op, vec![vaddr])
    }

    /// Returns 0 on success, 1 on failure (the guest-visible status).
    pub fn exclusive_write_memory(&mut self, bits: u32, vaddr: Value, value: Value) -> Value {
        let op = match bits {
            8 => Opcode::ExclusiveWriteMemory8,
            16 => Opcode::ExclusiveWriteMemory16,
            32 => Opcode::ExclusiveWriteMemory32,
            _ => Opcode::ExclusiveWriteMemory64,
        };
        self.push(op, vec![vaddr, value])
    }

    pub fn clear_exclusive(&mut self) {
        self.push(Opcode::ClearExclusive, vec![]);
    }

    // ---- Barriers and system ----

    pub fn data_memory_barrier(&mut self) {
        self.push(Opcode::DataMemoryBarrier, vec![]);
    }

    pub fn data_synchronization_barrier(&mut self) {
        self.push(Opcode::DataSynchronizationBarrier, vec![]);
    }

    pub fn instruction_synchronization_barrier(&mut self) {
        self.push(Opcode::InstructionSynchronizationBarrier, vec![]);
    }

    pub fn call_supervisor(&mut self, imm: Value) {
        self.push(Opcode::CallSupervisor, vec![imm]);
    }

    pub fn exception_raised(&mut self, pc: u64, kind: crate::env::ExceptionKind) {
        self.push(
            Opcode::ExceptionRaised,
            vec![Value::U64(pc), Value::U32(kind as u32)],
        );
    }

    pub fn push_rsb(&mut self, desc: LocationDescriptor) {
        self.push(Opcode::PushRSB, vec![Value::U64(desc.raw())]);
    }

    pub fn coproc_callback_word(&mut self, slot: u32, a: Value, b: Value) -> Value {
        self.push(Opcode::CoprocCallbackWord, vec![Value::U32(slot), a, b])
    }

    pub fn coproc_callback_double(&mut self, slot: u32, a: Value, b: Value) -> Value {
        self.push(Opcode::CoprocCallbackDouble, vec![Value::U32(slot), a, b])
    }

    pub fn read_host_word(&mut self, ptr: u64) -> Value {
        self.push(Opcode::ReadHostWord, vec![Value::U64(ptr)])
    }

    pub fn write_host_word(&mut self, ptr: u64, value: Value) {
        self.push(Opcode::WriteHostWord, vec![Value::U64(ptr), value]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::opcode::Opcode;

    #[test]
    fn test_builder_dataflow() {
        let mut b = IrBuilder::new(LocationDescriptor(0x100));
        let r0 = b.get_register(0);
        let sum = b.add32(r0, Value::U32(2), Value::U1(false));
        b.set_register(0, sum);
        let block = b.finish(Terminal::ReturnToDispatch);
        assert_eq!(block.live_inst_count(), 3);
        assert_eq!(block.terminal, Terminal::ReturnToDispatch);
    }

    #[test]
    fn test_carry_pseudo_via_builder() {
        let mut b = IrBuilder::new(LocationDescriptor(0));
        let sum = b.add32(Value::U32(1), Value::U32(2), Value::U1(false));
        let carry = b.carry_from(sum);
        b.set_c_flag(carry);
        let block = b.finish(Terminal::ReturnToDispatch);
        let add_id = match sum {
            Value::Inst(id) => id,
            _ => unreachable!(),
        };
        assert!(block.inst(add_id).carry_out.is_some());
        assert_eq!(
            block.inst(block.inst(add_id).carry_out.unwrap()).op,
            Opcode::GetCarryFromOp
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn test_type_mismatch_asserts() {
        let mut b = IrBuilder::new(LocationDescriptor(0));
        // U64 immediate in a U32 slot
        b.add32(Value::U64(1), Value::U32(2), Value::U1(false));
    }
}
