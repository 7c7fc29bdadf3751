//! IR values and instructions
//!
//! Values are either immediates or references to the instruction that
//! produced them; instructions live in their block's arena and refer to
//! earlier instructions only (SSA within a block). An instruction producing
//! a side-channel output (carry, overflow) records the back-link to the
//! pseudo-operation consuming that channel, so erasing either side keeps
//! the links consistent.

use armature_isa::Cond;

use super::opcode::{ArgType, Opcode};
use super::types::Type;

/// Index of an instruction within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for InstId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An IR value: an immediate or the result of an earlier instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Inst(InstId),
    U1(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// Guest register reference (argument of Get/SetRegister-family opcodes)
    GuestReg(u8),
    /// Condition immediate
    Cond(Cond),
}

impl Value {
    pub fn is_immediate(self) -> bool {
        !matches!(self, Value::Inst(_))
    }

    /// The immediate as a zero-extended u64. Panics on non-immediates.
    pub fn imm_u64(self) -> u64 {
        match self {
            Value::U1(v) => v as u64,
            Value::U8(v) => v as u64,
            Value::U16(v) => v as u64,
            Value::U32(v) => v as u64,
            Value::U64(v) => v,
            Value::GuestReg(r) => r as u64,
            other => panic!("not a scalar immediate: {:?}", other),
        }
    }

    /// Whether this value satisfies an argument slot of the given kind.
    pub fn matches_arg(self, arg: ArgType, block: &crate::ir::block::Block) -> bool {
        match (arg, self) {
            (ArgType::GuestReg, Value::GuestReg(_)) => true,
            (ArgType::Producer, Value::Inst(_)) => true,
            (ArgType::Value(ty), v) => v.type_of(block) == Some(ty),
            _ => false,
        }
    }

    /// The type of this value, looking producer types up in the block.
    pub fn type_of(self, block: &crate::ir::block::Block) -> Option<Type> {
        match self {
            Value::Inst(id) => Some(block.inst(id).op.info().result),
            Value::U1(_) => Some(Type::U1),
            Value::U8(_) => Some(Type::U8),
            Value::U16(_) => Some(Type::U16),
            Value::U32(_) => Some(Type::U32),
            Value::U64(_) => Some(Type::U64),
            Value::GuestReg(_) | Value::Cond(_) => None,
        }
    }
}

/// Side channels a producer can expose to pseudo-operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideChannel {
    Carry,
    Overflow,
}

/// A single microinstruction.
#[derive(Debug, Clone)]
pub struct Inst {
    pub op: Opcode,
    pub args: Vec<Value>,
    /// Pseudo-operation consuming this instruction's carry channel
    pub carry_out: Option<InstId>,
    /// Pseudo-operation consuming this instruction's overflow channel
    pub overflow_out: Option<InstId>,
}

impl Inst {
    pub fn new(op: Opcode, args: Vec<Value>) -> Inst {
        Inst {
            op,
            args,
            carry_out: None,
            overflow_out: None,
        }
    }

    /// Whether this instruction has been tombstoned by the optimizer.
    pub fn is_void(&self) -> bool {
        self.op == Opcode::Void
    }

    pub fn pseudo_link(&self, channel: SideChannel) -> Option<InstId> {
        match channel {
            SideChannel::Carry => self.carry_out,
            SideChannel::Overflow => self.overflow_out,
        }
    }

    pub fn set_pseudo_link(&mut self, channel: SideChannel, link: Option<InstId>) {
        match channel {
            SideChannel::Carry => self.carry_out = link,
            SideChannel::Overflow => self.overflow_out = link,
        }
    }

    /// Turn this instruction into a tombstone, dropping args and links.
    pub fn make_void(&mut self) {
        self.op = Opcode::Void;
        self.args.clear();
        self.carry_out = None;
        self.overflow_out = None;
    }
}
