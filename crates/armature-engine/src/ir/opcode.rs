//! IR opcodes
//!
//! Every microinstruction opcode is listed exactly once in the `opcodes!`
//! invocation below, together with its result type, argument types, and
//! attributes. The optimizer's side-effect queries, the type checker, and
//! the backend's per-opcode dispatch all derive from this single table, so
//! adding an opcode without updating every consumer fails to compile (the
//! backend matches exhaustively, without a wildcard arm).
//!
//! Argument type `Gr` is a guest register reference immediate; `In` is a
//! reference to a producing instruction (used only by the pseudo-operations
//! that read a producer's side channel).

use super::types::Type;

/// Attributes an opcode can carry.
///
/// `se`: observable side effect, never dead-code eliminated.
/// `pseudo`: companion instruction reading a producer's side channel.
/// `memory`: guest memory access (implies ordering constraints and `se`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub result: Type,
    pub args: &'static [ArgType],
    pub side_effects: bool,
    pub pseudo: bool,
    pub memory: bool,
}

/// Expected kind of each argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// A value of the given type (immediate or instruction result)
    Value(Type),
    /// A guest register reference
    GuestReg,
    /// A reference to a producer instruction (pseudo-operations)
    Producer,
}

macro_rules! opcodes {
    ($( $name:ident { result: $res:ident, args: [$($arg:expr),*] $(, $attr:ident)* } )*) => {
        /// An IR microinstruction opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub fn info(self) -> &'static OpInfo {
                match self {
                    $(Opcode::$name => {
                        const INFO: OpInfo = OpInfo {
                            result: Type::$res,
                            args: &[$($arg),*],
                            side_effects: opcodes!(@has_se $($attr)*),
                            pseudo: opcodes!(@has_pseudo $($attr)*),
                            memory: opcodes!(@has_mem $($attr)*),
                        };
                        &INFO
                    })*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
    (@has_se) => { false };
    (@has_se se $($rest:ident)*) => { true };
    (@has_se memory $($rest:ident)*) => { true };
    (@has_se $other:ident $($rest:ident)*) => { opcodes!(@has_se $($rest)*) };
    (@has_pseudo) => { false };
    (@has_pseudo pseudo $($rest:ident)*) => { true };
    (@has_pseudo $other:ident $($rest:ident)*) => { opcodes!(@has_pseudo $($rest)*) };
    (@has_mem) => { false };
    (@has_mem memory $($rest:ident)*) => { true };
    (@has_mem $other:ident $($rest:ident)*) => { opcodes!(@has_mem $($rest)*) };
}

use ArgType::GuestReg as AGr;
use ArgType::Producer as AIn;
const A1: ArgType = ArgType::Value(Type::U1);
const A8: ArgType = ArgType::Value(Type::U8);
const A32V: ArgType = ArgType::Value(Type::U32);
const A64V: ArgType = ArgType::Value(Type::U64);
const A128: ArgType = ArgType::Value(Type::U128);
const A16: ArgType = ArgType::Value(Type::U16);

opcodes! {
    // Tombstone left behind by dead-code elimination
    Void { result: Void, args: [] }

    // ---- Guest register and flag access ----
    GetRegister { result: U32, args: [AGr] }
    SetRegister { result: Void, args: [AGr, A32V], se }
    GetRegister64 { result: U64, args: [AGr] }
    SetRegister64 { result: Void, args: [AGr, A64V], se }
    GetVector { result: U128, args: [AGr] }
    SetVector { result: Void, args: [AGr, A128], se }
    GetNFlag { result: U1, args: [] }
    SetNFlag { result: Void, args: [A1], se }
    GetZFlag { result: U1, args: [] }
    SetZFlag { result: Void, args: [A1], se }
    GetCFlag { result: U1, args: [] }
    SetCFlag { result: Void, args: [A1], se }
    GetVFlag { result: U1, args: [] }
    SetVFlag { result: Void, args: [A1], se }
    OrQFlag { result: Void, args: [A1], se }
    SetTFlag { result: Void, args: [A1], se }
    SetCheckBit { result: Void, args: [A1], se }

    // ---- Pseudo-operations (side-channel readers) ----
    GetCarryFromOp { result: U1, args: [AIn], pseudo }
    GetOverflowFromOp { result: U1, args: [AIn], pseudo }

    // ---- Integer arithmetic ----
    Add32 { result: U32, args: [A32V, A32V, A1] }
    Add64 { result: U64, args: [A64V, A64V, A1] }
    Sub32 { result: U32, args: [A32V, A32V, A1] }
    Sub64 { result: U64, args: [A64V, A64V, A1] }
    Mul32 { result: U32, args: [A32V, A32V] }
    Mul64 { result: U64, args: [A64V, A64V] }
    SignedMultiplyLong { result: U64, args: [A32V, A32V] }
    UnsignedMultiplyLong { result: U64, args: [A32V, A32V] }

    // ---- Bitwise ----
    And32 { result: U32, args: [A32V, A32V] }
    And64 { result: U64, args: [A64V, A64V] }
    Or32 { result: U32, args: [A32V, A32V] }
    Or64 { result: U64, args: [A64V, A64V] }
    Eor32 { result: U32, args: [A32V, A32V] }
    Eor64 { result: U64, args: [A64V, A64V] }
    Not32 { result: U32, args: [A32V] }
    Not64 { result: U64, args: [A64V] }
    CountLeadingZeros32 { result: U32, args: [A32V] }

    // ---- Shifts (32-bit forms carry the A32 shifter carry-out channel) ----
    LogicalShiftLeft32 { result: U32, args: [A32V, A8, A1] }
    LogicalShiftRight32 { result: U32, args: [A32V, A8, A1] }
    ArithmeticShiftRight32 { result: U32, args: [A32V, A8, A1] }
    RotateRight32 { result: U32, args: [A32V, A8, A1] }
    RotateRightExtended { result: U32, args: [A32V, A1] }
    LogicalShiftLeft64 { result: U64, args: [A64V, A8] }
    LogicalShiftRight64 { result: U64, args: [A64V, A8] }
    ArithmeticShiftRight64 { result: U64, args: [A64V, A8] }

    // ---- Extension and extraction ----
    SignExtend8To32 { result: U32, args: [A8] }
    SignExtend16To32 { result: U32, args: [A16] }
    ZeroExtend8To32 { result: U32, args: [A8] }
    ZeroExtend16To32 { result: U32, args: [A16] }
    SignExtend32To64 { result: U64, args: [A32V] }
    ZeroExtend32To64 { result: U64, args: [A32V] }
    LeastSignificantWord { result: U32, args: [A64V] }
    MostSignificantWord { result: U32, args: [A64V] }
    LeastSignificantByte { result: U8, args: [A32V] }
    LeastSignificantHalf { result: U16, args: [A32V] }
    MostSignificantBit32 { result: U1, args: [A32V] }
    MostSignificantBit64 { result: U1, args: [A64V] }
    IsZero32 { result: U1, args: [A32V] }
    IsZero64 { result: U1, args: [A64V] }
    TestBit32 { result: U1, args: [A32V, A8] }

    // ---- Saturating arithmetic (overflow channel is the Q bit) ----
    SignedSaturatedAdd8 { result: U8, args: [A8, A8] }
    SignedSaturatedAdd16 { result: U16, args: [A16, A16] }
    SignedSaturatedAdd32 { result: U32, args: [A32V, A32V] }
    SignedSaturatedAdd64 { result: U64, args: [A64V, A64V] }
    SignedSaturatedSub8 { result: U8, args: [A8, A8] }
    SignedSaturatedSub16 { result: U16, args: [A16, A16] }
    SignedSaturatedSub32 { result: U32, args: [A32V, A32V] }
    SignedSaturatedSub64 { result: U64, args: [A64V, A64V] }
    UnsignedSaturatedAdd8 { result: U8, args: [A8, A8] }
    UnsignedSaturatedAdd16 { result: U16, args: [A16, A16] }
    UnsignedSaturatedAdd32 { result: U32, args: [A32V, A32V] }
    UnsignedSaturatedAdd64 { result: U64, args: [A64V, A64V] }
    UnsignedSaturatedSub8 { result: U8, args: [A8, A8] }
    UnsignedSaturatedSub16 { result: U16, args: [A16, A16] }
    UnsignedSaturatedSub32 { result: U32, args: [A32V, A32V] }
    UnsignedSaturatedSub64 { result: U64, args: [A64V, A64V] }
    SignedSaturatedDouble32 { result: U32, args: [A32V] }
    SignedSaturatedDoublingMultiplyHigh16 { result: U16, args: [A16, A16] }
    SignedSaturatedDoublingMultiplyHigh32 { result: U32, args: [A32V, A32V] }
    SignedSaturation { result: U32, args: [A32V, A8] }
    UnsignedSaturation { result: U32, args: [A32V, A8] }

    // ---- Guest memory ----
    ReadMemory8 { result: U8, args: [A64V], memory }
    ReadMemory16 { result: U16, args: [A64V], memory }
    ReadMemory32 { result: U32, args: [A64V], memory }
    ReadMemory64 { result: U64, args: [A64V], memory }
    WriteMemory8 { result: Void, args: [A64V, A8], memory }
    WriteMemory16 { result: Void, args: [A64V, A16], memory }
    WriteMemory32 { result: Void, args: [A64V, A32V], memory }
    WriteMemory64 { result: Void, args: [A64V, A64V], memory }
    ExclusiveReadMemory8 { result: U8, args: [A64V], memory }
    ExclusiveReadMemory16 { result: U16, args: [A64V], memory }
    ExclusiveReadMemory32 { result: U32, args: [A64V], memory }
    ExclusiveReadMemory64 { result: U64, args: [A64V], memory }
    ExclusiveWriteMemory8 { result: U32, args: [A64V, A8], memory }
    ExclusiveWriteMemory16 { result: U32, args: [A64V, A16], memory }
    ExclusiveWriteMemory32 { result: U32, args: [A64V, A32V], memory }
    ExclusiveWriteMemory64 { result: U32, args: [A64V, A64V], memory }
    ClearExclusive { result: Void, args: [], se }

    // ---- Barriers ----
    DataMemoryBarrier { result: Void, args: [], se }
    DataSynchronizationBarrier { result: Void, args: [], se }
    InstructionSynchronizationBarrier { result: Void, args: [], se }

    // ---- System ----
    CallSupervisor { result: Void, args: [A32V], se }
    ExceptionRaised { result: Void, args: [A64V, A32V], se }
    PushRSB { result: Void, args: [A64V], se }
    CoprocCallbackWord { result: U32, args: [A32V, A32V, A32V], se }
    CoprocCallbackDouble { result: U64, args: [A32V, A32V, A32V], se }
    ReadHostWord { result: U32, args: [A64V], se }
    WriteHostWord { result: Void, args: [A64V, A32V], se }

    // ---- AES ----
    AESEncryptSingleRound { result: U128, args: [A128] }
    AESDecryptSingleRound { result: U128, args: [A128] }
    AESMixColumns { result: U128, args: [A128] }
    AESInverseMixColumns { result: U128, args: [A128] }
}

impl Opcode {
    /// Whether the optimizer may remove an unused instance of this opcode.
    pub fn removable(self) -> bool {
        !self.info().side_effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_basic() {
        let add = Opcode::Add32.info();
        assert_eq!(add.result, Type::U32);
        assert_eq!(add.args.len(), 3);
        assert!(!add.side_effects);

        let set = Opcode::SetRegister.info();
        assert_eq!(set.result, Type::Void);
        assert!(set.side_effects);
    }

    #[test]
    fn test_memory_implies_side_effects() {
        assert!(Opcode::ReadMemory32.info().memory);
        assert!(Opcode::ReadMemory32.info().side_effects);
        assert!(Opcode::WriteMemory8.info().side_effects);
    }

    #[test]
    fn test_pseudo_ops() {
        assert!(Opcode::GetCarryFromOp.info().pseudo);
        assert!(Opcode::GetOverflowFromOp.info().pseudo);
        assert!(!Opcode::Add32.info().pseudo);
    }

    #[test]
    fn test_names() {
        assert_eq!(Opcode::Add32.name(), "Add32");
        assert_eq!(Opcode::SignedSaturatedAdd32.name(), "SignedSaturatedAdd32");
    }
}
