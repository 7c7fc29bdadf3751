//! Thumb-16 decode table
//!
//! 16-bit encodings only. The same first-match-wins rules as the A32 table;
//! SVC and UDF are declared before the conditional branch row because they
//! occupy the two condition values the branch row must not take.

use once_cell::sync::Lazy;

use crate::bits::bits;
use crate::cond::Cond;
use crate::matcher::{DecodeTable, Matcher};
use crate::reg::Reg;

/// Opcodes of the Thumb data-processing (register) group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbAluOp {
    And,
    Eor,
    Lsl,
    Lsr,
    Asr,
    Adc,
    Sbc,
    Ror,
    Tst,
    Rsb,
    Cmp,
    Cmn,
    Orr,
    Mul,
    Bic,
    Mvn,
}

impl ThumbAluOp {
    pub fn from_bits(bits: u32) -> ThumbAluOp {
        match bits & 0xf {
            0x0 => ThumbAluOp::And,
            0x1 => ThumbAluOp::Eor,
            0x2 => ThumbAluOp::Lsl,
            0x3 => ThumbAluOp::Lsr,
            0x4 => ThumbAluOp::Asr,
            0x5 => ThumbAluOp::Adc,
            0x6 => ThumbAluOp::Sbc,
            0x7 => ThumbAluOp::Ror,
            0x8 => ThumbAluOp::Tst,
            0x9 => ThumbAluOp::Rsb,
            0xa => ThumbAluOp::Cmp,
            0xb => ThumbAluOp::Cmn,
            0xc => ThumbAluOp::Orr,
            0xd => ThumbAluOp::Mul,
            0xe => ThumbAluOp::Bic,
            _ => ThumbAluOp::Mvn,
        }
    }
}

/// A decoded Thumb-16 instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThumbInstr {
    /// LSL/LSR/ASR with 5-bit immediate shift (flag-setting).
    ShiftImm { op: ThumbAluOp, imm5: u32, m: Reg, d: Reg },
    AddReg { m: Reg, n: Reg, d: Reg },
    SubReg { m: Reg, n: Reg, d: Reg },
    AddImm3 { imm3: u32, n: Reg, d: Reg },
    SubImm3 { imm3: u32, n: Reg, d: Reg },
    MovImm8 { d: Reg, imm8: u32 },
    CmpImm8 { n: Reg, imm8: u32 },
    AddImm8 { d: Reg, imm8: u32 },
    SubImm8 { d: Reg, imm8: u32 },
    AluReg { op: ThumbAluOp, m: Reg, d: Reg },
    AddHi { m: Reg, d: Reg },
    CmpHi { m: Reg, n: Reg },
    MovHi { m: Reg, d: Reg },
    Bx { m: Reg },
    BlxReg { m: Reg },
    LdrLit { t: Reg, imm8: u32 },
    StrImm5 { imm5: u32, n: Reg, t: Reg },
    LdrImm5 { imm5: u32, n: Reg, t: Reg },
    StrbImm5 { imm5: u32, n: Reg, t: Reg },
    LdrbImm5 { imm5: u32, n: Reg, t: Reg },
    StrhImm5 { imm5: u32, n: Reg, t: Reg },
    LdrhImm5 { imm5: u32, n: Reg, t: Reg },
    Hint { op: u32 },
    BCond { cond: Cond, imm8: u32 },
    B { imm11: u32 },
    Svc { imm8: u32 },
    Udf { word: u16 },
}

fn w32(w: u16) -> u32 {
    w as u32
}

fn reg3(w: u16, lo: u32) -> Reg {
    Reg::from_bits(bits(w32(w), lo, 3))
}

/// The Thumb-16 decode table, built once.
pub static THUMB_TABLE: Lazy<DecodeTable<u16, ThumbInstr>> = Lazy::new(|| {
    use ThumbInstr::*;
    DecodeTable::new(vec![
        // Shift-by-immediate rows; 00000 with imm5=0 is MOV (reg), which the
        // lifter gets for free since LSL #0 is the identity.
        Matcher::new("LSL (imm)", "00000iiiiimmmddd", |w| ShiftImm {
            op: ThumbAluOp::Lsl, imm5: bits(w32(w), 6, 5), m: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("LSR (imm)", "00001iiiiimmmddd", |w| ShiftImm {
            op: ThumbAluOp::Lsr, imm5: bits(w32(w), 6, 5), m: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("ASR (imm)", "00010iiiiimmmddd", |w| ShiftImm {
            op: ThumbAluOp::Asr, imm5: bits(w32(w), 6, 5), m: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("ADD (reg)", "0001100mmmnnnddd", |w| AddReg {
            m: reg3(w, 6), n: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("SUB (reg)", "0001101mmmnnnddd", |w| SubReg {
            m: reg3(w, 6), n: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("ADD (imm3)", "0001110iiinnnddd", |w| AddImm3 {
            imm3: bits(w32(w), 6, 3), n: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("SUB (imm3)", "0001111iiinnnddd", |w| SubImm3 {
            imm3: bits(w32(w), 6, 3), n: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("MOV (imm8)", "00100dddiiiiiiii", |w| MovImm8 {
            d: reg3(w, 8), imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("CMP (imm8)", "00101nnniiiiiiii", |w| CmpImm8 {
            n: reg3(w, 8), imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("ADD (imm8)", "00110dddiiiiiiii", |w| AddImm8 {
            d: reg3(w, 8), imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("SUB (imm8)", "00111dddiiiiiiii", |w| SubImm8 {
            d: reg3(w, 8), imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("data processing (reg)", "010000oooommmddd", |w| AluReg {
            op: ThumbAluOp::from_bits(bits(w32(w), 6, 4)), m: reg3(w, 3), d: reg3(w, 0),
        }),
        Matcher::new("ADD (hi)", "01000100dmmmmddd", |w| AddHi {
            m: Reg::from_bits(bits(w32(w), 3, 4)),
            d: Reg::from_bits((bits(w32(w), 7, 1) << 3) | bits(w32(w), 0, 3)),
        }),
        Matcher::new("CMP (hi)", "01000101nmmmmnnn", |w| CmpHi {
            m: Reg::from_bits(bits(w32(w), 3, 4)),
            n: Reg::from_bits((bits(w32(w), 7, 1) << 3) | bits(w32(w), 0, 3)),
        }),
        Matcher::new("MOV (hi)", "01000110dmmmmddd", |w| MovHi {
            m: Reg::from_bits(bits(w32(w), 3, 4)),
            d: Reg::from_bits((bits(w32(w), 7, 1) << 3) | bits(w32(w), 0, 3)),
        }),
        Matcher::new("BX", "010001110mmmm000", |w| Bx {
            m: Reg::from_bits(bits(w32(w), 3, 4)),
        }),
        Matcher::new("BLX (reg)", "010001111mmmm000", |w| BlxReg {
            m: Reg::from_bits(bits(w32(w), 3, 4)),
        }),
        Matcher::new("LDR (literal)", "01001tttiiiiiiii", |w| LdrLit {
            t: reg3(w, 8), imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("STR (imm5)", "01100iiiiinnnttt", |w| StrImm5 {
            imm5: bits(w32(w), 6, 5), n: reg3(w, 3), t: reg3(w, 0),
        }),
        Matcher::new("LDR (imm5)", "01101iiiiinnnttt", |w| LdrImm5 {
            imm5: bits(w32(w), 6, 5), n: reg3(w, 3), t: reg3(w, 0),
        }),
        Matcher::new("STRB (imm5)", "01110iiiiinnnttt", |w| StrbImm5 {
            imm5: bits(w32(w), 6, 5), n: reg3(w, 3), t: reg3(w, 0),
        }),
        Matcher::new("LDRB (imm5)", "01111iiiiinnnttt", |w| LdrbImm5 {
            imm5: bits(w32(w), 6, 5), n: reg3(w, 3), t: reg3(w, 0),
        }),
        Matcher::new("STRH (imm5)", "10000iiiiinnnttt", |w| StrhImm5 {
            imm5: bits(w32(w), 6, 5), n: reg3(w, 3), t: reg3(w, 0),
        }),
        Matcher::new("LDRH (imm5)", "10001iiiiinnnttt", |w| LdrhImm5 {
            imm5: bits(w32(w), 6, 5), n: reg3(w, 3), t: reg3(w, 0),
        }),
        Matcher::new("hints", "10111111oooo0000", |w| Hint {
            op: bits(w32(w), 4, 4),
        }),
        Matcher::new("UDF", "11011110iiiiiiii", |w| Udf { word: w }),
        Matcher::new("SVC", "11011111iiiiiiii", |w| Svc {
            imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("B (cond)", "1101cccciiiiiiii", |w| BCond {
            cond: Cond::from_bits(bits(w32(w), 8, 4)),
            imm8: bits(w32(w), 0, 8),
        }),
        Matcher::new("B", "11100iiiiiiiiiii", |w| B {
            imm11: bits(w32(w), 0, 11),
        }),
        // ---- Sentinel ----
        Matcher::new("undefined (sentinel)", "vvvvvvvvvvvvvvvv", |w| Udf { word: w }),
    ])
});
