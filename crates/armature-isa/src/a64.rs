//! A64 decode table
//!
//! Fixed 32-bit encodings, no condition field. The A64 space is cleaner than
//! A32 so there is less ordering pressure, but system rows (barriers, hints,
//! CLREX) still precede nothing that overlaps them and the sentinel closes
//! the table. Register fields are resolved to ZR or SP per-row, so consumers
//! never re-interpret index 31.

use once_cell::sync::Lazy;

use crate::bits::{bit, bits, decode_bit_masks};
use crate::cond::Cond;
use crate::matcher::{DecodeTable, Matcher};
use crate::reg::XReg;

/// Shift applied to a shifted-register operand (ROR is reserved for
/// add/subtract forms; the decoder hands it through and the lifter rejects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A64Shift {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl A64Shift {
    pub fn from_bits(bits: u32) -> A64Shift {
        match bits & 3 {
            0 => A64Shift::Lsl,
            1 => A64Shift::Lsr,
            2 => A64Shift::Asr,
            _ => A64Shift::Ror,
        }
    }
}

/// Logical opcode group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Orr,
    Eor,
    Ands,
}

impl LogicalOp {
    pub fn from_bits(bits: u32) -> LogicalOp {
        match bits & 3 {
            0 => LogicalOp::And,
            1 => LogicalOp::Orr,
            2 => LogicalOp::Eor,
            _ => LogicalOp::Ands,
        }
    }
}

/// Move-wide opcode group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovWideOp {
    Movn,
    Movz,
    Movk,
}

/// A decoded A64 instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum A64Instr {
    AddSubImm { sf: bool, sub: bool, set_flags: bool, imm12: u32, shift12: bool, n: XReg, d: XReg },
    AddSubShifted { sf: bool, sub: bool, set_flags: bool, shift: A64Shift, m: XReg, imm6: u32, n: XReg, d: XReg },
    LogicalShifted { sf: bool, op: LogicalOp, invert: bool, shift: A64Shift, m: XReg, imm6: u32, n: XReg, d: XReg },
    /// Logical immediate with the bitmask already decoded; None means the
    /// encoding is reserved and lifts to undefined.
    LogicalImm { sf: bool, op: LogicalOp, imm: Option<u64>, n: XReg, d: XReg },
    MovWide { sf: bool, op: MovWideOp, hw: u32, imm16: u32, d: XReg },
    Madd { sf: bool, sub: bool, m: XReg, a: XReg, n: XReg, d: XReg },

    B { imm26: u32 },
    Bl { imm26: u32 },
    BCond { imm19: u32, cond: Cond },
    Cbz { sf: bool, imm19: u32, t: XReg },
    Cbnz { sf: bool, imm19: u32, t: XReg },
    Br { n: XReg },
    Blr { n: XReg },
    Ret { n: XReg },

    /// LDR/STR with scaled unsigned 12-bit offset; size is log2(bytes).
    LdrStrImm { size: u32, load: bool, imm12: u32, n: XReg, t: XReg },
    Ldxr { size: u32, n: XReg, t: XReg },
    Stxr { size: u32, s: XReg, n: XReg, t: XReg },
    Clrex,
    Dmb { option: u32 },
    Dsb { option: u32 },
    Isb { option: u32 },

    Svc { imm16: u32 },
    Brk { imm16: u32 },
    Hint { op: u32 },

    Udf { word: u32 },
}

fn zr(w: u32, lo: u32) -> XReg {
    XReg::from_bits_zr(bits(w, lo, 5))
}

fn sp(w: u32, lo: u32) -> XReg {
    XReg::from_bits_sp(bits(w, lo, 5))
}

/// The A64 decode table, built once.
pub static A64_TABLE: Lazy<DecodeTable<u32, A64Instr>> = Lazy::new(|| {
    use A64Instr::*;
    DecodeTable::new(vec![
        // ---- System ----
        Matcher::new("NOP/hints", "110101010000001100100000ooo11111", |w| Hint { op: bits(w, 5, 3) }),
        Matcher::new("CLREX", "11010101000000110011mmmm01011111", |_| Clrex),
        Matcher::new("DSB", "11010101000000110011mmmm10011111", |w| Dsb { option: bits(w, 8, 4) }),
        Matcher::new("DMB", "11010101000000110011mmmm10111111", |w| Dmb { option: bits(w, 8, 4) }),
        Matcher::new("ISB", "11010101000000110011mmmm11011111", |w| Isb { option: bits(w, 8, 4) }),
        Matcher::new("SVC", "11010100000iiiiiiiiiiiiiiii00001", |w| Svc { imm16: bits(w, 5, 16) }),
        Matcher::new("BRK", "11010100001iiiiiiiiiiiiiiii00000", |w| Brk { imm16: bits(w, 5, 16) }),

        // ---- Branches ----
        Matcher::new("RET", "1101011001011111000000nnnnn00000", |w| Ret { n: zr(w, 5) }),
        Matcher::new("BR", "1101011000011111000000nnnnn00000", |w| Br { n: zr(w, 5) }),
        Matcher::new("BLR", "1101011000111111000000nnnnn00000", |w| Blr { n: zr(w, 5) }),
        Matcher::new("B", "000101iiiiiiiiiiiiiiiiiiiiiiiiii", |w| B { imm26: bits(w, 0, 26) }),
        Matcher::new("BL", "100101iiiiiiiiiiiiiiiiiiiiiiiiii", |w| Bl { imm26: bits(w, 0, 26) }),
        Matcher::new("B.cond", "01010100iiiiiiiiiiiiiiiiiii0cccc", |w| BCond {
            imm19: bits(w, 5, 19), cond: Cond::from_bits(bits(w, 0, 4)),
        }),
        Matcher::new("CBZ", "s0110100iiiiiiiiiiiiiiiiiiittttt", |w| Cbz {
            sf: bit(w, 31), imm19: bits(w, 5, 19), t: zr(w, 0),
        }),
        Matcher::new("CBNZ", "s0110101iiiiiiiiiiiiiiiiiiittttt", |w| Cbnz {
            sf: bit(w, 31), imm19: bits(w, 5, 19), t: zr(w, 0),
        }),

        // ---- Data processing (immediate) ----
        Matcher::new("ADD/SUB (imm)", "sos100010hiiiiiiiiiiiinnnnnddddd", |w| {
            let set_flags = bit(w, 29);
            AddSubImm {
                sf: bit(w, 31),
                sub: bit(w, 30),
                set_flags,
                shift12: bit(w, 22),
                imm12: bits(w, 10, 12),
                n: sp(w, 5),
                d: if set_flags { zr(w, 0) } else { sp(w, 0) },
            }
        }),
        Matcher::new("logical (imm)", "soo100100wrrrrrrssssssnnnnnddddd", |w| {
            let sf = bit(w, 31);
            let op = LogicalOp::from_bits(bits(w, 29, 2));
            let n_bit = bit(w, 22);
            // N=1 with 32-bit regs is reserved
            let imm = if n_bit && !sf {
                None
            } else {
                decode_bit_masks(n_bit, bits(w, 16, 6), bits(w, 10, 6), if sf { 64 } else { 32 })
            };
            LogicalImm {
                sf,
                op,
                imm,
                n: zr(w, 5),
                d: if op == LogicalOp::Ands { zr(w, 0) } else { sp(w, 0) },
            }
        }),
        Matcher::new("MOVN/MOVZ/MOVK", "soo100101hhiiiiiiiiiiiiiiiiddddd", |w| {
            let op = match bits(w, 29, 2) {
                0b00 => MovWideOp::Movn,
                0b10 => MovWideOp::Movz,
                0b11 => MovWideOp::Movk,
                // opc 01 is unallocated
                _ => return Udf { word: w },
            };
            MovWide {
                sf: bit(w, 31),
                op,
                hw: bits(w, 21, 2),
                imm16: bits(w, 5, 16),
                d: zr(w, 0),
            }
        }),

        // ---- Data processing (register) ----
        Matcher::new("ADD/SUB (shifted)", "sos01011tt0mmmmmiiiiiinnnnnddddd", |w| AddSubShifted {
            sf: bit(w, 31),
            sub: bit(w, 30),
            set_flags: bit(w, 29),
            shift: A64Shift::from_bits(bits(w, 22, 2)),
            m: zr(w, 16),
            imm6: bits(w, 10, 6),
            n: zr(w, 5),
            d: zr(w, 0),
        }),
        Matcher::new("logical (shifted)", "soo01010ttummmmmiiiiiinnnnnddddd", |w| LogicalShifted {
            sf: bit(w, 31),
            op: LogicalOp::from_bits(bits(w, 29, 2)),
            invert: bit(w, 21),
            shift: A64Shift::from_bits(bits(w, 22, 2)),
            m: zr(w, 16),
            imm6: bits(w, 10, 6),
            n: zr(w, 5),
            d: zr(w, 0),
        }),
        Matcher::new("MADD/MSUB", "s0011011000mmmmmoaaaaannnnnddddd", |w| Madd {
            sf: bit(w, 31),
            sub: bit(w, 15),
            m: zr(w, 16),
            a: zr(w, 10),
            n: zr(w, 5),
            d: zr(w, 0),
        }),

        // ---- Loads and stores ----
        Matcher::new("LDR/STR (unsigned imm)", "ss1110010liiiiiiiiiiiinnnnnttttt", |w| LdrStrImm {
            size: bits(w, 30, 2),
            load: bit(w, 22),
            imm12: bits(w, 10, 12),
            n: sp(w, 5),
            t: zr(w, 0),
        }),
        Matcher::new("LDXR", "ss00100001011111011111nnnnnttttt", |w| Ldxr {
            size: bits(w, 30, 2),
            n: sp(w, 5),
            t: zr(w, 0),
        }),
        Matcher::new("STXR", "ss001000000sssss011111nnnnnttttt", |w| Stxr {
            size: bits(w, 30, 2),
            s: zr(w, 16),
            n: sp(w, 5),
            t: zr(w, 0),
        }),

        // ---- Sentinel ----
        Matcher::new("undefined (sentinel)", "vvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvv", |w| Udf { word: w }),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(word: u32) -> A64Instr {
        A64_TABLE.decode(word)
    }

    #[test]
    fn test_add_shifted() {
        // ADD X0, X1, X2 = 8B020020
        match decode(0x8b02_0020) {
            A64Instr::AddSubShifted { sf: true, sub: false, set_flags: false, shift: A64Shift::Lsl, m, imm6: 0, n, d } => {
                assert_eq!(m.index(), 2);
                assert_eq!(n.index(), 1);
                assert_eq!(d.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_adds_sets_flags() {
        // ADDS X0, X1, X2 = AB020020
        assert!(matches!(
            decode(0xab02_0020),
            A64Instr::AddSubShifted { set_flags: true, .. }
        ));
        // SUBS X0, X1, X2 = EB020020
        assert!(matches!(
            decode(0xeb02_0020),
            A64Instr::AddSubShifted { sub: true, set_flags: true, .. }
        ));
    }

    #[test]
    fn test_add_imm() {
        // ADD X0, X1, #42 = 9100A820
        match decode(0x9100_a820) {
            A64Instr::AddSubImm { sf: true, sub: false, set_flags: false, imm12: 42, shift12: false, n, d } => {
                assert_eq!(n.index(), 1);
                assert_eq!(d.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_movz() {
        // MOVZ X0, #1 = D2800020
        match decode(0xd280_0020) {
            A64Instr::MovWide { sf: true, op: MovWideOp::Movz, hw: 0, imm16: 1, d } => {
                assert_eq!(d.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_logical_imm() {
        // ORR X0, XZR, #1 = B24003E0
        match decode(0xb240_03e0) {
            A64Instr::LogicalImm { sf: true, op: LogicalOp::Orr, imm: Some(1), n, d } => {
                assert!(n.is_zr());
                assert_eq!(d.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_ret() {
        // RET (x30) = D65F03C0
        match decode(0xd65f_03c0) {
            A64Instr::Ret { n } => assert_eq!(n.index(), 30),
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_branches() {
        // B +4 = 14000001
        assert!(matches!(decode(0x1400_0001), A64Instr::B { imm26: 1 }));
        // BL +4 = 94000001
        assert!(matches!(decode(0x9400_0001), A64Instr::Bl { imm26: 1 }));
        // B.EQ +8 = 54000040
        assert!(matches!(
            decode(0x5400_0040),
            A64Instr::BCond { imm19: 2, cond: Cond::Eq }
        ));
        // CBZ X0, +8 = B4000040
        assert!(matches!(decode(0xb400_0040), A64Instr::Cbz { sf: true, imm19: 2, .. }));
    }

    #[test]
    fn test_ldr_str() {
        // LDR X0, [X1, #8] = F9400420
        match decode(0xf940_0420) {
            A64Instr::LdrStrImm { size: 3, load: true, imm12: 1, n, t } => {
                assert_eq!(n.index(), 1);
                assert_eq!(t.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
        // STR W0, [X1] = B9000020
        assert!(matches!(
            decode(0xb900_0020),
            A64Instr::LdrStrImm { size: 2, load: false, imm12: 0, .. }
        ));
    }

    #[test]
    fn test_exclusives() {
        // LDXR X0, [X1] = C85F7C20
        match decode(0xc85f_7c20) {
            A64Instr::Ldxr { size: 3, n, t } => {
                assert_eq!(n.index(), 1);
                assert_eq!(t.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
        // STXR W2, X3, [X1] = C8027C23
        match decode(0xc802_7c23) {
            A64Instr::Stxr { size: 3, s, n, t } => {
                assert_eq!(s.index(), 2);
                assert_eq!(n.index(), 1);
                assert_eq!(t.index(), 3);
            }
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_system() {
        // NOP = D503201F
        assert!(matches!(decode(0xd503_201f), A64Instr::Hint { op: 0 }));
        // SVC #0 = D4000001
        assert!(matches!(decode(0xd400_0001), A64Instr::Svc { imm16: 0 }));
        // BRK #1 = D4200020
        assert!(matches!(decode(0xd420_0020), A64Instr::Brk { imm16: 1 }));
        // DMB ISH = D5033BBF
        assert!(matches!(decode(0xd503_3bbf), A64Instr::Dmb { option: 0xb }));
    }

    #[test]
    fn test_mul() {
        // MUL X0, X1, X2 = 9B027C20 (MADD with XZR accumulator)
        match decode(0x9b02_7c20) {
            A64Instr::Madd { sf: true, sub: false, m, a, n, d } => {
                assert_eq!(m.index(), 2);
                assert!(a.is_zr());
                assert_eq!(n.index(), 1);
                assert_eq!(d.index(), 0);
            }
            other => panic!("bad decode: {:?}", other),
        }
    }

    #[test]
    fn test_undefined() {
        assert!(matches!(decode(0x0000_0000), A64Instr::Udf { .. }));
        assert_eq!(A64_TABLE.lookup(0).name(), "undefined (sentinel)");
    }
}
