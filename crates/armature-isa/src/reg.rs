//! Guest register newtypes
//!
//! A32 registers are 4-bit indices with R13/R14/R15 aliased to SP/LR/PC.
//! A64 registers are 5-bit indices where index 31 is either the zero
//! register or SP depending on the instruction; the decoder resolves that
//! overload per-row, so the engine never has to know which instructions use
//! which interpretation.

/// An A32 general-purpose register (R0-R15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub const SP: Reg = Reg(13);
    pub const LR: Reg = Reg(14);
    pub const PC: Reg = Reg(15);

    /// Decode from a 4-bit field.
    pub fn from_bits(bits: u32) -> Reg {
        Reg((bits & 0xf) as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_pc(self) -> bool {
        self.0 == 15
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            13 => write!(f, "sp"),
            14 => write!(f, "lr"),
            15 => write!(f, "pc"),
            n => write!(f, "r{}", n),
        }
    }
}

/// An A64 general-purpose register (X0-X30), with the index-31 overload
/// split into distinct ZR and SP values so users never need to know which
/// instructions interpret it which way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XReg(u8);

impl XReg {
    pub const ZR: XReg = XReg(31);
    pub const SP: XReg = XReg(32);

    /// Decode a 5-bit field, interpreting index 31 as the zero register.
    pub fn from_bits_zr(bits: u32) -> XReg {
        XReg((bits & 0x1f) as u8)
    }

    /// Decode a 5-bit field, interpreting index 31 as SP.
    pub fn from_bits_sp(bits: u32) -> XReg {
        let n = (bits & 0x1f) as u8;
        if n == 31 {
            XReg::SP
        } else {
            XReg(n)
        }
    }

    pub fn is_zr(self) -> bool {
        self.0 == 31
    }

    pub fn is_sp(self) -> bool {
        self.0 == 32
    }

    /// Index into the X0-X30 register file. Panics for ZR/SP.
    pub fn index(self) -> usize {
        assert!(self.0 < 31, "ZR/SP have no register file slot");
        self.0 as usize
    }
}

impl std::fmt::Display for XReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            31 => write!(f, "xzr"),
            32 => write!(f, "sp"),
            n => write!(f, "x{}", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a32_aliases() {
        assert_eq!(Reg::from_bits(13), Reg::SP);
        assert_eq!(Reg::from_bits(15), Reg::PC);
        assert!(Reg::from_bits(15).is_pc());
        assert_eq!(format!("{}", Reg(0)), "r0");
        assert_eq!(format!("{}", Reg::LR), "lr");
    }

    #[test]
    fn test_a64_overload_split() {
        assert!(XReg::from_bits_zr(31).is_zr());
        assert!(XReg::from_bits_sp(31).is_sp());
        assert!(!XReg::from_bits_zr(30).is_zr());
        assert_eq!(XReg::from_bits_zr(7).index(), 7);
        assert_eq!(format!("{}", XReg::from_bits_zr(31)), "xzr");
        assert_eq!(format!("{}", XReg::from_bits_sp(31)), "sp");
    }

    #[test]
    #[should_panic]
    fn test_zr_has_no_index() {
        XReg::ZR.index();
    }
}
