//! Location descriptors
//!
//! A location descriptor is the cache key for translated code: the program
//! counter plus every architectural bit that changes code generation. Two
//! guest states that must compile differently hash differently; states that
//! may share host code compare equal. The packing is part of the emitted-code
//! ABI: block epilogues rebuild the current descriptor from `JitState` fields
//! with shifts and ORs, so the layout here and in the emitter must agree.

/// Opaque, exact-equality key identifying a guest execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationDescriptor(pub u64);

impl LocationDescriptor {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LocationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{:#x}}}", self.0)
    }
}

/// Bit positions shared with emitted code. PC occupies the low word for A32;
/// A64 packs a 56-bit PC with mode bits above it.
pub mod a32 {
    use super::LocationDescriptor;

    pub const T_BIT: u32 = 32;
    pub const E_BIT: u32 = 33;
    pub const STEP_BIT: u32 = 34;
    pub const FPSCR_SHIFT: u32 = 40;
    /// FPSCR bits that affect code generation (rounding mode, flush-to-zero,
    /// default NaN, vector stride/length).
    pub const FPSCR_MODE_MASK: u32 = 0x07f7_0000;

    /// An unpacked A32 location.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct A32Location {
        pub pc: u32,
        pub thumb: bool,
        pub big_endian: bool,
        pub single_step: bool,
        pub fpscr_mode: u32,
    }

    impl A32Location {
        pub fn new(pc: u32) -> A32Location {
            A32Location {
                pc,
                thumb: false,
                big_endian: false,
                single_step: false,
                fpscr_mode: 0,
            }
        }

        pub fn with_thumb(mut self, thumb: bool) -> A32Location {
            self.thumb = thumb;
            self
        }

        pub fn with_single_step(mut self, step: bool) -> A32Location {
            self.single_step = step;
            self
        }

        pub fn with_fpscr(mut self, fpscr: u32) -> A32Location {
            self.fpscr_mode = fpscr & FPSCR_MODE_MASK;
            self
        }

        pub fn advance(self, bytes: u32) -> A32Location {
            A32Location {
                pc: self.pc.wrapping_add(bytes),
                ..self
            }
        }

        /// The instruction width in bytes for this mode.
        pub fn instruction_size(self) -> u32 {
            if self.thumb {
                2
            } else {
                4
            }
        }

        pub fn descriptor(self) -> LocationDescriptor {
            LocationDescriptor(
                self.pc as u64
                    | (self.thumb as u64) << T_BIT
                    | (self.big_endian as u64) << E_BIT
                    | (self.single_step as u64) << STEP_BIT
                    | ((self.fpscr_mode >> 16) as u64) << FPSCR_SHIFT,
            )
        }

        pub fn from_descriptor(desc: LocationDescriptor) -> A32Location {
            A32Location {
                pc: desc.0 as u32,
                thumb: desc.0 >> T_BIT & 1 == 1,
                big_endian: desc.0 >> E_BIT & 1 == 1,
                single_step: desc.0 >> STEP_BIT & 1 == 1,
                fpscr_mode: ((desc.0 >> FPSCR_SHIFT) as u32) << 16 & FPSCR_MODE_MASK,
            }
        }
    }
}

pub mod a64 {
    use super::LocationDescriptor;

    /// A64 PCs are tracked to 56 bits; the upper byte of the descriptor
    /// carries FPCR mode bits and the single-step flag.
    pub const PC_MASK: u64 = (1 << 56) - 1;
    pub const FPCR_SHIFT: u32 = 56;
    pub const STEP_BIT: u32 = 63;
    /// FPCR bits that affect code generation (AHP, DN, FZ, RMode).
    pub const FPCR_MODE_MASK: u32 = 0x07c0_0000;

    /// An unpacked A64 location.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct A64Location {
        pub pc: u64,
        pub single_step: bool,
        pub fpcr_mode: u32,
    }

    impl A64Location {
        pub fn new(pc: u64) -> A64Location {
            A64Location {
                pc,
                single_step: false,
                fpcr_mode: 0,
            }
        }

        pub fn with_single_step(mut self, step: bool) -> A64Location {
            self.single_step = step;
            self
        }

        pub fn with_fpcr(mut self, fpcr: u32) -> A64Location {
            self.fpcr_mode = fpcr & FPCR_MODE_MASK;
            self
        }

        pub fn advance(self, bytes: u64) -> A64Location {
            A64Location {
                pc: self.pc.wrapping_add(bytes) & PC_MASK,
                ..self
            }
        }

        pub fn descriptor(self) -> LocationDescriptor {
            LocationDescriptor(
                (self.pc & PC_MASK)
                    | ((self.fpcr_mode >> 22) as u64) << FPCR_SHIFT
                    | (self.single_step as u64) << STEP_BIT,
            )
        }

        pub fn from_descriptor(desc: LocationDescriptor) -> A64Location {
            A64Location {
                pc: desc.0 & PC_MASK,
                single_step: desc.0 >> STEP_BIT & 1 == 1,
                fpcr_mode: ((desc.0 >> FPCR_SHIFT) as u32 & 0x1f) << 22,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::a32::A32Location;
    use super::a64::A64Location;

    #[test]
    fn test_a32_roundtrip() {
        let loc = A32Location::new(0x1000)
            .with_thumb(true)
            .with_single_step(true)
            .with_fpscr(0x03f0_0000);
        let back = A32Location::from_descriptor(loc.descriptor());
        assert_eq!(loc, back);
    }

    #[test]
    fn test_a32_distinguishes_modes() {
        let arm = A32Location::new(0x1000);
        let thumb = A32Location::new(0x1000).with_thumb(true);
        assert_ne!(arm.descriptor(), thumb.descriptor());
        let step = A32Location::new(0x1000).with_single_step(true);
        assert_ne!(arm.descriptor(), step.descriptor());
    }

    #[test]
    fn test_a32_same_state_same_descriptor() {
        let a = A32Location::new(0x2000).with_thumb(true);
        let b = A32Location::new(0x2000).with_thumb(true);
        assert_eq!(a.descriptor(), b.descriptor());
    }

    #[test]
    fn test_a64_roundtrip() {
        let loc = A64Location::new(0x0012_3456_7890)
            .with_single_step(true)
            .with_fpcr(0x0440_0000);
        let back = A64Location::from_descriptor(loc.descriptor());
        assert_eq!(loc, back);
    }

    #[test]
    fn test_a64_pc_mask() {
        let loc = A64Location::new(u64::MAX);
        assert_eq!(
            A64Location::from_descriptor(loc.descriptor()).pc,
            (1u64 << 56) - 1
        );
    }

    #[test]
    fn test_advance() {
        assert_eq!(A32Location::new(0x1000).advance(4).pc, 0x1004);
        assert_eq!(A32Location::new(0x1000).with_thumb(true).instruction_size(), 2);
        assert_eq!(A64Location::new(0x1000).advance(4).pc, 0x1004);
    }
}
