//! Guest state blocks and their emitted-code ABI
//!
//! `A32JitState` / `A64JitState` hold the architectural registers plus the
//! host scratch the dispatcher and emitted code share: cycle counters, the
//! halt and check bytes, the RSB, spill slots, and saved MXCSR words. Their
//! layout is ABI: emitted instructions address fields through the offsets
//! captured once in `StateInfo`, never through Rust field access.

use std::mem::offset_of;
use std::sync::atomic::AtomicU8;

use crate::loc::LocationDescriptor;

/// Entries in the return stack buffer. Power of two.
pub const RSB_SIZE: usize = 8;
pub const RSB_PTR_MASK: u64 = (RSB_SIZE as u64) - 1;

/// 64-bit spill slots available to the register allocator.
pub const SPILL_COUNT: usize = 16;
/// 128-bit spill slots for the vector class.
pub const VEC_SPILL_COUNT: usize = 4;

/// Descriptor value stored in empty RSB slots; never a valid location.
pub const RSB_INVALID: u64 = u64::MAX;

/// Guest architecture selector for descriptor reconstruction in emitted
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    A32,
    A64,
}

/// A32 guest state. `#[repr(C)]` — the field order is load-bearing.
#[repr(C)]
pub struct A32JitState {
    pub regs: [u32; 16],
    /// NZCV as 0/1 bytes; packed only when the CPSR is read through the
    /// facade.
    pub cpsr_n: u8,
    pub cpsr_z: u8,
    pub cpsr_c: u8,
    pub cpsr_v: u8,
    pub cpsr_q: u8,
    pub cpsr_t: u8,
    pub check_bit: u8,
    pub halt_requested: AtomicU8,
    pub fpscr: u32,
    /// Precomputed descriptor bits above PC and T (E bit, FPSCR mode).
    pub desc_hi: u64,
    pub cycles_remaining: i64,
    pub cycles_to_run: i64,
    pub save_host_mxcsr: u32,
    pub guest_mxcsr: u32,
    pub rsb_ptr: u64,
    pub rsb_descriptors: [u64; RSB_SIZE],
    pub rsb_codeptrs: [u64; RSB_SIZE],
    pub spill: [u64; SPILL_COUNT],
    pub vec_spill: [[u64; 2]; VEC_SPILL_COUNT],
    pub ext_regs: [u32; 64],
}

impl Default for A32JitState {
    fn default() -> A32JitState {
        A32JitState {
            regs: [0; 16],
            cpsr_n: 0,
            cpsr_z: 0,
            cpsr_c: 0,
            cpsr_v: 0,
            cpsr_q: 0,
            cpsr_t: 0,
            check_bit: 0,
            halt_requested: AtomicU8::new(0),
            fpscr: 0,
            desc_hi: 0,
            cycles_remaining: 0,
            cycles_to_run: 0,
            save_host_mxcsr: 0,
            guest_mxcsr: 0x1f80,
            rsb_ptr: 0,
            rsb_descriptors: [RSB_INVALID; RSB_SIZE],
            rsb_codeptrs: [0; RSB_SIZE],
            spill: [0; SPILL_COUNT],
            vec_spill: [[0; 2]; VEC_SPILL_COUNT],
            ext_regs: [0; 64],
        }
    }
}

impl A32JitState {
    /// Reset RSB prediction state (after cache clears).
    pub fn clear_rsb(&mut self) {
        self.rsb_ptr = 0;
        self.rsb_descriptors = [RSB_INVALID; RSB_SIZE];
        self.rsb_codeptrs = [0; RSB_SIZE];
    }

    /// Current location descriptor, as emitted code would compute it.
    pub fn current_descriptor(&self) -> LocationDescriptor {
        LocationDescriptor(
            self.regs[15] as u64
                | (self.cpsr_t as u64) << crate::loc::a32::T_BIT
                | self.desc_hi,
        )
    }

    /// Pack the CPSR view from the unpacked flag bytes.
    pub fn cpsr(&self) -> u32 {
        (self.cpsr_n as u32) << 31
            | (self.cpsr_z as u32) << 30
            | (self.cpsr_c as u32) << 29
            | (self.cpsr_v as u32) << 28
            | (self.cpsr_q as u32) << 27
            | (self.cpsr_t as u32) << 5
            | 0x10 // user mode
    }

    pub fn set_cpsr(&mut self, cpsr: u32) {
        self.cpsr_n = (cpsr >> 31 & 1) as u8;
        self.cpsr_z = (cpsr >> 30 & 1) as u8;
        self.cpsr_c = (cpsr >> 29 & 1) as u8;
        self.cpsr_v = (cpsr >> 28 & 1) as u8;
        self.cpsr_q = (cpsr >> 27 & 1) as u8;
        self.cpsr_t = (cpsr >> 5 & 1) as u8;
    }
}

/// A64 guest state. Register slots 0-30 are X0-X30, 31 is SP, 32 is PC —
/// the three arrays are contiguous so emitted code indexes them uniformly.
#[repr(C)]
pub struct A64JitState {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub cpsr_n: u8,
    pub cpsr_z: u8,
    pub cpsr_c: u8,
    pub cpsr_v: u8,
    pub check_bit: u8,
    pub halt_requested: AtomicU8,
    _pad: [u8; 2],
    pub fpcr: u32,
    pub fpsr: u32,
    pub desc_hi: u64,
    pub cycles_remaining: i64,
    pub cycles_to_run: i64,
    pub save_host_mxcsr: u32,
    pub guest_mxcsr: u32,
    pub rsb_ptr: u64,
    pub rsb_descriptors: [u64; RSB_SIZE],
    pub rsb_codeptrs: [u64; RSB_SIZE],
    pub spill: [u64; SPILL_COUNT],
    pub vec_spill: [[u64; 2]; VEC_SPILL_COUNT],
    pub vregs: [[u64; 2]; 32],
}

impl Default for A64JitState {
    fn default() -> A64JitState {
        A64JitState {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            cpsr_n: 0,
            cpsr_z: 0,
            cpsr_c: 0,
            cpsr_v: 0,
            check_bit: 0,
            halt_requested: AtomicU8::new(0),
            _pad: [0; 2],
            fpcr: 0,
            fpsr: 0,
            desc_hi: 0,
            cycles_remaining: 0,
            cycles_to_run: 0,
            save_host_mxcsr: 0,
            guest_mxcsr: 0x1f80,
            rsb_ptr: 0,
            rsb_descriptors: [RSB_INVALID; RSB_SIZE],
            rsb_codeptrs: [0; RSB_SIZE],
            spill: [0; SPILL_COUNT],
            vec_spill: [[0; 2]; VEC_SPILL_COUNT],
            vregs: [[0; 2]; 32],
        }
    }
}

impl A64JitState {
    pub fn clear_rsb(&mut self) {
        self.rsb_ptr = 0;
        self.rsb_descriptors = [RSB_INVALID; RSB_SIZE];
        self.rsb_codeptrs = [0; RSB_SIZE];
    }

    pub fn current_descriptor(&self) -> LocationDescriptor {
        LocationDescriptor((self.pc & crate::loc::a64::PC_MASK) | self.desc_hi)
    }

    pub fn pstate(&self) -> u32 {
        (self.cpsr_n as u32) << 31
            | (self.cpsr_z as u32) << 30
            | (self.cpsr_c as u32) << 29
            | (self.cpsr_v as u32) << 28
    }

    pub fn set_pstate(&mut self, pstate: u32) {
        self.cpsr_n = (pstate >> 31 & 1) as u8;
        self.cpsr_z = (pstate >> 30 & 1) as u8;
        self.cpsr_c = (pstate >> 29 & 1) as u8;
        self.cpsr_v = (pstate >> 28 & 1) as u8;
    }
}

/// Field offsets shared with emitted code. Captured once at construction
/// from the `repr(C)` layouts above.
#[derive(Debug, Clone, Copy)]
pub struct StateInfo {
    pub arch: Arch,
    pub regs_off: i32,
    pub reg_stride: i32,
    /// Number of addressable register slots (A32: 16, A64: 33 incl SP/PC).
    pub reg_count: u8,
    pub pc_off: i32,
    pub n_off: i32,
    pub z_off: i32,
    pub c_off: i32,
    pub v_off: i32,
    /// A32 only; -1 otherwise.
    pub q_off: i32,
    /// A32 only; -1 otherwise.
    pub t_off: i32,
    pub check_bit_off: i32,
    pub halt_off: i32,
    pub desc_hi_off: i32,
    pub cycles_off: i32,
    pub mxcsr_save_off: i32,
    pub mxcsr_guest_off: i32,
    pub rsb_ptr_off: i32,
    pub rsb_descs_off: i32,
    pub rsb_ptrs_off: i32,
    pub spill_off: i32,
    pub spill_count: usize,
    pub vec_spill_off: i32,
    pub vec_spill_count: usize,
    pub vec_off: i32,
}

impl StateInfo {
    pub fn a32() -> StateInfo {
        StateInfo {
            arch: Arch::A32,
            regs_off: offset_of!(A32JitState, regs) as i32,
            reg_stride: 4,
            reg_count: 16,
            pc_off: offset_of!(A32JitState, regs) as i32 + 15 * 4,
            n_off: offset_of!(A32JitState, cpsr_n) as i32,
            z_off: offset_of!(A32JitState, cpsr_z) as i32,
            c_off: offset_of!(A32JitState, cpsr_c) as i32,
            v_off: offset_of!(A32JitState, cpsr_v) as i32,
            q_off: offset_of!(A32JitState, cpsr_q) as i32,
            t_off: offset_of!(A32JitState, cpsr_t) as i32,
            check_bit_off: offset_of!(A32JitState, check_bit) as i32,
            halt_off: offset_of!(A32JitState, halt_requested) as i32,
            desc_hi_off: offset_of!(A32JitState, desc_hi) as i32,
            cycles_off: offset_of!(A32JitState, cycles_remaining) as i32,
            mxcsr_save_off: offset_of!(A32JitState, save_host_mxcsr) as i32,
            mxcsr_guest_off: offset_of!(A32JitState, guest_mxcsr) as i32,
            rsb_ptr_off: offset_of!(A32JitState, rsb_ptr) as i32,
            rsb_descs_off: offset_of!(A32JitState, rsb_descriptors) as i32,
            rsb_ptrs_off: offset_of!(A32JitState, rsb_codeptrs) as i32,
            spill_off: offset_of!(A32JitState, spill) as i32,
            spill_count: SPILL_COUNT,
            vec_spill_off: offset_of!(A32JitState, vec_spill) as i32,
            vec_spill_count: VEC_SPILL_COUNT,
            vec_off: offset_of!(A32JitState, ext_regs) as i32,
        }
    }

    pub fn a64() -> StateInfo {
        StateInfo {
            arch: Arch::A64,
            regs_off: offset_of!(A64JitState, regs) as i32,
            reg_stride: 8,
            reg_count: 33,
            pc_off: offset_of!(A64JitState, pc) as i32,
            n_off: offset_of!(A64JitState, cpsr_n) as i32,
            z_off: offset_of!(A64JitState, cpsr_z) as i32,
            c_off: offset_of!(A64JitState, cpsr_c) as i32,
            v_off: offset_of!(A64JitState, cpsr_v) as i32,
            q_off: -1,
            t_off: -1,
            check_bit_off: offset_of!(A64JitState, check_bit) as i32,
            halt_off: offset_of!(A64JitState, halt_requested) as i32,
            desc_hi_off: offset_of!(A64JitState, desc_hi) as i32,
            cycles_off: offset_of!(A64JitState, cycles_remaining) as i32,
            mxcsr_save_off: offset_of!(A64JitState, save_host_mxcsr) as i32,
            mxcsr_guest_off: offset_of!(A64JitState, guest_mxcsr) as i32,
            rsb_ptr_off: offset_of!(A64JitState, rsb_ptr) as i32,
            rsb_descs_off: offset_of!(A64JitState, rsb_descriptors) as i32,
            rsb_ptrs_off: offset_of!(A64JitState, rsb_codeptrs) as i32,
            spill_off: offset_of!(A64JitState, spill) as i32,
            spill_count: SPILL_COUNT,
            vec_spill_off: offset_of!(A64JitState, vec_spill) as i32,
            vec_spill_count: VEC_SPILL_COUNT,
            vec_off: offset_of!(A64JitState, vregs) as i32,
        }
    }

    pub fn reg_offset(&self, index: u8) -> i32 {
        assert!(index < self.reg_count, "register slot out of range");
        self.regs_off + index as i32 * self.reg_stride
    }

    pub fn spill_slot_offset(&self, slot: usize) -> i32 {
        assert!(slot < self.spill_count);
        self.spill_off + (slot * 8) as i32
    }

    pub fn vec_spill_slot_offset(&self, slot: usize) -> i32 {
        assert!(slot < self.vec_spill_count);
        self.vec_spill_off + (slot * 16) as i32
    }

    pub fn vec_reg_offset(&self, index: u8) -> i32 {
        self.vec_off + index as i32 * 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a32_offsets_capture_layout() {
        let info = StateInfo::a32();
        assert_eq!(info.regs_off, 0);
        assert_eq!(info.reg_offset(0), 0);
        assert_eq!(info.reg_offset(15), 60);
        assert_eq!(info.pc_off, info.reg_offset(15));
        // Flag bytes are adjacent
        assert_eq!(info.z_off, info.n_off + 1);
        assert_eq!(info.c_off, info.n_off + 2);
    }

    #[test]
    fn test_a64_register_block_contiguous() {
        let info = StateInfo::a64();
        // SP and PC sit directly after X30
        assert_eq!(info.reg_offset(31), info.regs_off + 31 * 8);
        assert_eq!(info.reg_offset(32), info.pc_off);
    }

    #[test]
    fn test_a32_cpsr_roundtrip() {
        let mut s = A32JitState::default();
        s.set_cpsr(0xf800_0020);
        assert_eq!(s.cpsr_n, 1);
        assert_eq!(s.cpsr_q, 1);
        assert_eq!(s.cpsr_t, 1);
        assert_eq!(s.cpsr() & 0xf800_0020, 0xf800_0020);
    }

    #[test]
    fn test_a32_descriptor_matches_location() {
        let mut s = A32JitState::default();
        s.regs[15] = 0x1000;
        s.cpsr_t = 1;
        let loc = crate::loc::a32::A32Location::new(0x1000).with_thumb(true);
        assert_eq!(s.current_descriptor(), loc.descriptor());
    }

    #[test]
    fn test_a64_descriptor_matches_location() {
        let mut s = A64JitState::default();
        s.pc = 0x4000_0000;
        let loc = crate::loc::a64::A64Location::new(0x4000_0000);
        assert_eq!(s.current_descriptor(), loc.descriptor());
    }

    #[test]
    fn test_rsb_clear() {
        let mut s = A32JitState::default();
        s.rsb_ptr = 3;
        s.rsb_descriptors[0] = 42;
        s.clear_rsb();
        assert_eq!(s.rsb_ptr, 0);
        assert_eq!(s.rsb_descriptors[0], RSB_INVALID);
    }
}
