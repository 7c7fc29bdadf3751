//! Register allocation for the x64 emitter
//!
//! Linear, SSA-aware, two register classes. Values live in host registers
//! until pressure evicts the least-recently-used into a fixed JitState spill
//! slot; reloads are transparent. Per-argument policies:
//!
//! - `use_gpr`/`use_fpr`: read-only access, result register must survive
//!   the instruction
//! - `use_scratch_gpr`: the value in a register the caller may clobber
//! - `scratch_gpr`/`scratch_fpr`: uninitialized temporary
//! - `host_call`: pins arguments into the SysV argument registers and
//!   flushes every live caller-saved value first
//!
//! `end_of_alloc_scope` runs after each instruction and releases temporaries
//! and values past their last use; `assert_no_more_uses` at block end
//! catches leaks. Exhaustion of spill slots is a translator invariant
//! violation and aborts.

use rustc_hash::FxHashMap;

use super::asm::{Assembler, Fpr, Gpr, Mem, Size, R15};
use crate::ir::{Block, InstId, Type, Value};
use crate::runtime::state::StateInfo;

/// Allocation preference order: caller-saved first, pinned registers
/// (RSP, R15) excluded.
const GPR_ORDER: [u8; 14] = [0, 1, 2, 6, 7, 8, 9, 10, 11, 3, 5, 12, 13, 14];
const CALLER_SAVED: [u8; 9] = [0, 1, 2, 6, 7, 8, 9, 10, 11];
/// SysV integer argument registers: rdi, rsi, rdx, rcx.
pub const ABI_ARGS: [Gpr; 4] = [Gpr(7), Gpr(6), Gpr(2), Gpr(1)];
pub const ABI_RET: Gpr = Gpr(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostLoc {
    Gpr(Gpr),
    Fpr(Fpr),
    Spill(usize),
    VecSpill(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Reserved,
    Free,
    Val(InstId),
    Scratch,
}

pub struct RegAlloc {
    info: StateInfo,
    last_use: Vec<Option<u32>>,
    current: u32,
    values: FxHashMap<InstId, HostLoc>,
    gpr: [Slot; 16],
    gpr_stamp: [u64; 16],
    gpr_locked: [bool; 16],
    fpr: [Slot; 16],
    fpr_stamp: [u64; 16],
    fpr_locked: [bool; 16],
    stamp: u64,
    spill_used: Vec<Option<InstId>>,
    vec_spill_used: Vec<Option<InstId>>,
}

impl RegAlloc {
    pub fn new(info: StateInfo, block: &Block) -> RegAlloc {
        let count = block.insts().len();
        let mut last_use = vec![None; count];
        for id in block.inst_ids() {
            let inst = block.inst(id);
            if inst.is_void() || inst.op.info().pseudo {
                // A pseudo-op's producer reference is a side channel, not a
                // value use
                continue;
            }
            for arg in &inst.args {
                if let Value::Inst(ref_id) = arg {
                    last_use[ref_id.index()] = Some(id.0);
                }
            }
        }

        let mut gpr = [Slot::Free; 16];
        gpr[4] = Slot::Reserved; // rsp
        gpr[15] = Slot::Reserved; // r15 = JitState

        RegAlloc {
            last_use,
            current: 0,
            values: FxHashMap::default(),
            gpr,
            gpr_stamp: [0; 16],
            gpr_locked: [false; 16],
            fpr: [Slot::Free; 16],
            fpr_stamp: [0; 16],
            fpr_locked: [false; 16],
            stamp: 0,
            spill_used: vec![None; info.spill_count],
            vec_spill_used: vec![None; info.vec_spill_count],
            info,
        }
    }

    pub fn set_current(&mut self, idx: u32) {
        self.current = idx;
    }

    fn touch_gpr(&mut self, r: Gpr) {
        self.stamp += 1;
        self.gpr_stamp[r.0 as usize] = self.stamp;
    }

    fn touch_fpr(&mut self, r: Fpr) {
        self.stamp += 1;
        self.fpr_stamp[r.0 as usize] = self.stamp;
    }

    // ---- GPR allocation ----

    fn alloc_gpr(&mut self, asm: &mut Assembler) -> Gpr {
        for &i in GPR_ORDER.iter() {
            if self.gpr[i as usize] == Slot::Free {
                let r = Gpr(i);
                self.touch_gpr(r);
                return r;
            }
        }
        // Evict the least recently used unlocked value
        let victim = GPR_ORDER
            .iter()
            .copied()
            .filter(|&i| {
                matches!(self.gpr[i as usize], Slot::Val(_)) && !self.gpr_locked[i as usize]
            })
            .min_by_key(|&i| self.gpr_stamp[i as usize])
            .expect("all registers locked: emitter holds too many operands");
        let r = Gpr(victim);
        self.spill_gpr(asm, r);
        self.touch_gpr(r);
        r
    }

    fn spill_gpr(&mut self, asm: &mut Assembler, r: Gpr) {
        let id = match self.gpr[r.0 as usize] {
            Slot::Val(id) => id,
            _ => unreachable!("spilling a non-value register"),
        };
        let slot = self
            .spill_used
            .iter()
            .position(|s| s.is_none())
            .expect("out of spill slots");
        self.spill_used[slot] = Some(id);
        asm.mov_mr(
            Size::B64,
            Mem::base_disp(R15, self.info.spill_slot_offset(slot)),
            r,
        );
        self.values.insert(id, HostLoc::Spill(slot));
        self.gpr[r.0 as usize] = Slot::Free;
    }

    fn reload_gpr(&mut self, asm: &mut Assembler, id: InstId, slot: usize) -> Gpr {
        let r = self.alloc_gpr(asm);
        asm.mov_rm(
            Size::B64,
            r,
            Mem::base_disp(R15, self.info.spill_slot_offset(slot)),
        );
        self.spill_used[slot] = None;
        self.values.insert(id, HostLoc::Gpr(r));
        self.gpr[r.0 as usize] = Slot::Val(id);
        r
    }

    /// Read access: the value in a register, valid through this instruction.
    pub fn use_gpr(&mut self, asm: &mut Assembler, v: Value) -> Gpr {
        let r = match v {
            Value::Inst(id) => match *self
                .values
                .get(&id)
                .unwrap_or_else(|| panic!("use of undefined value {}", id))
            {
                HostLoc::Gpr(r) => {
                    self.touch_gpr(r);
                    r
                }
                HostLoc::Spill(slot) => self.reload_gpr(asm, id, slot),
                _ => panic!("scalar use of a vector value"),
            },
            imm => {
                let r = self.scratch_gpr(asm);
                Self::materialize(asm, r, imm);
                r
            }
        };
        self.gpr_locked[r.0 as usize] = true;
        r
    }

    /// Read access to a register the caller may clobber.
    pub fn use_scratch_gpr(&mut self, asm: &mut Assembler, v: Value) -> Gpr {
        match v {
            Value::Inst(id) => {
                let loc = *self
                    .values
                    .get(&id)
                    .unwrap_or_else(|| panic!("use of undefined value {}", id));
                let dies_here = self.last_use[id.index()] == Some(self.current);
                match loc {
                    HostLoc::Gpr(r) if dies_here => {
                        // Last use: take the register over
                        self.values.remove(&id);
                        self.gpr[r.0 as usize] = Slot::Scratch;
                        self.gpr_locked[r.0 as usize] = true;
                        self.touch_gpr(r);
                        r
                    }
                    HostLoc::Gpr(src) => {
                        // Protect the source from being evicted by the
                        // scratch allocation
                        self.gpr_locked[src.0 as usize] = true;
                        let r = self.scratch_gpr(asm);
                        asm.mov_rr(Size::B64, r, src);
                        r
                    }
                    HostLoc::Spill(slot) => {
                        let r = self.scratch_gpr(asm);
                        asm.mov_rm(
                            Size::B64,
                            r,
                            Mem::base_disp(R15, self.info.spill_slot_offset(slot)),
                        );
                        if dies_here {
                            self.spill_used[slot] = None;
                            self.values.remove(&id);
                        }
                        r
                    }
                    _ => panic!("scalar use of a vector value"),
                }
            }
            imm => {
                let r = self.scratch_gpr(asm);
                Self::materialize(asm, r, imm);
                r
            }
        }
    }

    /// Uninitialized temporary, free to clobber.
    pub fn scratch_gpr(&mut self, asm: &mut Assembler) -> Gpr {
        let r = self.alloc_gpr(asm);
        self.gpr[r.0 as usize] = Slot::Scratch;
        self.gpr_locked[r.0 as usize] = true;
        r
    }

    /// Record that `inst`'s value now lives in `reg` (previously a scratch).
    pub fn define_gpr(&mut self, inst: InstId, reg: Gpr) {
        debug_assert!(matches!(self.gpr[reg.0 as usize], Slot::Scratch));
        self.gpr[reg.0 as usize] = Slot::Val(inst);
        self.values.insert(inst, HostLoc::Gpr(reg));
    }

    fn materialize(asm: &mut Assembler, r: Gpr, v: Value) {
        match v {
            Value::U1(b) => asm.mov_ri32(r, b as u32),
            Value::U8(n) => asm.mov_ri32(r, n as u32),
            Value::U16(n) => asm.mov_ri32(r, n as u32),
            Value::U32(n) => asm.mov_ri32(r, n),
            Value::U64(n) => {
                if n <= u32::MAX as u64 {
                    asm.mov_ri32(r, n as u32);
                } else {
                    asm.mov_ri64(r, n);
                }
            }
            other => panic!("cannot materialize {:?}", other),
        }
    }

    // ---- FPR allocation ----

    fn alloc_fpr(&mut self, asm: &mut Assembler) -> Fpr {
        for i in 0..16u8 {
            if self.fpr[i as usize] == Slot::Free {
                let r = Fpr(i);
                self.touch_fpr(r);
                return r;
            }
        }
        let victim = (0..16u8)
            .filter(|&i| {
                matches!(self.fpr[i as usize], Slot::Val(_)) && !self.fpr_locked[i as usize]
            })
            .min_by_key(|&i| self.fpr_stamp[i as usize])
            .expect("all vector registers locked");
        let r = Fpr(victim);
        self.spill_fpr(asm, r);
        self.touch_fpr(r);
        r
    }

    fn spill_fpr(&mut self, asm: &mut Assembler, r: Fpr) {
        let id = match self.fpr[r.0 as usize] {
            Slot::Val(id) => id,
            _ => unreachable!(),
        };
        let slot = self
            .vec_spill_used
            .iter()
            .position(|s| s.is_none())
            .expect("out of vector spill slots");
        self.vec_spill_used[slot] = Some(id);
        asm.movdqu_mr(
            Mem::base_disp(R15, self.info.vec_spill_slot_offset(slot)),
            r,
        );
        self.values.insert(id, HostLoc::VecSpill(slot));
        self.fpr[r.0 as usize] = Slot::Free;
    }

    pub fn use_fpr(&mut self, asm: &mut Assembler, v: Value) -> Fpr {
        let id = match v {
            Value::Inst(id) => id,
            other => panic!("vector immediates are not supported: {:?}", other),
        };
        let r = match *self.values.get(&id).expect("use of undefined vector value") {
            HostLoc::Fpr(r) => {
                self.touch_fpr(r);
                r
            }
            HostLoc::VecSpill(slot) => {
                let r = self.alloc_fpr(asm);
                asm.movdqu_rm(
                    r,
                    Mem::base_disp(R15, self.info.vec_spill_slot_offset(slot)),
                );
                self.vec_spill_used[slot] = None;
                self.values.insert(id, HostLoc::Fpr(r));
                self.fpr[r.0 as usize] = Slot::Val(id);
                r
            }
            _ => panic!("vector use of a scalar value"),
        };
        self.fpr_locked[r.0 as usize] = true;
        r
    }

    pub fn scratch_fpr(&mut self, asm: &mut Assembler) -> Fpr {
        let r = self.alloc_fpr(asm);
        self.fpr[r.0 as usize] = Slot::Scratch;
        self.fpr_locked[r.0 as usize] = true;
        r
    }

    pub fn define_fpr(&mut self, inst: InstId, reg: Fpr) {
        debug_assert!(matches!(self.fpr[reg.0 as usize], Slot::Scratch));
        self.fpr[reg.0 as usize] = Slot::Val(inst);
        self.values.insert(inst, HostLoc::Fpr(reg));
    }

    // ---- Host calls ----

    /// Flush live caller-saved values, then pin `args` into the SysV
    /// argument registers. The caller emits the call itself; afterwards all
    /// caller-saved registers are free and the result (if any) is defined
    /// in RAX via `define_call_result`.
    pub fn host_call(&mut self, asm: &mut Assembler, args: &[Option<Value>]) {
        assert!(args.len() <= ABI_ARGS.len());
        debug_assert!(
            !self.gpr.iter().any(|s| *s == Slot::Scratch),
            "scratches live across a host call"
        );

        // Flush every caller-saved value to spill slots; vector values are
        // all caller-saved
        for &i in CALLER_SAVED.iter() {
            if matches!(self.gpr[i as usize], Slot::Val(_)) {
                self.spill_gpr(asm, Gpr(i));
            }
        }
        for i in 0..16u8 {
            if matches!(self.fpr[i as usize], Slot::Val(_)) {
                self.spill_fpr(asm, Fpr(i));
            }
        }

        // Arguments now come only from immediates, spill slots, or
        // callee-saved registers, so no target can be clobbered early
        for (i, arg) in args.iter().enumerate() {
            let target = ABI_ARGS[i];
            let Some(v) = arg else { continue };
            match v {
                Value::Inst(id) => match *self.values.get(id).expect("undefined call argument") {
                    HostLoc::Gpr(src) => asm.mov_rr(Size::B64, target, src),
                    HostLoc::Spill(slot) => asm.mov_rm(
                        Size::B64,
                        target,
                        Mem::base_disp(R15, self.info.spill_slot_offset(slot)),
                    ),
                    _ => panic!("vector value as scalar call argument"),
                },
                imm => Self::materialize(asm, target, *imm),
            }
        }
    }

    /// Define the call's result as living in RAX.
    pub fn define_call_result(&mut self, inst: InstId) {
        debug_assert!(self.gpr[ABI_RET.0 as usize] == Slot::Free);
        self.gpr[ABI_RET.0 as usize] = Slot::Val(inst);
        self.touch_gpr(ABI_RET);
        self.values.insert(inst, HostLoc::Gpr(ABI_RET));
    }

    // ---- Scope management ----

    /// Release temporaries and dead values after each instruction.
    pub fn end_of_alloc_scope(&mut self) {
        for i in 0..16 {
            self.gpr_locked[i] = false;
            self.fpr_locked[i] = false;
            match self.gpr[i] {
                Slot::Scratch => self.gpr[i] = Slot::Free,
                Slot::Val(id) => {
                    if self.dead(id) {
                        self.gpr[i] = Slot::Free;
                        self.values.remove(&id);
                    }
                }
                _ => {}
            }
            match self.fpr[i] {
                Slot::Scratch => self.fpr[i] = Slot::Free,
                Slot::Val(id) => {
                    if self.dead(id) {
                        self.fpr[i] = Slot::Free;
                        self.values.remove(&id);
                    }
                }
                _ => {}
            }
        }
        for slot in 0..self.spill_used.len() {
            if let Some(id) = self.spill_used[slot] {
                if self.dead(id) {
                    self.spill_used[slot] = None;
                    self.values.remove(&id);
                }
            }
        }
        for slot in 0..self.vec_spill_used.len() {
            if let Some(id) = self.vec_spill_used[slot] {
                if self.dead(id) {
                    self.vec_spill_used[slot] = None;
                    self.values.remove(&id);
                }
            }
        }
    }

    fn dead(&self, id: InstId) -> bool {
        match self.last_use[id.index()] {
            None => true,
            Some(last) => last <= self.current,
        }
    }

    /// Invariant check at block end: every value has been released.
    pub fn assert_no_more_uses(&self) {
        assert!(
            self.values.is_empty(),
            "values leaked past block end: {:?}",
            self.values.keys().collect::<Vec<_>>()
        );
    }

    /// The register class a value of this type allocates from.
    pub fn class_of(ty: Type) -> RegClass {
        if ty == Type::U128 {
            RegClass::Fpr
        } else {
            RegClass::Gpr
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Gpr,
    Fpr,
}
