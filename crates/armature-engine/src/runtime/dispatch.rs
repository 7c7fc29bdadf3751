//! Dispatcher and execution core
//!
//! `Core` owns everything one guest CPU needs: the architectural state, the
//! code arena with its emitted enter/exit stubs, the block cache, the
//! fast-dispatch table, and the embedder callbacks. Compilation, dispatch
//! and guest execution all run on the calling thread.
//!
//! Emitted code calls back into the engine through the `extern "C"` shims
//! below; every shim recovers the core from a baked-in pointer. The enter
//! stub saves callee-saved registers, pins R15 to the state block, swaps
//! MXCSR, and jumps to a block entry; blocks leave by jumping to the exit
//! stub, or chain directly to each other while cycles remain.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::backend::x64::asm::{
    Alu, Assembler, Mem, Size, R12, R13, R14, R15, RBP, RBX, RDI, RSI, RSP,
};
use crate::backend::{emit_block, RuntimeHandles, ShimTable};
use crate::config::Config;
use crate::env::{CoprocCallback, Environment, ExceptionKind};
use crate::frontend::LiftContext;
use crate::ir::Block;
use crate::loc::LocationDescriptor;
use crate::opt::Optimizer;
use crate::runtime::arena::CodeArena;
use crate::runtime::cache::{BlockCache, BlockDescriptor, PatchSite};
use crate::runtime::fastmem::{self, DoNotFastmem};
use crate::runtime::monitor::ExclusiveMonitor;
use crate::runtime::state::{A32JitState, A64JitState, StateInfo};
use crate::JitError;

/// Arena reserved per JIT instance.
const ARENA_SIZE: usize = 16 * 1024 * 1024;
/// Fast-dispatch table entries (power of two).
const FAST_DISPATCH_ENTRIES: usize = 1024;

/// One fast-dispatch slot; layout shared with emitted code.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FastDispatchEntry {
    pub descriptor: u64,
    pub code_ptr: u64,
}

const EMPTY_ENTRY: FastDispatchEntry = FastDispatchEntry {
    descriptor: u64::MAX,
    code_ptr: 0,
};

/// Guest architecture plugged into the generic core.
pub trait Architecture: Sized + 'static {
    type State: Default;
    fn state_info() -> StateInfo;
    fn current_descriptor(state: &Self::State) -> LocationDescriptor;
    fn with_single_step(desc: LocationDescriptor) -> LocationDescriptor;
    fn is_single_step(desc: LocationDescriptor) -> bool;
    fn lift(ctx: &mut LiftContext<'_>, desc: LocationDescriptor) -> Block;
    fn cycles_remaining(state: &Self::State) -> i64;
    fn set_cycles(state: &mut Self::State, remaining: i64, to_run: i64);
    fn cycles_to_run(state: &Self::State) -> i64;
    fn halt_flag(state: &Self::State) -> &AtomicU8;
    fn clear_rsb(state: &mut Self::State);
}

/// A32 (and Thumb) guest.
pub enum A32 {}

impl Architecture for A32 {
    type State = A32JitState;

    fn state_info() -> StateInfo {
        StateInfo::a32()
    }

    fn current_descriptor(state: &Self::State) -> LocationDescriptor {
        state.current_descriptor()
    }

    fn with_single_step(desc: LocationDescriptor) -> LocationDescriptor {
        let loc = crate::loc::a32::A32Location::from_descriptor(desc);
        loc.with_single_step(true).descriptor()
    }

    fn is_single_step(desc: LocationDescriptor) -> bool {
        crate::loc::a32::A32Location::from_descriptor(desc).single_step
    }

    fn lift(ctx: &mut LiftContext<'_>, desc: LocationDescriptor) -> Block {
        crate::frontend::a32::lift(ctx, crate::loc::a32::A32Location::from_descriptor(desc))
    }

    fn cycles_remaining(state: &Self::State) -> i64 {
        state.cycles_remaining
    }

    fn set_cycles(state: &mut Self::State, remaining: i64, to_run: i64) {
        state.cycles_remaining = remaining;
        state.cycles_to_run = to_run;
    }

    fn cycles_to_run(state: &Self::State) -> i64 {
        state.cycles_to_run
    }

    fn halt_flag(state: &Self::State) -> &AtomicU8 {
        &state.halt_requested
    }

    fn clear_rsb(state: &mut Self::State) {
        state.clear_rsb();
    }
}

/// A64 guest.
pub enum A64 {}

impl Architecture for A64 {
    type State = A64JitState;

    fn state_info() -> StateInfo {
        StateInfo::a64()
    }

    fn current_descriptor(state: &Self::State) -> LocationDescriptor {
        state.current_descriptor()
    }

    fn with_single_step(desc: LocationDescriptor) -> LocationDescriptor {
        let loc = crate::loc::a64::A64Location::from_descriptor(desc);
        loc.with_single_step(true).descriptor()
    }

    fn is_single_step(desc: LocationDescriptor) -> bool {
        crate::loc::a64::A64Location::from_descriptor(desc).single_step
    }

    fn lift(ctx: &mut LiftContext<'_>, desc: LocationDescriptor) -> Block {
        crate::frontend::a64::lift(ctx, crate::loc::a64::A64Location::from_descriptor(desc))
    }

    fn cycles_remaining(state: &Self::State) -> i64 {
        state.cycles_remaining
    }

    fn set_cycles(state: &mut Self::State, remaining: i64, to_run: i64) {
        state.cycles_remaining = remaining;
        state.cycles_to_run = to_run;
    }

    fn cycles_to_run(state: &Self::State) -> i64 {
        state.cycles_to_run
    }

    fn halt_flag(state: &Self::State) -> &AtomicU8 {
        &state.halt_requested
    }

    fn clear_rsb(state: &mut Self::State) {
        state.clear_rsb();
    }
}

type EnterFn = unsafe extern "C" fn(*mut u8, *const u8);

/// Why `run` returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    CyclesExhausted,
    Halted,
}

pub struct Core<A: Architecture> {
    pub state: A::State,
    pub env: Box<dyn Environment>,
    pub config: Config,
    pub monitor: Arc<ExclusiveMonitor>,
    arena: CodeArena,
    cache: BlockCache,
    fast_dispatch: Box<[FastDispatchEntry; FAST_DISPATCH_ENTRIES]>,
    fast_dispatch_enabled: bool,
    coproc_slots: Vec<CoprocCallback>,
    optimizer: Optimizer,
    info: StateInfo,
    enter: u64,
    epilogue: u64,
    arena_watermark: usize,
    demoted: DoNotFastmem,
}

impl<A: Architecture> Core<A> {
    pub fn new(config: Config, env: Box<dyn Environment>) -> Result<Box<Core<A>>, JitError> {
        let mut arena = CodeArena::new(ARENA_SIZE, false)?;
        let info = A::state_info();
        let (enter, epilogue) = emit_enter_exit(&mut arena, info)?;
        let watermark = arena.position();

        let fast_dispatch_enabled = config.enable_fast_dispatch && crc32c_available();
        let monitor = config
            .global_monitor
            .clone()
            .unwrap_or_else(|| Arc::new(ExclusiveMonitor::new(config.processor_id as usize + 1)));
        if config.fastmem_pointer.is_some() {
            fastmem::ensure_handler_installed();
        }

        let optimizer = if config.enable_optimizations {
            Optimizer::new()
        } else {
            Optimizer::empty()
        };

        Ok(Box::new(Core {
            state: A::State::default(),
            env,
            config,
            monitor,
            arena,
            cache: BlockCache::new(),
            fast_dispatch: Box::new([EMPTY_ENTRY; FAST_DISPATCH_ENTRIES]),
            fast_dispatch_enabled,
            coproc_slots: Vec::new(),
            optimizer,
            info,
            enter,
            epilogue,
            arena_watermark: watermark,
            demoted: Arc::new(Mutex::new(FxHashSet::default())),
        }))
    }

    /// Run until halt or cycle exhaustion; reports consumed cycles.
    pub fn run(&mut self) -> ExitReason {
        let budget = self.env.ticks_remaining() as i64;
        A::set_cycles(&mut self.state, budget, budget);

        let reason = loop {
            if A::halt_flag(&self.state).swap(0, Ordering::Acquire) != 0 {
                break ExitReason::Halted;
            }
            if A::cycles_remaining(&self.state) <= 0 {
                break ExitReason::CyclesExhausted;
            }
            let desc = A::current_descriptor(&self.state);
            let entry = self.get_or_compile(desc);
            self.enter_code(entry);
        };

        let consumed = A::cycles_to_run(&self.state) - A::cycles_remaining(&self.state);
        self.env.add_ticks(consumed.max(0) as u64);
        reason
    }

    /// Execute exactly one guest instruction.
    pub fn step(&mut self) {
        let desc = A::with_single_step(A::current_descriptor(&self.state));
        A::set_cycles(&mut self.state, 1, 1);
        let entry = self.get_or_compile(desc);
        self.enter_code(entry);
        let consumed = A::cycles_to_run(&self.state) - A::cycles_remaining(&self.state);
        self.env.add_ticks(consumed.max(0) as u64);
        A::halt_flag(&self.state).store(0, Ordering::Release);
    }

    pub fn halt_execution(&self) {
        A::halt_flag(&self.state).store(1, Ordering::Release);
    }

    fn enter_code(&mut self, entry: u64) {
        let state_ptr = &mut self.state as *mut A::State as *mut u8;
        // Safety: `enter` and `entry` point into this core's arena; the
        // emitted code only touches the state block and calls back through
        // the shims, which reconstruct the core from the same allocation.
        unsafe {
            let f: EnterFn = std::mem::transmute(self.enter as usize);
            f(state_ptr, entry as *const u8);
        }
    }

    pub fn current_descriptor(&self) -> LocationDescriptor {
        A::current_descriptor(&self.state)
    }

    fn runtime_handles(&mut self, single_step: bool) -> RuntimeHandles {
        RuntimeHandles {
            core_ptr: self as *mut Core<A> as u64,
            epilogue: self.epilogue,
            shims: shim_table::<A>(),
            fast_dispatch_table: if self.fast_dispatch_enabled {
                self.fast_dispatch.as_ptr() as u64
            } else {
                0
            },
            fast_dispatch_mask: (FAST_DISPATCH_ENTRIES - 1) as u32,
            fastmem_base: self.config.fastmem_pointer,
            single_step,
        }
    }

    /// Translate, optimize, emit, place, link.
    fn compile(&mut self, desc: LocationDescriptor) -> u64 {
        let mut ctx = LiftContext {
            env: &mut *self.env,
            coprocessors: &self.config.coprocessors,
            coproc_slots: &mut self.coproc_slots,
            max_instructions: self.config.max_instructions_per_block,
        };
        let mut block = A::lift(&mut ctx, desc);
        self.optimizer.optimize(&mut block);

        let single_step = A::is_single_step(desc);
        let rt = self.runtime_handles(single_step);
        let base = self.arena.base_address() + self.arena.position() as u64;
        let denied = self.demoted.lock().clone();
        let compiled = emit_block(&block, self.info, &rt, base, &denied);

        self.arena.enable_writing();
        let entry = self
            .arena
            .append(&compiled.code)
            .expect("code arena exhausted; ClearCache required");

        // Register this block's outgoing patch sites and apply any whose
        // target already exists
        let mut outgoing = Vec::new();
        for patch in &compiled.patches {
            let addr = entry + patch.offset as u64;
            let site = PatchSite {
                addr,
                kind: patch.kind,
                unpatched: patch.unpatched.clone(),
            };
            if let Some(target) = self.cache.get(patch.target) {
                let bytes = site.patched_bytes(target.entry);
                self.arena.write_at(addr, &bytes);
            }
            outgoing.push((patch.target, addr));
            self.cache.add_patch_site(patch.target, site);
        }

        // Fastmem sites become visible to the fault handler
        for site in &compiled.fastmem {
            fastmem::register_site(
                entry + site.offset as u64,
                site.slow_bytes.clone(),
                block.location,
                site.inst,
                self.demoted.clone(),
            );
        }

        self.cache.insert(
            desc,
            BlockDescriptor {
                entry,
                size: compiled.code.len(),
                pc_range: block.pc_range,
                outgoing,
            },
        );

        // Link every site that was waiting for this block
        let waiting: Vec<PatchSite> = self.cache.sites_for(desc).to_vec();
        for site in waiting {
            let bytes = site.patched_bytes(entry);
            self.arena.write_at(site.addr, &bytes);
        }
        self.arena.disable_writing();

        if self.fast_dispatch_enabled && !single_step {
            self.fast_dispatch_insert(desc, entry);
        }
        entry
    }

    fn get_or_compile(&mut self, desc: LocationDescriptor) -> u64 {
        if let Some(block) = self.cache.get(desc) {
            return block.entry;
        }
        self.compile(desc)
    }

    fn fast_dispatch_insert(&mut self, desc: LocationDescriptor, entry: u64) {
        let idx = hash_descriptor(desc.raw()) as usize & (FAST_DISPATCH_ENTRIES - 1);
        self.fast_dispatch[idx] = FastDispatchEntry {
            descriptor: desc.raw(),
            code_ptr: entry,
        };
    }

    /// Drop translations overlapping any of the guest ranges. Host code
    /// bytes stay in the arena until `clear_cache`.
    pub fn invalidate_cache_ranges(&mut self, ranges: &[(u64, u64)]) {
        let victims = self.cache.overlapping_ranges(ranges);
        if victims.is_empty() {
            return;
        }
        self.arena.enable_writing();
        for desc in victims {
            if let Some((block, to_unpatch)) = self.cache.remove(desc) {
                for site in to_unpatch {
                    self.arena.write_at(site.addr, &site.unpatched);
                }
                fastmem::unregister_range(block.entry, block.entry + block.size as u64);
                let idx = hash_descriptor(desc.raw()) as usize & (FAST_DISPATCH_ENTRIES - 1);
                if self.fast_dispatch[idx].descriptor == desc.raw() {
                    self.fast_dispatch[idx] = EMPTY_ENTRY;
                }
            }
        }
        self.arena.disable_writing();
        // Stale RSB entries may point into the removed translations
        A::clear_rsb(&mut self.state);
    }

    /// Drop every translation and reclaim the arena.
    pub fn clear_cache(&mut self) {
        for desc in self.cache.overlapping_ranges(&[(0, u64::MAX)]) {
            if let Some(block) = self.cache.get(desc) {
                fastmem::unregister_range(block.entry, block.entry + block.size as u64);
            }
        }
        self.cache.clear();
        self.arena.enable_writing();
        self.arena.reset_to(self.arena_watermark);
        self.arena.disable_writing();
        self.fast_dispatch.fill(EMPTY_ENTRY);
        self.coproc_slots.clear();
        A::clear_rsb(&mut self.state);
    }

    pub fn cached_block_count(&self) -> usize {
        self.cache.len()
    }

    pub fn has_block(&self, desc: LocationDescriptor) -> bool {
        self.cache.contains(desc)
    }
}

impl<A: Architecture> Drop for Core<A> {
    fn drop(&mut self) {
        // The fault-handler registry must not keep sites pointing into the
        // arena mapping we are about to release
        fastmem::unregister_range(
            self.arena.base_address(),
            self.arena.base_address() + self.arena.size() as u64,
        );
    }
}

/// Emit the enter/exit stub pair at the arena base. The enter stub is the
/// only way into guest code; the exit address is what every terminal jumps
/// to when returning to the dispatcher.
fn emit_enter_exit(arena: &mut CodeArena, info: StateInfo) -> Result<(u64, u64), JitError> {
    let base = arena.base_address() + arena.position() as u64;
    let mut asm = Assembler::new(base);
    // enter(state: rdi, entry: rsi)
    for r in [RBX, RBP, R12, R13, R14, R15] {
        asm.push_r(r);
    }
    asm.alu_ri(Alu::Sub, Size::B64, RSP, 8);
    asm.mov_rr(Size::B64, R15, RDI);
    asm.stmxcsr(Mem::base_disp(R15, info.mxcsr_save_off));
    asm.ldmxcsr(Mem::base_disp(R15, info.mxcsr_guest_off));
    asm.jmp_r(RSI);

    // exit
    let epilogue_off = asm.offset();
    asm.ldmxcsr(Mem::base_disp(R15, info.mxcsr_save_off));
    asm.alu_ri(Alu::Add, Size::B64, RSP, 8);
    for r in [R15, R14, R13, R12, RBP, RBX] {
        asm.pop_r(r);
    }
    asm.ret();

    let code = asm.finish();
    let enter = arena.append(&code)?;
    Ok((enter, enter + epilogue_off as u64))
}

/// CRC32-C of a descriptor, matching the emitted `crc32` instruction.
pub fn hash_descriptor(desc: u64) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if crc32c_available() {
            // Safety: feature presence checked
            return unsafe { crc32c_u64(desc) };
        }
    }
    // Portable fallback (fast dispatch is disabled in this case, but the
    // hash stays well-defined for bookkeeping)
    crc32fast::hash(&desc.to_le_bytes())
}

#[cfg(target_arch = "x86_64")]
fn crc32c_available() -> bool {
    std::is_x86_feature_detected!("sse4.2")
}

#[cfg(not(target_arch = "x86_64"))]
fn crc32c_available() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32c_u64(desc: u64) -> u32 {
    core::arch::x86_64::_mm_crc32_u64(0, desc) as u32
}

// ---- Shims: the extern "C" surface emitted code calls into ----

fn shim_table<A: Architecture>() -> ShimTable {
    ShimTable {
        read8: shim_read8::<A> as usize as u64,
        read16: shim_read16::<A> as usize as u64,
        read32: shim_read32::<A> as usize as u64,
        read64: shim_read64::<A> as usize as u64,
        write8: shim_write8::<A> as usize as u64,
        write16: shim_write16::<A> as usize as u64,
        write32: shim_write32::<A> as usize as u64,
        write64: shim_write64::<A> as usize as u64,
        ex_read8: shim_ex_read8::<A> as usize as u64,
        ex_read16: shim_ex_read16::<A> as usize as u64,
        ex_read32: shim_ex_read32::<A> as usize as u64,
        ex_read64: shim_ex_read64::<A> as usize as u64,
        ex_write8: shim_ex_write8::<A> as usize as u64,
        ex_write16: shim_ex_write16::<A> as usize as u64,
        ex_write32: shim_ex_write32::<A> as usize as u64,
        ex_write64: shim_ex_write64::<A> as usize as u64,
        clear_exclusive: shim_clear_exclusive::<A> as usize as u64,
        call_svc: shim_call_svc::<A> as usize as u64,
        exception_raised: shim_exception_raised::<A> as usize as u64,
        interpret: shim_interpret::<A> as usize as u64,
        coproc_word: shim_coproc_word::<A> as usize as u64,
        coproc_double: shim_coproc_double::<A> as usize as u64,
        lookup_code: shim_lookup::<A> as usize as u64,
        lsl32_c: shim_lsl32 as usize as u64,
        lsr32_c: shim_lsr32 as usize as u64,
        asr32_c: shim_asr32 as usize as u64,
        ror32_c: shim_ror32 as usize as u64,
        shift64: shim_shift64 as usize as u64,
        aes_encrypt: shim_aes_encrypt as usize as u64,
        aes_decrypt: shim_aes_decrypt as usize as u64,
        aes_mix: shim_aes_mix as usize as u64,
        aes_inverse_mix: shim_aes_inverse_mix as usize as u64,
    }
}

macro_rules! mem_shims {
    ($read:ident, $write:ident, $ex_read:ident, $ex_write:ident, $read_m:ident, $write_m:ident, $ty:ty) => {
        unsafe extern "C" fn $read<A: Architecture>(core: *mut Core<A>, vaddr: u64) -> u64 {
            let core = unsafe { &mut *core };
            if let Some(host) = core.config.page_table.as_ref().and_then(|pt| pt.lookup(vaddr)) {
                // Safety: the embedder guarantees mapped pages are readable
                return unsafe { std::ptr::read_unaligned(host as *const $ty) } as u64;
            }
            core.env.$read_m(vaddr) as u64
        }

        unsafe extern "C" fn $write<A: Architecture>(core: *mut Core<A>, vaddr: u64, value: u64) {
            let core = unsafe { &mut *core };
            // A non-exclusive store loses any reservation on the granule
            core.monitor.clear_by_address(vaddr);
            if let Some(host) = core.config.page_table.as_ref().and_then(|pt| pt.lookup(vaddr)) {
                // Safety: the embedder guarantees mapped pages are writable
                unsafe { std::ptr::write_unaligned(host as *mut $ty, value as $ty) };
                return;
            }
            core.env.$write_m(vaddr, value as $ty);
        }

        unsafe extern "C" fn $ex_read<A: Architecture>(core: *mut Core<A>, vaddr: u64) -> u64 {
            let core = unsafe { &mut *core };
            let pid = core.config.processor_id as usize;
            let env = &mut core.env;
            core.monitor
                .read_and_mark(pid, vaddr, || env.$read_m(vaddr) as u64)
        }

        unsafe extern "C" fn $ex_write<A: Architecture>(
            core: *mut Core<A>,
            vaddr: u64,
            value: u64,
        ) -> u64 {
            let core = unsafe { &mut *core };
            let pid = core.config.processor_id as usize;
            let env = &mut core.env;
            let ok = core
                .monitor
                .do_exclusive_operation(pid, vaddr, || env.$write_m(vaddr, value as $ty));
            if ok {
                0
            } else {
                1
            }
        }
    };
}

mem_shims!(shim_read8, shim_write8, shim_ex_read8, shim_ex_write8, read_memory8, write_memory8, u8);
mem_shims!(shim_read16, shim_write16, shim_ex_read16, shim_ex_write16, read_memory16, write_memory16, u16);
mem_shims!(shim_read32, shim_write32, shim_ex_read32, shim_ex_write32, read_memory32, write_memory32, u32);
mem_shims!(shim_read64, shim_write64, shim_ex_read64, shim_ex_write64, read_memory64, write_memory64, u64);

unsafe extern "C" fn shim_clear_exclusive<A: Architecture>(core: *mut Core<A>) {
    let core = unsafe { &mut *core };
    core.monitor.clear_processor(core.config.processor_id as usize);
}

unsafe extern "C" fn shim_call_svc<A: Architecture>(core: *mut Core<A>, imm: u64) {
    let core = unsafe { &mut *core };
    core.env.call_svc(imm as u32);
}

unsafe extern "C" fn shim_exception_raised<A: Architecture>(
    core: *mut Core<A>,
    pc: u64,
    kind: u64,
) {
    let core = unsafe { &mut *core };
    core.env
        .exception_raised(pc, ExceptionKind::from_u32(kind as u32));
}

unsafe extern "C" fn shim_interpret<A: Architecture>(core: *mut Core<A>, pc: u64, count: u64) {
    let core = unsafe { &mut *core };
    core.env.interpreter_fallback(pc, count as usize);
}

unsafe extern "C" fn shim_coproc_word<A: Architecture>(
    core: *mut Core<A>,
    slot: u64,
    a: u64,
    b: u64,
) -> u64 {
    let core = unsafe { &mut *core };
    let cb = core.coproc_slots[slot as usize].clone();
    cb(a as u32, b as u32) as u32 as u64
}

unsafe extern "C" fn shim_coproc_double<A: Architecture>(
    core: *mut Core<A>,
    slot: u64,
    a: u64,
    b: u64,
) -> u64 {
    let core = unsafe { &mut *core };
    let cb = core.coproc_slots[slot as usize].clone();
    cb(a as u32, b as u32)
}

/// Consult the cache only; compiling here would write to the arena while
/// executing from it. Updates the fast-dispatch table on a hit.
unsafe extern "C" fn shim_lookup<A: Architecture>(core: *mut Core<A>, desc: u64) -> u64 {
    let core = unsafe { &mut *core };
    let d = LocationDescriptor(desc);
    match core.cache.get(d) {
        Some(block) => {
            let entry = block.entry;
            if core.fast_dispatch_enabled {
                core.fast_dispatch_insert(d, entry);
            }
            entry
        }
        None => 0,
    }
}

// Pure reference helpers for dynamic shift amounts

extern "C" fn shim_lsl32(x: u64, amount: u64, carry_in: u64) -> u64 {
    let (r, c) = crate::opt::const_fold::lsl32_c(x as u32, amount as u32, carry_in != 0);
    r as u64 | (c as u64) << 32
}

extern "C" fn shim_lsr32(x: u64, amount: u64, carry_in: u64) -> u64 {
    let (r, c) = crate::opt::const_fold::lsr32_c(x as u32, amount as u32, carry_in != 0);
    r as u64 | (c as u64) << 32
}

extern "C" fn shim_asr32(x: u64, amount: u64, carry_in: u64) -> u64 {
    let (r, c) = crate::opt::const_fold::asr32_c(x as u32, amount as u32, carry_in != 0);
    r as u64 | (c as u64) << 32
}

extern "C" fn shim_ror32(x: u64, amount: u64, carry_in: u64) -> u64 {
    let (r, c) = crate::opt::const_fold::ror32_c(x as u32, amount as u32, carry_in != 0);
    r as u64 | (c as u64) << 32
}

extern "C" fn shim_shift64(x: u64, amount: u64, kind: u64) -> u64 {
    let amt = (amount & 63) as u32;
    match kind {
        0 => x << amt,
        1 => x >> amt,
        _ => ((x as i64) >> amt) as u64,
    }
}

// AES trampolines: (out, in) pointers into the caller's stack shadow

unsafe extern "C" fn shim_aes_encrypt(out: *mut u8, inp: *const u8) {
    let state = unsafe { *(inp as *const [u8; 16]) };
    let result = crate::runtime::aes::encrypt_single_round(state);
    unsafe { *(out as *mut [u8; 16]) = result };
}

unsafe extern "C" fn shim_aes_decrypt(out: *mut u8, inp: *const u8) {
    let state = unsafe { *(inp as *const [u8; 16]) };
    let result = crate::runtime::aes::decrypt_single_round(state);
    unsafe { *(out as *mut [u8; 16]) = result };
}

unsafe extern "C" fn shim_aes_mix(out: *mut u8, inp: *const u8) {
    let state = unsafe { *(inp as *const [u8; 16]) };
    let result = crate::runtime::aes::mix_columns(state);
    unsafe { *(out as *mut [u8; 16]) = result };
}

unsafe extern "C" fn shim_aes_inverse_mix(out: *mut u8, inp: *const u8) {
    let state = unsafe { *(inp as *const [u8; 16]) };
    let result = crate::runtime::aes::inverse_mix_columns(state);
    unsafe { *(out as *mut [u8; 16]) = result };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_descriptor_stable() {
        // The emitted crc32 and this function must agree with themselves
        assert_eq!(hash_descriptor(0x1234), hash_descriptor(0x1234));
        assert_ne!(hash_descriptor(0x1234), hash_descriptor(0x1235));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_crc32c_properties() {
        if !crc32c_available() {
            return;
        }
        // The polynomial LFSR with zero seed fixes zero
        assert_eq!(unsafe { crc32c_u64(0) }, 0);
        assert_ne!(unsafe { crc32c_u64(1) }, 0);
        assert_ne!(unsafe { crc32c_u64(1) }, unsafe { crc32c_u64(2) });
    }

    #[test]
    fn test_shift_shims_pack_carry() {
        let packed = shim_lsl32(0x8000_0001, 1, 0);
        assert_eq!(packed as u32, 2);
        assert_eq!(packed >> 32, 1);
        let packed = shim_ror32(1, 1, 0);
        assert_eq!(packed as u32, 0x8000_0000);
        assert_eq!(packed >> 32, 1);
    }

    #[test]
    fn test_shift64_shim() {
        assert_eq!(shim_shift64(1, 8, 0), 0x100);
        assert_eq!(shim_shift64(0x100, 8, 1), 1);
        assert_eq!(shim_shift64(0x8000_0000_0000_0000, 63, 2), u64::MAX);
    }
}
