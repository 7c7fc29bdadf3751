//! End-to-end A32 execution against the reference environment.
#![cfg(all(target_arch = "x86_64", unix))]

mod common;

use std::sync::Arc;

use armature_engine::{
    a32, Config, CoprocAction, Coprocessor, ExceptionKind, ExclusiveMonitor, ExitReason,
};
use common::test_env;

fn make_jit(mem_size: usize) -> (a32::Jit, std::sync::Arc<parking_lot::Mutex<common::Shared>>) {
    let (env, shared) = test_env(mem_size);
    let jit = a32::Jit::new(Config::default(), Box::new(env)).unwrap();
    (jit, shared)
}

#[test]
fn test_s1_mov_add_bx() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xe3a0_0001, // MOV R0, #1
            0xe280_0002, // ADD R0, R0, #2
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 3;
    jit.regs_mut()[14] = 0;
    jit.regs_mut()[15] = 0x100;

    let reason = jit.run();

    assert_eq!(jit.regs()[0], 3);
    assert_eq!(jit.regs()[15], 0);
    assert_eq!(jit.cpsr() >> 5 & 1, 0, "BX to an even address stays ARM");
    assert_eq!(reason, ExitReason::CyclesExhausted);
    assert_eq!(shared.lock().ticks_consumed, 3);
}

#[test]
fn test_s2_qadd_saturates_and_sets_q() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(0x100, &[0xe102_0051]); // QADD R0, R1, R2
    shared.lock().ticks = 1;
    jit.regs_mut()[1] = 0x7fff_ffff;
    jit.regs_mut()[2] = 1;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[0], 0x7fff_ffff);
    assert_eq!(jit.cpsr() >> 27 & 1, 1, "Q must be set on saturation");
}

#[test]
fn test_qadd_no_saturation_leaves_q_clear() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(0x100, &[0xe102_0051]);
    shared.lock().ticks = 1;
    jit.regs_mut()[1] = 5;
    jit.regs_mut()[2] = 7;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[0], 12);
    assert_eq!(jit.cpsr() >> 27 & 1, 0);
}

#[test]
fn test_flags_subs_borrow() {
    let (mut jit, shared) = make_jit(0x1000);
    // SUBS R2, R0, R1; BX LR
    shared.lock().load_words(0x100, &[0xe050_2001, 0xe12f_ff1e]);
    shared.lock().ticks = 2;
    jit.regs_mut()[0] = 3;
    jit.regs_mut()[1] = 5;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[2], 0xffff_fffe);
    let cpsr = jit.cpsr();
    assert_eq!(cpsr >> 31 & 1, 1, "negative");
    assert_eq!(cpsr >> 30 & 1, 0, "not zero");
    assert_eq!(cpsr >> 29 & 1, 0, "borrow clears carry");
    assert_eq!(cpsr >> 28 & 1, 0, "no overflow");
}

#[test]
fn test_conditional_execution() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xe3b0_0000, // MOVS R0, #0 (sets Z)
            0x03a0_1005, // MOVEQ R1, #5
            0x13a0_2007, // MOVNE R2, #7
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 4;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[1], 5, "EQ body must run");
    assert_eq!(jit.regs()[2], 0, "NE body must be skipped");
    assert_eq!(jit.regs()[15], 0);
}

#[test]
fn test_memory_load_store() {
    let (mut jit, shared) = make_jit(0x4000);
    shared.lock().load_words(
        0x100,
        &[
            0xe591_0004, // LDR R0, [R1, #4]
            0xe582_0000, // STR R0, [R2]
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().write(0x2004, 0xdead_beef, 4);
    shared.lock().ticks = 3;
    jit.regs_mut()[1] = 0x2000;
    jit.regs_mut()[2] = 0x3000;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[0], 0xdead_beef);
    assert_eq!(shared.lock().read(0x3000, 4), 0xdead_beef);
}

#[test]
fn test_s4_exclusive_pair_with_intervening_write() {
    let monitor = Arc::new(ExclusiveMonitor::new(2));
    let mem = {
        let (env, shared) = test_env(0x4000);
        let mut config = Config::default();
        config.processor_id = 0;
        config.global_monitor = Some(monitor.clone());
        let jit = a32::Jit::new(config, Box::new(env)).unwrap();
        (jit, shared)
    };
    let (mut jit1, shared1) = mem;

    // Processor 1 shares guest memory through its own environment view
    let (env2, shared2) = test_env(0x4000);
    let mut config2 = Config::default();
    config2.processor_id = 1;
    config2.global_monitor = Some(monitor.clone());
    let mut jit2 = a32::Jit::new(config2, Box::new(env2)).unwrap();

    shared1.lock().load_words(
        0x100,
        &[
            0xe191_0f9f, // LDREX R0, [R1]
            0xeaff_ffff, // B 0x108
            0xe181_2f93, // STREX R2, R3, [R1]
            0xe12f_ff1e, // BX LR
        ],
    );
    shared2.lock().load_words(
        0x180,
        &[
            0xe581_3000, // STR R3, [R1]
            0xe12f_ff1e, // BX LR
        ],
    );

    // Phase 1: processor 0 takes the reservation and stops before STREX
    shared1.lock().write(0x2000, 41, 4);
    shared1.lock().ticks = 2;
    jit1.regs_mut()[1] = 0x2000;
    jit1.regs_mut()[3] = 42;
    jit1.regs_mut()[15] = 0x100;
    jit1.run();
    assert_eq!(jit1.regs()[15], 0x108);

    // Phase 2: processor 1 writes the same word
    shared2.lock().ticks = 2;
    jit2.regs_mut()[1] = 0x2000;
    jit2.regs_mut()[3] = 99;
    jit2.regs_mut()[15] = 0x180;
    jit2.run();

    // Phase 3: the exclusive store must fail
    shared1.lock().ticks = 2;
    jit1.run();
    assert_eq!(jit1.regs()[2], 1, "intervening write must fail STREX");

    // Without interference the pair succeeds and memory is updated
    shared1.lock().ticks = 4;
    jit1.regs_mut()[15] = 0x100;
    jit1.run();
    assert_eq!(jit1.regs()[2], 0);
    assert_eq!(shared1.lock().read(0x2000, 4), 42);
}

#[test]
fn test_s5_self_modifying_code() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xe300_0001, // MOVW R0, #1
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 2;
    jit.regs_mut()[15] = 0x100;
    jit.run();
    assert_eq!(jit.regs()[0], 1);

    // Guest-visible write to the code page, reported by the host
    shared.lock().load_words(0x100, &[0xe300_0002]); // MOVW R0, #2
    jit.invalidate_cache_range(0x100, 4);

    shared.lock().ticks = 2;
    jit.regs_mut()[15] = 0x100;
    jit.run();
    assert_eq!(jit.regs()[0], 2, "execution must match the fresh code");
}

#[test]
fn test_s6_svc_then_fast_link_chain() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xef00_0000, // SVC #0
            0xe300_1007, // MOVW R1, #7
            0xe12f_ff1e, // BX LR
        ],
    );

    for round in 0..2 {
        shared.lock().ticks = 3;
        jit.regs_mut()[1] = 0;
        jit.regs_mut()[14] = 0;
        jit.regs_mut()[15] = 0x100;
        jit.run();
        assert_eq!(jit.regs()[1], 7, "round {round}");
        assert_eq!(jit.regs()[15], 0);
    }
    // Both rounds went through the SVC, the second via the patched link
    assert_eq!(shared.lock().svc_calls, vec![0, 0]);
}

#[test]
fn test_rsb_call_return() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xeb00_003e, // BL 0x200
            0xe300_2009, // 0x104: MOVW R2, #9
            0xe12f_ff1e, // 0x108: BX LR (returns to 0, LR unchanged? LR = 0x104)
        ],
    );
    shared.lock().load_words(
        0x200,
        &[
            0xe300_4005, // MOVW R4, #5
            0xe12f_ff1e, // BX LR -> RSB hit back to 0x104
        ],
    );
    shared.lock().ticks = 5;
    jit.regs_mut()[15] = 0x100;
    jit.run();

    assert_eq!(jit.regs()[4], 5);
    assert_eq!(jit.regs()[2], 9);
    assert_eq!(jit.regs()[14], 0x104, "BL must set the link register");
    // Run again now that every block is compiled: the return predicts via
    // the patched RSB entry
    shared.lock().ticks = 5;
    jit.regs_mut()[2] = 0;
    jit.regs_mut()[4] = 0;
    jit.regs_mut()[15] = 0x100;
    jit.run();
    assert_eq!(jit.regs()[4], 5);
    assert_eq!(jit.regs()[2], 9);
}

#[test]
fn test_step_executes_single_instructions() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xe300_0001, // MOVW R0, #1
            0xe300_1002, // MOVW R1, #2
        ],
    );
    jit.regs_mut()[15] = 0x100;

    jit.step();
    assert_eq!(jit.regs()[0], 1);
    assert_eq!(jit.regs()[1], 0);
    assert_eq!(jit.regs()[15], 0x104);

    jit.step();
    assert_eq!(jit.regs()[1], 2);
    assert_eq!(jit.regs()[15], 0x108);
}

#[test]
fn test_halt_requested_before_run() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(0x100, &[0xe300_0001]);
    shared.lock().ticks = 10;
    jit.regs_mut()[15] = 0x100;
    jit.halt_execution();

    let reason = jit.run();
    assert_eq!(reason, ExitReason::Halted);
    assert_eq!(jit.regs()[0], 0, "no guest code ran");
}

#[test]
fn test_undefined_instruction_reports_exception() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(0x100, &[0xe7f0_00f0]); // UDF
    shared.lock().ticks = 1;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    let exceptions = shared.lock().exceptions.clone();
    assert_eq!(exceptions, vec![(0x100, ExceptionKind::UndefinedInstruction)]);
    assert_eq!(jit.regs()[15], 0x100, "faulting PC is visible to the host");
}

#[test]
fn test_interpreter_fallback() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(0x100, &[0xe10f_0000]); // MRS R0, CPSR
    shared.lock().ticks = 1;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(shared.lock().interpreter_calls, vec![(0x100, 1)]);
}

#[test]
fn test_thumb_mode() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_halfwords(
        0x100,
        &[
            0x2001, // MOVS R0, #1
            0x3002, // ADDS R0, #2
            0x4770, // BX LR
        ],
    );
    shared.lock().ticks = 3;
    jit.set_cpsr(0x20); // Thumb
    jit.regs_mut()[14] = 0;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[0], 3);
    assert_eq!(jit.regs()[15], 0);
    assert_eq!(jit.cpsr() >> 5 & 1, 0, "BX to ARM clears T");
}

#[test]
fn test_thumb_conditional_branch() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_halfwords(
        0x100,
        &[
            0x2800, // CMP R0, #0
            0xd001, // BEQ +2 (to 0x108)
            0x2107, // MOVS R1, #7 (skipped when R0 == 0)
            0x2205, // 0x108: MOVS R2, #5
        ],
    );
    shared.lock().ticks = 4;
    jit.set_cpsr(0x20);
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[1], 0);
    assert_eq!(jit.regs()[2], 5);
}

struct TestCp {
    cell: *mut u32,
}

// Safety: the cell outlives the test and is only touched on the test thread.
unsafe impl Send for TestCp {}
unsafe impl Sync for TestCp {}

impl Coprocessor for TestCp {
    fn compile_get_one_word(&self, _two: bool, opc1: u32, crn: u32, _crm: u32, _opc2: u32) -> CoprocAction {
        if opc1 == 0 && crn == 1 {
            CoprocAction::Callback(Arc::new(|_, _| 0x1234))
        } else {
            CoprocAction::Unhandled
        }
    }

    fn compile_send_one_word(&self, _two: bool, opc1: u32, crn: u32, _crm: u32, _opc2: u32) -> CoprocAction {
        if opc1 == 0 && crn == 1 {
            CoprocAction::Ptr(self.cell)
        } else {
            CoprocAction::Unhandled
        }
    }
}

#[test]
fn test_coprocessor_get_and_send() {
    let cell: &'static mut u32 = Box::leak(Box::new(0u32));
    let cell_ptr = cell as *mut u32;

    let (env, shared) = test_env(0x1000);
    let mut config = Config::default();
    config.coprocessors[15] = Some(Arc::new(TestCp { cell: cell_ptr }));
    let mut jit = a32::Jit::new(config, Box::new(env)).unwrap();

    shared.lock().load_words(
        0x100,
        &[
            0xee11_0f10, // MRC p15, 0, R0, c1, c0, 0
            0xee01_5f10, // MCR p15, 0, R5, c1, c0, 0
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 3;
    jit.regs_mut()[5] = 0xfeed;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[0], 0x1234, "MRC reads through the callback");
    // Safety: same cell, test thread only
    assert_eq!(unsafe { *cell_ptr }, 0xfeed, "MCR stores through the pointer");
}

#[test]
fn test_fastmem_direct_access_bypasses_callbacks() {
    let guest_ram = vec![0u8; 0x4000];
    let (env, shared) = test_env(0x1000);
    let mut config = Config::default();
    config.fastmem_pointer = Some(guest_ram.as_ptr() as u64);
    let mut jit = a32::Jit::new(config, Box::new(env)).unwrap();

    // Place the guest value directly in the fastmem backing
    let value_addr = 0x2000usize;
    // Safety: in-bounds write to our own buffer
    unsafe {
        std::ptr::write_unaligned(guest_ram.as_ptr().add(value_addr) as *mut u32, 0xabad_1dea);
    }

    shared.lock().load_words(
        0x100,
        &[
            0xe591_0000, // LDR R0, [R1]
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 2;
    jit.regs_mut()[1] = value_addr as u32;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[0], 0xabad_1dea);
    assert!(
        !shared.lock().reads.contains(&(value_addr as u64)),
        "the load must not reach the callback"
    );
    drop(guest_ram);
}

#[test]
fn test_page_table_backed_memory() {
    use armature_engine::PageTable;

    // One mapped 4 KiB page at guest 0x2000
    let backing = vec![0u8; 0x1000];
    let mut entries: Vec<*mut u8> = vec![std::ptr::null_mut(); 1 << 20];
    entries[0x2] = backing.as_ptr() as *mut u8;

    let (env, shared) = test_env(0x1000);
    let mut config = Config::default();
    config.page_table = Some(PageTable {
        entries: entries.as_ptr(),
        address_bits: 32,
    });
    let mut jit = a32::Jit::new(config, Box::new(env)).unwrap();

    shared.lock().load_words(
        0x100,
        &[
            0xe582_0000, // STR R0, [R2]
            0xe592_1000, // LDR R1, [R2]
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 3;
    jit.regs_mut()[0] = 0x5151_0000;
    jit.regs_mut()[2] = 0x2010;
    jit.regs_mut()[15] = 0x100;

    jit.run();

    assert_eq!(jit.regs()[1], 0x5151_0000);
    // The store landed in the mapped page, not the callback RAM
    assert_eq!(
        u32::from_le_bytes(backing[0x10..0x14].try_into().unwrap()),
        0x5151_0000
    );
    assert_eq!(shared.lock().read(0x2010, 4), 0);
    drop(entries);
    drop(backing);
}

#[test]
fn test_optimizations_disabled_still_correct() {
    let (env, shared) = test_env(0x1000);
    let mut config = Config::default();
    config.enable_optimizations = false;
    config.enable_fast_dispatch = false;
    let mut jit = a32::Jit::new(config, Box::new(env)).unwrap();

    shared.lock().load_words(
        0x100,
        &[
            0xe3a0_0001, // MOV R0, #1
            0xe280_0002, // ADD R0, R0, #2
            0xe12f_ff1e, // BX LR
        ],
    );
    shared.lock().ticks = 3;
    jit.regs_mut()[15] = 0x100;

    jit.run();
    assert_eq!(jit.regs()[0], 3);
    assert_eq!(jit.regs()[15], 0);
}

#[test]
fn test_clear_cache_recompiles() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(0x100, &[0xe300_0001, 0xe12f_ff1e]);
    shared.lock().ticks = 2;
    jit.regs_mut()[15] = 0x100;
    jit.run();
    assert!(jit.cached_block_count() > 0);

    jit.clear_cache();
    assert_eq!(jit.cached_block_count(), 0);

    shared.lock().load_words(0x100, &[0xe300_0005, 0xe12f_ff1e]); // MOVW R0, #5
    shared.lock().ticks = 2;
    jit.regs_mut()[15] = 0x100;
    jit.run();
    assert_eq!(jit.regs()[0], 5);
}
