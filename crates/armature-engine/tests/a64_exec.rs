//! End-to-end A64 execution against the reference environment.
#![cfg(all(target_arch = "x86_64", unix))]

mod common;

use armature_engine::{a64, Config, ExitReason};
use common::test_env;

fn make_jit(mem_size: usize) -> (a64::Jit, std::sync::Arc<parking_lot::Mutex<common::Shared>>) {
    let (env, shared) = test_env(mem_size);
    let jit = a64::Jit::new(Config::default(), Box::new(env)).unwrap();
    (jit, shared)
}

#[test]
fn test_s3_add_wraps_without_flags() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0x8b02_0020, // ADD X0, X1, X2
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 2;
    jit.regs_mut()[1] = u64::MAX;
    jit.regs_mut()[2] = 1;
    jit.regs_mut()[30] = 0;
    jit.set_pc(0x100);

    let reason = jit.run();

    assert_eq!(jit.regs()[0], 0, "unsigned wrap");
    assert_eq!(jit.pstate(), 0, "non-S form leaves flags untouched");
    assert_eq!(jit.pc(), 0);
    assert_eq!(reason, ExitReason::CyclesExhausted);
}

#[test]
fn test_adds_sets_carry_and_zero() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xab02_0020, // ADDS X0, X1, X2
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 2;
    jit.regs_mut()[1] = u64::MAX;
    jit.regs_mut()[2] = 1;
    jit.set_pc(0x100);

    jit.run();

    assert_eq!(jit.regs()[0], 0);
    // Z and C set, N and V clear
    assert_eq!(jit.pstate(), 0x6000_0000);
}

#[test]
fn test_movz_and_call_return() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xd280_0020, // MOVZ X0, #1
            0x9400_003f, // BL 0x200
            0xd280_0062, // 0x108: MOVZ X2, #3
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().load_words(
        0x200,
        &[
            0xd280_0041, // MOVZ X1, #2
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 6;
    jit.set_pc(0x100);

    jit.run();

    assert_eq!(jit.regs()[0], 1);
    assert_eq!(jit.regs()[1], 2);
    assert_eq!(jit.regs()[2], 3);
    assert_eq!(jit.regs()[30], 0x108, "BL links X30");
}

#[test]
fn test_cbz_both_ways() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xb400_0040, // CBZ X0, +8 (0x108)
            0xd280_0021, // MOVZ X1, #1
            0xd280_0042, // 0x108: MOVZ X2, #2
            0xd65f_03c0, // RET
        ],
    );

    shared.lock().ticks = 4;
    jit.regs_mut()[0] = 0;
    jit.set_pc(0x100);
    jit.run();
    assert_eq!(jit.regs()[1], 0, "taken branch skips the middle");
    assert_eq!(jit.regs()[2], 2);

    shared.lock().ticks = 4;
    jit.regs_mut()[0] = 5;
    jit.regs_mut()[1] = 0;
    jit.regs_mut()[2] = 0;
    jit.set_pc(0x100);
    jit.run();
    assert_eq!(jit.regs()[1], 1, "untaken branch falls through");
    assert_eq!(jit.regs()[2], 2);
}

#[test]
fn test_logical_immediate() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xb240_03e0, // ORR X0, XZR, #1
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 2;
    jit.set_pc(0x100);

    jit.run();
    assert_eq!(jit.regs()[0], 1);
}

#[test]
fn test_load_store_64() {
    let (mut jit, shared) = make_jit(0x4000);
    shared.lock().load_words(
        0x100,
        &[
            0xf940_0420, // LDR X0, [X1, #8]
            0xf900_0040, // STR X0, [X2]
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().write(0x2008, 0x0123_4567_89ab_cdef, 8);
    shared.lock().ticks = 3;
    jit.regs_mut()[1] = 0x2000;
    jit.regs_mut()[2] = 0x3000;
    jit.set_pc(0x100);

    jit.run();

    assert_eq!(jit.regs()[0], 0x0123_4567_89ab_cdef);
    assert_eq!(shared.lock().read(0x3000, 8), 0x0123_4567_89ab_cdef);
}

#[test]
fn test_exclusive_pair_uncontended() {
    let (mut jit, shared) = make_jit(0x4000);
    shared.lock().load_words(
        0x100,
        &[
            0xc85f_7c20, // LDXR X0, [X1]
            0xc802_7c23, // STXR W2, X3, [X1]
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().write(0x2000, 7, 8);
    shared.lock().ticks = 3;
    jit.regs_mut()[1] = 0x2000;
    jit.regs_mut()[3] = 0x77;
    jit.set_pc(0x100);

    jit.run();

    assert_eq!(jit.regs()[0], 7, "LDXR observes the old value");
    assert_eq!(jit.regs()[2], 0, "uncontended STXR succeeds");
    assert_eq!(shared.lock().read(0x2000, 8), 0x77);
}

#[test]
fn test_svc_reports_to_host() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xd400_0001, // SVC #0
            0xd280_0021, // MOVZ X1, #1
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 3;
    jit.set_pc(0x100);

    jit.run();

    assert_eq!(shared.lock().svc_calls, vec![0]);
    assert_eq!(jit.regs()[1], 1, "execution resumes after the SVC");
}

#[test]
fn test_w_register_zero_extends() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0x0b02_0020, // ADD W0, W1, W2
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 2;
    jit.regs_mut()[0] = u64::MAX;
    jit.regs_mut()[1] = 0xffff_ffff;
    jit.regs_mut()[2] = 1;
    jit.set_pc(0x100);

    jit.run();
    assert_eq!(jit.regs()[0], 0, "W-form result zero-extends into X0");
}

#[test]
fn test_madd_mul() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0x9b02_7c20, // MUL X0, X1, X2
            0xd65f_03c0, // RET
        ],
    );
    shared.lock().ticks = 2;
    jit.regs_mut()[1] = 7;
    jit.regs_mut()[2] = 6;
    jit.set_pc(0x100);

    jit.run();
    assert_eq!(jit.regs()[0], 42);
}

#[test]
fn test_step_single_instruction() {
    let (mut jit, shared) = make_jit(0x1000);
    shared.lock().load_words(
        0x100,
        &[
            0xd280_0020, // MOVZ X0, #1
            0xd280_0041, // MOVZ X1, #2
        ],
    );
    jit.set_pc(0x100);

    jit.step();
    assert_eq!(jit.regs()[0], 1);
    assert_eq!(jit.regs()[1], 0);
    assert_eq!(jit.pc(), 0x104);
}
