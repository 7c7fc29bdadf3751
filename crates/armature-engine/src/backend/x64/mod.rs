//! x86-64 backend: encoder, register allocator, and per-opcode emitter.

pub mod asm;
pub mod emit;
pub mod regalloc;
