//! armature-engine: a dynamic binary translator for A32/Thumb and A64 guests
//!
//! The pipeline translates guest basic blocks into SSA microinstruction IR,
//! optimizes them, and emits native host code into a per-instance arena.
//! A dispatcher loop with a return-stack buffer and a CRC32-indexed
//! fast-dispatch table chains blocks together; self-modifying code is
//! handled by range invalidation with jump unpatching.
//!
//! The embedder supplies memory, exception and cycle callbacks through the
//! [`env::Environment`] trait and drives execution through the
//! [`jit::a32::Jit`] / [`jit::a64::Jit`] facades.

pub mod config;
pub mod env;
pub mod frontend;
pub mod ir;
pub mod jit;
pub mod loc;
pub mod opt;
pub mod runtime;

pub mod backend;

pub use config::{Config, PageTable};
pub use env::{CoprocAction, Coprocessor, Environment, ExceptionKind};
pub use jit::{a32, a64};
pub use loc::LocationDescriptor;
pub use runtime::{ExclusiveMonitor, ExitReason};

/// Construction-time failures. Guest-observable conditions are never
/// errors: they invoke callbacks. Internal invariant violations abort.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("failed to map the code arena: {0}")]
    CodeArena(std::io::Error),
    #[error("code arena exhausted")]
    CodeArenaFull,
    #[error("unsupported host: {0}")]
    UnsupportedHost(String),
}
