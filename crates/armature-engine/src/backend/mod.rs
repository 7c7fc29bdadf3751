//! Host code generation
//!
//! One backend per host architecture; x86-64 is the one provided. The
//! emitter consumes optimized IR blocks and produces position-fixed machine
//! code plus patch and fastmem records for the runtime to manage.

pub mod x64;

pub use x64::emit::{
    emit_block, CompiledBlock, FastmemSite, PatchKind, PatchRecord, RuntimeHandles, ShimTable,
    FASTMEM_REGION,
};
