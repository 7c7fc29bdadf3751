//! Embedder interface
//!
//! The translator owns no memory and no peripherals: every guest-observable
//! effect goes through the `Environment` trait the embedder supplies.
//! Emitted host code reaches these methods through `extern "C"` shims that
//! recover the engine pointer from an immediate, so calls are ordinary
//! virtual dispatch underneath.
//!
//! Coprocessor access is resolved at translation time: the lifter asks the
//! registered `Coprocessor` how to compile each MCR/MRC and receives either
//! a callback to embed, a raw pointer to load/store through, or "unhandled"
//! (which lifts to the undefined-instruction exception sequence).

use std::sync::Arc;

/// Exception kinds reported through `Environment::exception_raised`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionKind {
    UndefinedInstruction = 0,
    UnpredictableInstruction = 1,
    Breakpoint = 2,
}

impl ExceptionKind {
    pub fn from_u32(v: u32) -> ExceptionKind {
        match v {
            0 => ExceptionKind::UndefinedInstruction,
            1 => ExceptionKind::UnpredictableInstruction,
            _ => ExceptionKind::Breakpoint,
        }
    }
}

/// Callbacks the embedder must provide. All addresses are guest virtual.
pub trait Environment {
    fn read_memory8(&mut self, vaddr: u64) -> u8;
    fn read_memory16(&mut self, vaddr: u64) -> u16;
    fn read_memory32(&mut self, vaddr: u64) -> u32;
    fn read_memory64(&mut self, vaddr: u64) -> u64;
    fn write_memory8(&mut self, vaddr: u64, value: u8);
    fn write_memory16(&mut self, vaddr: u64, value: u16);
    fn write_memory32(&mut self, vaddr: u64, value: u32);
    fn write_memory64(&mut self, vaddr: u64, value: u64);

    /// Instruction fetch. Defaults to the data path; embedders with split
    /// buses or instruction caches can override.
    fn read_code32(&mut self, vaddr: u64) -> u32 {
        self.read_memory32(vaddr)
    }
    fn read_code16(&mut self, vaddr: u64) -> u16 {
        self.read_memory16(vaddr)
    }

    /// Execute `num_instructions` guest instructions starting at `pc` in the
    /// embedder's interpreter, updating the register state in place.
    fn interpreter_fallback(&mut self, pc: u64, num_instructions: usize);

    /// Guest executed SVC.
    fn call_svc(&mut self, swi: u32);

    /// Undefined/unpredictable/breakpoint encountered at `pc`.
    fn exception_raised(&mut self, pc: u64, kind: ExceptionKind);

    /// Cycle accounting: the translator reports consumed cycles and asks how
    /// many it may run before returning to the host.
    fn add_ticks(&mut self, ticks: u64);
    fn ticks_remaining(&mut self) -> u64;
}

/// How a coprocessor instruction should be compiled.
pub enum CoprocAction {
    /// No such operation: compile the coprocessor exception sequence.
    Unhandled,
    /// Call into the embedder at runtime. The callback receives the one or
    /// two transferred words (zero for reads) and returns the result word(s).
    Callback(CoprocCallback),
    /// Load/store directly through a pointer into the embedder.
    Ptr(*mut u32),
}

/// A boxed runtime callback for coprocessor traffic.
///
/// For sends, `a`/`b` carry the transferred words and the return value is
/// ignored. For one-word gets the low word of the result is used; two-word
/// gets use the full u64.
pub type CoprocCallback = Arc<dyn Fn(u32, u32) -> u64 + Send + Sync>;

/// A guest coprocessor (CP0-CP15). Queried at translation time.
pub trait Coprocessor {
    fn compile_internal_operation(
        &self,
        _opc1: u32,
        _crd: u32,
        _crn: u32,
        _crm: u32,
        _opc2: u32,
    ) -> CoprocAction {
        CoprocAction::Unhandled
    }

    fn compile_send_one_word(
        &self,
        _two: bool,
        _opc1: u32,
        _crn: u32,
        _crm: u32,
        _opc2: u32,
    ) -> CoprocAction {
        CoprocAction::Unhandled
    }

    fn compile_send_two_words(&self, _two: bool, _opc: u32, _crm: u32) -> CoprocAction {
        CoprocAction::Unhandled
    }

    fn compile_get_one_word(
        &self,
        _two: bool,
        _opc1: u32,
        _crn: u32,
        _crm: u32,
        _opc2: u32,
    ) -> CoprocAction {
        CoprocAction::Unhandled
    }

    fn compile_get_two_words(&self, _two: bool, _opc: u32, _crm: u32) -> CoprocAction {
        CoprocAction::Unhandled
    }

    fn compile_load_words(&self, _two: bool, _long: bool, _crd: u32) -> CoprocAction {
        CoprocAction::Unhandled
    }

    fn compile_store_words(&self, _two: bool, _long: bool, _crd: u32) -> CoprocAction {
        CoprocAction::Unhandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_kind_roundtrip() {
        for kind in [
            ExceptionKind::UndefinedInstruction,
            ExceptionKind::UnpredictableInstruction,
            ExceptionKind::Breakpoint,
        ] {
            assert_eq!(ExceptionKind::from_u32(kind as u32), kind);
        }
    }

    #[test]
    fn test_coprocessor_defaults_unhandled() {
        struct Nop;
        impl Coprocessor for Nop {}
        assert!(matches!(
            Nop.compile_get_one_word(false, 0, 0, 0, 0),
            CoprocAction::Unhandled
        ));
    }
}
