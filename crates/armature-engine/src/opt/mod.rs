//! Optimization passes on translated blocks
//!
//! Each pass implements the `Pass` trait and transforms a `Block` in place.
//! The default pipeline runs guest get/set elimination, constant folding,
//! dead-code elimination, and A32 condition folding, in that order. All
//! passes preserve SSA form, pseudo-operation link integrity, and the
//! single-terminal invariant; the debug-only verifier checks exactly that.

pub mod cond_fold;
pub mod const_fold;
pub mod dce;
pub mod getset;
pub mod verify;

use rustc_hash::FxHashMap;

use crate::ir::{Block, InstId, Value};

/// An optimization pass on a block.
pub trait Pass: Send + Sync {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass, mutating the block in place
    fn run(&self, block: &mut Block);
}

/// Optimizer that runs a sequence of passes.
pub struct Optimizer {
    passes: Vec<Box<dyn Pass>>,
}

impl Optimizer {
    /// The default pass pipeline.
    pub fn new() -> Optimizer {
        Optimizer {
            passes: vec![
                Box::new(getset::GetSetElimination),
                Box::new(const_fold::ConstantFolding),
                Box::new(dce::DeadCodeElimination),
                Box::new(cond_fold::A32CondFolding),
            ],
        }
    }

    /// No passes at all (`enable_optimizations = false`).
    pub fn empty() -> Optimizer {
        Optimizer { passes: vec![] }
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Run all passes in order, then the verifier in debug builds.
    pub fn optimize(&self, block: &mut Block) {
        for pass in &self.passes {
            pass.run(block);
        }
        #[cfg(debug_assertions)]
        verify::verify(block);
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite every argument use according to `subs`, from instruction
/// `start` onward. Pseudo-operation producer references are left alone;
/// their producers are never substituted away while the link stands.
pub(crate) fn substitute_uses(block: &mut Block, start: u32, subs: &FxHashMap<InstId, Value>) {
    if subs.is_empty() {
        return;
    }
    for id in block.inst_ids().skip(start as usize) {
        let inst = block.inst_mut(id);
        if inst.op.info().pseudo {
            continue;
        }
        for arg in inst.args.iter_mut() {
            if let Value::Inst(ref_id) = arg {
                if let Some(&replacement) = subs.get(ref_id) {
                    *arg = replacement;
                }
            }
        }
    }
}
