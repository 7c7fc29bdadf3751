//! Dead code elimination
//!
//! Reverse scan removing instructions with no users and no observable side
//! effect. Pseudo-operations sit after their producers, so a dead pseudo-op
//! falls first, releasing its producer's side channel; if the producer then
//! has no remaining users it falls on the same scan.

use super::Pass;
use crate::ir::{Block, InstId, Value};

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead-code-elimination"
    }

    fn run(&self, block: &mut Block) {
        let count = block.insts().len();
        let mut uses = vec![0u32; count];
        for id in block.inst_ids() {
            for arg in &block.inst(id).args {
                if let Value::Inst(ref_id) = arg {
                    uses[ref_id.index()] += 1;
                }
            }
        }

        for idx in (0..count).rev() {
            let id = InstId(idx as u32);
            let inst = block.inst(id);
            if inst.is_void() || !inst.op.removable() || uses[idx] != 0 {
                continue;
            }
            // A producer whose side channel is still consumed stays
            if inst.carry_out.is_some() || inst.overflow_out.is_some() {
                continue;
            }
            for arg in block.inst(id).args.clone() {
                if let Value::Inst(ref_id) = arg {
                    uses[ref_id.index()] -= 1;
                }
            }
            block.remove(id);
        }
    }
}
