//! IR verifier
//!
//! Debug-only structural checks run after the optimizer: SSA references
//! point backward to live instructions, argument kinds and types agree with
//! the opcode table, pseudo-operation links are symmetric, and the block has
//! a real terminal. Violations are translator bugs and abort.

use crate::ir::{Block, Opcode, SideChannel, Value};

/// Panics if the block violates an IR invariant.
pub fn verify(block: &Block) {
    assert!(!block.terminal.is_invalid(), "block has no terminal");

    for id in block.inst_ids() {
        let inst = block.inst(id);
        if inst.is_void() {
            continue;
        }
        let info = inst.op.info();
        assert_eq!(
            info.args.len(),
            inst.args.len(),
            "arity mismatch at {}: {}",
            id,
            inst.op.name()
        );

        for (arg, slot) in inst.args.iter().zip(info.args) {
            if let Value::Inst(ref_id) = arg {
                assert!(
                    ref_id.0 < id.0,
                    "forward reference at {}: {} -> {}",
                    id,
                    inst.op.name(),
                    ref_id
                );
                assert!(
                    !block.inst(*ref_id).is_void(),
                    "reference to removed instruction at {}",
                    id
                );
            }
            assert!(
                arg.matches_arg(*slot, block),
                "argument kind mismatch at {}: {:?} in {:?}",
                id,
                arg,
                slot
            );
        }

        // Pseudo links are symmetric
        for (channel, link) in [
            (SideChannel::Carry, inst.carry_out),
            (SideChannel::Overflow, inst.overflow_out),
        ] {
            if let Some(pseudo) = link {
                let p = block.inst(pseudo);
                assert!(p.op.info().pseudo, "side channel links to non-pseudo op");
                assert_eq!(
                    p.args.first(),
                    Some(&Value::Inst(id)),
                    "pseudo-op does not point back at its producer"
                );
                let expected_op = match channel {
                    SideChannel::Carry => Opcode::GetCarryFromOp,
                    SideChannel::Overflow => Opcode::GetOverflowFromOp,
                };
                assert_eq!(p.op, expected_op, "pseudo-op reads the wrong channel");
            }
        }

        if info.pseudo {
            let producer = match inst.args[0] {
                Value::Inst(p) => p,
                _ => panic!("pseudo-op without a producer argument"),
            };
            let channel = match inst.op {
                Opcode::GetCarryFromOp => SideChannel::Carry,
                _ => SideChannel::Overflow,
            };
            assert_eq!(
                block.inst(producer).pseudo_link(channel),
                Some(id),
                "producer does not link back to pseudo-op {}",
                id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, Terminal};
    use crate::loc::LocationDescriptor;

    #[test]
    fn test_valid_block_passes() {
        let mut b = IrBuilder::new(LocationDescriptor(0));
        let sum = b.add32(Value::U32(1), Value::U32(2), Value::U1(false));
        let c = b.carry_from(sum);
        b.set_c_flag(c);
        b.set_register(0, sum);
        let block = b.finish(Terminal::ReturnToDispatch);
        verify(&block);
    }

    #[test]
    #[should_panic]
    fn test_missing_terminal_caught() {
        let b = IrBuilder::new(LocationDescriptor(0));
        let block = b.block;
        verify(&block);
    }
}
