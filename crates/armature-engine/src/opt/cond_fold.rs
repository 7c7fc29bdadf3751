//! A32 condition folding
//!
//! A32 blocks carry a block-level condition: the lifter only batches
//! consecutive instructions that share one. When the condition is not AL,
//! there are two lowerings:
//!
//! - If the body has no observable side effects (the usual case being a
//!   lone conditional branch), the condition folds into the terminal:
//!   `If(cond, original, LinkBlock(cond_failed))`, and the block becomes
//!   unconditional.
//! - Otherwise the backend emits a prelude conditional branch that skips
//!   the body to the condition-failed exit; this pass leaves such blocks
//!   alone.

use armature_isa::Cond;

use super::Pass;
use crate::ir::{Block, Terminal};

pub struct A32CondFolding;

impl Pass for A32CondFolding {
    fn name(&self) -> &str {
        "a32-condition-folding"
    }

    fn run(&self, block: &mut Block) {
        if block.cond == Cond::Al {
            return;
        }
        let has_side_effects = block
            .inst_ids()
            .map(|id| block.inst(id))
            .any(|i| !i.is_void() && i.op.info().side_effects);
        if has_side_effects {
            return;
        }
        let cond_failed = block
            .cond_failed
            .expect("conditional block without a condition-failed location");
        let original = std::mem::replace(&mut block.terminal, Terminal::Invalid);
        block.terminal = Terminal::If {
            cond: block.cond,
            then_: Box::new(original),
            else_: Box::new(Terminal::LinkBlock { next: cond_failed }),
        };
        block.cond = Cond::Al;
        block.cond_failed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, Value};
    use crate::loc::LocationDescriptor;

    #[test]
    fn test_pure_conditional_branch_folds() {
        let b = IrBuilder::new(LocationDescriptor(0x1000));
        let mut block = b.finish(Terminal::LinkBlock {
            next: LocationDescriptor(0x2000),
        });
        block.cond = Cond::Eq;
        block.cond_failed = Some(LocationDescriptor(0x1004));

        A32CondFolding.run(&mut block);

        assert_eq!(block.cond, Cond::Al);
        match &block.terminal {
            Terminal::If { cond, then_, else_ } => {
                assert_eq!(*cond, Cond::Eq);
                assert_eq!(
                    **then_,
                    Terminal::LinkBlock {
                        next: LocationDescriptor(0x2000)
                    }
                );
                assert_eq!(
                    **else_,
                    Terminal::LinkBlock {
                        next: LocationDescriptor(0x1004)
                    }
                );
            }
            other => panic!("expected If terminal, got {:?}", other),
        }
    }

    #[test]
    fn test_side_effecting_body_left_for_prelude() {
        let mut b = IrBuilder::new(LocationDescriptor(0x1000));
        b.set_register(0, Value::U32(1));
        let mut block = b.finish(Terminal::LinkBlock {
            next: LocationDescriptor(0x1004),
        });
        block.cond = Cond::Ne;
        block.cond_failed = Some(LocationDescriptor(0x1004));

        A32CondFolding.run(&mut block);

        // Unchanged: the backend will emit the prelude branch
        assert_eq!(block.cond, Cond::Ne);
        assert!(matches!(block.terminal, Terminal::LinkBlock { .. }));
    }

    #[test]
    fn test_al_block_untouched() {
        let b = IrBuilder::new(LocationDescriptor(0));
        let mut block = b.finish(Terminal::ReturnToDispatch);
        A32CondFolding.run(&mut block);
        assert_eq!(block.terminal, Terminal::ReturnToDispatch);
    }
}
