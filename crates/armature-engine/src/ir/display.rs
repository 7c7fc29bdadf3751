//! Pretty-printing for IR blocks
//!
//! Dump format used by tests and debugging. Tombstoned instructions are
//! skipped so optimizer output reads clean.

use std::fmt;

use super::block::{Block, Terminal};
use super::value::{InstId, Value};

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Inst(id) => write!(f, "{}", id),
            Value::U1(v) => write!(f, "{}", if *v { "1b" } else { "0b" }),
            Value::U8(v) => write!(f, "{:#x}:u8", v),
            Value::U16(v) => write!(f, "{:#x}:u16", v),
            Value::U32(v) => write!(f, "{:#x}:u32", v),
            Value::U64(v) => write!(f, "{:#x}:u64", v),
            Value::GuestReg(r) => write!(f, "@r{}", r),
            Value::Cond(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Invalid => write!(f, "<invalid>"),
            Terminal::Interpret { next, num_instructions } => {
                write!(f, "interpret {} x{}", next, num_instructions)
            }
            Terminal::ReturnToDispatch => write!(f, "return_to_dispatch"),
            Terminal::LinkBlock { next } => write!(f, "link_block {}", next),
            Terminal::LinkBlockFast { next } => write!(f, "link_block_fast {}", next),
            Terminal::PopRSBHint => write!(f, "pop_rsb_hint"),
            Terminal::FastDispatchHint => write!(f, "fast_dispatch_hint"),
            Terminal::If { cond, then_, else_ } => {
                write!(f, "if {} then {{ {} }} else {{ {} }}", cond, then_, else_)
            }
            Terminal::CheckBit { then_, else_ } => {
                write!(f, "check_bit {{ {} }} else {{ {} }}", then_, else_)
            }
            Terminal::CheckHalt { else_ } => write!(f, "check_halt else {{ {} }}", else_),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {} (cycles: {}):", self.location, self.cycle_count)?;
        for id in self.inst_ids() {
            let inst = self.inst(id);
            if inst.is_void() {
                continue;
            }
            let ty = inst.op.info().result;
            if ty == super::types::Type::Void {
                write!(f, "  {}", lower_name(inst.op.name()))?;
            } else {
                write!(f, "  {}:{} = {}", InstId(id.0), ty, lower_name(inst.op.name()))?;
            }
            for arg in &inst.args {
                write!(f, " {}", arg)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "  {}", self.terminal)
    }
}

/// CamelCase opcode name to dotted lowercase (Add32 -> add32).
fn lower_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::loc::LocationDescriptor;

    #[test]
    fn test_display_block() {
        let mut b = IrBuilder::new(LocationDescriptor(0x100));
        let r0 = b.get_register(0);
        let sum = b.add32(r0, Value::U32(2), Value::U1(false));
        b.set_register(0, sum);
        let block = b.finish(Terminal::ReturnToDispatch);

        let text = format!("{}", block);
        assert!(text.contains("getregister @r0"));
        assert!(text.contains("add32 %0 0x2:u32 0b"));
        assert!(text.contains("return_to_dispatch"));
    }
}
