//! SSA microinstruction IR
//!
//! One block of IR per translated guest basic block. Instructions are typed,
//! refer only to earlier instructions in the same block, and may carry
//! pseudo-operation back-links for side-channel outputs (carry, overflow).

pub mod block;
pub mod builder;
pub mod display;
pub mod opcode;
pub mod types;
pub mod value;

pub use block::{Block, Terminal};
pub use builder::IrBuilder;
pub use opcode::Opcode;
pub use types::Type;
pub use value::{Inst, InstId, SideChannel, Value};
