//! Runtime: code arena, dispatcher, block cache, fast dispatch, exclusive
//! monitor, fastmem fault recovery, and guest state layouts.

pub mod aes;
pub mod arena;
pub mod cache;
pub mod dispatch;
pub mod fastmem;
pub mod monitor;
pub mod state;

pub use dispatch::{Architecture, Core, ExitReason, A32, A64};
pub use monitor::ExclusiveMonitor;
pub use state::{A32JitState, A64JitState, StateInfo};
