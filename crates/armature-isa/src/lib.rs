//! Guest ISA surface for the armature translator
//!
//! This crate holds everything the translation engine needs to know about the
//! guest instruction sets, independent of how blocks are lifted or emitted:
//! - The declarative decoder matcher engine (mask/expected pattern rows,
//!   first-match-wins, sentinel undefined fallback)
//! - Representative matcher tables for A32, Thumb-16 and A64
//! - Condition codes, guest register newtypes, and bitfield helpers
//!
//! The production decode tables of a full ARM implementation run to thousands
//! of rows; the tables here cover exactly the instructions the engine's
//! lifters translate. Rows decode into typed instruction enums with all
//! fields extracted, so the lifters never touch raw instruction words.

pub mod bits;
pub mod cond;
pub mod matcher;
pub mod reg;

pub mod a32;
pub mod a64;
pub mod thumb;

pub use cond::Cond;
pub use matcher::{DecodeTable, Matcher};
pub use reg::{Reg, XReg};
