//! IR type system
//!
//! Microinstructions are typed: U1 for flags and predicates, U8..U64 for
//! scalar data, U128 for vector state (AES), and Opaque for coprocessor
//! tokens that flow through the IR without the engine interpreting them.

/// Type of an IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Produces no value (stores, barriers, calls without results)
    Void,
    U1,
    U8,
    U16,
    U32,
    U64,
    U128,
    /// Coprocessor token; carried through, never computed on
    Opaque,
}

impl Type {
    /// Width in bits for the scalar types; None for Void/Opaque.
    pub fn bit_width(self) -> Option<u32> {
        match self {
            Type::U1 => Some(1),
            Type::U8 => Some(8),
            Type::U16 => Some(16),
            Type::U32 => Some(32),
            Type::U64 => Some(64),
            Type::U128 => Some(128),
            Type::Void | Type::Opaque => None,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Type::Void => "void",
            Type::U1 => "u1",
            Type::U8 => "u8",
            Type::U16 => "u16",
            Type::U32 => "u32",
            Type::U64 => "u64",
            Type::U128 => "u128",
            Type::Opaque => "opaque",
        };
        write!(f, "{}", s)
    }
}
