//! IR primitive types.

/// The closed set of static types an IR expression can carry (§3).
///
/// Every expression has exactly one of these; the instruction selector and
/// the typecheck pass (see [`super::check`]) both match on this exhaustively
/// rather than via dynamic dispatch, per Design Notes §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IRType {
    /// A condition bit, the only legal type for `Mux0X`/`Exit` guards.
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl IRType {
    /// Size in bytes as stored in guest state / memory. `I1` has no direct
    /// storage representation; it only ever lives in a temporary.
    pub fn size_bytes(self) -> Option<u32> {
        use IRType::*;
        match self {
            I1 => None,
            I8 => Some(1),
            I16 => Some(2),
            I32 | F32 => Some(4),
            I64 | F64 => Some(8),
            V128 => Some(16),
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, IRType::I1 | IRType::I8 | IRType::I16 | IRType::I32 | IRType::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, IRType::F32 | IRType::F64)
    }
}

impl std::fmt::Display for IRType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IRType::I1 => "I1",
            IRType::I8 => "I8",
            IRType::I16 => "I16",
            IRType::I32 => "I32",
            IRType::I64 => "I64",
            IRType::F32 => "F32",
            IRType::F64 => "F64",
            IRType::V128 => "V128",
        };
        f.write_str(s)
    }
}
