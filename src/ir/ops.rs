//! The fixed catalogue of pure operators (§3 `Binop`/`Unop`).
//!
//! These are closed enumerations: the selector and optimizer both rely on
//! exhaustive matches over them (Design Notes §9).

use super::ty::IRType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binop {
    Add(IRType),
    Sub(IRType),
    Mul(IRType),
    /// Unsigned divide.
    DivU(IRType),
    /// Signed divide.
    DivS(IRType),
    And(IRType),
    Or(IRType),
    Xor(IRType),
    Shl(IRType),
    ShrU(IRType),
    ShrA(IRType),

    CmpEq(IRType),
    CmpNe(IRType),
    CmpLtU(IRType),
    CmpLtS(IRType),
    CmpLeU(IRType),
    CmpLeS(IRType),

    /// Narrow a wide lane pair down to one lane of half the width, e.g.
    /// `NarrowBin(I64) : (I32, I32) -> I64` packing two I32 halves.
    NarrowBin(IRType),
}

impl Binop {
    /// The type of both operands (this IR has no mixed-width binops; the
    /// front end is required to insert explicit widen/narrow unops).
    ///
    /// `NarrowBin(t)` is the one exception: it is parameterized by its
    /// *result* width, so its operands are each half that width (two I32s
    /// pack into an I64, per its doc comment above).
    pub fn operand_ty(self) -> IRType {
        use Binop::*;
        match self {
            Add(t) | Sub(t) | Mul(t) | DivU(t) | DivS(t) | And(t) | Or(t) | Xor(t) | Shl(t)
            | ShrU(t) | ShrA(t) | CmpEq(t) | CmpNe(t) | CmpLtU(t) | CmpLtS(t) | CmpLeU(t)
            | CmpLeS(t) => t,
            NarrowBin(t) => half_width(t),
        }
    }

    pub fn result_ty(self) -> IRType {
        use Binop::*;
        match self {
            CmpEq(_) | CmpNe(_) | CmpLtU(_) | CmpLtS(_) | CmpLeU(_) | CmpLeS(_) => IRType::I1,
            NarrowBin(t) => t,
            other => other.operand_ty(),
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Binop::Add(_) | Binop::Mul(_) | Binop::And(_) | Binop::Or(_) | Binop::Xor(_) | Binop::CmpEq(_) | Binop::CmpNe(_)
        )
    }

    /// Does this binop set AMD64 flags equivalent to comparing its result to
    /// zero? Used by the selector's condition-code cache (§4.2).
    pub fn sets_flags_like_cmp_zero(self) -> bool {
        matches!(self, Binop::Sub(_) | Binop::Add(_) | Binop::And(_) | Binop::Xor(_))
    }
}

fn half_width(t: IRType) -> IRType {
    match t {
        IRType::I64 => IRType::I32,
        IRType::I32 => IRType::I16,
        IRType::I16 => IRType::I8,
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unop {
    Neg(IRType),
    Not(IRType),

    /// Zero-extend from the given width up to the result width.
    Widen { from: IRType, to: IRType, signed: bool },
    /// Truncate down to the given width, dropping high bits.
    Narrow { from: IRType, to: IRType },

    IntToFloat { from: IRType, to: IRType, signed: bool },
    FloatToInt { from: IRType, to: IRType, signed: bool },
    FloatToFloat { from: IRType, to: IRType },
}

impl Unop {
    pub fn operand_ty(self) -> IRType {
        match self {
            Unop::Neg(t) | Unop::Not(t) => t,
            Unop::Widen { from, .. } | Unop::Narrow { from, .. } => from,
            Unop::IntToFloat { from, .. } | Unop::FloatToInt { from, .. } | Unop::FloatToFloat { from, .. } => from,
        }
    }

    pub fn result_ty(self) -> IRType {
        match self {
            Unop::Neg(t) | Unop::Not(t) => t,
            Unop::Widen { to, .. } | Unop::Narrow { to, .. } => to,
            Unop::IntToFloat { to, .. } | Unop::FloatToInt { to, .. } | Unop::FloatToFloat { to, .. } => to,
        }
    }
}
