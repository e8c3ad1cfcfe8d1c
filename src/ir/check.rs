//! Invariant checking (§3 invariants 1–4, §8 universal invariants).
//!
//! Called by the driver before the optimizer runs and again before the
//! selector runs, since both a buggy front end and a buggy optimizer
//! rewrite are "front-end bugs" as far as §4.2's contract is concerned —
//! the selector is allowed to assume it never sees an ill-typed tree.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::ir::constant::IRConst;
use crate::ir::expr::{Expr, ExprId, TmpId};
use crate::ir::ops::{Binop, Unop};
use crate::ir::stmt::Stmt;
use crate::ir::ty::IRType;

use super::block::IRBB;

pub fn typecheck(bb: &IRBB) -> Result<(), CoreError> {
    let mut defined: HashSet<TmpId> = HashSet::new();

    for stmt in &bb.stmts {
        match stmt {
            Stmt::Assign { dst, src } => {
                check_expr(bb, *src, &defined)?;
                if defined.contains(dst) {
                    return Err(CoreError::DoubleDefine(dst.0));
                }
                let declared = bb.tmp_ty(*dst).ok_or(CoreError::UseBeforeDef(dst.0))?;
                let actual = expr_ty(bb, *src, &defined)?;
                require_eq("Assign", declared, actual)?;
                defined.insert(*dst);
            }
            Stmt::Put { src, .. } => {
                check_expr(bb, *src, &defined)?;
            }
            Stmt::PutI { ix, src, .. } => {
                check_expr(bb, *ix, &defined)?;
                check_expr(bb, *src, &defined)?;
            }
            Stmt::Store { addr, data, .. } => {
                check_expr(bb, *addr, &defined)?;
                check_expr(bb, *data, &defined)?;
            }
            Stmt::Dirty { mem_fx, args, ret_tmp, .. } => {
                if let Some(fx) = mem_fx {
                    check_expr(bb, fx.addr, &defined)?;
                }
                for a in args {
                    check_expr(bb, *a, &defined)?;
                }
                if let Some(rt) = ret_tmp {
                    // A Dirty call's return tmp is defined by the statement
                    // itself (it has no pure defining expression).
                    defined.insert(*rt);
                }
            }
            Stmt::MFence => {}
            Stmt::Exit { guard, .. } => {
                check_expr(bb, *guard, &defined)?;
                let gt = expr_ty(bb, *guard, &defined)?;
                require_eq("Exit guard", IRType::I1, gt)?;
            }
        }
    }

    check_expr(bb, bb.next, &defined)?;
    let next_ty = expr_ty(bb, bb.next, &defined)?;
    // The guest pointer width for every front end this core currently
    // targets (x86/AMD64/ARM64) is 64 bits; a 32-bit guest front end would
    // widen its `next` expression itself.
    require_eq("block next", IRType::I64, next_ty)?;

    Ok(())
}

fn require_eq(component: &'static str, expected: IRType, got: IRType) -> Result<(), CoreError> {
    if expected == got {
        Ok(())
    } else {
        Err(CoreError::TypeMismatch { component, expected, got })
    }
}

/// Walk an expression, checking that every `Tmp` use is dominated by its
/// definition (§3 invariant 2: statements are linear, so dominance reduces
/// to "appears earlier in the list").
fn check_expr(bb: &IRBB, id: ExprId, defined: &HashSet<TmpId>) -> Result<(), CoreError> {
    match bb.arena.get(id) {
        Expr::Tmp(t) => {
            if !defined.contains(t) {
                return Err(CoreError::UseBeforeDef(t.0));
            }
            Ok(())
        }
        Expr::Get { .. } | Expr::Const(_) => Ok(()),
        Expr::GetI { ix, .. } => check_expr(bb, *ix, defined),
        Expr::Binop { a, b, .. } => {
            check_expr(bb, *a, defined)?;
            check_expr(bb, *b, defined)
        }
        Expr::Unop { a, .. } => check_expr(bb, *a, defined),
        Expr::Load { addr, .. } => check_expr(bb, *addr, defined),
        Expr::CCall { args, .. } => {
            for a in args {
                check_expr(bb, *a, defined)?;
            }
            Ok(())
        }
        Expr::Mux0X { cond, then_e, else_e } => {
            check_expr(bb, *cond, defined)?;
            check_expr(bb, *then_e, defined)?;
            check_expr(bb, *else_e, defined)
        }
    }
}

/// Compute (and check) the static type of an expression (§3 invariant 3).
pub fn expr_ty(bb: &IRBB, id: ExprId, defined: &HashSet<TmpId>) -> Result<IRType, CoreError> {
    match bb.arena.get(id) {
        Expr::Get { ty, .. } => Ok(*ty),
        Expr::GetI { descr, .. } => Ok(descr.elem_ty),
        Expr::Tmp(t) => bb.tmp_ty(*t).ok_or(CoreError::UseBeforeDef(t.0)),
        Expr::Const(c) => Ok(c.ty()),
        Expr::Binop { op, a, b } => {
            let at = expr_ty(bb, *a, defined)?;
            let bt = expr_ty(bb, *b, defined)?;
            let want = op.operand_ty();
            require_eq("Binop lhs", want, at)?;
            require_eq("Binop rhs", want, bt)?;
            Ok(op.result_ty())
        }
        Expr::Unop { op, a } => {
            let at = expr_ty(bb, *a, defined)?;
            require_eq("Unop operand", op.operand_ty(), at)?;
            Ok(op.result_ty())
        }
        Expr::Load { ty, addr, .. } => {
            let at = expr_ty(bb, *addr, defined)?;
            require_eq("Load address", IRType::I64, at)?;
            Ok(*ty)
        }
        Expr::CCall { ret_ty, args, .. } => {
            for a in args {
                expr_ty(bb, *a, defined)?;
            }
            Ok(*ret_ty)
        }
        Expr::Mux0X { cond, then_e, else_e } => {
            let ct = expr_ty(bb, *cond, defined)?;
            require_eq("Mux0X guard", IRType::I1, ct)?;
            let tt = expr_ty(bb, *then_e, defined)?;
            let et = expr_ty(bb, *else_e, defined)?;
            require_eq("Mux0X arms", tt, et)?;
            Ok(tt)
        }
    }
}

/// Constant-fold entry point used by [`super::super::middle::optimizer`];
/// lives here because it needs the same type-driven dispatch as `expr_ty`.
pub fn fold_binop(op: Binop, a: IRConst, b: IRConst) -> Option<IRConst> {
    use Binop::*;
    let (au, bu) = (a.to_bits64(), b.to_bits64());
    let ty = op.operand_ty();
    let mask = width_mask(ty);
    let wrap = |v: u64| -> u64 { v & mask };
    let result_u = match op {
        Add(_) => wrap(au.wrapping_add(bu)),
        Sub(_) => wrap(au.wrapping_sub(bu)),
        Mul(_) => wrap(au.wrapping_mul(bu)),
        DivU(_) => {
            if bu == 0 {
                return None;
            }
            wrap(au / bu)
        }
        DivS(_) => {
            let (as_, bs) = (sign_extend(au, ty), sign_extend(bu, ty));
            if bs == 0 {
                return None;
            }
            wrap(as_.wrapping_div(bs) as u64)
        }
        And(_) => wrap(au & bu),
        Or(_) => wrap(au | bu),
        Xor(_) => wrap(au ^ bu),
        Shl(_) => wrap(au << (bu & shift_mask(ty))),
        ShrU(_) => wrap(au >> (bu & shift_mask(ty))),
        ShrA(_) => wrap((sign_extend(au, ty) >> (bu & shift_mask(ty)) as i64) as u64),
        CmpEq(_) => return Some(IRConst::U1(au == bu)),
        CmpNe(_) => return Some(IRConst::U1(au != bu)),
        CmpLtU(_) => return Some(IRConst::U1(au < bu)),
        CmpLtS(_) => return Some(IRConst::U1(sign_extend(au, ty) < sign_extend(bu, ty))),
        CmpLeU(_) => return Some(IRConst::U1(au <= bu)),
        CmpLeS(_) => return Some(IRConst::U1(sign_extend(au, ty) <= sign_extend(bu, ty))),
        NarrowBin(_) => {
            // Pack `a` (low half) and `b` (high half) into a double-width
            // result; used for e.g. 32+32 -> 64 lane construction.
            let half_bits = ty.size_bytes().unwrap_or(8) * 8;
            return Some(reinterpret(op.result_ty(), wrap(au) | (wrap(bu) << half_bits)));
        }
    };
    Some(reinterpret(op.result_ty(), result_u))
}

pub fn fold_unop(op: Unop, a: IRConst) -> Option<IRConst> {
    use Unop::*;
    let ty = op.operand_ty();
    let mask = width_mask(ty);
    match op {
        Neg(_) => Some(reinterpret(op.result_ty(), (0u64.wrapping_sub(a.to_bits64())) & mask)),
        Not(_) => Some(reinterpret(op.result_ty(), (!a.to_bits64()) & width_mask(op.result_ty()))),
        Widen { to, signed, .. } => {
            let v = if signed { sign_extend(a.to_bits64(), ty) as u64 } else { a.to_bits64() };
            Some(reinterpret(to, v & width_mask(to)))
        }
        Narrow { to, .. } => Some(reinterpret(to, a.to_bits64() & width_mask(to))),
        IntToFloat { to, signed, .. } => {
            let f = if signed {
                sign_extend(a.to_bits64(), ty) as f64
            } else {
                a.to_bits64() as f64
            };
            Some(match to {
                IRType::F32 => IRConst::F64(f as f32 as f64),
                _ => IRConst::F64(f),
            })
        }
        FloatToInt { to, signed, .. } => {
            let f = match a {
                IRConst::F64(f) => f,
                IRConst::F64I(bits) => f64::from_bits(bits),
                _ => return None,
            };
            let v = if signed { f as i64 as u64 } else { f as u64 };
            Some(reinterpret(to, v & width_mask(to)))
        }
        FloatToFloat { to, .. } => {
            let f = match a {
                IRConst::F64(f) => f,
                IRConst::F64I(bits) => f64::from_bits(bits),
                _ => return None,
            };
            Some(match to {
                IRType::F32 => IRConst::F64(f as f32 as f64),
                _ => IRConst::F64(f),
            })
        }
    }
}

fn width_mask(ty: IRType) -> u64 {
    match ty {
        IRType::I1 => 0x1,
        IRType::I8 => 0xFF,
        IRType::I16 => 0xFFFF,
        IRType::I32 | IRType::F32 => 0xFFFF_FFFF,
        IRType::I64 | IRType::F64 => u64::MAX,
        IRType::V128 => u64::MAX,
    }
}

fn shift_mask(ty: IRType) -> u64 {
    match ty {
        IRType::I8 => 7,
        IRType::I16 => 15,
        IRType::I32 => 31,
        _ => 63,
    }
}

fn sign_extend(v: u64, ty: IRType) -> i64 {
    let bits = match ty {
        IRType::I1 => 1,
        IRType::I8 => 8,
        IRType::I16 => 16,
        IRType::I32 => 32,
        _ => 64,
    };
    if bits == 64 {
        v as i64
    } else {
        let shift = 64 - bits;
        ((v << shift) as i64) >> shift
    }
}

fn reinterpret(ty: IRType, bits: u64) -> IRConst {
    match ty {
        IRType::I1 => IRConst::U1(bits & 1 != 0),
        IRType::I8 => IRConst::U8(bits as u8),
        IRType::I16 => IRConst::U16(bits as u16),
        IRType::I32 => IRConst::U32(bits as u32),
        IRType::I64 => IRConst::U64(bits),
        IRType::F32 | IRType::F64 => IRConst::F64I(bits),
        IRType::V128 => IRConst::V128(bits as u16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_binop_wraps_add_to_the_operand_width() {
        let got = fold_binop(Binop::Add(IRType::I8), IRConst::U8(0xFF), IRConst::U8(2)).unwrap();
        assert_eq!(got, IRConst::U8(1));
    }

    #[test]
    fn fold_binop_div_by_zero_is_not_folded() {
        assert!(fold_binop(Binop::DivU(IRType::I32), IRConst::U32(10), IRConst::U32(0)).is_none());
        assert!(fold_binop(Binop::DivS(IRType::I32), IRConst::U32(10), IRConst::U32(0)).is_none());
    }

    #[test]
    fn fold_binop_signed_compare_respects_sign() {
        // -1i32 as bits is 0xFFFFFFFF, which is far larger than 1 unsigned
        // but smaller than 1 once sign-extended.
        let neg_one = IRConst::U32(0xFFFF_FFFF);
        let one = IRConst::U32(1);
        assert_eq!(fold_binop(Binop::CmpLtS(IRType::I32), neg_one, one), Some(IRConst::U1(true)));
        assert_eq!(fold_binop(Binop::CmpLtU(IRType::I32), neg_one, one), Some(IRConst::U1(false)));
    }

    #[test]
    fn fold_binop_shift_amount_is_masked_to_the_operand_width() {
        // Shifting an I32 by 32 must mask down to 0, not overflow/panic.
        let got = fold_binop(Binop::Shl(IRType::I32), IRConst::U32(1), IRConst::U32(32)).unwrap();
        assert_eq!(got, IRConst::U32(1));
    }

    #[test]
    fn fold_binop_narrowbin_packs_two_half_width_lanes() {
        // NarrowBin(I64) takes two I32 halves and packs them into one I64.
        let lo = IRConst::U32(0x0000_0001);
        let hi = IRConst::U32(0x0000_0002);
        let got = fold_binop(Binop::NarrowBin(IRType::I64), lo, hi).unwrap();
        assert_eq!(got, IRConst::U64(0x0000_0002_0000_0001));
    }

    #[test]
    fn fold_unop_widen_signed_sign_extends() {
        // 0xFF as a signed I8 is -1; widened to I64 it must stay -1, i.e.
        // all-ones, not zero-extended to 0x00000000000000FF.
        let got = fold_unop(Unop::Widen { from: IRType::I8, to: IRType::I64, signed: true }, IRConst::U8(0xFF)).unwrap();
        assert_eq!(got, IRConst::U64(u64::MAX));
    }

    #[test]
    fn fold_unop_widen_unsigned_zero_extends() {
        let got = fold_unop(Unop::Widen { from: IRType::I8, to: IRType::I64, signed: false }, IRConst::U8(0xFF)).unwrap();
        assert_eq!(got, IRConst::U64(0xFF));
    }

    #[test]
    fn fold_unop_narrow_truncates_high_bits() {
        let got = fold_unop(Unop::Narrow { from: IRType::I32, to: IRType::I8 }, IRConst::U32(0x1234)).unwrap();
        assert_eq!(got, IRConst::U8(0x34));
    }

    #[test]
    fn fold_unop_neg_wraps_at_the_operand_width() {
        let got = fold_unop(Unop::Neg(IRType::I8), IRConst::U8(1)).unwrap();
        assert_eq!(got, IRConst::U8(0xFF));
    }

    #[test]
    fn typecheck_rejects_use_before_def() {
        use crate::ir::{Builder, JumpKind};
        let mut b = Builder::new(0x1000);
        let next = b.konst(IRConst::U64(0x1004));
        let mut bb = b.finish(next, JumpKind::Boring);
        // A hand-corrupted reference to a tmp that was never assigned.
        let bogus = bb.arena.push(Expr::Tmp(TmpId(99)));
        bb.stmts.push(Stmt::Put { offset: 0, src: bogus });
        assert!(matches!(typecheck(&bb), Err(CoreError::UseBeforeDef(99))));
    }
}
