//! The addressing-mode matcher (§4.2 "Tiling rules" / Load-Store): folds
//! `Add(base, Const)` and `Add(base, Shl(index, Const)) + Const` patterns
//! into a single AMD64 [`AMode`] instead of materializing the full address
//! into a register first.

use crate::ir::{Binop, Expr, ExprId, IRBB};

use super::super::host_instr::AMode;
use super::Selector;

impl<'a> Selector<'a> {
    /// Match `addr` against the addressing-mode patterns the AMD64 backend
    /// recognizes, falling back to "materialize into a register, offset 0"
    /// when nothing folds.
    pub(super) fn select_amode(&mut self, bb: &IRBB, addr: ExprId) -> AMode {
        if let Expr::Binop { op: Binop::Add(t), a, b } = bb.arena.get(addr) {
            if t.is_integer() {
                if let Some(am) = self.try_base_plus_const(bb, *a, *b) {
                    return am;
                }
                if let Some(am) = self.try_base_plus_scaled_index(bb, *a, *b) {
                    return am;
                }
            }
        }
        let base = self.select_expr(bb, addr);
        AMode::IR { imm: 0, base }
    }

    fn try_base_plus_const(&mut self, bb: &IRBB, a: ExprId, b: ExprId) -> Option<AMode> {
        if let Expr::Const(c) = bb.arena.get(b) {
            let imm = c.to_bits64() as i64;
            if imm == imm as i32 as i64 {
                let base = self.select_expr(bb, a);
                return Some(AMode::IR { imm: imm as i32, base });
            }
        }
        None
    }

    fn try_base_plus_scaled_index(&mut self, bb: &IRBB, a: ExprId, b: ExprId) -> Option<AMode> {
        // `Add(base, Shl(index, Const))`, optionally with an outer `+
        // Const` already peeled off by the caller (here we only match the
        // scaled-index half; a wrapping `Add(_, Const)` is handled by
        // `select_amode` recursing through `select_expr`'s constant-fold
        // normal form, since the optimizer canonicalizes additive chains
        // left-to-right).
        if let Expr::Binop { op: Binop::Shl(t), a: index, b: shamt } = bb.arena.get(b) {
            if t.is_integer() {
                if let Expr::Const(c) = bb.arena.get(*shamt) {
                    let scale = c.to_bits64();
                    if scale <= 3 {
                        let base = self.select_expr(bb, a);
                        let index_reg = self.select_expr(bb, *index);
                        return Some(AMode::IRRS { imm: 0, base, index: index_reg, scale: scale as u8 });
                    }
                }
            }
        }
        None
    }
}
