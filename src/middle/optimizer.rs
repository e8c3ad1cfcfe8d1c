//! The IR optimizer (§4.1): constant folding, identity collapses, dead-code
//! elimination, and `helper_spec` CCall specialization.
//!
//! Runs as a fixed-point-free single pass per Design Notes: the contract
//! only requires *a* semantically equivalent, well-typed `IRBB` out, and
//! the testable idempotence property (running it twice equals running it
//! once) holds because every rewrite here either leaves no further
//! redex behind or is re-checked by a subsequent statement's own pass.

use std::collections::HashSet;

use crate::common::Name;
use crate::ir::check::{fold_binop, fold_unop};
use crate::ir::{Binop, Expr, ExprArena, ExprId, IRBB, IRConst, Stmt, TmpId, Unop};

/// The front end's hook to fold architecture-specific pure helpers it can
/// see through (§4.1 "Specialization via the callback `helper_spec`").
pub trait HelperSpec {
    fn specialize(&self, name: Name, args: &[ExprId], arena: &ExprArena) -> Option<Expr>;
}

/// A `HelperSpec` that never specializes anything, for contexts with no
/// front end attached (tests, the `xlate-dump` tool).
pub struct NoSpecialization;

impl HelperSpec for NoSpecialization {
    fn specialize(&self, _name: Name, _args: &[ExprId], _arena: &ExprArena) -> Option<Expr> {
        None
    }
}

/// Run one optimization pass over `bb` in place.
pub fn optimize(bb: &mut IRBB, helper_spec: &dyn HelperSpec) {
    specialize_ccalls(bb, helper_spec);
    fold_and_collapse(bb);
    eliminate_dead_temps(bb);
    eliminate_dead_puts(bb);
}

/// Rewrite every `Expr::CCall` node the callback recognizes into its
/// specialized form, in place in the arena (§4.1). The CCall's original
/// slot is overwritten; anything already referencing that `ExprId` picks
/// up the replacement for free since references are indices, not values.
fn specialize_ccalls(bb: &mut IRBB, helper_spec: &dyn HelperSpec) {
    let n = bb.arena.len();
    for i in 0..n {
        let id = ExprId(i as u32);
        let (name, args) = match bb.arena.get(id) {
            Expr::CCall { callee, args, .. } => (*callee, args.clone()),
            _ => continue,
        };
        if let Some(replacement) = helper_spec.specialize(name, &args, &bb.arena) {
            replace_node(bb, id, replacement);
        }
    }
}

/// Constant-fold every Binop/Unop/Mux0X node whose operands are already
/// constants, and collapse the algebraic identities §4.1 names explicitly.
/// Both passes share a single forward sweep: later nodes can reference
/// earlier ones by index only (the arena is append-only), so a left-to-
/// right pass sees every operand already in its final folded form.
fn fold_and_collapse(bb: &mut IRBB) {
    let n = bb.arena.len();
    for i in 0..n {
        let id = ExprId(i as u32);
        let node = bb.arena.get(id).clone();
        if let Some(replacement) = try_fold_or_collapse(bb, &node) {
            replace_node(bb, id, replacement);
        }
    }
}

fn try_fold_or_collapse(bb: &IRBB, node: &Expr) -> Option<Expr> {
    match node {
        Expr::Binop { op, a, b } => {
            if let (Expr::Const(ca), Expr::Const(cb)) = (bb.arena.get(*a), bb.arena.get(*b)) {
                if let Some(folded) = fold_binop(*op, *ca, *cb) {
                    return Some(Expr::Const(folded));
                }
            }
            collapse_binop_identity(bb, *op, *a, *b)
        }
        Expr::Unop { op, a } => {
            if let Expr::Const(ca) = bb.arena.get(*a) {
                if let Some(folded) = fold_unop(*op, *ca) {
                    return Some(Expr::Const(folded));
                }
            }
            collapse_unop_identity(bb, *op, *a)
        }
        Expr::Mux0X { cond, then_e, else_e } => {
            if let Expr::Const(c) = bb.arena.get(*cond) {
                return Some(if c.is_zero() { bb.arena.get(*then_e).clone() } else { bb.arena.get(*else_e).clone() });
            }
            None
        }
        _ => None,
    }
}

/// `Add x 0`, `Mul x 1`, `And x 0`, `Or x 0`, shifts by 0 — each collapses
/// to one of its operands without needing a fresh node (§4.1).
fn collapse_binop_identity(bb: &IRBB, op: Binop, a: ExprId, b: ExprId) -> Option<Expr> {
    let const_of = |id: ExprId| match bb.arena.get(id) {
        Expr::Const(c) => Some(*c),
        _ => None,
    };
    match op {
        Binop::Add(_) => {
            if const_of(b).is_some_and(IRConst::is_zero) {
                return Some(bb.arena.get(a).clone());
            }
            if const_of(a).is_some_and(IRConst::is_zero) {
                return Some(bb.arena.get(b).clone());
            }
            None
        }
        Binop::Sub(_) => {
            if const_of(b).is_some_and(IRConst::is_zero) {
                return Some(bb.arena.get(a).clone());
            }
            None
        }
        Binop::Mul(_) => {
            if const_of(b).is_some_and(IRConst::is_one) {
                return Some(bb.arena.get(a).clone());
            }
            if const_of(a).is_some_and(IRConst::is_one) {
                return Some(bb.arena.get(b).clone());
            }
            None
        }
        Binop::And(_) => {
            if const_of(b).is_some_and(IRConst::is_zero) {
                return Some(bb.arena.get(b).clone());
            }
            None
        }
        Binop::Or(_) => {
            if const_of(b).is_some_and(IRConst::is_zero) {
                return Some(bb.arena.get(a).clone());
            }
            None
        }
        Binop::Shl(_) | Binop::ShrU(_) | Binop::ShrA(_) => {
            if const_of(b).is_some_and(IRConst::is_zero) {
                return Some(bb.arena.get(a).clone());
            }
            None
        }
        _ => None,
    }
}

/// Double negation and narrow-widen round-trips (§4.1).
fn collapse_unop_identity(bb: &IRBB, op: Unop, a: ExprId) -> Option<Expr> {
    if let Unop::Neg(_) = op {
        if let Expr::Unop { op: Unop::Neg(_), a: inner } = bb.arena.get(a) {
            return Some(bb.arena.get(*inner).clone());
        }
    }
    if let Unop::Narrow { to, .. } = op {
        if let Expr::Unop { op: Unop::Widen { from: widen_from, .. }, a: inner } = bb.arena.get(a) {
            if *widen_from == to {
                return Some(bb.arena.get(*inner).clone());
            }
        }
    }
    None
}

/// Overwrite node `id` in place. Used instead of pushing a brand-new node
/// and rewriting every reference, since references are by index: mutating
/// the slot is equivalent and touches every caller for free.
fn replace_node(bb: &mut IRBB, id: ExprId, replacement: Expr) {
    *bb.arena.get_mut(id) = replacement;
}

/// §4.1 "Dead-temporary elimination": drop any `Assign` whose `dst` is
/// never read by a later statement or by the block terminator, provided
/// its right-hand side is pure (every `Expr` variant is pure by
/// construction; only `Stmt::Dirty` carries effects, and it is never a
/// `Tmp :=`-style assignment).
fn eliminate_dead_temps(bb: &mut IRBB) {
    let used = collect_used_tmps(bb);
    bb.stmts.retain(|s| match s {
        Stmt::Assign { dst, .. } => used.contains(dst),
        _ => true,
    });
}

fn collect_used_tmps(bb: &IRBB) -> HashSet<TmpId> {
    let mut used = HashSet::new();
    for stmt in &bb.stmts {
        match stmt {
            Stmt::Assign { src, .. } => mark_used(bb, *src, &mut used),
            Stmt::Put { src, .. } => mark_used(bb, *src, &mut used),
            Stmt::PutI { ix, src, .. } => {
                mark_used(bb, *ix, &mut used);
                mark_used(bb, *src, &mut used);
            }
            Stmt::Store { addr, data, .. } => {
                mark_used(bb, *addr, &mut used);
                mark_used(bb, *data, &mut used);
            }
            Stmt::Dirty { mem_fx, args, .. } => {
                if let Some(fx) = mem_fx {
                    mark_used(bb, fx.addr, &mut used);
                }
                for a in args {
                    mark_used(bb, *a, &mut used);
                }
            }
            Stmt::MFence => {}
            Stmt::Exit { guard, .. } => mark_used(bb, *guard, &mut used),
        }
    }
    mark_used(bb, bb.next, &mut used);
    used
}

fn mark_used(bb: &IRBB, id: ExprId, used: &mut HashSet<TmpId>) {
    match bb.arena.get(id) {
        Expr::Tmp(t) => {
            used.insert(*t);
        }
        Expr::GetI { ix, .. } => mark_used(bb, *ix, used),
        Expr::Binop { a, b, .. } => {
            mark_used(bb, *a, used);
            mark_used(bb, *b, used);
        }
        Expr::Unop { a, .. } => mark_used(bb, *a, used),
        Expr::Load { addr, .. } => mark_used(bb, *addr, used),
        Expr::CCall { args, .. } => {
            for a in args {
                mark_used(bb, *a, used);
            }
        }
        Expr::Mux0X { cond, then_e, else_e } => {
            mark_used(bb, *cond, used);
            mark_used(bb, *then_e, used);
            mark_used(bb, *else_e, used);
        }
        Expr::Get { .. } | Expr::Const(_) => {}
    }
}

/// §4.1 "Dead-Put elimination": a `Put(offset, _)` killed by a later
/// `Put` of the same offset whose source is *at least as wide*, with no
/// intervening read of that offset and no intervening ordering barrier,
/// is redundant. A later, narrower `Put` at the same offset only
/// overwrites its low bytes, so it does not make the earlier, wider
/// write dead — the earlier write's high bytes are still the only
/// source of those bytes' value.
fn eliminate_dead_puts(bb: &mut IRBB) {
    let all_defined: HashSet<TmpId> = bb.type_env.keys().copied().collect();
    let n = bb.stmts.len();
    let mut dead = vec![false; n];
    for i in 0..n {
        let Stmt::Put { offset, src } = &bb.stmts[i] else { continue };
        let (offset, earlier_src) = (*offset, *src);
        let earlier_width = put_width_bits(crate::ir::check::expr_ty(bb, earlier_src, &all_defined).expect("optimizer runs on a well-typed block"));
        for j in (i + 1)..n {
            if stmt_reads_offset(bb, &bb.stmts[j], offset) || bb.stmts[j].is_ordering_barrier() {
                break;
            }
            if let Stmt::Put { offset: later_offset, src: later_src } = &bb.stmts[j] {
                if *later_offset == offset {
                    let later_width = put_width_bits(crate::ir::check::expr_ty(bb, *later_src, &all_defined).expect("optimizer runs on a well-typed block"));
                    dead[i] = later_width >= earlier_width;
                    break;
                }
            }
        }
    }
    let mut it = dead.into_iter();
    bb.stmts.retain(|_| !it.next().unwrap());
}

/// Bit width of a `Put`'s source type, for the "equal or wider" dead-Put
/// test above. `I1`/`I8` are both treated as the narrowest (1 byte on the
/// wire) since guest state never stores a lone condition bit packed
/// tighter than a byte.
fn put_width_bits(ty: crate::ir::IRType) -> u32 {
    use crate::ir::IRType::*;
    match ty {
        I1 | I8 => 8,
        I16 => 16,
        I32 | F32 => 32,
        I64 | F64 => 64,
        V128 => 128,
    }
}

/// Whether `stmt` reads guest-state offset `offset` — a `Dirty` call that
/// declares that offset in its footprint, or any expression it references
/// containing a `Get` of that exact offset or a `GetI` (whose index range
/// the optimizer does not attempt to check against `offset`, so it is
/// treated conservatively as reading everything).
fn stmt_reads_offset(bb: &IRBB, stmt: &Stmt, offset: crate::common::GuestOffset) -> bool {
    match stmt {
        Stmt::Dirty { guest_state_fx, args, .. } => {
            guest_state_fx.iter().any(|r| r.offset == offset) || args.iter().any(|a| expr_reads_offset(bb, *a, offset))
        }
        Stmt::Assign { src, .. } => expr_reads_offset(bb, *src, offset),
        Stmt::Put { src, .. } => expr_reads_offset(bb, *src, offset),
        Stmt::PutI { ix, src, .. } => expr_reads_offset(bb, *ix, offset) || expr_reads_offset(bb, *src, offset),
        Stmt::Store { addr, data, .. } => expr_reads_offset(bb, *addr, offset) || expr_reads_offset(bb, *data, offset),
        Stmt::MFence => false,
        Stmt::Exit { guard, .. } => expr_reads_offset(bb, *guard, offset),
    }
}

fn expr_reads_offset(bb: &IRBB, id: ExprId, offset: crate::common::GuestOffset) -> bool {
    match bb.arena.get(id) {
        Expr::Get { offset: o, .. } => *o == offset,
        Expr::GetI { .. } => true,
        Expr::Tmp(_) | Expr::Const(_) => false,
        Expr::Binop { a, b, .. } => expr_reads_offset(bb, *a, offset) || expr_reads_offset(bb, *b, offset),
        Expr::Unop { a, .. } => expr_reads_offset(bb, *a, offset),
        Expr::Load { addr, .. } => expr_reads_offset(bb, *addr, offset),
        Expr::CCall { args, .. } => args.iter().any(|a| expr_reads_offset(bb, *a, offset)),
        Expr::Mux0X { cond, then_e, else_e } => {
            expr_reads_offset(bb, *cond, offset) || expr_reads_offset(bb, *then_e, offset) || expr_reads_offset(bb, *else_e, offset)
        }
    }
}
