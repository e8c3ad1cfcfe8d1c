//! The selector's condition-code cache (§4.2, Glossary "Condition-code
//! cache"): memoizes the most recent instruction known to set flags
//! equivalent to a given IR comparison, so a subsequent `Mux0X`/`Exit`
//! guard can skip a redundant compare.
//!
//! Per SPEC_FULL.md §9 Open Question 2, this crate takes the eager +
//! specialization route rather than modeling CC_OP/CC_DEP1/CC_DEP2 thunks:
//! the cache below is strictly a peephole memo over already-evaluated
//! comparisons, invalidated by any intervening flag-setting instruction.

use crate::ir::ExprId;
use crate::middle::host_instr::Cond;
use crate::middle::hreg::HReg;

/// What the most recent flag-setting instruction actually computed, in
/// terms the selector can match a guard expression against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedCompare {
    /// The IR expression id whose evaluation produced these flags (usually
    /// a `Binop::CmpXxx` or a flag-setting arithmetic op per
    /// `Binop::sets_flags_like_cmp_zero`).
    pub source_expr: ExprId,
    /// The register the comparison's result (as an I1) would be read from
    /// if re-materialized — used to confirm a guard really refers to the
    /// same comparison rather than merely an equal-looking one.
    pub result_reg: HReg,
    /// The flag condition that is true exactly when `source_expr` holds.
    /// For a `Binop::CmpXxx` this is that comparison's own condition; for
    /// a flags-setting ALU op used as a truthiness guard
    /// (`sets_flags_like_cmp_zero`) it is `NZ` (the op's result, compared
    /// to zero, is what "truthy" means). Re-testing must dispatch on this
    /// rather than assume every cached guard is a zero/nonzero check.
    pub cond: Cond,
}

#[derive(Debug, Default)]
pub struct CondCodeCache {
    cached: Option<CachedCompare>,
}

impl CondCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `expr` was just evaluated and left flags behind
    /// matching `cond`, readable (if re-tested) via `result_reg`.
    pub fn record(&mut self, expr: ExprId, result_reg: HReg, cond: Cond) {
        self.cached = Some(CachedCompare { source_expr: expr, result_reg, cond });
    }

    /// Any instruction not itself a recorded compare invalidates the cache
    /// (§4.2: "invalidated by any intervening instruction that writes
    /// flags"). The selector calls this after emitting anything that isn't
    /// a tracked comparison.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// If `guard` is exactly the expression the cache remembers, return the
    /// condition that is true exactly when it holds (and the register its
    /// boolean result lives in, for callers that want both) so the
    /// selector can omit the redundant `test`/compare.
    pub fn lookup(&self, guard: ExprId) -> Option<CachedCompare> {
        self.cached.filter(|c| c.source_expr == guard)
    }
}
