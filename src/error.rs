//! Invariant-violation and resource-exhaustion errors.
//!
//! Per spec these are programmer bugs (category 2) or arena exhaustion
//! (category 3): never recoverable, always fatal. [`CoreError`] exists so
//! that the `panic!` messages the pipeline produces are structured rather
//! than ad hoc strings, and so tests can assert on *which* invariant broke
//! with [`std::panic::catch_unwind`].

use thiserror::Error;

use crate::ir::ty::IRType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("type mismatch in {component}: expected {expected:?}, got {got:?}")]
    TypeMismatch {
        component: &'static str,
        expected: IRType,
        got: IRType,
    },

    #[error("use of tmp{0} before its defining statement")]
    UseBeforeDef(u32),

    #[error("tmp{0} assigned more than once")]
    DoubleDefine(u32),

    #[error("instruction selector cannot tile expression: {0}")]
    UnselectableExpr(String),

    #[error("dirty call '{0}' declares an unsupported memory footprint size {1}")]
    UnsupportedDirtyFootprint(String, u32),

    #[error("encoded branch displacement {0} overflows its reserved {1}-byte field")]
    BranchDisplacementOverflow(i64, u8),

    #[error("host instruction encoding exceeded the 32-byte per-instruction bound ({0} bytes)")]
    InstructionTooLong(usize),

    #[error("no allocable physical register left in class {0:?}")]
    AllocationExhausted(crate::middle::hreg::HRegClass),

    #[error("mandatory physical register {0:?} is pinned by a vreg that cannot be spilled")]
    PinnedRegisterConflict(crate::middle::hreg::HReg),

    #[error("arena exhausted: {0}")]
    ArenaExhausted(&'static str),

    #[error("call '{0}' passes {1} arguments, which exceeds the ABI's register-passing count")]
    TooManyCallArgs(String, usize),
}

/// Panics with a [`CoreError`], per spec §7 category 2/3: these are never
/// recoverable and always indicate a bug in an upstream component (usually
/// the front end handing the core an ill-typed or ill-formed `IRBB`).
#[macro_export]
macro_rules! bug {
    ($err:expr) => {
        panic!("{}", $err)
    };
}
