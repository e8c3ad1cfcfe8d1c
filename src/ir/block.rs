//! The IR basic block (§3 `IRBB`) and its terminator vocabulary.

use crate::common::{GuestAddr, Map};

use super::constant::IRConst;
use super::expr::{ExprArena, ExprId, TmpId};
use super::stmt::Stmt;
use super::ty::IRType;

/// Classifies a block terminator for the host dispatcher (§6, "wire-level"
/// vocabulary — the integer tokens are stable across translations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    Boring,
    Call,
    Ret,
    Syscall,
    ClientReq,
    Yield,
    EmWarn,
    MapFail,
    NoDecode,
}

impl JumpKind {
    /// The stable wire-level token passed to the host dispatcher in the
    /// designated base-pointer register at block exit (§6).
    pub fn wire_token(self) -> u64 {
        match self {
            JumpKind::Boring => 0,
            JumpKind::Call => 1,
            JumpKind::Ret => 2,
            JumpKind::Syscall => 3,
            JumpKind::ClientReq => 4,
            JumpKind::Yield => 5,
            JumpKind::EmWarn => 6,
            JumpKind::MapFail => 7,
            JumpKind::NoDecode => 8,
        }
    }
}

/// The destination of a mid-block [`super::stmt::Stmt::Exit`]. Always a
/// statically known guest address: an `Exit` that could jump to a
/// dynamically computed target would not be expressible as a side exit
/// (the front end would instead end the block and use `next`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitTarget(pub IRConst);

impl ExitTarget {
    pub fn as_addr(self) -> GuestAddr {
        self.0.to_bits64()
    }
}

/// One straight-line sequence of IR statements with a single terminator.
#[derive(Debug, Clone)]
pub struct IRBB {
    /// The guest address of the block's first instruction.
    pub guest_addr_start: GuestAddr,
    pub arena: ExprArena,
    /// Maps each temporary to its declared type (§3 invariant 3).
    pub type_env: Map<TmpId, IRType>,
    pub stmts: Vec<Stmt>,
    /// Expression evaluating to the successor guest address.
    pub next: ExprId,
    pub jump_kind: JumpKind,
}

impl IRBB {
    pub fn new(guest_addr_start: GuestAddr) -> Self {
        IRBB {
            guest_addr_start,
            arena: ExprArena::new(),
            type_env: Map::new(),
            stmts: Vec::new(),
            // Placeholder until the builder sets a real terminator;
            // building an IRBB without ever setting `next` is a bug caught
            // by `check::typecheck`.
            next: ExprId(u32::MAX),
            jump_kind: JumpKind::Boring,
        }
    }

    pub fn tmp_ty(&self, id: TmpId) -> Option<IRType> {
        self.type_env.get(&id).copied()
    }
}
