//! Pure IR expressions (§3 `IRExpr`) and the arena they live in.
//!
//! Expressions reference their operands by [`ExprId`] rather than `Box`,
//! per Design Notes §9: this makes every node a plain value, removes any
//! need for reference counting or a GC, and lets the optimizer clone/rewrite
//! a block cheaply (append new nodes, never mutate shared ones in place).

use crate::common::{GuestOffset, Name};

use super::ops::{Binop, Unop};
use super::ty::IRType;
use super::constant::IRConst;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TmpId(pub u32);

impl std::fmt::Display for TmpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Describes a circular array region of the guest state, for [`Expr::GetI`]
/// / [`super::stmt::Stmt::PutI`] (used to model register-stack
/// architectures, e.g. x87).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDescr {
    pub base: GuestOffset,
    pub elem_ty: IRType,
    pub num_elems: u32,
}

/// A definedness mask accompanying a [`Expr::CCall`], consumed by
/// downstream undefined-value-tracking tools. The core itself only
/// threads it through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefinednessMask(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Get {
        offset: GuestOffset,
        ty: IRType,
    },
    GetI {
        descr: ArrayDescr,
        ix: ExprId,
        bias: i32,
    },
    Tmp(TmpId),
    Binop {
        op: Binop,
        a: ExprId,
        b: ExprId,
    },
    Unop {
        op: Unop,
        a: ExprId,
    },
    Load {
        endian: Endian,
        ty: IRType,
        addr: ExprId,
    },
    Const(IRConst),
    /// A call to a *pure* helper: no memory effects, no guest-state effects.
    /// See [`super::stmt::Stmt::Dirty`] for the impure counterpart.
    CCall {
        callee: Name,
        ret_ty: IRType,
        args: Vec<ExprId>,
        defined: DefinednessMask,
    },
    /// `if cond8 == 0 { then_e } else { else_e }` — the only conditional
    /// expression in the IR.
    Mux0X {
        cond: ExprId,
        then_e: ExprId,
        else_e: ExprId,
    },
}

/// A per-block arena of expression nodes, indexed by [`ExprId`].
#[derive(Debug, Default, Clone)]
pub struct ExprArena {
    nodes: Vec<Expr>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, e: Expr) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(e);
        id
    }

    pub fn get(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0 as usize]
    }

    /// Overwrite a node in place, used by the optimizer's in-arena
    /// rewrites (constant folding, identity collapses, specialization):
    /// since every reference is an `ExprId` index rather than a pointer,
    /// mutating a slot updates every existing reference to it for free.
    pub fn get_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExprId, &Expr)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, e)| (ExprId(i as u32), e))
    }
}

impl std::ops::Index<ExprId> for ExprArena {
    type Output = Expr;
    fn index(&self, id: ExprId) -> &Expr {
        self.get(id)
    }
}
