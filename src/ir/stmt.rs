//! Side-effecting IR statements (§3 `IRStmt`), executed in listed order.

use bitflags::bitflags;

use crate::common::{GuestOffset, Name};

use super::expr::{ArrayDescr, Endian, ExprId, TmpId};

bitflags! {
    /// Which way a [`Stmt::Dirty`] call touches the memory range it
    /// declares. Mandatory for anything the pure IR cannot express
    /// (CPUID, FSAVE, ...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFx: u8 {
        const READ   = 0b001;
        const WRITE  = 0b010;
        const MODIFY = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// The memory footprint a [`Stmt::Dirty`] call declares, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyMemFx {
    pub addr: ExprId,
    pub size: u32,
    pub fx: MemFx,
}

/// One guest-state field a [`Stmt::Dirty`] call declares it reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestStateRange {
    pub offset: GuestOffset,
    pub size: u32,
    pub fx: MemFx,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `Tmp(id) := expr` — the unique defining statement for `id`.
    Assign { dst: TmpId, src: ExprId },
    Put { offset: GuestOffset, src: ExprId },
    PutI { descr: ArrayDescr, ix: ExprId, bias: i32, src: ExprId },
    Store { endian: Endian, addr: ExprId, data: ExprId },
    /// An impure helper call. Declares which memory range it touches and
    /// which guest-state fields it reads/writes; the optimizer may not
    /// reorder it past a statement whose footprint intersects (§4.1).
    Dirty {
        callee: Name,
        mem_fx: Option<DirtyMemFx>,
        guest_state_fx: Vec<GuestStateRange>,
        ret_tmp: Option<TmpId>,
        args: Vec<ExprId>,
    },
    MFence,
    /// A mid-block side exit: if `guard` (an I1) holds, control leaves the
    /// block for `target` with kind `jump_kind`; otherwise execution falls
    /// through to the next statement. Never reorderable with prior `Put`s.
    Exit {
        guard: ExprId,
        jump_kind: super::block::JumpKind,
        target: super::block::ExitTarget,
    },
}

impl Stmt {
    /// `true` for statements the optimizer must never reorder past one
    /// another when their footprints intersect (§4.1, §5).
    pub fn is_ordering_barrier(&self) -> bool {
        matches!(self, Stmt::Dirty { .. } | Stmt::MFence | Stmt::Exit { .. })
    }
}
