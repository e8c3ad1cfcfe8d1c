//! The typed IR data model (§3): a pure expression arena, side-effecting
//! statements, and the basic block that ties them together.

pub mod block;
pub mod check;
pub mod constant;
pub mod expr;
pub mod ops;
pub mod stmt;
pub mod ty;

pub use block::{ExitTarget, IRBB, JumpKind};
pub use constant::IRConst;
pub use expr::{ArrayDescr, DefinednessMask, Endian, Expr, ExprArena, ExprId, TmpId};
pub use ops::{Binop, Unop};
pub use stmt::{DirtyMemFx, GuestStateRange, MemFx, Stmt};
pub use ty::IRType;

/// Convenience builder used by tests and by front ends constructing an
/// `IRBB` by hand rather than through a decoder.
pub struct Builder {
    bb: IRBB,
}

impl Builder {
    pub fn new(guest_addr_start: crate::common::GuestAddr) -> Self {
        Builder { bb: IRBB::new(guest_addr_start) }
    }

    pub fn konst(&mut self, c: IRConst) -> ExprId {
        self.bb.arena.push(Expr::Const(c))
    }

    pub fn get(&mut self, offset: crate::common::GuestOffset, ty: IRType) -> ExprId {
        self.bb.arena.push(Expr::Get { offset, ty })
    }

    pub fn tmp_ref(&mut self, t: TmpId) -> ExprId {
        self.bb.arena.push(Expr::Tmp(t))
    }

    pub fn binop(&mut self, op: Binop, a: ExprId, b: ExprId) -> ExprId {
        self.bb.arena.push(Expr::Binop { op, a, b })
    }

    pub fn unop(&mut self, op: Unop, a: ExprId) -> ExprId {
        self.bb.arena.push(Expr::Unop { op, a })
    }

    pub fn mux0x(&mut self, cond: ExprId, then_e: ExprId, else_e: ExprId) -> ExprId {
        self.bb.arena.push(Expr::Mux0X { cond, then_e, else_e })
    }

    pub fn load(&mut self, endian: Endian, ty: IRType, addr: ExprId) -> ExprId {
        self.bb.arena.push(Expr::Load { endian, ty, addr })
    }

    /// A call to a *pure* helper (§3 `Expr::CCall`): no memory or
    /// guest-state effects, so the optimizer is free to fold, CSE, or
    /// specialize it via `HelperSpec`.
    pub fn ccall(&mut self, callee: crate::common::Name, ret_ty: IRType, args: Vec<ExprId>, defined: DefinednessMask) -> ExprId {
        self.bb.arena.push(Expr::CCall { callee, ret_ty, args, defined })
    }

    /// A read from a guest register-stack / array region (§3 `Expr::GetI`),
    /// e.g. an x87 or SIMD register file indexed modulo its element count.
    pub fn get_i(&mut self, descr: ArrayDescr, ix: ExprId, bias: i32) -> ExprId {
        self.bb.arena.push(Expr::GetI { descr, ix, bias })
    }

    /// Allocate a fresh temporary of the given type and bind it to `src`.
    pub fn assign_fresh(&mut self, ty: IRType, src: ExprId) -> TmpId {
        let id = TmpId(self.bb.type_env.len() as u32);
        self.bb.type_env.insert(id, ty);
        self.bb.stmts.push(Stmt::Assign { dst: id, src });
        id
    }

    pub fn put(&mut self, offset: crate::common::GuestOffset, src: ExprId) {
        self.bb.stmts.push(Stmt::Put { offset, src });
    }

    pub fn store(&mut self, endian: Endian, addr: ExprId, data: ExprId) {
        self.bb.stmts.push(Stmt::Store { endian, addr, data });
    }

    /// A write to a guest register-stack / array region (§3 `Stmt::PutI`),
    /// the side-effecting counterpart of [`Builder::get_i`].
    pub fn put_i(&mut self, descr: ArrayDescr, ix: ExprId, bias: i32, src: ExprId) {
        self.bb.stmts.push(Stmt::PutI { descr, ix, bias, src });
    }

    pub fn exit(&mut self, guard: ExprId, jump_kind: JumpKind, target: IRConst) {
        self.bb.stmts.push(Stmt::Exit { guard, jump_kind, target: ExitTarget(target) });
    }

    pub fn dirty(
        &mut self,
        callee: crate::common::Name,
        mem_fx: Option<DirtyMemFx>,
        guest_state_fx: Vec<GuestStateRange>,
        ret_tmp: Option<TmpId>,
        args: Vec<ExprId>,
    ) {
        self.bb.stmts.push(Stmt::Dirty { callee, mem_fx, guest_state_fx, ret_tmp, args });
    }

    pub fn mfence(&mut self) {
        self.bb.stmts.push(Stmt::MFence);
    }

    pub fn finish(mut self, next: ExprId, jump_kind: JumpKind) -> IRBB {
        self.bb.next = next;
        self.bb.jump_kind = jump_kind;
        self.bb
    }
}
