//! The instruction selector (§4.2): tiles an optimized `IRBB` into a list
//! of [`HInstr`] using only virtual host registers (save for the handful
//! of AMD64-ABI-mandated physical registers: rax/rdx for `Div64`, the
//! argument registers and r11 scratch for `CallIndirect`).

use crate::bug;
use crate::common::Map;
use crate::error::CoreError;
use crate::ir::{Binop, Endian, Expr, ExprId, IRBB, IRConst, IRType, JumpKind, Stmt, TmpId, Unop};

use super::super::host_instr::{
    int_preg, AluOp, Cond, DivOp, HInstr, Label, RI, RM, RMI, ARG_REGS, PREG_CALL_SCRATCH, PREG_GSBASE,
};
use super::super::hreg::{HReg, HRegClass, VirtualRegSupply};
use super::condcache::CondCodeCache;

pub struct Selector<'a> {
    vregs: VirtualRegSupply,
    tmp_reg: Map<TmpId, HReg>,
    cc_cache: CondCodeCache,
    instrs: Vec<HInstr>,
    next_label: u32,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> Selector<'a> {
    pub fn select_block(bb: &'a IRBB) -> Vec<HInstr> {
        let mut sel = Selector {
            vregs: VirtualRegSupply::new(),
            tmp_reg: Map::new(),
            cc_cache: CondCodeCache::new(),
            instrs: Vec::new(),
            next_label: 0,
            _marker: std::marker::PhantomData,
        };
        for stmt in &bb.stmts {
            sel.select_stmt(bb, stmt);
        }
        let target = sel.select_rmi(bb, bb.next);
        sel.instrs.push(HInstr::Dispatch { target, jump_kind_token: bb.jump_kind.wire_token() });
        sel.instrs
    }

    fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn fresh(&mut self, class: HRegClass) -> HReg {
        self.vregs.fresh(class)
    }

    fn push(&mut self, i: HInstr) {
        // Any instruction other than the comparisons the cache tracks
        // invalidates it (§4.2).
        if !matches!(i, HInstr::Comment(_)) {
            self.cc_cache.invalidate();
        }
        self.instrs.push(i);
    }

    fn select_stmt(&mut self, bb: &'a IRBB, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { dst, src } => {
                let reg = self.select_expr(bb, *src);
                self.tmp_reg.insert(*dst, reg);
            }
            Stmt::Put { offset, src } => {
                let ty = expr_static_ty(bb, *src);
                let src_reg = self.select_expr(bb, *src);
                let addr = crate::middle::host_instr::AMode::IR { imm: *offset as i32, base: int_preg(PREG_GSBASE) };
                self.emit_store(ty, addr, src_reg);
            }
            Stmt::PutI { descr, ix, bias, src } => {
                let addr = self.select_index_amode(descr.base, descr.elem_ty, descr.num_elems, bb, *ix, *bias);
                let src_reg = self.select_expr(bb, *src);
                self.emit_store(descr.elem_ty, addr, src_reg);
            }
            Stmt::Store { endian, addr, data } => {
                if *endian != Endian::Little {
                    bug!(CoreError::UnselectableExpr("big-endian Store unsupported by this backend".into()));
                }
                let ty = expr_static_ty(bb, *data);
                let am = self.select_amode(bb, *addr);
                let data_reg = self.select_expr(bb, *data);
                self.emit_store(ty, am, data_reg);
            }
            Stmt::Dirty { callee, args, ret_tmp, .. } => {
                let ret = self.emit_call(bb, callee.to_string(), args);
                if let (Some(rt), Some(r)) = (ret_tmp, ret) {
                    self.tmp_reg.insert(*rt, r);
                }
            }
            Stmt::MFence => self.push(HInstr::Comment("mfence".into())),
            Stmt::Exit { guard, jump_kind, target } => self.select_exit(bb, *guard, *jump_kind, *target),
        }
    }

    fn select_exit(&mut self, bb: &'a IRBB, guard: ExprId, jump_kind: JumpKind, target: crate::ir::ExitTarget) {
        // `test guard, guard; jz skip` — skip the guarded dispatch body
        // when the guard is false, i.e. mirror §4.2's "conditional move
        // from a pre-computed then/else pair after a test-against-zero",
        // specialized to control flow rather than data.
        let skip = self.fresh_label();
        if let Some(cached) = self.cc_cache.lookup(guard) {
            // Flags are still those of the cached comparison (SetCond and
            // movzx don't touch them); skip exactly when it does *not*
            // hold, i.e. on the negated condition.
            self.instrs.push(HInstr::CondJmpFwd { cond: cached.cond.negate(), label: skip });
        } else {
            let greg = self.select_expr(bb, guard);
            self.push(HInstr::Test64 { reg: greg });
            self.instrs.push(HInstr::CondJmpFwd { cond: Cond::Z, label: skip });
        }
        let target_rmi = self.select_exit_target(target);
        self.instrs.push(HInstr::Dispatch { target: target_rmi, jump_kind_token: jump_kind.wire_token() });
        self.instrs.push(HInstr::Label(skip));
        self.cc_cache.invalidate();
    }

    /// A side exit's target is always a compile-time-known guest address;
    /// reuse the same i32-immediate-vs-full-materialization choice as
    /// [`Selector::select_rmi`] rather than truncating a 64-bit address.
    fn select_exit_target(&mut self, target: crate::ir::ExitTarget) -> RMI {
        let addr = target.as_addr();
        if addr as i64 == addr as i32 as i64 {
            return RMI::Imm(addr as i32);
        }
        let dst = self.fresh(HRegClass::Int64);
        self.push(HInstr::Imm64 { dst, imm: addr });
        RMI::Reg(dst)
    }

    fn select_index_amode(
        &mut self,
        base: u32,
        elem_ty: IRType,
        num_elems: u32,
        bb: &'a IRBB,
        ix: ExprId,
        bias: i32,
    ) -> crate::middle::host_instr::AMode {
        use crate::middle::host_instr::AMode;
        if !num_elems.is_power_of_two() {
            bug!(CoreError::UnselectableExpr(format!(
                "GetI/PutI with non-power-of-two element count {num_elems} is unsupported by this backend"
            )));
        }
        let ix_reg = self.select_expr(bb, ix);
        let biased = self.fresh(HRegClass::Int64);
        self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(ix_reg), dst: biased });
        if bias != 0 {
            self.push(HInstr::Alu64R { op: AluOp::Add, src: RMI::Imm(bias), dst: biased });
        }
        self.push(HInstr::Alu64R { op: AluOp::And, src: RMI::Imm((num_elems - 1) as i32), dst: biased });
        let scale = elem_ty.size_bytes().unwrap_or(1).trailing_zeros() as u8;
        AMode::IRRS { imm: base as i32, base: int_preg(PREG_GSBASE), index: biased, scale }
    }

    fn emit_store(&mut self, ty: IRType, addr: crate::middle::host_instr::AMode, src: HReg) {
        match ty {
            IRType::F64 | IRType::F32 => self.push(HInstr::FStore64 { addr, src }),
            IRType::V128 => self.push(HInstr::VStore128 { addr, src }),
            _ => self.push(HInstr::Store64 { addr, src }),
        }
    }

    fn emit_call(&mut self, bb: &'a IRBB, callee: String, args: &[ExprId]) -> Option<HReg> {
        if args.len() > ARG_REGS.len() {
            bug!(CoreError::TooManyCallArgs(callee, args.len()));
        }
        let mut arg_regs = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            let v = self.select_expr(bb, *a);
            let preg = int_preg(ARG_REGS[i]);
            self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(v), dst: preg });
            arg_regs.push(preg);
        }
        let callee_reg = self.fresh(HRegClass::Int64);
        // Callee address materialization is a front-end/runtime concern in
        // the real system (symbol -> address resolution); here we encode
        // the interned name's hash as a placeholder immediate so the
        // shape of the call sequence (§4.2 "Integer CCall") is exercised.
        self.push(HInstr::Imm64 { dst: callee_reg, imm: name_placeholder(&callee) });
        self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(callee_reg), dst: int_preg(PREG_CALL_SCRATCH) });
        let ret = self.fresh(HRegClass::Int64);
        let clobbers: Vec<HReg> = ARG_REGS.iter().chain(std::iter::once(&PREG_CALL_SCRATCH)).map(|&p| int_preg(p)).collect();
        self.push(HInstr::CallIndirect {
            target: int_preg(PREG_CALL_SCRATCH),
            args: arg_regs,
            ret: Some(int_preg(crate::middle::host_instr::PREG_RAX)),
            clobbers,
        });
        self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(int_preg(crate::middle::host_instr::PREG_RAX)), dst: ret });
        Some(ret)
    }

    fn select_rmi(&mut self, bb: &'a IRBB, id: ExprId) -> RMI {
        if let Expr::Const(c) = bb.arena.get(id) {
            let bits = c.to_bits64();
            if bits as i64 == bits as i32 as i64 {
                return RMI::Imm(bits as i32);
            }
        }
        RMI::Reg(self.select_expr(bb, id))
    }

    fn select_rm(&mut self, bb: &'a IRBB, id: ExprId) -> RM {
        match bb.arena.get(id) {
            Expr::Load { addr, .. } => RM::Mem(self.select_amode(bb, *addr)),
            _ => RM::Reg(self.select_expr(bb, id)),
        }
    }

    /// Tile one expression into a fresh virtual register holding its
    /// value (§4.2 "each IR expression is lowered to a virtual-register-
    /// producing host subsequence").
    pub(super) fn select_expr(&mut self, bb: &'a IRBB, id: ExprId) -> HReg {
        match bb.arena.get(id).clone() {
            Expr::Get { offset, ty } => {
                let dst = self.fresh(class_for(ty));
                let addr = crate::middle::host_instr::AMode::IR { imm: offset as i32, base: int_preg(PREG_GSBASE) };
                self.emit_load(ty, addr, dst);
                dst
            }
            Expr::GetI { descr, ix, bias } => {
                let addr = self.select_index_amode(descr.base, descr.elem_ty, descr.num_elems, bb, ix, bias);
                let dst = self.fresh(class_for(descr.elem_ty));
                self.emit_load(descr.elem_ty, addr, dst);
                dst
            }
            Expr::Tmp(t) => *self.tmp_reg.get(&t).unwrap_or_else(|| bug!(CoreError::UseBeforeDef(t.0))),
            Expr::Const(c) => self.select_const(c),
            Expr::Binop { op, a, b } => self.select_binop(bb, op, a, b, id),
            Expr::Unop { op, a } => self.select_unop(bb, op, a),
            Expr::Load { ty, addr, endian } => {
                if endian != Endian::Little {
                    bug!(CoreError::UnselectableExpr("big-endian Load unsupported by this backend".into()));
                }
                let am = self.select_amode(bb, addr);
                let dst = self.fresh(class_for(ty));
                self.emit_load(ty, am, dst);
                dst
            }
            Expr::CCall { callee, args, .. } => self
                .emit_call(bb, callee.to_string(), &args)
                .unwrap_or_else(|| bug!(CoreError::UnselectableExpr("CCall with no return tmp used as a value".into()))),
            Expr::Mux0X { cond, then_e, else_e } => self.select_mux(bb, cond, then_e, else_e),
        }
    }

    fn select_const(&mut self, c: IRConst) -> HReg {
        match c {
            IRConst::F64(_) | IRConst::F64I(_) => {
                let dst = self.fresh(HRegClass::Flt64);
                let bits_reg = self.fresh(HRegClass::Int64);
                self.push(HInstr::Imm64 { dst: bits_reg, imm: c.to_bits64() });
                self.push(HInstr::FCvt { to_float: true, src: bits_reg, dst });
                dst
            }
            IRConst::V128(mask) => {
                let dst = self.fresh(HRegClass::Vec128);
                let tmp = self.fresh(HRegClass::Int64);
                self.push(HInstr::Imm64 { dst: tmp, imm: mask as u64 });
                self.push(HInstr::FMov64 { src: tmp, dst });
                dst
            }
            _ => {
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Imm64 { dst, imm: c.to_bits64() });
                dst
            }
        }
    }

    fn emit_load(&mut self, ty: IRType, addr: crate::middle::host_instr::AMode, dst: HReg) {
        match ty {
            IRType::F64 | IRType::F32 => self.push(HInstr::FLoad64 { dst, addr }),
            IRType::V128 => self.push(HInstr::VLoad128 { dst, addr }),
            _ => self.push(HInstr::Load64 { dst, addr }),
        }
    }

    fn select_binop(&mut self, bb: &'a IRBB, op: Binop, a: ExprId, b: ExprId, whole: ExprId) -> HReg {
        match op {
            Binop::Shl(_) | Binop::ShrU(_) | Binop::ShrA(_) => {
                let lhs = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(lhs), dst });
                let amount = self.select_ri(bb, b);
                let shop = match op {
                    Binop::Shl(_) => crate::middle::host_instr::ShiftOp::Shl,
                    Binop::ShrU(_) => crate::middle::host_instr::ShiftOp::Shr,
                    _ => crate::middle::host_instr::ShiftOp::Sar,
                };
                self.push(HInstr::Shift64 { op: shop, amount, dst });
                dst
            }
            Binop::DivU(_) | Binop::DivS(_) => {
                let lhs = self.select_expr(bb, a);
                self.push(HInstr::Alu64R {
                    op: AluOp::Mov,
                    src: RMI::Reg(lhs),
                    dst: int_preg(crate::middle::host_instr::PREG_RAX),
                });
                let rhs = self.select_rm(bb, b);
                let divop = if matches!(op, Binop::DivU(_)) { DivOp::DivU } else { DivOp::DivS };
                self.push(HInstr::Div64 { op: divop, src: rhs });
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Alu64R {
                    op: AluOp::Mov,
                    src: RMI::Reg(int_preg(crate::middle::host_instr::PREG_RAX)),
                    dst,
                });
                dst
            }
            Binop::CmpEq(_) | Binop::CmpNe(_) | Binop::CmpLtU(_) | Binop::CmpLtS(_) | Binop::CmpLeU(_) | Binop::CmpLeS(_) => {
                let cond = cmp_cond(op);
                let lhs = self.select_expr(bb, a);
                let rhs = self.select_rmi(bb, b);
                self.push(HInstr::Alu64R { op: AluOp::Cmp, src: rhs, dst: lhs });
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::SetCond { cond, dst });
                self.cc_cache.record(whole, dst, cond);
                dst
            }
            Binop::Add(t) | Binop::Sub(t) | Binop::And(t) | Binop::Or(t) | Binop::Xor(t) | Binop::Mul(t) if t.is_float() => {
                let lhs = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Flt64);
                self.push(HInstr::FMov64 { src: lhs, dst });
                let rhs = self.select_frm(bb, b);
                self.push(HInstr::FAlu64 { op: float_alu_op(op), src: rhs, dst });
                dst
            }
            Binop::Mul(t) if t == IRType::V128 => {
                bug!(CoreError::UnselectableExpr(
                    "128-bit integer multiply has no tile in this backend".into()
                ))
            }
            Binop::Add(t) | Binop::Sub(t) | Binop::And(t) | Binop::Or(t) | Binop::Xor(t) if t == IRType::V128 => {
                let lhs = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Vec128);
                self.push(HInstr::FMov64 { src: lhs, dst });
                let rhs = self.select_vrm(bb, b);
                self.push(HInstr::VAlu128 { op: vec_alu_op(op), src: rhs, dst });
                dst
            }
            Binop::Add(_) | Binop::Sub(_) | Binop::And(_) | Binop::Or(_) | Binop::Xor(_) | Binop::Mul(_) => {
                let lhs = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(lhs), dst });
                let rhs = self.select_rmi(bb, b);
                let aop = int_alu_op(op);
                self.push(HInstr::Alu64R { op: aop, src: rhs, dst });
                if op.sets_flags_like_cmp_zero() {
                    self.cc_cache.record(whole, dst, Cond::NZ);
                }
                dst
            }
            Binop::NarrowBin(_) => bug!(CoreError::UnselectableExpr("NarrowBin has no single-instruction AMD64 tile".into())),
        }
    }

    fn select_unop(&mut self, bb: &'a IRBB, op: Unop, a: ExprId) -> HReg {
        match op {
            Unop::Neg(t) if t.is_integer() => {
                let src = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Imm(0), dst });
                self.push(HInstr::Alu64R { op: AluOp::Sub, src: RMI::Reg(src), dst });
                dst
            }
            Unop::Not(t) if t.is_integer() => {
                let src = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Imm(-1), dst });
                self.push(HInstr::Alu64R { op: AluOp::Xor, src: RMI::Reg(src), dst });
                dst
            }
            Unop::Widen { .. } | Unop::Narrow { .. } => {
                // A 32-bit reg-reg move zero/sign-extends to 64 bits on
                // AMD64 (§4.4 "32-bit reg-reg moves are used as explicit
                // zero-extend-to-64-bit operations"); narrowing is a no-op
                // at the register level since the value is simply
                // reinterpreted at a smaller width downstream.
                let src = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(src), dst });
                dst
            }
            Unop::IntToFloat { .. } => {
                let src = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Flt64);
                self.push(HInstr::FCvt { to_float: true, src, dst });
                dst
            }
            Unop::FloatToInt { .. } => {
                let src = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Int64);
                self.push(HInstr::FCvt { to_float: false, src, dst });
                dst
            }
            Unop::FloatToFloat { .. } => {
                let src = self.select_expr(bb, a);
                let dst = self.fresh(HRegClass::Flt64);
                self.push(HInstr::FMov64 { src, dst });
                dst
            }
            _ => bug!(CoreError::UnselectableExpr(format!("{op:?} has no AMD64 tile"))),
        }
    }

    fn select_mux(&mut self, bb: &'a IRBB, cond: ExprId, then_e: ExprId, else_e: ExprId) -> HReg {
        // "A conditional move from a pre-computed then/else pair after a
        // test-against-zero" (§4.2): both arms are evaluated eagerly since
        // the IR guarantees no side effects in expressions.
        let else_reg = self.select_expr(bb, else_e);
        let dst = self.fresh(HRegClass::Int64);
        self.push(HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(else_reg), dst });
        let then_rm = self.select_rm(bb, then_e);
        if let Some(cached) = self.cc_cache.lookup(cond) {
            self.push(HInstr::CMov64 { cond: cached.cond, src: then_rm, dst });
        } else {
            let creg = self.select_expr(bb, cond);
            self.push(HInstr::Test64 { reg: creg });
            self.push(HInstr::CMov64 { cond: Cond::NZ, src: then_rm, dst });
        }
        dst
    }

    fn select_ri(&mut self, bb: &'a IRBB, id: ExprId) -> RI {
        if let Expr::Const(c) = bb.arena.get(id) {
            return RI::Imm(c.to_bits64() as i32);
        }
        RI::Reg(self.select_expr(bb, id))
    }

    fn select_frm(&mut self, bb: &'a IRBB, id: ExprId) -> RM {
        match bb.arena.get(id) {
            Expr::Load { addr, .. } => RM::Mem(self.select_amode(bb, *addr)),
            _ => RM::Reg(self.select_expr(bb, id)),
        }
    }

    fn select_vrm(&mut self, bb: &'a IRBB, id: ExprId) -> RM {
        self.select_frm(bb, id)
    }
}

fn class_for(ty: IRType) -> HRegClass {
    match ty {
        IRType::F32 | IRType::F64 => HRegClass::Flt64,
        IRType::V128 => HRegClass::Vec128,
        _ => HRegClass::Int64,
    }
}

fn expr_static_ty(bb: &IRBB, id: ExprId) -> IRType {
    // Selection only ever runs on a block that already passed `check::typecheck`.
    crate::ir::check::expr_ty(bb, id, &defined_upto(bb, id)).unwrap_or(IRType::I64)
}

/// `check::expr_ty` wants a "defined so far" set purely to produce
/// `UseBeforeDef` diagnostics; by selection time the block is already
/// known-good, so a full set (every temporary) is a safe approximation.
fn defined_upto(bb: &IRBB, _id: ExprId) -> std::collections::HashSet<TmpId> {
    bb.type_env.keys().copied().collect()
}

fn int_alu_op(op: Binop) -> AluOp {
    match op {
        Binop::Add(_) => AluOp::Add,
        Binop::Sub(_) => AluOp::Sub,
        Binop::And(_) => AluOp::And,
        Binop::Or(_) => AluOp::Or,
        Binop::Xor(_) => AluOp::Xor,
        Binop::Mul(_) => AluOp::Mul,
        _ => unreachable!(),
    }
}

fn float_alu_op(op: Binop) -> AluOp {
    int_alu_op(op)
}

fn vec_alu_op(op: Binop) -> AluOp {
    int_alu_op(op)
}

fn cmp_cond(op: Binop) -> Cond {
    match op {
        Binop::CmpEq(_) => Cond::Z,
        Binop::CmpNe(_) => Cond::NZ,
        Binop::CmpLtU(_) => Cond::B,
        Binop::CmpLtS(_) => Cond::L,
        Binop::CmpLeU(_) => Cond::BE,
        Binop::CmpLeS(_) => Cond::LE,
        _ => unreachable!(),
    }
}

fn name_placeholder(name: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}
