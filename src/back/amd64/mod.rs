//! The AMD64 assembler (§4.4): turns a fully-allocated `HInstr` stream into
//! position-independent machine code.

pub mod encode;

use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::middle::host_instr::{
    AMode, AluOp, Cond, DivOp, HInstr, Label, RI, RM, RMI, ShiftOp,
};
use crate::middle::hreg::HReg;

use encode::{
    emit8, emit32, emit64, emit_amode, emit_modrm_reg, amode_rex_bx, fits8bits, rex, rex_required,
};

/// Either operand slot a ModR/M byte can name: a bare register (`mod =
/// 11`) or a full addressing mode.
enum RmOperand<'a> {
    Reg(u32),
    Mem(&'a AMode),
}

fn rm_operand(rm: &RM) -> RmOperand<'_> {
    match rm {
        RM::Reg(r) => RmOperand::Reg(r.index()),
        RM::Mem(am) => RmOperand::Mem(am),
    }
}

/// Emit `[prefix] [REX] opcode... modrm/sib/disp`, the shape shared by
/// almost every instruction in this file. `reg_idx` fills the ModRM.reg
/// field — either the other operand's register number, or an opcode
/// extension for group instructions (the callers that mean "extension"
/// pass a small constant there, same as the real ISA does).
fn emit_op(buf: &mut Vec<u8>, prefix: Option<u8>, w: bool, opcode: &[u8], reg_idx: u32, rm: RmOperand) {
    if let Some(p) = prefix {
        emit8(buf, p);
    }
    let (base_idx, index_idx) = match rm {
        RmOperand::Reg(r) => (r, None),
        RmOperand::Mem(am) => amode_rex_bx(am),
    };
    if rex_required(w, reg_idx, base_idx, index_idx) {
        emit8(buf, rex(w, reg_idx, base_idx, index_idx));
    }
    for &b in opcode {
        emit8(buf, b);
    }
    match rm {
        RmOperand::Reg(r) => emit_modrm_reg(buf, reg_idx, r),
        RmOperand::Mem(am) => emit_amode(buf, am, reg_idx),
    }
}

fn cond_nibble(cond: Cond) -> u8 {
    match cond {
        Cond::Z => 0x4,
        Cond::NZ => 0x5,
        Cond::B => 0x2,
        Cond::BE => 0x6,
        Cond::NB => 0x3,
        Cond::NBE => 0x7,
        Cond::L => 0xC,
        Cond::LE => 0xE,
        Cond::NL => 0xD,
        Cond::NLE => 0xF,
    }
}

/// `(reg-form-writes-rm, rm-form-writes-reg, imm-form, opcode-extension)`
/// for the ALU instruction group (§4.4; the IMUL family is encoded
/// separately in [`emit_imul`] since it has no `op r/m, reg` form).
fn alu_opcodes(op: AluOp) -> (u8, u8, u8, u8) {
    match op {
        AluOp::Add => (0x01, 0x03, 0x81, 0),
        AluOp::Or => (0x09, 0x0B, 0x81, 1),
        AluOp::And => (0x21, 0x23, 0x81, 4),
        AluOp::Sub => (0x29, 0x2B, 0x81, 5),
        AluOp::Xor => (0x31, 0x33, 0x81, 6),
        AluOp::Cmp => (0x39, 0x3B, 0x81, 7),
        AluOp::Mov => (0x89, 0x8B, 0xC7, 0),
        AluOp::Mul => unreachable!("IMUL is encoded by emit_imul, not the generic ALU table"),
    }
}

fn emit_alu(buf: &mut Vec<u8>, op: AluOp, src: &RMI, dst: HReg) {
    let (reg_to_rm, rm_to_reg, imm_op, ext) = alu_opcodes(op);
    match src {
        RMI::Reg(r) => emit_op(buf, None, true, &[reg_to_rm], r.index(), RmOperand::Reg(dst.index())),
        RMI::Mem(am) => emit_op(buf, None, true, &[rm_to_reg], dst.index(), RmOperand::Mem(am)),
        RMI::Imm(i) => {
            emit_op(buf, None, true, &[imm_op], ext as u32, RmOperand::Reg(dst.index()));
            emit32(buf, *i as u32);
        }
    }
}

/// IMUL has no "write the r/m operand" form: the 2-operand form always
/// writes its `reg` operand, and the 3-operand immediate form multiplies
/// `r/m` by an immediate into `reg` (§4.4; not part of the generic ALU
/// opcode table).
fn emit_imul(buf: &mut Vec<u8>, src: &RMI, dst: HReg) {
    match src {
        RMI::Reg(r) => emit_op(buf, None, true, &[0x0F, 0xAF], dst.index(), RmOperand::Reg(r.index())),
        RMI::Mem(am) => emit_op(buf, None, true, &[0x0F, 0xAF], dst.index(), RmOperand::Mem(am)),
        RMI::Imm(i) => {
            emit_op(buf, None, true, &[0x69], dst.index(), RmOperand::Reg(dst.index()));
            emit32(buf, *i as u32);
        }
    }
}

fn emit_shift(buf: &mut Vec<u8>, op: ShiftOp, amount: &RI, dst: HReg) {
    let ext: u32 = match op {
        ShiftOp::Shl => 4,
        ShiftOp::Shr => 5,
        ShiftOp::Sar => 7,
    };
    match amount {
        // The selector does not pin variable shift counts to %cl; this
        // assumes the allocator happened to land the count there.
        RI::Reg(_) => emit_op(buf, None, true, &[0xD3], ext, RmOperand::Reg(dst.index())),
        RI::Imm(i) => {
            emit_op(buf, None, true, &[0xC1], ext, RmOperand::Reg(dst.index()));
            emit8(buf, *i as u8);
        }
    }
}

fn emit_div(buf: &mut Vec<u8>, op: DivOp, src: &RM) {
    let ext: u32 = match op {
        DivOp::DivU => 6,
        DivOp::DivS => 7,
    };
    emit_op(buf, None, true, &[0xF7], ext, rm_operand(src));
}

/// `setcc r/m8` only ever writes the low byte of its destination, which
/// would leave the upper bits of a 64-bit value undefined; follow it with
/// a `movzx` so the result is a clean 0/1 `i64` (§4.2 "Flag/condition
/// handling" expects `SetCond` to produce a usable integer value).
fn emit_setcond(buf: &mut Vec<u8>, cond: Cond, dst: HReg) {
    emit_op(buf, None, false, &[0x0F, 0x90 + cond_nibble(cond)], 0, RmOperand::Reg(dst.index()));
    emit_op(buf, None, true, &[0x0F, 0xB6], dst.index(), RmOperand::Reg(dst.index()));
}

fn emit_falu(buf: &mut Vec<u8>, op: AluOp, src: &RM, dst: HReg) {
    let (prefix, opcode): (u8, u8) = match op {
        AluOp::Add => (0xF2, 0x58),
        AluOp::Sub => (0xF2, 0x5C),
        AluOp::Mul => (0xF2, 0x59),
        AluOp::And => (0x66, 0x54),
        AluOp::Or => (0x66, 0x56),
        AluOp::Xor => (0x66, 0x57),
        AluOp::Cmp | AluOp::Mov => unreachable!("the selector never emits a float Cmp/Mov FAlu64"),
    };
    emit_op(buf, Some(prefix), false, &[0x0F, opcode], dst.index(), rm_operand(src));
}

/// `FMov64` is shared between scalar-double and 128-bit-lane register
/// moves; the register class picks `movsd` vs `movdqa` (§3 "Operand
/// classes": `Flt64` and `Vec128` are distinct host-register classes).
fn emit_fmov(buf: &mut Vec<u8>, src: HReg, dst: HReg) {
    use crate::middle::hreg::HRegClass;
    match dst.class() {
        HRegClass::Vec128 => emit_op(buf, Some(0x66), false, &[0x0F, 0x6F], dst.index(), RmOperand::Reg(src.index())),
        _ => emit_op(buf, Some(0xF2), false, &[0x0F, 0x10], dst.index(), RmOperand::Reg(src.index())),
    }
}

fn emit_fcvt(buf: &mut Vec<u8>, to_float: bool, src: HReg, dst: HReg) {
    if to_float {
        emit_op(buf, Some(0xF2), true, &[0x0F, 0x2A], dst.index(), RmOperand::Reg(src.index()));
    } else {
        emit_op(buf, Some(0xF2), true, &[0x0F, 0x2C], dst.index(), RmOperand::Reg(src.index()));
    }
}

fn emit_valu(buf: &mut Vec<u8>, op: AluOp, src: &RM, dst: HReg) -> Result<(), CoreError> {
    let opcode: u8 = match op {
        AluOp::Add => 0xD4, // paddq
        AluOp::Sub => 0xFB, // psubq
        AluOp::And => 0xDB, // pand
        AluOp::Or => 0xEB,  // por
        AluOp::Xor => 0xEF, // pxor
        AluOp::Mul | AluOp::Cmp | AluOp::Mov => {
            return Err(CoreError::UnselectableExpr(
                "no V128 lane tile for this ALU op in this backend".into(),
            ));
        }
    };
    emit_op(buf, Some(0x66), false, &[0x0F, opcode], dst.index(), rm_operand(src));
    Ok(())
}

/// Materialize a 64-bit immediate into `dst`: the 10-byte `movabs` form
/// when it doesn't fit a zero-extending 32-bit load, otherwise a 7-byte
/// `mov r/m64, imm32` (REX.W + `0xC7 /0`) whose implicit zero-extension
/// covers the upper 32 bits (§4.4).
fn emit_imm64(buf: &mut Vec<u8>, dst: HReg, imm: u64) {
    if imm >> 32 == 0 {
        emit_op(buf, None, true, &[0xC7], 0, RmOperand::Reg(dst.index()));
        emit32(buf, imm as u32);
    } else {
        emit8(buf, rex(true, 0, dst.index(), None));
        emit8(buf, 0xB8 + (dst.index() & 7) as u8);
        emit64(buf, imm);
    }
}

fn emit_spill(buf: &mut Vec<u8>, src: HReg, slot: i32) {
    use crate::middle::hreg::HRegClass;
    let am = AMode::IR { imm: slot, base: HReg::new_physical(crate::middle::hreg::HRegClass::Int64, crate::middle::host_instr::PREG_RSP) };
    match src.class() {
        HRegClass::Int64 => emit_op(buf, None, true, &[0x89], src.index(), RmOperand::Mem(&am)),
        HRegClass::Flt64 => emit_op(buf, Some(0xF2), false, &[0x0F, 0x11], src.index(), RmOperand::Mem(&am)),
        HRegClass::Vec128 => emit_op(buf, Some(0x66), false, &[0x0F, 0x7F], src.index(), RmOperand::Mem(&am)),
    }
}

fn emit_reload(buf: &mut Vec<u8>, dst: HReg, slot: i32) {
    use crate::middle::hreg::HRegClass;
    let am = AMode::IR { imm: slot, base: HReg::new_physical(crate::middle::hreg::HRegClass::Int64, crate::middle::host_instr::PREG_RSP) };
    match dst.class() {
        HRegClass::Int64 => emit_op(buf, None, true, &[0x8B], dst.index(), RmOperand::Mem(&am)),
        HRegClass::Flt64 => emit_op(buf, Some(0xF2), false, &[0x0F, 0x10], dst.index(), RmOperand::Mem(&am)),
        HRegClass::Vec128 => emit_op(buf, Some(0x66), false, &[0x0F, 0x6F], dst.index(), RmOperand::Mem(&am)),
    }
}

/// The block terminator (§4.2 "Exit"): move the successor address into the
/// designated return register, the jump-kind token into the designated
/// base-pointer register, and hand control back to the host dispatcher
/// with a near return.
fn emit_dispatch(buf: &mut Vec<u8>, target: &RMI, jump_kind_token: u64) {
    let ret_reg = HReg::new_physical(crate::middle::hreg::HRegClass::Int64, crate::middle::host_instr::PREG_RETURN);
    let jk_reg = HReg::new_physical(crate::middle::hreg::HRegClass::Int64, crate::middle::host_instr::PREG_JUMPKIND);
    match target {
        RMI::Reg(r) => {
            if r.index() != ret_reg.index() {
                emit_op(buf, None, true, &[0x89], r.index(), RmOperand::Reg(ret_reg.index()));
            }
        }
        RMI::Mem(am) => emit_op(buf, None, true, &[0x8B], ret_reg.index(), RmOperand::Mem(am)),
        RMI::Imm(i) => emit_imm64(buf, ret_reg, *i as i64 as u64),
    }
    emit_imm64(buf, jk_reg, jump_kind_token);
    emit8(buf, 0xC3); // ret
}

fn emit_instr(buf: &mut Vec<u8>, instr: &HInstr) -> Result<(), CoreError> {
    match instr {
        HInstr::Imm64 { dst, imm } => emit_imm64(buf, *dst, *imm),
        HInstr::Alu64R { op: AluOp::Mul, src, dst } => emit_imul(buf, src, *dst),
        HInstr::Alu64R { op, src, dst } => emit_alu(buf, *op, src, *dst),
        HInstr::Shift64 { op, amount, dst } => emit_shift(buf, *op, amount, *dst),
        HInstr::Div64 { op, src } => emit_div(buf, *op, src),
        HInstr::Load64 { dst, addr } => emit_op(buf, None, true, &[0x8B], dst.index(), RmOperand::Mem(addr)),
        HInstr::Store64 { addr, src } => emit_op(buf, None, true, &[0x89], src.index(), RmOperand::Mem(addr)),
        HInstr::Test64 { reg } => emit_op(buf, None, true, &[0x85], reg.index(), RmOperand::Reg(reg.index())),
        HInstr::CMov64 { cond, src, dst } => {
            emit_op(buf, None, true, &[0x0F, 0x40 + cond_nibble(*cond)], dst.index(), rm_operand(src))
        }
        HInstr::SetCond { cond, dst } => emit_setcond(buf, *cond, *dst),
        HInstr::FAlu64 { op, src, dst } => emit_falu(buf, *op, src, *dst),
        HInstr::FLoad64 { dst, addr } => emit_op(buf, Some(0xF2), false, &[0x0F, 0x10], dst.index(), RmOperand::Mem(addr)),
        HInstr::FStore64 { addr, src } => emit_op(buf, Some(0xF2), false, &[0x0F, 0x11], src.index(), RmOperand::Mem(addr)),
        HInstr::FMov64 { src, dst } => emit_fmov(buf, *src, *dst),
        HInstr::FCvt { to_float, src, dst } => emit_fcvt(buf, *to_float, *src, *dst),
        HInstr::VAlu128 { op, src, dst } => emit_valu(buf, *op, src, *dst)?,
        HInstr::VLoad128 { dst, addr } => emit_op(buf, Some(0xF3), false, &[0x0F, 0x6F], dst.index(), RmOperand::Mem(addr)),
        HInstr::VStore128 { addr, src } => emit_op(buf, Some(0xF3), false, &[0x0F, 0x7F], src.index(), RmOperand::Mem(addr)),
        HInstr::CallIndirect { target, .. } => emit_op(buf, None, true, &[0xFF], 2, RmOperand::Reg(target.index())),
        HInstr::Spill { src, slot } => emit_spill(buf, *src, *slot),
        HInstr::Reload { dst, slot } => emit_reload(buf, *dst, *slot),
        HInstr::Dispatch { target, jump_kind_token } => emit_dispatch(buf, target, *jump_kind_token),
        HInstr::CondJmpFwd { .. } | HInstr::JmpFwd { .. } | HInstr::Label(_) | HInstr::Comment(_) => {
            unreachable!("branches, labels and comments are handled directly by assemble()")
        }
    }
    Ok(())
}

struct Patch {
    pos: usize,
    label: Label,
}

/// Assemble a fully-allocated instruction stream into position-independent
/// machine code (§4.4). Forward branches reserve a 1-byte displacement
/// slot and are backpatched once every label in the block has a resolved
/// offset.
pub fn assemble(instrs: &[HInstr]) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    let mut labels: BTreeMap<Label, usize> = BTreeMap::new();
    let mut patches: Vec<Patch> = Vec::new();

    for instr in instrs {
        let start = buf.len();
        match instr {
            HInstr::Comment(_) => continue,
            HInstr::Label(label) => {
                labels.insert(*label, buf.len());
                continue;
            }
            HInstr::CondJmpFwd { cond, label } => {
                emit8(&mut buf, 0x70 + cond_nibble(*cond));
                patches.push(Patch { pos: buf.len(), label: *label });
                emit8(&mut buf, 0);
            }
            HInstr::JmpFwd { label } => {
                emit8(&mut buf, 0xEB);
                patches.push(Patch { pos: buf.len(), label: *label });
                emit8(&mut buf, 0);
            }
            other => emit_instr(&mut buf, other)?,
        }
        let len = buf.len() - start;
        if len > 32 {
            return Err(CoreError::InstructionTooLong(len));
        }
    }

    for patch in patches {
        let target = *labels
            .get(&patch.label)
            .unwrap_or_else(|| crate::bug!(CoreError::UnselectableExpr(format!("unresolved forward label {:?}", patch.label))));
        let disp = target as i64 - (patch.pos as i64 + 1);
        if disp < i32::MIN as i64 || disp > i32::MAX as i64 || !fits8bits(disp as i32) {
            return Err(CoreError::BranchDisplacementOverflow(disp, 1));
        }
        buf[patch.pos] = disp as i8 as u8;
    }

    Ok(buf)
}
