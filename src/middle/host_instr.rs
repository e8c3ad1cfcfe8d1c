//! The AMD64 host-instruction vocabulary (§3 "Host-instruction list",
//! "Addressing modes", "Operand classes"), plus the register-use contract
//! the allocator needs (§4.3).

use derive_more::Display;

use crate::common::GuestAddr;

use super::hreg::{HReg, HRegClass};

/// `log2` of the SIB scale factor: 0, 1, 2, or 3 (i.e. scale 1/2/4/8).
pub type Log2Scale = u8;

/// A closed sum type for AMD64 addressing modes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AMode {
    /// `disp32(base)`.
    IR { imm: i32, base: HReg },
    /// `disp32(base, index, scale)`.
    IRRS { imm: i32, base: HReg, index: HReg, scale: Log2Scale },
}

impl AMode {
    pub fn registers(&self) -> Vec<HReg> {
        match self {
            AMode::IR { base, .. } => vec![*base],
            AMode::IRRS { base, index, .. } => vec![*base, *index],
        }
    }

    fn map(&mut self, f: &mut impl FnMut(&mut HReg)) {
        match self {
            AMode::IR { base, .. } => f(base),
            AMode::IRRS { base, index, .. } => {
                f(base);
                f(index);
            }
        }
    }
}

/// Register | memory | immediate — the widest operand class (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RMI {
    Reg(HReg),
    Mem(AMode),
    Imm(i32),
}

/// Register | memory (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RM {
    Reg(HReg),
    Mem(AMode),
}

/// Register | immediate (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RI {
    Reg(HReg),
    Imm(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AluOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("cmp")]
    Cmp,
    #[display("mov")]
    Mov,
    #[display("mul")]
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ShiftOp {
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
    #[display("sar")]
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DivOp {
    #[display("div")]
    DivU,
    #[display("idiv")]
    DivS,
}

/// AMD64 condition codes, named by the mnemonic suffix (`jz`, `jl`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Cond {
    #[display("z")]
    Z,
    #[display("nz")]
    NZ,
    #[display("l")]
    L,
    #[display("le")]
    LE,
    #[display("b")]
    B,
    #[display("be")]
    BE,
    #[display("nb")]
    NB,
    #[display("nbe")]
    NBE,
    #[display("nl")]
    NL,
    #[display("nle")]
    NLE,
}

impl Cond {
    pub fn negate(self) -> Cond {
        use Cond::*;
        match self {
            Z => NZ,
            NZ => Z,
            L => NL,
            LE => NLE,
            B => NB,
            BE => NBE,
            NB => B,
            NBE => BE,
            NL => L,
            NLE => LE,
        }
    }
}

/// A forward branch target within the current block's instruction list,
/// resolved by the assembler's backpatching pass (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum HInstr {
    /// Materialize a 64-bit immediate (§4.4: `movabs` or zero-extending
    /// `movl`, chosen by the assembler based on the value's range).
    Imm64 { dst: HReg, imm: u64 },
    /// `dst := dst OP src` for `Mov`, source is simply moved into `dst`.
    Alu64R { op: AluOp, src: RMI, dst: HReg },
    Shift64 { op: ShiftOp, amount: RI, dst: HReg },
    /// Divide `rdx:rax` by `src`, mandatory-physical per the AMD64 ABI
    /// (§4.2 "Tiling rules").
    Div64 { op: DivOp, src: RM },
    Load64 { dst: HReg, addr: AMode },
    Store64 { addr: AMode, src: HReg },
    /// Set flags as if comparing `reg` against zero, without otherwise
    /// touching it — used ahead of `Mux0X`/`Exit` lowering (§4.2).
    Test64 { reg: HReg },
    CMov64 { cond: Cond, src: RM, dst: HReg },
    /// Materialize a condition as a 0/1 integer value (`setcc`), for a
    /// comparison consumed as a plain `I1` value rather than immediately
    /// through `Mux0X`/`Exit`.
    SetCond { cond: Cond, dst: HReg },
    /// Scalar double-precision SSE2 arithmetic (`addsd`/`subsd`/`mulsd`/
    /// `divsd`), covering the IR's `F64` binops.
    FAlu64 { op: AluOp, src: RM, dst: HReg },
    FLoad64 { dst: HReg, addr: AMode },
    FStore64 { addr: AMode, src: HReg },
    FMov64 { src: HReg, dst: HReg },
    /// `cvtsi2sd`/`cvttsd2si`-family conversions between `Int64` and
    /// `Flt64` classes.
    FCvt { to_float: bool, src: HReg, dst: HReg },
    /// Minimal `V128` lane-wise integer ops (`paddq`/`pxor`/...), covering
    /// the IR's vector binops at the granularity this backend supports.
    VAlu128 { op: AluOp, src: RM, dst: HReg },
    VLoad128 { dst: HReg, addr: AMode },
    VStore128 { addr: AMode, src: HReg },
    /// Load the callee address into the scratch register (r11 on AMD64)
    /// and emit an indirect call. `args` are the ABI parameter registers
    /// already populated by preceding `Alu64R`/`Imm64` moves; `ret` is
    /// where the callee leaves its result (rax).
    CallIndirect { target: HReg, args: Vec<HReg>, ret: Option<HReg>, clobbers: Vec<HReg> },
    /// Spill a live vreg's physical register to its stack slot.
    Spill { src: HReg, slot: i32 },
    /// Reload a previously spilled vreg into a (possibly different)
    /// physical register.
    Reload { dst: HReg, slot: i32 },
    /// Conditional forward jump within this block; `label` is resolved by
    /// the assembler via backpatch.
    CondJmpFwd { cond: Cond, label: Label },
    JmpFwd { label: Label },
    /// Marks the byte offset a `CondJmpFwd`/`JmpFwd` targets.
    Label(Label),
    /// The block's terminating dispatch: move `target` into the designated
    /// return register, the jump-kind token into the designated
    /// base-pointer register, and return to the host dispatcher (§4.2,
    /// §6).
    Dispatch { target: RMI, jump_kind_token: u64 },
    Comment(String),
}

/// Which of an instruction's register operands are read, (over)written, or
/// both — the allocator's `reg_usage` callback (§4.3).
#[derive(Debug, Default, Clone)]
pub struct RegUsage {
    pub read: Vec<HReg>,
    pub written: Vec<HReg>,
    pub modified: Vec<HReg>,
}

impl HInstr {
    pub fn reg_usage(&self) -> RegUsage {
        let mut u = RegUsage::default();
        match self {
            HInstr::Imm64 { dst, .. } => u.written.push(*dst),
            HInstr::Alu64R { op, src, dst } => {
                if matches!(op, AluOp::Mov) {
                    u.written.push(*dst);
                } else {
                    u.modified.push(*dst);
                }
                push_rmi(&mut u.read, src);
            }
            HInstr::Shift64 { amount, dst, .. } => {
                u.modified.push(*dst);
                if let RI::Reg(r) = amount {
                    u.read.push(*r);
                }
            }
            HInstr::Div64 { src, .. } => {
                push_rm(&mut u.read, src);
                u.modified.push(HReg::new_physical(HRegClass::Int64, PREG_RAX));
                u.modified.push(HReg::new_physical(HRegClass::Int64, PREG_RDX));
            }
            HInstr::Load64 { dst, addr } => {
                u.written.push(*dst);
                u.read.extend(addr.registers());
            }
            HInstr::Store64 { addr, src } => {
                u.read.push(*src);
                u.read.extend(addr.registers());
            }
            HInstr::Test64 { reg } => u.read.push(*reg),
            HInstr::CMov64 { src, dst, .. } => {
                u.modified.push(*dst);
                push_rm(&mut u.read, src);
            }
            HInstr::SetCond { dst, .. } => u.written.push(*dst),
            HInstr::FAlu64 { src, dst, .. } | HInstr::VAlu128 { src, dst, .. } => {
                u.modified.push(*dst);
                push_rm(&mut u.read, src);
            }
            HInstr::FLoad64 { dst, addr } | HInstr::VLoad128 { dst, addr } => {
                u.written.push(*dst);
                u.read.extend(addr.registers());
            }
            HInstr::FStore64 { addr, src } | HInstr::VStore128 { addr, src } => {
                u.read.push(*src);
                u.read.extend(addr.registers());
            }
            HInstr::FMov64 { src, dst } => {
                u.written.push(*dst);
                u.read.push(*src);
            }
            HInstr::FCvt { src, dst, .. } => {
                u.written.push(*dst);
                u.read.push(*src);
            }
            HInstr::CallIndirect { target, args, ret, clobbers } => {
                u.read.push(*target);
                u.read.extend(args.iter().copied());
                u.written.extend(clobbers.iter().copied());
                if let Some(r) = ret {
                    u.written.push(*r);
                }
            }
            HInstr::Spill { src, .. } => u.read.push(*src),
            HInstr::Reload { dst, .. } => u.written.push(*dst),
            HInstr::CondJmpFwd { .. } | HInstr::JmpFwd { .. } | HInstr::Label(_) | HInstr::Comment(_) => {}
            HInstr::Dispatch { target, .. } => push_rmi(&mut u.read, target),
        }
        u
    }

    /// `Some((src, dst))` iff this is a plain register-to-register move the
    /// allocator may coalesce or delete (§4.3 "Move coalescing").
    pub fn is_move(&self) -> Option<(HReg, HReg)> {
        match self {
            HInstr::Alu64R { op: AluOp::Mov, src: RMI::Reg(src), dst } => Some((*src, *dst)),
            _ => None,
        }
    }

    pub fn map_regs(&mut self, remap: &impl Fn(HReg) -> HReg) {
        let m = |r: &mut HReg| *r = remap(*r);
        match self {
            HInstr::Imm64 { dst, .. } => m(dst),
            HInstr::Alu64R { src, dst, .. } => {
                m(dst);
                map_rmi(src, &m);
            }
            HInstr::Shift64 { amount, dst, .. } => {
                m(dst);
                if let RI::Reg(r) = amount {
                    m(r);
                }
            }
            HInstr::Div64 { src, .. } => map_rm(src, &m),
            HInstr::Load64 { dst, addr } => {
                m(dst);
                addr.map(&mut |r| m(r));
            }
            HInstr::Store64 { addr, src } => {
                m(src);
                addr.map(&mut |r| m(r));
            }
            HInstr::Test64 { reg } => m(reg),
            HInstr::CMov64 { src, dst, .. } => {
                m(dst);
                map_rm(src, &m);
            }
            HInstr::CallIndirect { target, args, ret, .. } => {
                m(target);
                for a in args {
                    m(a);
                }
                if let Some(r) = ret {
                    m(r);
                }
            }
            HInstr::Spill { src, .. } => m(src),
            HInstr::Reload { dst, .. } => m(dst),
            HInstr::SetCond { dst, .. } => m(dst),
            HInstr::FAlu64 { src, dst, .. } | HInstr::VAlu128 { src, dst, .. } => {
                m(dst);
                map_rm(src, &m);
            }
            HInstr::FLoad64 { dst, addr } | HInstr::VLoad128 { dst, addr } => {
                m(dst);
                addr.map(&mut |r| m(r));
            }
            HInstr::FStore64 { addr, src } | HInstr::VStore128 { addr, src } => {
                m(src);
                addr.map(&mut |r| m(r));
            }
            HInstr::FMov64 { src, dst } => {
                m(src);
                m(dst);
            }
            HInstr::FCvt { src, dst, .. } => {
                m(src);
                m(dst);
            }
            HInstr::CondJmpFwd { .. } | HInstr::JmpFwd { .. } | HInstr::Label(_) | HInstr::Comment(_) => {}
            HInstr::Dispatch { target, .. } => map_rmi(target, &m),
        }
    }
}

fn push_rmi(out: &mut Vec<HReg>, rmi: &RMI) {
    match rmi {
        RMI::Reg(r) => out.push(*r),
        RMI::Mem(m) => out.extend(m.registers()),
        RMI::Imm(_) => {}
    }
}

fn push_rm(out: &mut Vec<HReg>, rm: &RM) {
    match rm {
        RM::Reg(r) => out.push(*r),
        RM::Mem(m) => out.extend(m.registers()),
    }
}

fn map_rmi(rmi: &mut RMI, m: &impl Fn(&mut HReg)) {
    match rmi {
        RMI::Reg(r) => m(r),
        RMI::Mem(am) => am.map(&mut |r| m(r)),
        RMI::Imm(_) => {}
    }
}

fn map_rm(rm: &mut RM, m: &impl Fn(&mut HReg)) {
    match rm {
        RM::Reg(r) => m(r),
        RM::Mem(am) => am.map(&mut |r| m(r)),
    }
}

/// The designated register the block terminator leaves the successor
/// guest address in, read by the host dispatcher (§6).
pub const PREG_RETURN: u32 = PREG_RAX;
/// The designated base-pointer register the jump-kind token is passed in
/// (§6 "wire-level" vocabulary).
pub const PREG_JUMPKIND: u32 = PREG_RBP;
/// AMD64 integer divide's mandatory dividend-low/remainder registers.
pub const PREG_RAX: u32 = 0;
pub const PREG_RCX: u32 = 1;
pub const PREG_RDX: u32 = 2;
pub const PREG_RBX: u32 = 3;
pub const PREG_RSP: u32 = 4;
pub const PREG_RBP: u32 = 5;
pub const PREG_RSI: u32 = 6;
pub const PREG_RDI: u32 = 7;
pub const PREG_R8: u32 = 8;
pub const PREG_R9: u32 = 9;
pub const PREG_R10: u32 = 10;
pub const PREG_R11: u32 = 11;
pub const PREG_R12: u32 = 12;
pub const PREG_R13: u32 = 13;
pub const PREG_R14: u32 = 14;
pub const PREG_R15: u32 = 15;

/// The scratch register the selector loads indirect-call callees into
/// (§4.2 "Integer CCall").
pub const PREG_CALL_SCRATCH: u32 = PREG_R11;
/// Callee-saved register holding the base address of the guest-state byte
/// array for the duration of the block (every `Get`/`Put`/`GetI`/`PutI`
/// addresses relative to this). Not reused for anything else, so it stays
/// live across the `Dispatch` sequence's use of rax/rbp.
pub const PREG_GSBASE: u32 = PREG_R15;

/// SysV-ish integer argument-passing registers, in order.
pub const ARG_REGS: [u32; 6] = [PREG_RDI, PREG_RSI, PREG_RDX, PREG_RCX, PREG_R8, PREG_R9];

pub fn int_preg(index: u32) -> HReg {
    HReg::new_physical(HRegClass::Int64, index)
}

/// An entry in the encoded output's guest-extent list (§6); not a host
/// instruction, but produced alongside the instruction stream by the
/// driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestExtent {
    pub base: GuestAddr,
    pub length: u32,
}
