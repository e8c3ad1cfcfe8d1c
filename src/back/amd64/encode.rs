//! Low-level AMD64 byte-emission helpers (§4.4 "Encoding discipline").
//!
//! Grounded directly on the REX/ModRM/SIB construction rules used by
//! Valgrind's `host-amd64` back end (`doAMode_M`, `rexAMode_M`,
//! `rexAMode_R`, `fits8bits`): every addressing mode this crate selects
//! is one of the two `AMode` variants, encoded the same way regardless of
//! which instruction carries it.

use crate::middle::host_instr::AMode;

pub fn emit8(buf: &mut Vec<u8>, b: u8) {
    buf.push(b);
}

pub fn emit32(buf: &mut Vec<u8>, w: u32) {
    buf.extend_from_slice(&w.to_le_bytes());
}

pub fn emit64(buf: &mut Vec<u8>, w: u64) {
    buf.extend_from_slice(&w.to_le_bytes());
}

/// Does `d` sign-extend correctly from 8 bits? (§4.4 "8-bit-displacement
/// vs 32-bit-displacement forms are chosen by range".)
pub fn fits8bits(d: i32) -> bool {
    d == d as i8 as i32
}

fn low3(index: u32) -> u8 {
    (index & 7) as u8
}

fn high_bit(index: u32) -> u8 {
    ((index >> 3) & 1) as u8
}

/// REX prefix: `0100WRXB`. `w` is set by the caller per operand width;
/// `reg`/`rm`/`index` are the (possibly absent) register numbers whose
/// high bit feeds R/B/X.
pub fn rex(w: bool, reg: u32, base_or_rm: u32, index: Option<u32>) -> u8 {
    0x40 | ((w as u8) << 3)
        | (high_bit(reg) << 2)
        | (index.map(high_bit).unwrap_or(0) << 1)
        | high_bit(base_or_rm)
}

/// Whether this instruction needs a REX prefix at all even with `w =
/// false`: any operand register number ≥ 8 (R, X, or B nonzero).
pub fn rex_required(w: bool, reg: u32, base_or_rm: u32, index: Option<u32>) -> bool {
    w || reg >= 8 || base_or_rm >= 8 || index.map(|i| i >= 8).unwrap_or(false)
}

/// Registers that force a SIB escape when used as a base with no index:
/// RSP and R12 (rm field 100 means "SIB follows", not "this register").
fn needs_sib_escape(base_index: u32) -> bool {
    low3(base_index) == 4
}

/// Registers that cannot be addressed with a zero-displacement ModRM
/// because `mod=00, rm=101` is the RIP-relative encoding: RBP and R13.
fn needs_forced_disp8(base_index: u32) -> bool {
    low3(base_index) == 5
}

/// Encode the ModRM (+ SIB + displacement) bytes for `am`, with `reg`
/// supplying the ModRM.reg field (the other operand, or an opcode
/// extension). Mirrors `doAMode_M`'s base/SIB/displacement-size choices.
pub fn emit_amode(buf: &mut Vec<u8>, am: &AMode, reg: u32) {
    match *am {
        AMode::IR { imm, base } => {
            let base_idx = base.index();
            let rm = low3(base_idx);
            let force_disp8 = imm == 0 && needs_forced_disp8(base_idx);
            let md: u8 = if imm == 0 && !needs_forced_disp8(base_idx) {
                0b00
            } else if force_disp8 || fits8bits(imm) {
                0b01
            } else {
                0b10
            };
            if needs_sib_escape(base_idx) {
                emit8(buf, (md << 6) | (low3(reg) << 3) | 0b100);
                // SIB with no index: index=100, scale=0, base=rm.
                emit8(buf, (0b00 << 6) | (0b100 << 3) | rm);
            } else {
                emit8(buf, (md << 6) | (low3(reg) << 3) | rm);
            }
            match md {
                0b00 => {}
                0b01 => emit8(buf, imm as i8 as u8),
                _ => emit32(buf, imm as u32),
            }
        }
        AMode::IRRS { imm, base, index, scale } => {
            let base_idx = base.index();
            let rm = 0b100; // SIB escape, always, when an index is present.
            let force_disp8 = imm == 0 && needs_forced_disp8(base_idx);
            let md: u8 = if imm == 0 && !needs_forced_disp8(base_idx) {
                0b00
            } else if force_disp8 || fits8bits(imm) {
                0b01
            } else {
                0b10
            };
            emit8(buf, (md << 6) | (low3(reg) << 3) | rm);
            emit8(buf, (scale << 6) | (low3(index.index()) << 3) | low3(base_idx));
            match md {
                0b00 => {}
                0b01 => emit8(buf, imm as i8 as u8),
                _ => emit32(buf, imm as u32),
            }
        }
    }
}

/// The REX bits an `AMode` alone contributes (its B and X fields); the R
/// field still comes from whatever `reg` operand accompanies it.
pub fn amode_rex_bx(am: &AMode) -> (u32, Option<u32>) {
    match *am {
        AMode::IR { base, .. } => (base.index(), None),
        AMode::IRRS { base, index, .. } => (base.index(), Some(index.index())),
    }
}

/// ModRM for a register-register (`mod = 11`) form, e.g. `Alu64R` with a
/// register source.
pub fn emit_modrm_reg(buf: &mut Vec<u8>, reg: u32, rm: u32) {
    emit8(buf, 0b1100_0000 | (low3(reg) << 3) | low3(rm));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::hreg::{HReg, HRegClass};

    fn preg(index: u32) -> HReg {
        HReg::new_physical(HRegClass::Int64, index)
    }

    #[test]
    fn fits8bits_matches_the_signed_byte_range() {
        assert!(fits8bits(127));
        assert!(!fits8bits(128));
        assert!(fits8bits(-128));
        assert!(!fits8bits(-129));
        assert!(fits8bits(0));
    }

    #[test]
    fn rex_sets_w_r_x_b_from_the_right_operands() {
        // No W, no extended registers at all: still the bare 0x40 prefix.
        assert_eq!(rex(false, 0, 0, None), 0x40);
        // W set.
        assert_eq!(rex(true, 0, 0, None), 0x48);
        // reg >= 8 sets R (bit 2); base_or_rm >= 8 sets B (bit 0).
        assert_eq!(rex(false, 8, 0, None), 0x40 | 0b0100);
        assert_eq!(rex(false, 0, 8, None), 0x40 | 0b0001);
        // An index >= 8 sets X (bit 1).
        assert_eq!(rex(false, 0, 0, Some(8)), 0x40 | 0b0010);
    }

    #[test]
    fn rex_required_is_true_whenever_any_operand_is_extended() {
        assert!(!rex_required(false, 0, 0, None));
        assert!(rex_required(true, 0, 0, None));
        assert!(rex_required(false, 8, 0, None));
        assert!(rex_required(false, 0, 0, Some(8)));
    }

    #[test]
    fn emit_modrm_reg_always_sets_mod_to_11() {
        let mut buf = Vec::new();
        emit_modrm_reg(&mut buf, 1, 6);
        // mod=11, reg=001, rm=110
        assert_eq!(buf, vec![0b1100_1_110]);
    }

    #[test]
    fn emit_amode_ir_zero_disp_omits_the_displacement_for_a_plain_base() {
        let mut buf = Vec::new();
        // rcx (index 1) as base, no SIB escape or forced-disp8 needed.
        emit_amode(&mut buf, &AMode::IR { imm: 0, base: preg(1) }, 0);
        assert_eq!(buf, vec![0b00_000_001]);
    }

    #[test]
    fn emit_amode_ir_rbp_base_forces_disp8_even_at_zero_offset() {
        // rbp (index 5) at disp 0 would collide with the RIP-relative
        // encoding, so a disp8 of 0 must be emitted instead of omitted.
        let mut buf = Vec::new();
        emit_amode(&mut buf, &AMode::IR { imm: 0, base: preg(5) }, 0);
        assert_eq!(buf, vec![0b01_000_101, 0x00]);
    }

    #[test]
    fn emit_amode_ir_rsp_base_forces_a_sib_escape() {
        // rsp (index 4) as a bare base can't be ModRM-encoded directly;
        // it always needs a SIB byte with no index.
        let mut buf = Vec::new();
        emit_amode(&mut buf, &AMode::IR { imm: 16, base: preg(4) }, 0);
        assert_eq!(buf[0], 0b01_000_100);
        assert_eq!(buf[1], 0b00_100_100);
        assert_eq!(buf[2], 16);
    }

    #[test]
    fn emit_amode_ir_picks_disp32_once_the_offset_overflows_a_byte() {
        let mut buf = Vec::new();
        emit_amode(&mut buf, &AMode::IR { imm: 200, base: preg(1) }, 0);
        assert_eq!(buf[0] >> 6, 0b10);
        assert_eq!(buf.len(), 1 + 4);
    }
}
