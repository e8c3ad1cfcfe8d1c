//! The per-translation context (§5, §3.4): controls the host reads once
//! and reuses across calls, plus the register-allocation policy for the
//! AMD64 back end this crate ships.

use bitflags::bitflags;

use crate::common::Map;
use crate::middle::hreg::{HReg, HRegClass};
use crate::middle::host_instr;
use crate::middle::AllocPolicy;

bitflags! {
    /// Per-pipeline-stage trace logging toggles (§3.2). Purely diagnostic:
    /// no bit here changes what bytes come out of `translate_block`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraceFlags: u8 {
        const OPTIMIZE = 0b0001;
        const SELECT   = 0b0010;
        const ALLOCATE = 0b0100;
        const ASSEMBLE = 0b1000;
    }
}

/// Host-chosen limits and trace toggles, read-only for the duration of a
/// translation (§3.4). Constructed once by the host and reused across
/// `translate_block` calls.
#[derive(Debug, Clone, Copy)]
pub struct TranslationControls {
    /// Upper bound on the number of guest instructions folded into one
    /// block, enforced by the (out-of-scope) front end; carried here so
    /// the core can assert it was honored.
    pub guest_max_insns: u32,
    /// How many direct-jump hops the front end may chase into the same
    /// block; consulted via [`crate::front::GuestFrontEnd::chase_into_ok`].
    pub guest_chase_thresh: u32,
    pub trace_flags: TraceFlags,
}

impl Default for TranslationControls {
    fn default() -> Self {
        TranslationControls {
            guest_max_insns: 50,
            guest_chase_thresh: 1,
            trace_flags: TraceFlags::empty(),
        }
    }
}

/// The `Send`-able, non-`Sync` value threading controls and allocation
/// policy through one call to `translate_block` (§5). Dropped at the end
/// of the call, mirroring the arena it accompanies.
pub struct TranslationContext {
    pub controls: TranslationControls,
    pub alloc_policy: AllocPolicy,
    // Cell is Send but not Sync: one context per thread, never shared.
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl TranslationContext {
    pub fn new(controls: TranslationControls, spill_base: i32) -> Self {
        TranslationContext {
            controls,
            alloc_policy: default_amd64_alloc_policy(spill_base),
            _not_sync: std::marker::PhantomData,
        }
    }
}

impl Default for TranslationContext {
    fn default() -> Self {
        TranslationContext::new(TranslationControls::default(), 0)
    }
}

/// The default AMD64 allocable-register pools, excluding every physical
/// register this back end pins for an ABI or ISA reason (§4.3 point 5 is
/// satisfied by construction here rather than by active per-instruction
/// conflict tracking): `rax`/`rdx` (integer divide), `rbp` (jump-kind
/// token), `r11` (indirect-call scratch), `r15` (guest-state base), `rsp`
/// (spill-slot frame pointer).
fn default_amd64_alloc_policy(spill_base: i32) -> AllocPolicy {
    let reserved_int = [
        host_instr::PREG_RAX,
        host_instr::PREG_RDX,
        host_instr::PREG_RBP,
        host_instr::PREG_CALL_SCRATCH,
        host_instr::PREG_GSBASE,
        host_instr::PREG_RSP,
    ];
    let int_regs: Vec<HReg> = (0u32..16)
        .filter(|i| !reserved_int.contains(i))
        .map(|i| HReg::new_physical(HRegClass::Int64, i))
        .collect();
    let flt_regs: Vec<HReg> = (0u32..16).map(|i| HReg::new_physical(HRegClass::Flt64, i)).collect();
    let vec_regs: Vec<HReg> = (0u32..16).map(|i| HReg::new_physical(HRegClass::Vec128, i)).collect();

    let mut allocable: Map<HRegClass, Vec<HReg>> = Map::new();
    allocable.insert(HRegClass::Int64, int_regs);
    allocable.insert(HRegClass::Flt64, flt_regs);
    allocable.insert(HRegClass::Vec128, vec_regs);

    AllocPolicy {
        allocable,
        spill_base,
        slot_size: 8,
    }
}
