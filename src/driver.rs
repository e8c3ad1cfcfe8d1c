//! Wires the pipeline stages together for one guest block (§4.5).

use tracing::debug;

use crate::back::amd64;
use crate::context::TranslationContext;
use crate::error::CoreError;
use crate::front::GuestFrontEnd;
use crate::ir::check::typecheck;
use crate::ir::IRBB;
use crate::middle::host_instr::GuestExtent;
use crate::middle::selector::Selector;
use crate::middle::{allocate, optimize};

/// The bytes and guest-extent metadata produced by translating one block
/// (§6 "External interfaces").
pub struct TranslatedBlock {
    pub code: Vec<u8>,
    pub extents: Vec<GuestExtent>,
}

/// Run optimize → select → allocate → assemble over `bb`, in that order
/// (§4.5). `bb` must already satisfy the IR invariants (§3); this is
/// re-checked both before optimization and before selection, since a
/// buggy optimizer rewrite is a front-end-grade bug from the selector's
/// point of view.
pub fn translate_block<F: GuestFrontEnd>(
    ctx: &TranslationContext,
    front: &F,
    mut bb: IRBB,
    extents: Vec<GuestExtent>,
) -> Result<TranslatedBlock, CoreError> {
    typecheck(&bb)?;

    debug!(guest_addr = bb.guest_addr_start, stmts = bb.stmts.len(), "optimize");
    optimize(&mut bb, front);

    typecheck(&bb)?;

    debug!(guest_addr = bb.guest_addr_start, "select");
    let selected = Selector::select_block(&bb);

    debug!(instrs = selected.len(), "allocate");
    let allocated = allocate(selected, &ctx.alloc_policy)?;

    debug!(instrs = allocated.len(), "assemble");
    let code = amd64::assemble(&allocated)?;

    debug!(bytes = code.len(), "translated block");
    Ok(TranslatedBlock { code, extents })
}
