//! The front-end capability boundary (§6, §1 "Non-goals"). Guest decoders
//! are out of scope for this crate; what the core needs from one is
//! modeled as a trait so `driver::translate_block` stays decoupled from
//! any particular guest architecture.

use crate::common::GuestAddr;
use crate::ir::{Expr, ExprArena, ExprId};
use crate::middle::HelperSpec;

/// What the core asks of a guest front end while building or optimizing a
/// block. `helper_spec` is modeled as the [`HelperSpec`] supertrait rather
/// than a fourth method, so any `GuestFrontEnd` is directly usable
/// wherever `middle::optimize` wants a `&dyn HelperSpec`.
pub trait GuestFrontEnd: HelperSpec {
    /// Can the front end safely read (and therefore decode) guest bytes at
    /// `addr`? Consulted before chasing a direct jump into the same block.
    fn byte_accessible(&self, addr: GuestAddr) -> bool;

    /// May the front end fold a direct jump to `target` into the current
    /// block rather than ending it there?
    fn chase_into_ok(&self, target: GuestAddr) -> bool;
}

/// The trivial front end: never chases, never specializes. Useful for
/// tests and for hosts that hand the core already-built `IRBB`s one
/// instruction at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFrontEnd;

impl HelperSpec for NullFrontEnd {
    fn specialize(&self, _name: crate::common::Name, _args: &[ExprId], _arena: &ExprArena) -> Option<Expr> {
        None
    }
}

impl GuestFrontEnd for NullFrontEnd {
    fn byte_accessible(&self, _addr: GuestAddr) -> bool {
        true
    }

    fn chase_into_ok(&self, _target: GuestAddr) -> bool {
        false
    }
}
