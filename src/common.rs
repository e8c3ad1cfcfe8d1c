//! Definitions shared across the pipeline stages.

// Sorted maps/sets give deterministic iteration, which matters for encoding
// stability (two translations of the same block must produce the same
// bytes).
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// An interned name, used for helper-function and dirty-callee identifiers.
pub type Name = internment::Intern<String>;

/// A byte offset into the guest state array (see [`crate::ir::Expr::Get`]).
pub type GuestOffset = u32;

/// A guest machine address.
pub type GuestAddr = u64;
