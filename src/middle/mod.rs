//! The middle end (§4.1–§4.3): optimizer, instruction selector, and
//! register allocator, plus the host-instruction vocabulary they share.

pub mod host_instr;
pub mod hreg;
pub mod optimizer;
pub mod regalloc;
pub mod selector;

pub use optimizer::{optimize, HelperSpec, NoSpecialization};
pub use regalloc::{allocate, AllocPolicy};
pub use selector::Selector;
