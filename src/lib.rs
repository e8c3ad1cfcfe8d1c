//! Middle-end and AMD64 back-end of a dynamic binary translator: typed
//! IR, optimizer, instruction selector, linear-scan register allocator,
//! and a position-independent AMD64 assembler (see `SPEC_FULL.md`).

pub mod back;
pub mod common;
pub mod context;
pub mod driver;
pub mod error;
pub mod front;
pub mod ir;
pub mod middle;

pub use context::{TranslationContext, TranslationControls, TraceFlags};
pub use driver::{translate_block, TranslatedBlock};
pub use error::CoreError;
pub use front::{GuestFrontEnd, NullFrontEnd};
