//! Host back ends (§4.4). AMD64 is the only target this crate encodes
//! today; the module boundary exists so a second host architecture can be
//! added without touching the selector or allocator.

pub mod amd64;
