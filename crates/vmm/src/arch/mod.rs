//! Architecture-specific definitions for the translation hardware.
//!
//! Only the software scale model is provided. The fault servicer, translation map and
//! address space builder are written against these definitions, so the whole subsystem
//! can run on any host.

mod software;

pub use software::*;
