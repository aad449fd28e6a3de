//! Top-level facade crate for capgate.
//!
//! Re-exports core primitives and the decoration engine so users can depend on a single crate.

pub mod core {
    pub use capgate_core::*;
}

pub mod engine {
    pub use capgate_engine::*;
}
