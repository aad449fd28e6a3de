//! capgate core: policy-free primitives shared by the decoration engine.
//!
//! This crate defines the error surface, argument bags, caller identity and
//! the signature machinery (method specs, argument tailoring, spec cache).
//! It knows nothing about freezing, locking or friends.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied outside tests.
//! All fallible paths surface as `CapError`/`Result`.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod args;
pub mod error;
pub mod identity;
pub mod signature;

pub use args::{ArgBag, BoundArgs};
/// Shared result type.
pub use error::{CapError, ErrorKind, Result};
pub use identity::ClassId;
pub use signature::{tailor, CallableId, MethodSpec, SignatureCache, Tailored};
