//! capgate engine: capability decoration for plain Rust data.
//!
//! A class definition (`ClassDef`) describes data plus its members. Policy
//! layers (freeze, lock, friend-access) are compiled onto it by the wrapper
//! factory, producing a `WrappedType` whose instances check every gated
//! access before delegating. `Instance::view()` yields a restricted proxy
//! whose blocked set is the union of every layer's view restrictions.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied outside tests.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod class;
pub mod config;
pub mod instance;
pub mod members;
pub mod obs;
pub mod policy;
pub mod registry;
pub mod view;
pub mod wrapper;

pub use class::{ClassBuilder, ClassDef, Member, OwnedFn, RESERVED};
pub use instance::Instance;
pub use policy::{
    Access, AccessMode, CallerSet, Denial, Freezable, FreezePolicy, FriendPolicy, KeyScope, LockPolicy, Policy,
    PolicyKind, PolicyState, Probe, Transition, Verdict,
};
pub use registry::{Registry, RegistryStats};
pub use view::{Route, View, ViewType};
pub use wrapper::{alienatable, freezable, lockable, Decoration, WrappedType};
