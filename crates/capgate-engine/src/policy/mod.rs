//! Policy layer (freeze, lock, friend-access).
//!
//! A policy is pure configuration: which members it gates, how it initialises
//! per-instance state, and how it decides a single access. The wrapper factory
//! compiles policies into delegation tables; instances own the state.

pub mod freeze;
pub mod friend;
pub mod lock;
pub mod permission;

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use capgate_core::error::{CapError, ErrorKind, Result};
use capgate_core::{BoundArgs, ClassId};

pub use freeze::{FreezePolicy, Freezable};
pub use friend::FriendPolicy;
pub use lock::{KeyScope, LockPolicy};
pub use permission::CallerSet;

/// Which built-in policy a layer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyKind {
    Freeze,
    Lock,
    Friend,
    Custom(&'static str),
}

impl PolicyKind {
    /// Tag appended to wrapped-type names, one per layer.
    pub fn tag(self) -> &'static str {
        match self {
            PolicyKind::Freeze => "freezable",
            PolicyKind::Lock => "lockable",
            PolicyKind::Friend => "alienatable",
            PolicyKind::Custom(tag) => tag,
        }
    }

    /// Error kind raised when this policy denies an access.
    pub fn violation(self) -> ErrorKind {
        match self {
            PolicyKind::Freeze => ErrorKind::Frozen,
            PolicyKind::Lock => ErrorKind::Locked,
            PolicyKind::Friend => ErrorKind::Friend,
            PolicyKind::Custom(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Per-instance policy state. One slot per layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyState {
    Frozen(bool),
    Locks(BTreeSet<String>),
    /// Nothing changes after construction (friend-access).
    Static,
    Custom(Value),
}

/// How a member is being touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Call,
    Read,
    Write,
}

impl AccessMode {
    /// Calls and writes can change state; reads cannot.
    pub fn mutates(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// One attempted access, as seen by a policy.
#[derive(Debug, Clone, Copy)]
pub struct Access<'a> {
    pub member: &'a str,
    pub mode: AccessMode,
    pub caller: Option<&'a ClassId>,
    /// The decorated class; always permitted where self-access applies.
    pub owner: &'a ClassId,
    /// Name used in error texts.
    pub class_name: &'a str,
}

/// State transitions driven by the per-instance operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Freeze,
    Melt,
    Lock(String),
    Unlock(String),
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Freeze => "freeze",
            Transition::Melt => "melt",
            Transition::Lock(_) => "lock",
            Transition::Unlock(_) => "unlock",
        }
    }
}

/// Read-only state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe<'a> {
    Frozen,
    Locked(&'a str),
}

/// A refused access, before the class's `on_denied` hook has seen it.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub kind: ErrorKind,
    pub policy: PolicyKind,
    pub member: String,
    pub caller: Option<ClassId>,
    pub message: String,
}

impl Denial {
    pub fn new(policy: PolicyKind, access: &Access<'_>, message: String) -> Self {
        Self {
            kind: policy.violation(),
            policy,
            member: access.member.to_string(),
            caller: access.caller.cloned(),
            message,
        }
    }

    /// Missing hook; never offered to `on_denied`.
    pub fn not_implemented(policy: PolicyKind, method: &str) -> Self {
        let err = CapError::not_implemented(method);
        Self {
            kind: ErrorKind::NotImplemented,
            policy,
            member: method.to_string(),
            caller: None,
            message: err.to_string(),
        }
    }

    pub fn into_error(self) -> CapError {
        CapError::new(self.kind, self.message)
    }
}

/// What the `on_denied` hook decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Fail with the policy's own message.
    Default,
    /// Fail with this message instead.
    Report(String),
    /// Let the access through anyway.
    Permit,
}

/// A pluggable cross-cutting policy.
///
/// Hooks with default bodies that return `NotImplemented` must be supplied by
/// any policy that relies on them; they fail at first use otherwise.
pub trait Policy: Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> PolicyKind;

    /// Stable identity of this configuration, used in cache keys.
    fn fingerprint(&self) -> String;

    /// Members this policy gates.
    fn gated(&self) -> &BTreeSet<String>;

    fn gates(&self, member: &str) -> bool {
        self.gated().contains(member)
    }

    /// Members a view of a decorated instance always refuses.
    fn view_blocked(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Denial a view raises for one of its blocked members.
    fn view_denial(&self, member: &str, view_name: &str, _class_name: &str) -> (ErrorKind, String) {
        (
            self.kind().violation(),
            format!("`{member}` method is not callable on `{view_name}` view objects."),
        )
    }

    /// Keyword parameters this policy accepts at construction.
    fn construct_signature(&self) -> String {
        String::new()
    }

    /// Initial state from this policy's share of the constructor arguments.
    fn construct(&self, _args: &BoundArgs, _owner: &ClassId) -> Result<PolicyState> {
        Err(CapError::not_implemented(&format!("{}::construct", self.kind().tag())))
    }

    /// Decide one access to a gated member.
    fn check(&self, state: &PolicyState, access: &Access<'_>) -> Option<Denial>;

    fn handles(&self, _op: &Transition) -> bool {
        false
    }

    fn transition(
        &self,
        _state: &mut PolicyState,
        op: &Transition,
        _access: &Access<'_>,
    ) -> std::result::Result<(), Denial> {
        Err(Denial::not_implemented(self.kind(), &format!("{}::{}", self.kind().tag(), op.name())))
    }

    fn probe(&self, _state: &PolicyState, _probe: Probe<'_>) -> Option<Result<bool>> {
        None
    }

    /// Whether freeze transitions propagate to owned decorated children.
    fn cascades(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Bare(BTreeSet<String>);

    impl Policy for Bare {
        fn kind(&self) -> PolicyKind {
            PolicyKind::Custom("bare")
        }
        fn fingerprint(&self) -> String {
            "bare".into()
        }
        fn gated(&self) -> &BTreeSet<String> {
            &self.0
        }
        fn check(&self, _: &PolicyState, _: &Access<'_>) -> Option<Denial> {
            None
        }
    }

    #[test]
    fn unimplemented_hooks_fail_loudly() {
        let p = Bare(BTreeSet::new());
        let owner = ClassId::new("Box");
        let err = p.construct(&BoundArgs::default(), &owner).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);

        let access = Access {
            member: "freeze",
            mode: AccessMode::Call,
            caller: None,
            owner: &owner,
            class_name: "Box",
        };
        let mut state = PolicyState::Static;
        let denial = p.transition(&mut state, &Transition::Freeze, &access).unwrap_err();
        assert_eq!(denial.kind, ErrorKind::NotImplemented);
        assert_eq!(denial.into_error().to_string(), "`bare::freeze` method is not implemented.");
    }

    #[test]
    fn kinds_map_to_violations() {
        assert_eq!(PolicyKind::Freeze.violation(), ErrorKind::Frozen);
        assert_eq!(PolicyKind::Lock.violation(), ErrorKind::Locked);
        assert_eq!(PolicyKind::Friend.violation(), ErrorKind::Friend);
        assert!(AccessMode::Write.mutates() && !AccessMode::Read.mutates());
    }
}
