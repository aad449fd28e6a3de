//! Freeze policy: `mutable <-> frozen`, gated members fail while frozen.

use std::collections::BTreeSet;

use capgate_core::error::{CapError, ErrorKind, Result};
use capgate_core::{BoundArgs, ClassId};

use super::permission::CallerSet;
use super::{Access, Denial, Policy, PolicyKind, PolicyState, Probe, Transition};

/// A decorated object whose frozen state can be set by its owner.
pub trait Freezable: Send + Sync {
    /// Force the frozen state, bypassing `let_freeze`/`let_melt`.
    fn cascade_frozen(&self, frozen: bool) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FreezePolicy {
    methods: BTreeSet<String>,
    let_freeze: CallerSet,
    let_melt: CallerSet,
    frozen: bool,
    transitive: bool,
}

impl FreezePolicy {
    /// Starts with no gated methods and both `let_freeze` and `let_melt`
    /// open to any caller. Python's `freezable` closes `let_melt` by default;
    /// here melting must be restricted explicitly with
    /// [`FreezeBuilder::let_melt`].
    pub fn builder() -> FreezeBuilder {
        FreezeBuilder {
            methods: BTreeSet::new(),
            let_freeze: CallerSet::anyone(),
            let_melt: CallerSet::anyone(),
            frozen: false,
            transitive: false,
        }
    }

    pub fn frozen_at_construction(&self) -> bool {
        self.frozen
    }

    fn frozen_text(member: &str, class_name: &str) -> String {
        format!(
            "Calling `{member}` method on frozen `{class_name}` objects is not possible. \
             Try making a copy of the object before calling frozen methods."
        )
    }
}

pub struct FreezeBuilder {
    methods: BTreeSet<String>,
    let_freeze: CallerSet,
    let_melt: CallerSet,
    frozen: bool,
    transitive: bool,
}

impl FreezeBuilder {
    /// Gate `name`: it fails while the object is frozen.
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.insert(name.into());
        self
    }

    pub fn methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(names.into_iter().map(Into::into));
        self
    }

    /// Who may call `freeze()`.
    pub fn let_freeze(mut self, callers: CallerSet) -> Self {
        self.let_freeze = callers;
        self
    }

    /// Who may call `melt()`.
    pub fn let_melt(mut self, callers: CallerSet) -> Self {
        self.let_melt = callers;
        self
    }

    /// Start instances frozen unless the constructor says otherwise.
    pub fn frozen(mut self, yes: bool) -> Self {
        self.frozen = yes;
        self
    }

    /// Propagate freeze/melt to owned decorated children.
    pub fn transitive(mut self, yes: bool) -> Self {
        self.transitive = yes;
        self
    }

    pub fn build(self) -> FreezePolicy {
        FreezePolicy {
            methods: self.methods,
            let_freeze: self.let_freeze,
            let_melt: self.let_melt,
            frozen: self.frozen,
            transitive: self.transitive,
        }
    }
}

impl Policy for FreezePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Freeze
    }

    fn fingerprint(&self) -> String {
        let methods: Vec<&str> = self.methods.iter().map(String::as_str).collect();
        format!(
            "freezable(methods=[{}],let_freeze={},let_melt={},frozen={},transitive={})",
            methods.join(","),
            self.let_freeze,
            self.let_melt,
            self.frozen,
            self.transitive
        )
    }

    fn gated(&self) -> &BTreeSet<String> {
        &self.methods
    }

    fn view_blocked(&self) -> BTreeSet<String> {
        self.methods.clone()
    }

    // A view of a freezable object is always frozen.
    fn view_denial(&self, member: &str, _view_name: &str, class_name: &str) -> (ErrorKind, String) {
        (ErrorKind::Frozen, Self::frozen_text(member, class_name))
    }

    fn construct_signature(&self) -> String {
        format!("frozen={}", self.frozen)
    }

    fn construct(&self, args: &BoundArgs, _owner: &ClassId) -> Result<PolicyState> {
        Ok(PolicyState::Frozen(args.get_as::<bool>("frozen")?))
    }

    fn check(&self, state: &PolicyState, access: &Access<'_>) -> Option<Denial> {
        if !access.mode.mutates() || !self.gates(access.member) {
            return None;
        }
        match state {
            PolicyState::Frozen(true) => Some(Denial::new(
                PolicyKind::Freeze,
                access,
                Self::frozen_text(access.member, access.class_name),
            )),
            _ => None,
        }
    }

    fn handles(&self, op: &Transition) -> bool {
        matches!(op, Transition::Freeze | Transition::Melt)
    }

    fn transition(
        &self,
        state: &mut PolicyState,
        op: &Transition,
        access: &Access<'_>,
    ) -> std::result::Result<(), Denial> {
        let (callers, frozen) = match op {
            Transition::Freeze => (&self.let_freeze, true),
            Transition::Melt => (&self.let_melt, false),
            other => return Err(Denial::not_implemented(PolicyKind::Freeze, other.name())),
        };
        if !callers.permits(access.caller, access.owner) {
            return Err(Denial::new(
                PolicyKind::Freeze,
                access,
                format!("`{}` method on `{}` objects is not callable.", op.name(), access.class_name),
            ));
        }
        *state = PolicyState::Frozen(frozen);
        Ok(())
    }

    fn probe(&self, state: &PolicyState, probe: Probe<'_>) -> Option<Result<bool>> {
        match (probe, state) {
            (Probe::Frozen, PolicyState::Frozen(f)) => Some(Ok(*f)),
            (Probe::Frozen, other) => {
                Some(Err(CapError::Internal(format!("freeze layer holds {other:?}"))))
            }
            _ => None,
        }
    }

    fn cascades(&self) -> bool {
        self.transitive
    }
}
