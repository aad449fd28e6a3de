//! Friend-access policy: gated members are reachable only by friend classes.
//!
//! Friends are organised in named groups. The `default` group applies to
//! every gated member; a member may name extra groups. The decorated class
//! itself is always a friend.

use std::collections::{BTreeMap, BTreeSet};

use capgate_core::error::{CapError, Result};
use capgate_core::identity::caller_name;
use capgate_core::{BoundArgs, ClassId};

use super::permission::CallerSet;
use super::{Access, Denial, Policy, PolicyKind, PolicyState};

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone)]
pub struct FriendPolicy {
    groups: BTreeMap<String, BTreeSet<String>>,
    methods: BTreeMap<String, BTreeSet<String>>,
    allow_subclasses: bool,
    gated: BTreeSet<String>,
    // member -> resolved friends
    allowed: BTreeMap<String, CallerSet>,
}

impl FriendPolicy {
    pub fn builder() -> FriendBuilder {
        FriendBuilder::default()
    }

    /// Friends permitted on `member`, or `None` if it is not gated.
    pub fn friends_of(&self, member: &str) -> Option<&CallerSet> {
        self.allowed.get(member)
    }
}

#[derive(Default)]
pub struct FriendBuilder {
    groups: BTreeMap<String, BTreeSet<String>>,
    methods: BTreeMap<String, BTreeSet<String>>,
    allow_subclasses: bool,
}

impl FriendBuilder {
    /// Add classes to the `default` group.
    pub fn friends<I, S>(self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group(DEFAULT_GROUP, classes)
    }

    /// Add classes to a named group.
    pub fn group<I, S>(mut self, name: impl Into<String>, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.entry(name.into()).or_default().extend(classes.into_iter().map(Into::into));
        self
    }

    /// Gate `name`; reachable by the `default` group only.
    pub fn method(self, name: impl Into<String>) -> Self {
        self.method_for(name, Vec::<String>::new())
    }

    /// Gate `name`; reachable by the `default` group plus `groups`.
    pub fn method_for<I, S>(mut self, name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.entry(name.into()).or_default().extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn allow_subclasses(mut self, yes: bool) -> Self {
        self.allow_subclasses = yes;
        self
    }

    pub fn build(self) -> Result<FriendPolicy> {
        if self.groups.is_empty() {
            return Err(CapError::Configuration(
                "No friends have been defined for `alienatable` decorator. \
                 Use `friends` parameter to define the friends."
                    .into(),
            ));
        }

        let empty = BTreeSet::new();
        let default = self.groups.get(DEFAULT_GROUP).unwrap_or(&empty);
        let mut allowed = BTreeMap::new();
        for (member, groups) in &self.methods {
            let mut classes = default.clone();
            for g in groups {
                let members = self.groups.get(g).ok_or_else(|| {
                    CapError::Configuration(format!("`{member}` names unknown friend group '{g}'"))
                })?;
                classes.extend(members.iter().cloned());
            }
            allowed.insert(
                member.clone(),
                CallerSet::only(classes).with_subclasses(self.allow_subclasses),
            );
        }

        Ok(FriendPolicy {
            gated: self.methods.keys().cloned().collect(),
            groups: self.groups,
            methods: self.methods,
            allow_subclasses: self.allow_subclasses,
            allowed,
        })
    }
}

impl Policy for FriendPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Friend
    }

    fn fingerprint(&self) -> String {
        let join = |m: &BTreeMap<String, BTreeSet<String>>| {
            m.iter()
                .map(|(k, v)| format!("{k}:{}", v.iter().cloned().collect::<Vec<_>>().join("|")))
                .collect::<Vec<_>>()
                .join(";")
        };
        format!(
            "alienatable(groups={},methods={},subclasses={})",
            join(&self.groups),
            join(&self.methods),
            self.allow_subclasses
        )
    }

    fn gated(&self) -> &BTreeSet<String> {
        &self.gated
    }

    fn construct(&self, _args: &BoundArgs, _owner: &ClassId) -> Result<PolicyState> {
        Ok(PolicyState::Static)
    }

    fn check(&self, _state: &PolicyState, access: &Access<'_>) -> Option<Denial> {
        let friends = self.allowed.get(access.member)?;
        if friends.permits(access.caller, access.owner) {
            return None;
        }
        Some(Denial::new(
            PolicyKind::Friend,
            access,
            format!(
                "Alien `{}` object is not allowed to call `{}.{}` method.",
                caller_name(access.caller),
                access.class_name,
                access.member
            ),
        ))
    }
}
