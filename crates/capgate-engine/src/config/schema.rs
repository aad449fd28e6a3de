use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;

use capgate_core::error::{CapError, Result};

use crate::policy::{CallerSet, FreezePolicy, FriendPolicy, LockPolicy, Policy};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecorationConfig {
    pub version: u32,

    #[serde(default)]
    pub classes: Vec<ClassDecoration>,
}

impl DecorationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(CapError::Configuration(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        let mut seen = BTreeSet::new();
        for c in &self.classes {
            if c.name.trim().is_empty() {
                return Err(CapError::Configuration("classes[].name must not be empty".into()));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(CapError::Configuration(format!("class `{}` is configured twice", c.name)));
            }
            // Every section must compile into a policy.
            if c.policies()?.is_empty() {
                return Err(CapError::Configuration(format!(
                    "class `{}` has no freezable, lockable or friends section",
                    c.name
                )));
            }
        }
        Ok(())
    }

    pub fn class(&self, name: &str) -> Option<&ClassDecoration> {
        self.classes.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassDecoration {
    pub name: String,

    #[serde(default)]
    pub freezable: Option<FreezeSection>,

    #[serde(default)]
    pub lockable: Option<LockSection>,

    #[serde(default)]
    pub friends: Option<FriendSection>,
}

impl ClassDecoration {
    /// Policy layers in a fixed order: freeze, lock, friends.
    pub fn policies(&self) -> Result<Vec<Arc<dyn Policy>>> {
        let mut out: Vec<Arc<dyn Policy>> = Vec::new();
        if let Some(f) = &self.freezable {
            out.push(Arc::new(f.policy()));
        }
        if let Some(l) = &self.lockable {
            out.push(Arc::new(l.policy()?));
        }
        if let Some(f) = &self.friends {
            out.push(Arc::new(f.policy()?));
        }
        Ok(out)
    }
}

/// `true` (anyone), `false` (the class itself) or a list of class names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Permit {
    All(bool),
    Only(Vec<String>),
}

impl Default for Permit {
    fn default() -> Self {
        Permit::All(true)
    }
}

impl Permit {
    pub fn callers(&self) -> CallerSet {
        match self {
            Permit::All(true) => CallerSet::anyone(),
            Permit::All(false) => CallerSet::owner_only(),
            Permit::Only(names) => CallerSet::only(names.iter().cloned()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreezeSection {
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub let_freeze: Permit,

    #[serde(default)]
    pub let_melt: Permit,

    #[serde(default)]
    pub frozen: bool,

    #[serde(default)]
    pub transitive: bool,
}

impl FreezeSection {
    pub fn policy(&self) -> FreezePolicy {
        FreezePolicy::builder()
            .methods(self.methods.iter().cloned())
            .let_freeze(self.let_freeze.callers())
            .let_melt(self.let_melt.callers())
            .frozen(self.frozen)
            .transitive(self.transitive)
            .build()
    }
}

/// `null` means anyone.
fn callers_or_anyone(names: &Option<Vec<String>>) -> CallerSet {
    match names {
        Some(names) => CallerSet::only(names.iter().cloned()),
        None => CallerSet::anyone(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSection {
    #[serde(default)]
    pub lock_permissions: BTreeMap<String, Option<Vec<String>>>,

    #[serde(default)]
    pub unlock_permissions: Option<BTreeMap<String, Option<Vec<String>>>>,

    /// method -> keys; `null` locks the method with any key.
    #[serde(default)]
    pub methods: BTreeMap<String, Option<Vec<String>>>,
}

impl LockSection {
    pub fn policy(&self) -> Result<LockPolicy> {
        let mut b = LockPolicy::builder();
        for (key, names) in &self.lock_permissions {
            b = b.key(key.clone(), callers_or_anyone(names));
        }
        for (key, names) in self.unlock_permissions.iter().flatten() {
            b = b.unlock_key(key.clone(), callers_or_anyone(names));
        }
        for (method, keys) in &self.methods {
            b = match keys {
                Some(keys) => b.method(method.clone(), keys.iter().cloned()),
                None => b.method_global(method.clone()),
            };
        }
        b.build()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FriendSection {
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,

    /// method -> extra groups (the `default` group always applies).
    #[serde(default)]
    pub methods: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub allow_subclasses: bool,
}

impl FriendSection {
    pub fn policy(&self) -> Result<FriendPolicy> {
        let mut b = FriendPolicy::builder().allow_subclasses(self.allow_subclasses);
        for (group, names) in &self.groups {
            b = b.group(group.clone(), names.iter().cloned());
        }
        for (method, groups) in &self.methods {
            b = b.method_for(method.clone(), groups.iter().cloned());
        }
        b.build()
    }
}
