//! Lock policy: a set of held keys; gated members fail while a relevant key is held.
//!
//! Keys are declared with the classes permitted to lock and unlock them.
//! A gated member is either globally locked (any held key) or keyed (only
//! the listed keys).

use std::collections::{BTreeMap, BTreeSet};

use capgate_core::error::{CapError, Result};
use capgate_core::identity::caller_name;
use capgate_core::{BoundArgs, ClassId};

use super::permission::CallerSet;
use super::{Access, Denial, Policy, PolicyKind, PolicyState, Probe, Transition};

/// Which held keys lock a gated member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    /// Any held key.
    Any,
    /// Only these keys.
    Keys(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct LockPolicy {
    lock_permissions: BTreeMap<String, CallerSet>,
    unlock_permissions: BTreeMap<String, CallerSet>,
    methods: BTreeMap<String, KeyScope>,
    gated: BTreeSet<String>,
}

impl LockPolicy {
    pub fn builder() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lock_permissions.keys().map(String::as_str)
    }

    pub fn knows(&self, key: &str) -> bool {
        self.lock_permissions.contains_key(key)
    }

    fn unrecognized(access: &Access<'_>, key: &str) -> Denial {
        Denial::new(PolicyKind::Lock, access, format!("Unrecognized key '{key}'."))
    }

    fn held_key<'s>(scope: &KeyScope, held: &'s BTreeSet<String>) -> Option<&'s str> {
        match scope {
            KeyScope::Any => held.iter().next().map(String::as_str),
            KeyScope::Keys(keys) => held.iter().find(|k| keys.contains(*k)).map(String::as_str),
        }
    }
}

#[derive(Default)]
pub struct LockBuilder {
    lock_permissions: BTreeMap<String, CallerSet>,
    unlock_permissions: Option<BTreeMap<String, CallerSet>>,
    methods: BTreeMap<String, KeyScope>,
    empty_keyed: Vec<String>,
}

impl LockBuilder {
    /// Declare `key` and who may lock it.
    pub fn key(mut self, key: impl Into<String>, lockers: CallerSet) -> Self {
        self.lock_permissions.insert(key.into(), lockers);
        self
    }

    /// Who may unlock `key`. Without any of these calls, unlocking mirrors locking.
    pub fn unlock_key(mut self, key: impl Into<String>, unlockers: CallerSet) -> Self {
        self.unlock_permissions.get_or_insert_with(BTreeMap::new).insert(key.into(), unlockers);
        self
    }

    /// Gate `name` behind the listed keys.
    pub fn method<I, S>(mut self, name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            self.empty_keyed.push(name.clone());
        }
        self.methods.insert(name, KeyScope::Keys(keys));
        self
    }

    /// Gate `name` behind every key.
    pub fn method_global(mut self, name: impl Into<String>) -> Self {
        self.methods.insert(name.into(), KeyScope::Any);
        self
    }

    pub fn build(self) -> Result<LockPolicy> {
        let mut lock_permissions = self.lock_permissions;
        let mut unlock_permissions = match self.unlock_permissions {
            Some(u) => u,
            None => lock_permissions.clone(),
        };

        // A key missing from one side is open to any caller on that side.
        for key in unlock_permissions.keys() {
            lock_permissions.entry(key.clone()).or_insert_with(CallerSet::anyone);
        }
        for key in lock_permissions.keys() {
            unlock_permissions.entry(key.clone()).or_insert_with(CallerSet::anyone);
        }

        if lock_permissions.is_empty() {
            return Err(CapError::Configuration(
                "No locks have been defined for `lockable` decorator. \
                 Use `lock_permissions` parameter to define the locks."
                    .into(),
            ));
        }
        if let Some(name) = self.empty_keyed.first() {
            return Err(CapError::Configuration(format!(
                "No keys have been defined for `{name}` in `lockable` decorator. \
                 Use `keys` parameter to define the keys."
            )));
        }
        for (name, scope) in &self.methods {
            if let KeyScope::Keys(keys) = scope {
                if let Some(k) = keys.iter().find(|k| !lock_permissions.contains_key(*k)) {
                    return Err(CapError::Configuration(format!(
                        "`{name}` is gated by undeclared key '{k}'"
                    )));
                }
            }
        }

        let gated = self.methods.keys().cloned().collect();
        Ok(LockPolicy { lock_permissions, unlock_permissions, methods: self.methods, gated })
    }
}

impl Policy for LockPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lock
    }

    fn fingerprint(&self) -> String {
        let perms = |m: &BTreeMap<String, CallerSet>| {
            m.iter().map(|(k, v)| format!("{k}:{v}")).collect::<Vec<_>>().join(";")
        };
        let methods = self
            .methods
            .iter()
            .map(|(m, s)| match s {
                KeyScope::Any => format!("{m}:*"),
                KeyScope::Keys(k) => {
                    format!("{m}:{}", k.iter().cloned().collect::<Vec<_>>().join("|"))
                }
            })
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "lockable(lock={},unlock={},methods={})",
            perms(&self.lock_permissions),
            perms(&self.unlock_permissions),
            methods
        )
    }

    fn gated(&self) -> &BTreeSet<String> {
        &self.gated
    }

    fn view_blocked(&self) -> BTreeSet<String> {
        self.gated.clone()
    }

    fn construct_signature(&self) -> String {
        "locks=[]".to_string()
    }

    // Initial locks are applied by the class itself, which may always lock.
    fn construct(&self, args: &BoundArgs, _owner: &ClassId) -> Result<PolicyState> {
        let keys: Vec<String> = args.get_as("locks")?;
        let mut held = BTreeSet::new();
        for key in keys {
            if !self.knows(&key) {
                return Err(CapError::Locked(format!("Unrecognized key '{key}'.")));
            }
            held.insert(key);
        }
        Ok(PolicyState::Locks(held))
    }

    fn check(&self, state: &PolicyState, access: &Access<'_>) -> Option<Denial> {
        if !access.mode.mutates() {
            return None;
        }
        let scope = self.methods.get(access.member)?;
        let PolicyState::Locks(held) = state else { return None; };
        let key = Self::held_key(scope, held)?;
        Some(Denial::new(
            PolicyKind::Lock,
            access,
            format!("`{}.{}` method is locked with key '{key}'.", access.class_name, access.member),
        ))
    }

    fn handles(&self, op: &Transition) -> bool {
        matches!(op, Transition::Lock(_) | Transition::Unlock(_))
    }

    fn transition(
        &self,
        state: &mut PolicyState,
        op: &Transition,
        access: &Access<'_>,
    ) -> std::result::Result<(), Denial> {
        let PolicyState::Locks(held) = state else {
            return Err(Denial::new(PolicyKind::Lock, access, format!("lock layer holds {state:?}")));
        };
        let (key, perms, verb) = match op {
            Transition::Lock(k) => (k, &self.lock_permissions, "lock"),
            Transition::Unlock(k) => (k, &self.unlock_permissions, "unlock"),
            other => return Err(Denial::not_implemented(PolicyKind::Lock, other.name())),
        };

        let Some(callers) = perms.get(key) else {
            return Err(Self::unrecognized(access, key));
        };
        if !callers.permits(access.caller, access.owner) {
            return Err(Denial::new(
                PolicyKind::Lock,
                access,
                format!(
                    "`{}` objects are not allowed to {verb} `{}` objects using '{key}' key.",
                    caller_name(access.caller),
                    access.class_name
                ),
            ));
        }

        match op {
            Transition::Lock(_) => {
                held.insert(key.clone());
            }
            _ => {
                if !held.remove(key) {
                    return Err(Denial::new(
                        PolicyKind::Lock,
                        access,
                        format!("`{}` objects are not locked with '{key}' key.", access.class_name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn probe(&self, state: &PolicyState, probe: Probe<'_>) -> Option<Result<bool>> {
        let Probe::Locked(key) = probe else { return None; };
        if !self.knows(key) {
            return Some(Err(CapError::Locked(format!("Unrecognized key '{key}'."))));
        }
        match state {
            PolicyState::Locks(held) => Some(Ok(held.contains(key))),
            other => Some(Err(CapError::Internal(format!("lock layer holds {other:?}")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::AccessMode;
    use capgate_core::ErrorKind;

    fn policy() -> LockPolicy {
        LockPolicy::builder()
            .key("edit", CallerSet::only(["Admin"]))
            .key("audit", CallerSet::anyone())
            .method("set", ["edit"])
            .method_global("clear")
            .build()
            .unwrap()
    }

    fn access<'a>(member: &'a str, owner: &'a ClassId, caller: Option<&'a ClassId>) -> Access<'a> {
        Access { member, mode: AccessMode::Call, caller, owner, class_name: owner.name() }
    }

    #[test]
    fn keyed_and_global_gates() {
        let p = policy();
        let owner = ClassId::new("Doc");
        let audit_only = PolicyState::Locks(["audit".to_string()].into());

        assert!(p.check(&audit_only, &access("set", &owner, None)).is_none());
        let d = p.check(&audit_only, &access("clear", &owner, None)).unwrap();
        assert_eq!(d.kind, ErrorKind::Locked);
        assert_eq!(d.message, "`Doc.clear` method is locked with key 'audit'.");
        assert!(p.check(&PolicyState::Locks(BTreeSet::new()), &access("clear", &owner, None)).is_none());
    }

    #[test]
    fn lock_requires_permission_and_leaves_state_on_refusal() {
        let p = policy();
        let owner = ClassId::new("Doc");
        let admin = ClassId::new("Admin");
        let guest = ClassId::new("Guest");
        let mut state = PolicyState::Locks(BTreeSet::new());

        let d = p
            .transition(&mut state, &Transition::Lock("edit".into()), &access("lock", &owner, Some(&guest)))
            .unwrap_err();
        assert_eq!(d.message, "`Guest` objects are not allowed to lock `Doc` objects using 'edit' key.");
        assert_eq!(state, PolicyState::Locks(BTreeSet::new()));

        p.transition(&mut state, &Transition::Lock("edit".into()), &access("lock", &owner, Some(&admin)))
            .unwrap();
        assert!(p.check(&state, &access("set", &owner, None)).is_some());
    }

    #[test]
    fn unlocking_a_key_never_locked_fails_cleanly() {
        let p = policy();
        let owner = ClassId::new("Doc");
        let mut state = PolicyState::Locks(BTreeSet::new());

        let d = p
            .transition(&mut state, &Transition::Unlock("audit".into()), &access("unlock", &owner, None))
            .unwrap_err();
        assert_eq!(d.message, "`Doc` objects are not locked with 'audit' key.");
        assert_eq!(state, PolicyState::Locks(BTreeSet::new()));

        let d = p
            .transition(&mut state, &Transition::Lock("nope".into()), &access("lock", &owner, None))
            .unwrap_err();
        assert_eq!(d.message, "Unrecognized key 'nope'.");
    }

    #[test]
    fn configuration_errors() {
        assert!(LockPolicy::builder().build().is_err());
        assert!(LockPolicy::builder()
            .key("a", CallerSet::anyone())
            .method("m", ["b"])
            .build()
            .is_err());
        assert!(LockPolicy::builder()
            .key("a", CallerSet::anyone())
            .method("m", Vec::<String>::new())
            .build()
            .is_err());
    }

    #[test]
    fn explicit_unlock_permissions_replace_lock_permissions() {
        let p = LockPolicy::builder()
            .key("edit", CallerSet::only(["Admin"]))
            .unlock_key("edit", CallerSet::only(["Root"]))
            .method("set", ["edit"])
            .build()
            .unwrap();
        let owner = ClassId::new("Doc");
        let admin = ClassId::new("Admin");
        let root = ClassId::new("Root");
        let mut state = PolicyState::Locks(BTreeSet::new());

        p.transition(&mut state, &Transition::Lock("edit".into()), &access("lock", &owner, Some(&admin)))
            .unwrap();
        assert!(p
            .transition(&mut state, &Transition::Unlock("edit".into()), &access("unlock", &owner, Some(&admin)))
            .is_err());
        p.transition(&mut state, &Transition::Unlock("edit".into()), &access("unlock", &owner, Some(&root)))
            .unwrap();
        assert_eq!(p.probe(&state, Probe::Locked("edit")), Some(Ok(false)));
        assert!(matches!(p.probe(&state, Probe::Locked("zzz")), Some(Err(_))));
    }

    #[test]
    fn keys_left_out_of_unlock_permissions_unlock_for_anyone() {
        let p = LockPolicy::builder()
            .key("edit", CallerSet::only(["Admin"]))
            .key("audit", CallerSet::only(["Admin"]))
            .unlock_key("edit", CallerSet::only(["Root"]))
            .method("set", ["edit", "audit"])
            .build()
            .unwrap();
        let owner = ClassId::new("Doc");
        let admin = ClassId::new("Admin");
        let guest = ClassId::new("Guest");
        let mut state = PolicyState::Locks(BTreeSet::new());

        for key in ["edit", "audit"] {
            p.transition(&mut state, &Transition::Lock(key.into()), &access("lock", &owner, Some(&admin)))
                .unwrap();
        }
        assert!(p
            .transition(&mut state, &Transition::Unlock("edit".into()), &access("unlock", &owner, Some(&guest)))
            .is_err());
        p.transition(&mut state, &Transition::Unlock("audit".into()), &access("unlock", &owner, Some(&guest)))
            .unwrap();
        assert_eq!(p.probe(&state, Probe::Locked("audit")), Some(Ok(false)));
        assert_eq!(p.probe(&state, Probe::Locked("edit")), Some(Ok(true)));
    }

    #[test]
    fn unlock_only_keys_lock_for_anyone() {
        let p = LockPolicy::builder()
            .key("edit", CallerSet::only(["Admin"]))
            .unlock_key("seal", CallerSet::only(["Root"]))
            .method("set", ["edit"])
            .build()
            .unwrap();
        let owner = ClassId::new("Doc");
        let guest = ClassId::new("Guest");
        let mut state = PolicyState::Locks(BTreeSet::new());

        p.transition(&mut state, &Transition::Lock("seal".into()), &access("lock", &owner, Some(&guest)))
            .unwrap();
        assert!(p
            .transition(&mut state, &Transition::Unlock("seal".into()), &access("unlock", &owner, Some(&guest)))
            .is_err());
    }
}
