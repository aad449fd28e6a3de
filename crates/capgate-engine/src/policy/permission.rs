//! Caller-set compilation and matching.
//!
//! Every policy that asks "may this class do that?" goes through
//! `CallerSet::permits`. The owning class is always permitted.

use std::collections::BTreeSet;
use std::fmt;

use capgate_core::ClassId;

/// Classes permitted to perform an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerSet {
    open: bool,
    classes: BTreeSet<String>,
    subclasses: bool,
}

impl CallerSet {
    /// Any caller, including module-level code.
    pub fn anyone() -> Self {
        Self { open: true, ..Default::default() }
    }

    /// Only the owning class itself.
    pub fn owner_only() -> Self {
        Self::default()
    }

    /// The listed classes (plus the owner).
    pub fn only<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { open: false, classes: classes.into_iter().map(Into::into).collect(), subclasses: false }
    }

    /// Also permit classes derived from a permitted class.
    pub fn with_subclasses(mut self, yes: bool) -> Self {
        self.subclasses = yes;
        self
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }

    /// Union of two sets; open wins.
    pub fn union(&self, other: &CallerSet) -> CallerSet {
        CallerSet {
            open: self.open || other.open,
            classes: self.classes.union(&other.classes).cloned().collect(),
            subclasses: self.subclasses || other.subclasses,
        }
    }

    pub fn permits(&self, caller: Option<&ClassId>, owner: &ClassId) -> bool {
        if self.open {
            return true;
        }
        let Some(caller) = caller else { return false; };

        let matches = |name: &str| {
            if self.subclasses { caller.is_a(name) } else { caller.name() == name }
        };
        matches(owner.name()) || self.classes.iter().any(|c| matches(c))
    }
}

impl fmt::Display for CallerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.open {
            return f.write_str("*");
        }
        let names: Vec<&str> = self.classes().collect();
        write!(f, "[{}]", names.join(","))?;
        if self.subclasses {
            f.write_str("+sub")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_is_always_permitted() {
        let owner = ClassId::new("Vault");
        let set = CallerSet::only(["Admin"]);
        assert!(set.permits(Some(&owner), &owner));
        assert!(set.permits(Some(&ClassId::new("Admin")), &owner));
        assert!(!set.permits(Some(&ClassId::new("Guest")), &owner));
        assert!(!set.permits(None, &owner));
        assert!(CallerSet::owner_only().permits(Some(&owner), &owner));
    }

    #[test]
    fn subclasses_only_when_enabled() {
        let owner = ClassId::new("Vault");
        let admin = ClassId::new("Admin");
        let root = admin.subclass("Root");
        assert!(!CallerSet::only(["Admin"]).permits(Some(&root), &owner));
        assert!(CallerSet::only(["Admin"]).with_subclasses(true).permits(Some(&root), &owner));
        // Subclasses of the owner count as self-access when enabled.
        let sub_vault = owner.subclass("SubVault");
        assert!(CallerSet::owner_only().with_subclasses(true).permits(Some(&sub_vault), &owner));
    }

    #[test]
    fn open_set_admits_anonymous_callers() {
        let owner = ClassId::new("Vault");
        assert!(CallerSet::anyone().permits(None, &owner));
        assert!(CallerSet::only(["A"]).union(&CallerSet::anyone()).is_open());
        assert_eq!(CallerSet::only(["B", "A"]).to_string(), "[A,B]");
    }
}
