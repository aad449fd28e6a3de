//! Caller identity.
//!
//! Permission checks compare the calling class against allow-lists. The caller
//! states its identity explicitly with a `ClassId`; nothing is inferred from
//! the call stack.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a class plus the names of its ancestors, nearest first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId {
    name: String,
    #[serde(default)]
    ancestors: Vec<String>,
}

impl ClassId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ancestors: Vec::new() }
    }

    /// Identity of a subclass of `self`.
    pub fn subclass(&self, name: impl Into<String>) -> Self {
        let mut ancestors = Vec::with_capacity(self.ancestors.len() + 1);
        ancestors.push(self.name.clone());
        ancestors.extend(self.ancestors.iter().cloned());
        Self { name: name.into(), ancestors }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// True if this class is `name` or derives from it.
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.ancestors.iter().any(|a| a == name)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Display helper for an optional caller; module-level code has no class.
pub fn caller_name(caller: Option<&ClassId>) -> &str {
    caller.map(ClassId::name).unwrap_or("anonymous")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subclass_knows_its_lineage() {
        let base = ClassId::new("Account");
        let mid = base.subclass("Savings");
        let leaf = mid.subclass("Junior");
        assert!(leaf.is_a("Junior") && leaf.is_a("Savings") && leaf.is_a("Account"));
        assert!(!base.is_a("Savings"));
        assert_eq!(leaf.ancestors(), ["Savings".to_string(), "Account".to_string()]);
    }

    #[test]
    fn anonymous_caller_name() {
        assert_eq!(caller_name(None), "anonymous");
        assert_eq!(caller_name(Some(&ClassId::new("Admin"))), "Admin");
    }
}
