//! Argument bags passed to constructors and methods.
//!
//! Values are `serde_json::Value` so that decorated classes, policies and
//! configuration share one dynamic representation.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CapError, Result};

/// Combined positional + keyword arguments for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgBag {
    pub positional: Vec<Value>,
    pub keyword: BTreeMap<String, Value>,
}

impl ArgBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bag holding only positional arguments.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kw(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }
}

/// Arguments after binding against a `MethodSpec`: every declared parameter
/// has a value (passed or default).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    named: BTreeMap<String, Value>,
    rest: Vec<Value>,
    extra: BTreeMap<String, Value>,
}

impl BoundArgs {
    pub(crate) fn from_parts(
        named: BTreeMap<String, Value>,
        rest: Vec<Value>,
        extra: BTreeMap<String, Value>,
    ) -> Self {
        Self { named, rest, extra }
    }

    /// Bound value of a declared parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// Deserialize a declared parameter into `D`.
    pub fn get_as<D: DeserializeOwned>(&self, name: &str) -> Result<D> {
        let v = self
            .named
            .get(name)
            .ok_or_else(|| CapError::Argument(format!("missing argument '{name}'")))?;
        serde_json::from_value(v.clone())
            .map_err(|e| CapError::Argument(format!("argument '{name}': {e}")))
    }

    /// Surplus positional arguments collected by a `*rest` parameter.
    pub fn rest(&self) -> &[Value] {
        &self.rest
    }

    /// Surplus keyword arguments collected by a `**extra` parameter.
    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }
}
