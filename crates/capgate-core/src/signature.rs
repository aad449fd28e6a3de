//! Method specs, signature tailoring and the signature cache.
//!
//! A callable declares its parameter list as text:
//! `"value, scale=1, *rest, **extra"`. Defaults are JSON literals.
//! Parsing happens once per callable; the parsed `MethodSpec` is cached by
//! `CallableId` and shared by every wrapped type that uses the callable.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::args::{ArgBag, BoundArgs};
use crate::error::{CapError, Result};

/// Identity of a declared callable: the class that defines it plus its name.
///
/// `definition` tells apart classes that share a qualified name; every
/// class definition gets its own token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallableId {
    pub owner: String,
    pub name: String,
    pub definition: u64,
}

impl CallableId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self { owner: owner.into(), name: name.into(), definition: 0 }
    }

    /// Same callable name, scoped to one class definition.
    pub fn in_definition(mut self, definition: u64) -> Self {
        self.definition = definition;
        self
    }
}

impl fmt::Display for CallableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

/// Parsed parameter list of a callable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodSpec {
    /// Ordered named parameters (the receiver is never listed).
    pub params: Vec<Param>,
    /// Name of the `*rest` parameter, if any.
    pub var_positional: Option<String>,
    /// Name of the `**extra` parameter, if any.
    pub var_keyword: Option<String>,
    /// Whether the callable takes an implicit receiver.
    pub receiver: bool,
}

impl MethodSpec {
    /// Parse signature text.
    pub fn parse(text: &str, receiver: bool) -> Result<Self> {
        let mut spec = MethodSpec { receiver, ..Default::default() };
        let mut seen = BTreeSet::new();
        let mut saw_default = false;

        for raw in split_params(text) {
            let item = raw.trim();
            if item.is_empty() {
                continue;
            }

            if let Some(name) = item.strip_prefix("**") {
                let name = ident(name, text)?;
                if spec.var_keyword.is_some() {
                    return Err(bad_sig(text, "more than one `**` parameter"));
                }
                if !seen.insert(name.to_string()) {
                    return Err(bad_sig(text, &format!("duplicate parameter '{name}'")));
                }
                spec.var_keyword = Some(name.to_string());
                continue;
            }
            if spec.var_keyword.is_some() {
                return Err(bad_sig(text, "parameters after `**`"));
            }

            if let Some(name) = item.strip_prefix('*') {
                let name = ident(name, text)?;
                if spec.var_positional.is_some() {
                    return Err(bad_sig(text, "more than one `*` parameter"));
                }
                if !seen.insert(name.to_string()) {
                    return Err(bad_sig(text, &format!("duplicate parameter '{name}'")));
                }
                spec.var_positional = Some(name.to_string());
                continue;
            }
            if spec.var_positional.is_some() {
                return Err(bad_sig(text, "named parameters after `*`"));
            }

            let (name, default) = match item.split_once('=') {
                Some((n, d)) => {
                    let v: Value = serde_json::from_str(d.trim()).map_err(|e| {
                        bad_sig(text, &format!("default of '{}' is not JSON: {e}", n.trim()))
                    })?;
                    (ident(n, text)?, Some(v))
                }
                None => (ident(item, text)?, None),
            };

            if default.is_some() {
                saw_default = true;
            } else if saw_default {
                return Err(bad_sig(text, &format!("'{name}' without default follows a default")));
            }
            if !seen.insert(name.to_string()) {
                return Err(bad_sig(text, &format!("duplicate parameter '{name}'")));
            }
            spec.params.push(Param { name: name.to_string(), default });
        }

        Ok(spec)
    }

    /// True if `name` is one of the named parameters.
    pub fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Concatenate several specs into one keyword-only spec. Used to merge the
    /// constructor parameters of stacked policies.
    pub fn merge<'a>(specs: impl IntoIterator<Item = &'a MethodSpec>) -> Result<Self> {
        let mut out = MethodSpec::default();
        for s in specs {
            for p in &s.params {
                if out.declares(&p.name) {
                    return Err(CapError::Configuration(format!(
                        "parameter '{}' is claimed by more than one policy",
                        p.name
                    )));
                }
                out.params.push(p.clone());
            }
        }
        Ok(out)
    }

    /// Bind an argument bag, filling defaults. Fails with an argument error
    /// on surplus, missing, duplicate or unexpected arguments.
    pub fn bind(&self, args: &ArgBag) -> Result<BoundArgs> {
        let mut named = BTreeMap::new();
        let mut rest = Vec::new();

        for (i, v) in args.positional.iter().enumerate() {
            match self.params.get(i) {
                Some(p) => {
                    named.insert(p.name.clone(), v.clone());
                }
                None if self.var_positional.is_some() => rest.push(v.clone()),
                None => {
                    return Err(CapError::Argument(format!(
                        "takes {} positional arguments but {} were given",
                        self.params.len(),
                        args.positional.len()
                    )))
                }
            }
        }

        let mut extra = BTreeMap::new();
        for (k, v) in &args.keyword {
            if self.declares(k) {
                if named.contains_key(k) {
                    return Err(CapError::Argument(format!("got multiple values for argument '{k}'")));
                }
                named.insert(k.clone(), v.clone());
            } else if self.var_keyword.is_some() {
                extra.insert(k.clone(), v.clone());
            } else {
                return Err(CapError::Argument(format!("got an unexpected keyword argument '{k}'")));
            }
        }

        for p in &self.params {
            if named.contains_key(&p.name) {
                continue;
            }
            match &p.default {
                Some(d) => {
                    named.insert(p.name.clone(), d.clone());
                }
                None => {
                    return Err(CapError::Argument(format!(
                        "missing required argument '{}'",
                        p.name
                    )))
                }
            }
        }

        Ok(BoundArgs::from_parts(named, rest, extra))
    }
}

/// Result of splitting one argument bag between a callable and its policies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tailored {
    /// Arguments accepted by the wrapped callable.
    pub intended: ArgBag,
    /// Everything else; routed to policy initialisation.
    pub remainder: ArgBag,
}

/// Split `args` into the part accepted by `intended` and the remainder.
///
/// `intended = None` means the callable has no parameter list of its own, so
/// every argument goes to the remainder. Keywords declared by `augmented`
/// always go to the remainder unless `intended` names them explicitly.
/// The input bag is never modified and the outputs partition it exactly.
pub fn tailor(
    intended: Option<&MethodSpec>,
    augmented: Option<&MethodSpec>,
    args: &ArgBag,
) -> Tailored {
    let Some(intended) = intended else {
        return Tailored { intended: ArgBag::new(), remainder: args.clone() };
    };

    let mut out = Tailored::default();

    let take = if intended.var_positional.is_some() {
        args.positional.len()
    } else {
        intended.params.len().min(args.positional.len())
    };
    out.intended.positional = args.positional[..take].to_vec();
    out.remainder.positional = args.positional[take..].to_vec();

    for (k, v) in &args.keyword {
        let to_intended = intended.declares(k)
            || (intended.var_keyword.is_some() && !augmented.is_some_and(|a| a.declares(k)));
        let side = if to_intended { &mut out.intended } else { &mut out.remainder };
        side.keyword.insert(k.clone(), v.clone());
    }

    out
}

/// Process-wide memo of parsed specs keyed by callable identity.
#[derive(Default)]
pub struct SignatureCache {
    specs: DashMap<CallableId, Arc<MethodSpec>>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self { specs: DashMap::new() }
    }

    /// Fetch the cached spec for `id`, parsing `text` on first use.
    /// Concurrent first uses may both parse; the first insert wins.
    pub fn resolve(&self, id: &CallableId, text: &str, receiver: bool) -> Result<Arc<MethodSpec>> {
        if let Some(hit) = self.specs.get(id) {
            tracing::trace!(callable = %id, "signature cache hit");
            return Ok(Arc::clone(hit.value()));
        }
        let parsed = Arc::new(MethodSpec::parse(text, receiver)?);
        tracing::debug!(callable = %id, params = parsed.params.len(), "signature parsed");
        Ok(Arc::clone(self.specs.entry(id.clone()).or_insert(parsed).value()))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn clear(&self) {
        self.specs.clear();
    }
}

// Split on commas that are not nested inside JSON brackets or strings.
fn split_params(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_str = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if in_str {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

fn ident<'a>(raw: &'a str, text: &str) -> Result<&'a str> {
    let name = raw.trim();
    let mut chars = name.chars();
    let ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(bad_sig(text, &format!("'{name}' is not a parameter name")))
    }
}

fn bad_sig(text: &str, why: &str) -> CapError {
    CapError::Configuration(format!("signature \"{text}\": {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_defaults_and_varargs() {
        let s = MethodSpec::parse("a, b=[1, 2], c=\"x,y\", *rest, **extra", true).unwrap();
        assert_eq!(s.param_names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(s.params[1].default, Some(json!([1, 2])));
        assert_eq!(s.params[2].default, Some(json!("x,y")));
        assert_eq!(s.var_positional.as_deref(), Some("rest"));
        assert_eq!(s.var_keyword.as_deref(), Some("extra"));
        assert!(s.receiver);
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(MethodSpec::parse("a=1, b", false).is_err());
        assert!(MethodSpec::parse("a, a", false).is_err());
        assert!(MethodSpec::parse("**kw, a", false).is_err());
        assert!(MethodSpec::parse("1bad", false).is_err());
        assert!(MethodSpec::parse("a=nope", false).is_err());
        assert!(MethodSpec::parse("", false).unwrap().params.is_empty());
    }

    #[test]
    fn bind_fills_defaults_and_rejects_surplus() {
        let s = MethodSpec::parse("value, scale=1", true).unwrap();
        let b = s.bind(&ArgBag::new().arg(5)).unwrap();
        assert_eq!(b.get("value"), Some(&json!(5)));
        assert_eq!(b.get("scale"), Some(&json!(1)));

        assert!(s.bind(&ArgBag::new()).is_err());
        assert!(s.bind(&ArgBag::positional([1, 2, 3])).is_err());
        assert!(s.bind(&ArgBag::new().arg(1).kw("value", 2)).is_err());
        assert!(s.bind(&ArgBag::new().arg(1).kw("other", 2)).is_err());
    }

    #[test]
    fn tailor_without_own_signature_routes_everything_to_remainder() {
        let bag = ArgBag::new().arg(1).kw("frozen", true);
        let t = tailor(None, None, &bag);
        assert!(t.intended.is_empty());
        assert_eq!(t.remainder, bag);
    }

    #[test]
    fn tailor_partitions_and_leaves_input_untouched() {
        let intended = MethodSpec::parse("value, label=\"\"", true).unwrap();
        let policy = MethodSpec::parse("frozen=false", false).unwrap();
        let bag = ArgBag::new().arg(5).kw("label", "a").kw("frozen", true);
        let before = bag.clone();

        let t = tailor(Some(&intended), Some(&policy), &bag);

        assert_eq!(bag, before);
        assert_eq!(t.intended, ArgBag::new().arg(5).kw("label", "a"));
        assert_eq!(t.remainder, ArgBag::new().kw("frozen", true));
        assert_eq!(t.intended.len() + t.remainder.len(), bag.len());
    }

    #[test]
    fn tailor_var_keyword_does_not_swallow_policy_arguments() {
        let intended = MethodSpec::parse("**opts", true).unwrap();
        let policy = MethodSpec::parse("locks=[]", false).unwrap();
        let bag = ArgBag::new().kw("color", "red").kw("locks", json!(["k"]));

        let t = tailor(Some(&intended), Some(&policy), &bag);

        assert_eq!(t.intended, ArgBag::new().kw("color", "red"));
        assert_eq!(t.remainder, ArgBag::new().kw("locks", json!(["k"])));
    }

    #[test]
    fn tailor_surplus_positional_goes_to_remainder() {
        let intended = MethodSpec::parse("a", true).unwrap();
        let t = tailor(Some(&intended), None, &ArgBag::positional([1, 2]));
        assert_eq!(t.intended.positional, vec![json!(1)]);
        assert_eq!(t.remainder.positional, vec![json!(2)]);
    }

    #[test]
    fn cache_parses_once_per_callable() {
        let cache = SignatureCache::new();
        let id = CallableId::new("Box", "set").in_definition(1);
        let a = cache.resolve(&id, "value", true).unwrap();
        let b = cache.resolve(&id, "value", true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn same_named_callables_of_distinct_definitions_get_distinct_specs() {
        let cache = SignatureCache::new();
        let first = cache.resolve(&CallableId::new("Box", "__init__").in_definition(1), "v", true).unwrap();
        let second = cache.resolve(&CallableId::new("Box", "__init__").in_definition(2), "a, b", true).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.param_names().collect::<Vec<_>>(), vec!["v"]);
        assert_eq!(second.param_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn merge_rejects_conflicting_policy_parameters() {
        let a = MethodSpec::parse("frozen=false", false).unwrap();
        let b = MethodSpec::parse("locks=[]", false).unwrap();
        let merged = MethodSpec::merge([&a, &b]).unwrap();
        assert!(merged.declares("frozen") && merged.declares("locks"));
        assert!(MethodSpec::merge([&a, &a]).is_err());
    }
}
