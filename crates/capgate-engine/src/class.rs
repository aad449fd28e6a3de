//! Class definitions: the "original class" a policy decorates.
//!
//! A class is data of type `T` plus an explicit member table (methods and
//! attributes with declared signatures) and a constructor. Members may be
//! inherited from a base class of the same data type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use capgate_core::error::{CapError, Result};
use capgate_core::{BoundArgs, CallableId, ClassId};

use crate::members::{Members, Mro};
use crate::policy::freeze::Freezable;
use crate::policy::{Denial, Verdict};

/// Engine operations available on every wrapper; classes may not shadow them.
pub const RESERVED: &[&str] = &["freeze", "melt", "frozen", "lock", "unlock", "locked", "view", "copy"];

// Token 0 is left to ad-hoc `CallableId::new` callers.
static NEXT_DEFINITION: AtomicU64 = AtomicU64::new(1);

type SharedFn<T> = Arc<dyn Fn(&T, &BoundArgs) -> Result<Value> + Send + Sync>;
type ExclusiveFn<T> = Arc<dyn Fn(&mut T, &BoundArgs) -> Result<Value> + Send + Sync>;
type GetFn<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
type SetFn<T> = Arc<dyn Fn(&mut T, Value) -> Result<()> + Send + Sync>;
type BuildFn<T> = Arc<dyn Fn(&BoundArgs) -> Result<T> + Send + Sync>;
type DeniedFn = Arc<dyn Fn(&Denial) -> Verdict + Send + Sync>;

/// Owned decorated children reachable for transitive freezing.
pub type OwnedFn<T> = for<'a> fn(&'a T) -> Vec<&'a dyn Freezable>;

/// Method body, by receiver kind.
pub enum Handler<T> {
    Shared(SharedFn<T>),
    Exclusive(ExclusiveFn<T>),
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Handler::Shared(f) => Handler::Shared(Arc::clone(f)),
            Handler::Exclusive(f) => Handler::Exclusive(Arc::clone(f)),
        }
    }
}

pub enum MemberKind<T> {
    Method { signature: String, handler: Handler<T> },
    Attribute { get: GetFn<T>, set: Option<SetFn<T>> },
}

impl<T> Clone for MemberKind<T> {
    fn clone(&self) -> Self {
        match self {
            MemberKind::Method { signature, handler } => {
                MemberKind::Method { signature: signature.clone(), handler: handler.clone() }
            }
            MemberKind::Attribute { get, set } => {
                MemberKind::Attribute { get: Arc::clone(get), set: set.clone() }
            }
        }
    }
}

/// One entry of a class's member table.
pub struct Member<T> {
    pub(crate) name: String,
    pub(crate) callable: CallableId,
    pub(crate) kind: MemberKind<T>,
}

impl<T> Clone for Member<T> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), callable: self.callable.clone(), kind: self.kind.clone() }
    }
}

impl<T> Member<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callable(&self) -> &CallableId {
        &self.callable
    }

    pub fn is_method(&self) -> bool {
        matches!(self.kind, MemberKind::Method { .. })
    }

    /// Dunder-style special operation (`__eq__`, `__len__`, ...).
    pub fn is_special(&self) -> bool {
        self.name.len() > 4 && self.name.starts_with("__") && self.name.ends_with("__")
    }
}

impl<T> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_method() { "method" } else { "attribute" };
        f.debug_struct("Member").field("name", &self.name).field("kind", &kind).finish()
    }
}

pub(crate) struct Constructor<T> {
    pub(crate) callable: CallableId,
    /// `None`: no parameter list of its own.
    pub(crate) signature: Option<String>,
    pub(crate) build: BuildFn<T>,
}

/// A class definition.
pub struct ClassDef<T> {
    id: ClassId,
    qualname: String,
    base: Option<Arc<ClassDef<T>>>,
    constructor: Option<Constructor<T>>,
    members: Vec<Member<T>>,
    on_denied: Option<DeniedFn>,
    owned: Option<OwnedFn<T>>,
}

impl<T> fmt::Debug for ClassDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("qualname", &self.qualname)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> ClassDef<T> {
    pub fn builder(name: impl Into<String>) -> ClassBuilder<T> {
        let name = name.into();
        ClassBuilder {
            id: ClassId::new(name.clone()),
            qualname: name,
            base: None,
            constructor: None,
            members: Vec::new(),
            on_denied: None,
            owned: None,
        }
    }
}

impl<T> ClassDef<T> {
    pub fn id(&self) -> &ClassId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    /// Qualified name used for introspection, copy and serialization.
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn base(&self) -> Option<&Arc<ClassDef<T>>> {
        self.base.as_ref()
    }

    /// Members declared directly on this class.
    pub fn own_members(&self) -> &[Member<T>] {
        &self.members
    }

    /// This class followed by its bases.
    pub fn mro(&self) -> Mro<'_, T> {
        Mro::new(self)
    }

    /// Lazily enumerate every visible member, overrides first.
    pub fn members(&self) -> Members<'_, T> {
        Members::new(self)
    }

    /// Resolve a member through the inheritance chain.
    pub fn member(&self, name: &str) -> Option<&Member<T>> {
        self.mro().find_map(|c| c.members.iter().find(|m| m.name == name))
    }

    pub(crate) fn constructor(&self) -> Option<&Constructor<T>> {
        self.mro().find_map(|c| c.constructor.as_ref())
    }

    pub(crate) fn on_denied(&self) -> Option<&DeniedFn> {
        self.mro().find_map(|c| c.on_denied.as_ref())
    }

    pub(crate) fn owned(&self) -> Option<OwnedFn<T>> {
        self.mro().find_map(|c| c.owned)
    }
}

pub struct ClassBuilder<T> {
    id: ClassId,
    qualname: String,
    base: Option<Arc<ClassDef<T>>>,
    constructor: Option<Constructor<T>>,
    members: Vec<Member<T>>,
    on_denied: Option<DeniedFn>,
    owned: Option<OwnedFn<T>>,
}

impl<T: Send + Sync + 'static> ClassBuilder<T> {
    /// Qualified name, e.g. `shapes.Box`. Defaults to the plain name.
    pub fn qualname(mut self, qualname: impl Into<String>) -> Self {
        self.qualname = qualname.into();
        self
    }

    /// Inherit members, constructor and hooks from `base`.
    pub fn extends(mut self, base: &Arc<ClassDef<T>>) -> Self {
        self.id = base.id().subclass(self.id.name().to_string());
        self.base = Some(Arc::clone(base));
        self
    }

    /// Constructor with an explicit parameter list.
    pub fn constructor<F>(mut self, signature: &str, build: F) -> Self
    where
        F: Fn(&BoundArgs) -> Result<T> + Send + Sync + 'static,
    {
        self.constructor = Some(Constructor {
            callable: CallableId::new(self.qualname.clone(), "__init__"),
            signature: Some(signature.to_string()),
            build: Arc::new(build),
        });
        self
    }

    pub fn method<F>(self, name: &str, signature: &str, f: F) -> Self
    where
        F: Fn(&T, &BoundArgs) -> Result<Value> + Send + Sync + 'static,
    {
        self.push(name, MemberKind::Method {
            signature: signature.to_string(),
            handler: Handler::Shared(Arc::new(f)),
        })
    }

    pub fn method_mut<F>(self, name: &str, signature: &str, f: F) -> Self
    where
        F: Fn(&mut T, &BoundArgs) -> Result<Value> + Send + Sync + 'static,
    {
        self.push(name, MemberKind::Method {
            signature: signature.to_string(),
            handler: Handler::Exclusive(Arc::new(f)),
        })
    }

    /// Read-only attribute.
    pub fn attribute<G>(self, name: &str, get: G) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.push(name, MemberKind::Attribute { get: Arc::new(get), set: None })
    }

    /// Read-write attribute.
    pub fn attribute_mut<G, S>(self, name: &str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.push(name, MemberKind::Attribute { get: Arc::new(get), set: Some(Arc::new(set)) })
    }

    /// Custom reporting for denied access. The hook sees the denial and may
    /// replace its message or permit the access.
    pub fn on_denied<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Denial) -> Verdict + Send + Sync + 'static,
    {
        self.on_denied = Some(Arc::new(hook));
        self
    }

    /// Declare owned decorated children for transitive freezing.
    pub fn owns(mut self, owned: OwnedFn<T>) -> Self {
        self.owned = Some(owned);
        self
    }

    fn push(mut self, name: &str, kind: MemberKind<T>) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            callable: CallableId::new(self.qualname.clone(), name),
            kind,
        });
        self
    }

    pub fn build(mut self) -> Result<Arc<ClassDef<T>>> {
        // Callable identity follows the final qualified name and this definition.
        let definition = NEXT_DEFINITION.fetch_add(1, Ordering::Relaxed);
        for m in &mut self.members {
            m.callable = CallableId::new(self.qualname.clone(), m.name.clone()).in_definition(definition);
        }
        if let Some(ctor) = &mut self.constructor {
            ctor.callable = CallableId::new(self.qualname.clone(), "__init__").in_definition(definition);
        }

        for (i, m) in self.members.iter().enumerate() {
            if RESERVED.contains(&m.name.as_str()) {
                return Err(CapError::Configuration(format!(
                    "`{}` cannot define `{}`: the name is reserved for wrapper operations",
                    self.qualname, m.name
                )));
            }
            if self.members[..i].iter().any(|o| o.name == m.name) {
                return Err(CapError::Configuration(format!(
                    "`{}` defines `{}` more than once",
                    self.qualname, m.name
                )));
            }
        }

        let class = ClassDef {
            id: self.id,
            qualname: self.qualname,
            base: self.base,
            constructor: self.constructor,
            members: self.members,
            on_denied: self.on_denied,
            owned: self.owned,
        };
        if class.constructor().is_none() {
            return Err(CapError::Configuration(format!(
                "`{}` has no constructor (declare one, or use `default_constructor`)",
                class.qualname
            )));
        }
        Ok(Arc::new(class))
    }
}

impl<T: Default + Send + Sync + 'static> ClassBuilder<T> {
    /// Construct from `T::default()`; the class has no parameter list of its
    /// own, so every constructor argument is routed to the policies.
    pub fn default_constructor(mut self) -> Self {
        self.constructor = Some(Constructor {
            callable: CallableId::new(self.qualname.clone(), "__init__"),
            signature: None,
            build: Arc::new(|_| Ok(T::default())),
        });
        self
    }
}
