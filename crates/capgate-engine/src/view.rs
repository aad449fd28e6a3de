//! Views: read-restricted proxies over a wrapper instance.
//!
//! A `ViewType` is an explicit delegation table built from Member
//! Enumeration: every member either forwards to the instance or is blocked
//! with a policy error. View types are cached per (class, policy) and merged
//! view types per exact ordered combination of inputs.
//!
//! A `View` holds a weak back-reference; it never keeps the instance alive
//! and carries no state of its own.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Serialize, Serializer};
use serde_json::Value;

use capgate_core::error::{CapError, ErrorKind, Result};
use capgate_core::{ArgBag, ClassId};

use crate::class::ClassDef;
use crate::instance::{Instance, Shared};
use crate::policy::{Policy, PolicyKind, Transition};

/// Operations a view refuses unconditionally.
pub const TRANSITIONS: &[&str] = &["freeze", "melt", "lock", "unlock"];

/// What a view does with one member.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Forward,
    Block { policy: PolicyKind, kind: ErrorKind, message: String },
}

/// Compiled delegation table of a view.
#[derive(Debug)]
pub struct ViewType {
    id: String,
    name: String,
    real_name: String,
    tags: Vec<&'static str>,
    routes: BTreeMap<String, Route>,
}

impl ViewType {
    /// Name used in error texts, e.g. `Box.View`.
    pub fn view_name(qualname: &str) -> String {
        format!("{qualname}.View")
    }

    /// Table for one policy layer over `class`.
    pub(crate) fn for_layer<T>(id: String, class: &ClassDef<T>, layer: &dyn Policy) -> Self {
        let name = Self::view_name(class.qualname());
        let blocked = layer.view_blocked();
        let routes = class
            .members()
            .map(|(member, _)| {
                let route = if blocked.contains(member) {
                    let (kind, message) = layer.view_denial(member, &name, class.name());
                    Route::Block { policy: layer.kind(), kind, message }
                } else {
                    Route::Forward
                };
                (member.to_string(), route)
            })
            .collect();
        let tags = vec![layer.kind().tag()];
        let real_name = format!("{name}<{}>", tags.join("+"));
        tracing::debug!(view = %real_name, blocked = blocked.len(), "view type compiled");
        Self { id, name, real_name, tags, routes }
    }

    /// Union of several view types over the same class. A member blocked by
    /// any input is blocked; the first blocking input supplies the error.
    pub(crate) fn merge(parts: &[Arc<ViewType>]) -> Self {
        let mut routes: BTreeMap<String, Route> = BTreeMap::new();
        for part in parts {
            for (member, route) in &part.routes {
                let slot = routes.entry(member.clone()).or_insert(Route::Forward);
                if *slot == Route::Forward {
                    *slot = route.clone();
                }
            }
        }

        let name = parts.first().map(|p| p.name.clone()).unwrap_or_default();
        let tags: Vec<&'static str> = parts.iter().flat_map(|p| p.tags.iter().copied()).collect();
        let real_name = format!("{name}<{}>", tags.join("+"));
        let id = parts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>().join("+");
        tracing::debug!(view = %real_name, inputs = parts.len(), "merged view type compiled");
        Self { id, name, real_name, tags, routes }
    }

    /// Policy tags, in layer order.
    pub fn tags(&self) -> &[&'static str] {
        &self.tags
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name including the policy tags, e.g. `Box.View<freezable+lockable>`.
    pub fn real_name(&self) -> &str {
        &self.real_name
    }

    pub fn route(&self, member: &str) -> Option<&Route> {
        self.routes.get(member)
    }

    /// Members this view refuses.
    pub fn blocked(&self) -> BTreeSet<&str> {
        self.routes
            .iter()
            .filter(|(_, r)| matches!(r, Route::Block { .. }))
            .map(|(m, _)| m.as_str())
            .collect()
    }

    fn transition_error(&self, op: &str) -> CapError {
        CapError::View(format!("`{op}` method is not callable on `{}` view objects.", self.name))
    }
}

/// A read-restricted proxy over a wrapper instance.
pub struct View<T> {
    ty: Arc<ViewType>,
    target: Weak<Shared<T>>,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        Self { ty: Arc::clone(&self.ty), target: Weak::clone(&self.target) }
    }
}

impl<T: Send + Sync + 'static> View<T> {
    pub(crate) fn new(ty: Arc<ViewType>, target: Weak<Shared<T>>) -> Self {
        Self { ty, target }
    }

    fn target(&self) -> Result<Arc<Shared<T>>> {
        self.target.upgrade().ok_or_else(|| {
            CapError::Detached(format!("`{}` object behind this view has been dropped", self.ty.name))
        })
    }

    // Blocked members never reach the instance; the class hook may only reword.
    fn gate(&self, target: &Shared<T>, member: &str, caller: Option<&ClassId>) -> Result<()> {
        if TRANSITIONS.contains(&member) {
            return Err(self.ty.transition_error(member));
        }
        match self.ty.route(member) {
            Some(Route::Block { policy, kind, message }) => {
                target.refuse_in_view(*policy, *kind, member, caller, message.clone())
            }
            _ => Ok(()),
        }
    }

    pub fn view_type(&self) -> &Arc<ViewType> {
        &self.ty
    }

    pub fn type_name(&self) -> &str {
        self.ty.real_name()
    }

    pub fn blocked(&self) -> BTreeSet<&str> {
        self.ty.blocked()
    }

    pub fn call(&self, name: &str, args: ArgBag) -> Result<Value> {
        self.call_inner(None, name, args)
    }

    pub fn call_as(&self, caller: &ClassId, name: &str, args: ArgBag) -> Result<Value> {
        self.call_inner(Some(caller), name, args)
    }

    fn call_inner(&self, caller: Option<&ClassId>, name: &str, args: ArgBag) -> Result<Value> {
        let target = self.target()?;
        self.gate(&target, name, caller)?;
        target.invoke(caller, name, &args)
    }

    pub fn get_attr(&self, name: &str) -> Result<Value> {
        self.get_inner(None, name)
    }

    pub fn get_attr_as(&self, caller: &ClassId, name: &str) -> Result<Value> {
        self.get_inner(Some(caller), name)
    }

    fn get_inner(&self, caller: Option<&ClassId>, name: &str) -> Result<Value> {
        let target = self.target()?;
        self.gate(&target, name, caller)?;
        target.read_attr(caller, name)
    }

    pub fn set_attr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_inner(None, name, value.into())
    }

    pub fn set_attr_as(&self, caller: &ClassId, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_inner(Some(caller), name, value.into())
    }

    fn set_inner(&self, caller: Option<&ClassId>, name: &str, value: Value) -> Result<()> {
        let target = self.target()?;
        self.gate(&target, name, caller)?;
        target.write_attr(caller, name, value)
    }

    /// Always fails: views cannot change policy state.
    pub fn freeze(&self) -> Result<()> {
        Err(self.ty.transition_error(Transition::Freeze.name()))
    }

    pub fn melt(&self) -> Result<()> {
        Err(self.ty.transition_error(Transition::Melt.name()))
    }

    pub fn lock(&self, _key: &str) -> Result<()> {
        Err(self.ty.transition_error("lock"))
    }

    pub fn unlock(&self, _key: &str) -> Result<()> {
        Err(self.ty.transition_error("unlock"))
    }

    /// Frozen state of the underlying instance.
    pub fn frozen(&self) -> Result<bool> {
        self.target()?.frozen()
    }

    pub fn locked(&self, key: &str) -> Result<bool> {
        self.target()?.locked(key)
    }

    /// A view of a view is the same view.
    pub fn view(&self) -> View<T> {
        self.clone()
    }

    pub fn is_view_of(&self, instance: &Instance<T>) -> bool {
        instance.is_target_of(&self.target)
    }

    /// Same underlying instance.
    pub fn same_target(&self, other: &View<T>) -> bool {
        Weak::ptr_eq(&self.target, &other.target)
    }
}

impl<T: Clone + Send + Sync + 'static> View<T> {
    /// Copy the underlying instance and view the copy. The copy is returned
    /// too; the new view does not keep it alive.
    pub fn copy(&self) -> Result<(Instance<T>, View<T>)> {
        let copy = Instance::from_shared(self.target()?.duplicate()?);
        let view = copy.view();
        Ok((copy, view))
    }
}

impl<T: PartialEq + Send + Sync + 'static> PartialEq<Instance<T>> for View<T> {
    fn eq(&self, other: &Instance<T>) -> bool {
        match self.target() {
            Ok(t) => t.data_eq(other.shared()),
            Err(_) => false,
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> PartialEq for View<T> {
    fn eq(&self, other: &View<T>) -> bool {
        match (self.target(), other.target()) {
            (Ok(a), Ok(b)) => a.data_eq(&b),
            _ => false,
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Ok(t) => t.debug_as(self.ty.real_name(), f),
            Err(_) => write!(f, "{} (detached)", self.ty.real_name()),
        }
    }
}

impl<T: Serialize + Send + Sync + 'static> Serialize for View<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let target = self.target().map_err(serde::ser::Error::custom)?;
        target.serialize_data(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::policy::{CallerSet, FreezePolicy, LockPolicy};
    use crate::registry::Registry;
    use crate::wrapper::Decoration;

    #[derive(Debug, Clone, PartialEq)]
    struct Stack {
        items: Vec<i64>,
    }

    fn stack_type(reg: &Registry) -> Arc<crate::wrapper::WrappedType<Stack>> {
        let class = ClassDef::<Stack>::builder("Stack")
            .constructor("*items", |a| {
                let items = a.rest().iter().filter_map(Value::as_i64).collect();
                Ok(Stack { items })
            })
            .method_mut("push", "item", |s: &mut Stack, a| {
                s.items.push(a.get_as("item")?);
                Ok(Value::Null)
            })
            .method_mut("clear", "", |s: &mut Stack, _| {
                s.items.clear();
                Ok(Value::Null)
            })
            .method("peek", "", |s: &Stack, _| Ok(json!(s.items.last())))
            .method("__len__", "", |s: &Stack, _| Ok(json!(s.items.len())))
            .build()
            .unwrap();
        Decoration::of(&class)
            .layer(FreezePolicy::builder().method("push").build())
            .layer(LockPolicy::builder().key("k", CallerSet::anyone()).method_global("clear").build().unwrap())
            .apply_in(reg)
            .unwrap()
    }

    #[test]
    fn blocked_members_fail_and_the_rest_forward() {
        let reg = Registry::new();
        let stack = stack_type(&reg).construct(ArgBag::positional([1, 2])).unwrap();
        let v = stack.view();

        assert_eq!(v.blocked().into_iter().collect::<Vec<_>>(), vec!["clear", "push"]);
        let err = v.call("push", ArgBag::positional([3])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Frozen);
        let err = v.call("clear", ArgBag::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
        assert_eq!(err.to_string(), "`clear` method is not callable on `Stack.View` view objects.");

        assert_eq!(v.call("peek", ArgBag::new()).unwrap(), json!(2));
        assert_eq!(v.call("__len__", ArgBag::new()).unwrap(), json!(2));
        // Nothing reached the instance.
        assert_eq!(stack.call("__len__", ArgBag::new()).unwrap(), json!(2));
        assert!(!stack.frozen().unwrap());
    }

    #[test]
    fn view_of_view_is_the_same_view() {
        let reg = Registry::new();
        let stack = stack_type(&reg).construct(ArgBag::new()).unwrap();
        let v = stack.view();
        let vv = v.view();
        assert!(Arc::ptr_eq(v.view_type(), vv.view_type()));
        assert!(v.same_target(&vv));
        assert!(vv.is_view_of(&stack));
        assert_eq!(vv.type_name(), "Stack.View<freezable+lockable>");
        assert!(Arc::ptr_eq(stack.view().view_type(), v.view_type()));
    }

    #[test]
    fn transitions_on_views_always_fail() {
        let reg = Registry::new();
        let stack = stack_type(&reg).construct(ArgBag::new()).unwrap();
        let v = stack.view();
        for err in [v.freeze(), v.melt(), v.lock("k"), v.unlock("k")] {
            assert_eq!(err.unwrap_err().kind(), ErrorKind::View);
        }
        let err = v.call("freeze", ArgBag::new()).unwrap_err();
        assert_eq!(err.to_string(), "`freeze` method is not callable on `Stack.View` view objects.");
        assert!(!v.frozen().unwrap());
        assert!(!v.locked("k").unwrap());
    }

    #[test]
    fn dropped_instance_detaches_views() {
        let reg = Registry::new();
        let stack = stack_type(&reg).construct(ArgBag::positional([7])).unwrap();
        let v = stack.view();
        assert!(v == stack);
        drop(stack);
        let err = v.call("peek", ArgBag::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Detached);
        assert!(format!("{v:?}").contains("detached"));
    }

    #[test]
    fn copying_a_view_copies_the_instance() {
        let reg = Registry::new();
        let stack = stack_type(&reg).construct(ArgBag::positional([1])).unwrap();
        stack.freeze().unwrap();
        let (copy, cv) = stack.view().copy().unwrap();
        assert!(cv.is_view_of(&copy));
        assert!(!cv.is_view_of(&stack));
        assert!(copy.frozen().unwrap());

        copy.melt().unwrap();
        copy.call("push", ArgBag::positional([2])).unwrap();
        assert_eq!(cv.call("peek", ArgBag::new()).unwrap(), json!(2));
        assert_eq!(stack.call("peek", ArgBag::new()).unwrap(), json!(1));
    }
}
