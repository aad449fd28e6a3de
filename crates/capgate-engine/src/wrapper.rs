//! Wrapper Factory: compiles (class x policy layers) into a wrapped type.
//!
//! A wrapped type is an explicit delegation table. Each visible member of the
//! class gets one slot holding the member, its parsed method spec and the
//! indices of the layers that gate it. Construction tailors the argument bag
//! between the class constructor and the merged policy parameters.
//!
//! Wrapped types are cached in a `Registry` by class identity plus the ordered
//! layer fingerprints, so decorating the same class the same way twice yields
//! the same `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use capgate_core::error::{CapError, Result};
use capgate_core::{tailor, ArgBag, BoundArgs, CallableId, MethodSpec};

use crate::class::{ClassDef, Member, MemberKind};
use crate::instance::Instance;
use crate::policy::{FreezePolicy, FriendPolicy, LockPolicy, Policy, PolicyState, Transition};
use crate::registry::{AnyWrapped, Registry, WrappedKey};
use crate::view::ViewType;

/// One member of a wrapped type.
pub(crate) struct Slot<T> {
    pub(crate) member: Member<T>,
    /// Parsed signature; methods only.
    pub(crate) spec: Option<Arc<MethodSpec>>,
    /// Indices into `layers` of the policies gating this member.
    pub(crate) gates: Vec<usize>,
}

/// A class plus its policy layers, compiled.
pub struct WrappedType<T> {
    class: Arc<ClassDef<T>>,
    layers: Vec<Arc<dyn Policy>>,
    real_name: String,
    table: BTreeMap<String, Slot<T>>,
    ctor_spec: Option<Arc<MethodSpec>>,
    policy_spec: MethodSpec,
    layer_specs: Vec<Arc<MethodSpec>>,
    view_type: Arc<ViewType>,
}

impl<T> fmt::Debug for WrappedType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedType")
            .field("real_name", &self.real_name)
            .field("layers", &self.layers)
            .field("members", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: Send + Sync + 'static> WrappedType<T> {
    pub fn class(&self) -> &Arc<ClassDef<T>> {
        &self.class
    }

    /// Name of the original class; wrapped objects present themselves under it.
    pub fn name(&self) -> &str {
        self.class.name()
    }

    pub fn qualname(&self) -> &str {
        self.class.qualname()
    }

    /// Distinguishing name with one tag per layer, e.g. `Box@freezable@lockable`.
    pub fn real_name(&self) -> &str {
        &self.real_name
    }

    pub fn layers(&self) -> &[Arc<dyn Policy>] {
        &self.layers
    }

    pub fn view_type(&self) -> &Arc<ViewType> {
        &self.view_type
    }

    /// Members gated by at least one layer.
    pub fn gated(&self) -> BTreeSet<&str> {
        self.table.iter().filter(|(_, s)| !s.gates.is_empty()).map(|(n, _)| n.as_str()).collect()
    }

    pub(crate) fn slot(&self, name: &str) -> Option<&Slot<T>> {
        self.table.get(name)
    }

    /// Index of the layer handling `op`.
    pub(crate) fn layer_for(&self, op: &Transition) -> Option<usize> {
        self.layers.iter().position(|l| l.handles(op))
    }

    /// Construct an instance. Arguments the class constructor does not
    /// declare are routed to the policies.
    pub fn construct(self: &Arc<Self>, args: ArgBag) -> Result<Instance<T>> {
        let ctor = self.class.constructor().ok_or_else(|| {
            CapError::Internal(format!("`{}` lost its constructor", self.class.qualname()))
        })?;

        let parts = tailor(self.ctor_spec.as_deref(), Some(&self.policy_spec), &args);
        // Policy parameters are keyword-only.
        if !parts.remainder.positional.is_empty() {
            return Err(CapError::Argument(format!(
                "`{}` takes {} positional arguments but {} were given",
                self.class.qualname(),
                parts.intended.positional.len(),
                args.positional.len()
            )));
        }
        let bound = match &self.ctor_spec {
            Some(spec) => spec.bind(&parts.intended)?,
            None => BoundArgs::default(),
        };
        // Validates the policy share as a whole before any state is built.
        self.policy_spec.bind(&parts.remainder)?;

        let mut states = Vec::with_capacity(self.layers.len());
        for (layer, spec) in self.layers.iter().zip(&self.layer_specs) {
            let mut own = ArgBag::new();
            for (k, v) in &parts.remainder.keyword {
                if spec.declares(k) {
                    own.keyword.insert(k.clone(), v.clone());
                }
            }
            states.push(layer.construct(&spec.bind(&own)?, self.class.id())?);
        }

        let data = (ctor.build)(&bound)?;
        let instance = Instance::new(Arc::clone(self), data, states);

        // Frozen at construction propagates like an explicit freeze.
        if let Some(i) = self.layer_for(&Transition::Freeze) {
            if self.layers[i].cascades() {
                if let Some(PolicyState::Frozen(true)) = instance.state_of(i)? {
                    instance.cascade(true)?;
                }
            }
        }
        Ok(instance)
    }

    /// Start a new decoration with this type's layers plus `policy`.
    pub fn with_policy(&self, policy: impl Policy) -> Decoration<T> {
        Decoration { class: Arc::clone(&self.class), layers: self.layers.clone() }.layer(policy)
    }
}

/// Builder for a wrapped type.
pub struct Decoration<T> {
    class: Arc<ClassDef<T>>,
    layers: Vec<Arc<dyn Policy>>,
}

impl<T: Send + Sync + 'static> Decoration<T> {
    pub fn of(class: &Arc<ClassDef<T>>) -> Self {
        Self { class: Arc::clone(class), layers: Vec::new() }
    }

    /// Add a policy layer. Layers are checked in the order added.
    pub fn layer(self, policy: impl Policy) -> Self {
        self.layer_arc(Arc::new(policy))
    }

    pub fn layer_arc(mut self, policy: Arc<dyn Policy>) -> Self {
        self.layers.push(policy);
        self
    }

    /// Compile (or fetch) the wrapped type in the process-wide registry.
    pub fn apply(self) -> Result<Arc<WrappedType<T>>> {
        self.apply_in(Registry::global())
    }

    pub fn apply_in(self, registry: &Registry) -> Result<Arc<WrappedType<T>>> {
        self.validate()?;

        let key = WrappedKey {
            class: Arc::as_ptr(&self.class) as usize,
            layers: self.layers.iter().map(|l| l.fingerprint()).collect(),
        };
        let qualname = self.class.qualname().to_string();
        let any = registry.wrapped(key, || {
            let compiled: AnyWrapped = Arc::new(self.compile(registry)?);
            Ok(compiled)
        })?;
        any.downcast::<WrappedType<T>>().map_err(|_| {
            CapError::Internal(format!("wrapped type cache holds a foreign type for `{qualname}`"))
        })
    }

    fn validate(&self) -> Result<()> {
        let class = self.class.qualname();
        if self.layers.is_empty() {
            return Err(CapError::Configuration(format!("`{class}` is decorated without any policy")));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if self.layers[..i].iter().any(|l| l.kind() == layer.kind()) {
                return Err(CapError::Configuration(format!(
                    "`{class}` is decorated with `{}` more than once",
                    layer.kind()
                )));
            }
            if let Some(m) = layer.gated().iter().find(|m| self.class.member(m).is_none()) {
                return Err(CapError::Configuration(format!(
                    "`{m}` is gated by `{}` but `{class}` has no such member",
                    layer.kind()
                )));
            }
        }
        Ok(())
    }

    fn compile(&self, registry: &Registry) -> Result<WrappedType<T>> {
        let class = &self.class;
        let sigs = registry.signatures();

        let ctor_spec = match class.constructor() {
            Some(c) => c.signature.as_deref().map(|s| sigs.resolve(&c.callable, s, true)).transpose()?,
            None => None,
        };

        let layer_specs = self
            .layers
            .iter()
            .map(|l| {
                let id = CallableId::new(l.fingerprint(), "__construct__");
                sigs.resolve(&id, &l.construct_signature(), false)
            })
            .collect::<Result<Vec<_>>>()?;
        let policy_spec = MethodSpec::merge(layer_specs.iter().map(|s| s.as_ref()))?;

        let mut table = BTreeMap::new();
        for (name, member) in class.members() {
            let spec = match &member.kind {
                MemberKind::Method { signature, .. } => {
                    Some(sigs.resolve(member.callable(), signature, true)?)
                }
                MemberKind::Attribute { .. } => None,
            };
            let gates = self
                .layers
                .iter()
                .enumerate()
                .filter(|(_, l)| l.gates(name))
                .map(|(i, _)| i)
                .collect();
            table.insert(name.to_string(), Slot { member: member.clone(), spec, gates });
        }

        let class_addr = Arc::as_ptr(class) as usize;
        let views: Vec<Arc<ViewType>> = self
            .layers
            .iter()
            .map(|l| {
                let id = format!("{class_addr:x}/{}", l.fingerprint());
                registry.view_type(id, |id| ViewType::for_layer(id, class, l.as_ref()))
            })
            .collect();
        let view_type = match views.as_slice() {
            [single] => Arc::clone(single),
            many => registry.merged_view(many),
        };

        let tags: Vec<&str> = self.layers.iter().map(|l| l.kind().tag()).collect();
        let real_name = format!("{}@{}", class.name(), tags.join("@"));
        tracing::debug!(
            wrapped = %real_name,
            members = table.len(),
            policy_params = policy_spec.params.len(),
            "wrapped type compiled"
        );

        Ok(WrappedType {
            class: Arc::clone(class),
            layers: self.layers.clone(),
            real_name,
            table,
            ctor_spec,
            policy_spec,
            layer_specs,
            view_type,
        })
    }
}

/// Decorate `class` with a freeze policy.
pub fn freezable<T: Send + Sync + 'static>(
    class: &Arc<ClassDef<T>>,
    policy: FreezePolicy,
) -> Result<Arc<WrappedType<T>>> {
    Decoration::of(class).layer(policy).apply()
}

/// Decorate `class` with a lock policy.
pub fn lockable<T: Send + Sync + 'static>(
    class: &Arc<ClassDef<T>>,
    policy: LockPolicy,
) -> Result<Arc<WrappedType<T>>> {
    Decoration::of(class).layer(policy).apply()
}

/// Decorate `class` with a friend-access policy.
pub fn alienatable<T: Send + Sync + 'static>(
    class: &Arc<ClassDef<T>>,
    policy: FriendPolicy,
) -> Result<Arc<WrappedType<T>>> {
    Decoration::of(class).layer(policy).apply()
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate_core::ErrorKind;
    use serde_json::{json, Value};

    use crate::policy::CallerSet;

    #[derive(Debug)]
    struct Cell {
        value: i64,
    }

    fn cell() -> Arc<ClassDef<Cell>> {
        ClassDef::<Cell>::builder("Cell")
            .constructor("value=0", |a| Ok(Cell { value: a.get_as("value")? }))
            .method("get", "", |c: &Cell, _| Ok(json!(c.value)))
            .method_mut("set", "value", |c: &mut Cell, a| {
                c.value = a.get_as("value")?;
                Ok(Value::Null)
            })
            .build()
            .unwrap()
    }

    fn locks() -> LockPolicy {
        LockPolicy::builder().key("k", CallerSet::anyone()).method_global("set").build().unwrap()
    }

    #[test]
    fn same_decoration_is_cached() {
        let reg = Registry::new();
        let class = cell();
        let a = Decoration::of(&class).layer(FreezePolicy::builder().method("set").build()).apply_in(&reg).unwrap();
        let b = Decoration::of(&class).layer(FreezePolicy::builder().method("set").build()).apply_in(&reg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = Decoration::of(&class).layer(FreezePolicy::builder().method("get").build()).apply_in(&reg).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(reg.stats().wrapped, 2);
    }

    #[test]
    fn stacked_layers_are_tagged_in_order() {
        let reg = Registry::new();
        let class = cell();
        let ty = Decoration::of(&class)
            .layer(FreezePolicy::builder().method("set").build())
            .layer(locks())
            .apply_in(&reg)
            .unwrap();
        assert_eq!(ty.real_name(), "Cell@freezable@lockable");
        assert_eq!(ty.name(), "Cell");
        assert_eq!(ty.slot("set").unwrap().gates, vec![0, 1]);
        assert!(ty.slot("get").unwrap().gates.is_empty());
        assert_eq!(ty.view_type().real_name(), "Cell.View<freezable+lockable>");
    }

    #[test]
    fn constructor_arguments_are_tailored() {
        let reg = Registry::new();
        let class = cell();
        let ty = Decoration::of(&class)
            .layer(FreezePolicy::builder().method("set").build())
            .layer(locks())
            .apply_in(&reg)
            .unwrap();

        let inst = ty
            .construct(ArgBag::positional([5]).kw("frozen", true).kw("locks", json!(["k"])))
            .unwrap();
        assert_eq!(inst.call("get", ArgBag::new()).unwrap(), json!(5));
        assert!(inst.frozen().unwrap());
        assert!(inst.locked("k").unwrap());

        let err = ty.construct(ArgBag::positional([1, 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        let err = ty.construct(ArgBag::new().kw("colour", "red")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn decoration_errors() {
        let reg = Registry::new();
        let class = cell();
        let missing = Decoration::of(&class)
            .layer(FreezePolicy::builder().method("reset").build())
            .apply_in(&reg)
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Configuration);

        let twice = Decoration::of(&class)
            .layer(FreezePolicy::builder().build())
            .layer(FreezePolicy::builder().frozen(true).build())
            .apply_in(&reg)
            .unwrap_err();
        assert_eq!(twice.kind(), ErrorKind::Configuration);

        let bare = Decoration::of(&class).apply_in(&reg).unwrap_err();
        assert_eq!(bare.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn with_policy_stacks_on_an_existing_type() {
        let reg = Registry::new();
        let class = cell();
        let frozen = Decoration::of(&class)
            .layer(FreezePolicy::builder().method("set").build())
            .apply_in(&reg)
            .unwrap();
        let both = frozen.with_policy(locks()).apply_in(&reg).unwrap();
        assert_eq!(both.layers().len(), 2);
        assert_eq!(both.gated().into_iter().collect::<Vec<_>>(), vec!["set"]);
    }
}
