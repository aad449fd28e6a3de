//! Wrapper instances: the decorated object plus its policy state.
//!
//! An instance exclusively owns its data and one state slot per policy
//! layer. Every member access is checked against the gating layers and
//! then delegated, all under the instance's state lock, so a check and
//! the call it guards see the same state.
//!
//! Callers identify themselves explicitly (`*_as` methods). The plain
//! variants act as anonymous module-level code.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Serialize, Serializer};
use serde_json::Value;

use capgate_core::error::{CapError, ErrorKind, Result};
use capgate_core::identity::caller_name;
use capgate_core::{ArgBag, ClassId};

use crate::class::{ClassDef, Handler, MemberKind};
use crate::obs::metrics;
use crate::policy::{Access, AccessMode, Denial, Freezable, PolicyKind, PolicyState, Probe, Transition, Verdict};
use crate::view::View;
use crate::wrapper::{Slot, WrappedType};

pub(crate) struct Shared<T> {
    wrapped: Arc<WrappedType<T>>,
    data: RwLock<T>,
    states: Mutex<Vec<PolicyState>>,
}

impl<T: Send + Sync + 'static> Shared<T> {
    fn class(&self) -> &ClassDef<T> {
        self.wrapped.class()
    }

    fn poisoned(&self, what: &str) -> CapError {
        CapError::Internal(format!("{what} lock of `{}` object is poisoned", self.class().name()))
    }

    fn data(&self) -> Result<RwLockReadGuard<'_, T>> {
        self.data.read().map_err(|_| self.poisoned("data"))
    }

    fn data_mut(&self) -> Result<RwLockWriteGuard<'_, T>> {
        self.data.write().map_err(|_| self.poisoned("data"))
    }

    fn states(&self) -> Result<MutexGuard<'_, Vec<PolicyState>>> {
        self.states.lock().map_err(|_| self.poisoned("state"))
    }

    fn access<'a>(&'a self, member: &'a str, mode: AccessMode, caller: Option<&'a ClassId>) -> Access<'a> {
        let class = self.class();
        Access { member, mode, caller, owner: class.id(), class_name: class.name() }
    }

    fn slot(&self, name: &str) -> Result<&Slot<T>> {
        self.wrapped.slot(name).ok_or_else(|| {
            CapError::NoSuchMember(format!("`{}` object has no member `{name}`", self.class().name()))
        })
    }

    /// Report a denial and let the class hook decide its fate. `may_permit`
    /// is false where the hook may only reword the failure.
    pub(crate) fn resolve(&self, denial: Denial, may_permit: bool) -> Result<()> {
        if denial.kind == ErrorKind::NotImplemented {
            return Err(denial.into_error());
        }
        metrics().record_denial(denial.policy.tag(), &denial.member);
        tracing::debug!(
            policy = %denial.policy,
            member = %denial.member,
            caller = caller_name(denial.caller.as_ref()),
            class = self.class().name(),
            "access denied"
        );

        let Some(hook) = self.class().on_denied() else {
            return Err(denial.into_error());
        };
        match hook(&denial) {
            Verdict::Permit if may_permit => {
                tracing::debug!(member = %denial.member, "denial overridden by class hook");
                Ok(())
            }
            Verdict::Report(message) => Err(CapError::new(denial.kind, message)),
            Verdict::Default | Verdict::Permit => Err(denial.into_error()),
        }
    }

    fn gate(
        &self,
        states: &[PolicyState],
        slot: &Slot<T>,
        name: &str,
        mode: AccessMode,
        caller: Option<&ClassId>,
    ) -> Result<()> {
        let access = self.access(name, mode, caller);
        let layers = self.wrapped.layers();
        for &i in &slot.gates {
            if let Some(denial) = layers[i].check(&states[i], &access) {
                self.resolve(denial, true)?;
            }
        }
        Ok(())
    }

    pub(crate) fn invoke(&self, caller: Option<&ClassId>, name: &str, args: &ArgBag) -> Result<Value> {
        let slot = self.slot(name)?;
        let (MemberKind::Method { handler, .. }, Some(spec)) = (&slot.member.kind, &slot.spec) else {
            return Err(CapError::NoSuchMember(format!(
                "`{}.{name}` is an attribute, not a method",
                self.class().name()
            )));
        };

        let states = self.states()?;
        self.gate(&states, slot, name, AccessMode::Call, caller)?;
        let bound = spec.bind(args)?;
        let out = match handler {
            Handler::Shared(f) => f(&*self.data()?, &bound),
            Handler::Exclusive(f) => f(&mut *self.data_mut()?, &bound),
        };
        drop(states);
        out
    }

    pub(crate) fn read_attr(&self, caller: Option<&ClassId>, name: &str) -> Result<Value> {
        let slot = self.slot(name)?;
        let MemberKind::Attribute { get, .. } = &slot.member.kind else {
            return Err(CapError::NoSuchMember(format!(
                "`{}.{name}` is a method, not an attribute",
                self.class().name()
            )));
        };
        let states = self.states()?;
        self.gate(&states, slot, name, AccessMode::Read, caller)?;
        let value = get(&*self.data()?);
        Ok(value)
    }

    pub(crate) fn write_attr(&self, caller: Option<&ClassId>, name: &str, value: Value) -> Result<()> {
        let slot = self.slot(name)?;
        let MemberKind::Attribute { set: Some(set), .. } = &slot.member.kind else {
            return Err(CapError::NoSuchMember(format!(
                "can't set `{name}` on `{}` objects",
                self.class().name()
            )));
        };
        let states = self.states()?;
        self.gate(&states, slot, name, AccessMode::Write, caller)?;
        let out = set(&mut *self.data_mut()?, value);
        drop(states);
        out
    }

    pub(crate) fn transition(&self, caller: Option<&ClassId>, op: Transition) -> Result<()> {
        let Some(i) = self.wrapped.layer_for(&op) else {
            return Err(CapError::NoSuchMember(format!(
                "`{}` objects have no `{}` method",
                self.class().name(),
                op.name()
            )));
        };
        let layer = &self.wrapped.layers()[i];
        let outcome = {
            let mut states = self.states()?;
            let access = self.access(op.name(), AccessMode::Call, caller);
            layer.transition(&mut states[i], &op, &access)
        };
        if let Err(denial) = outcome {
            return self.resolve(denial, false);
        }
        tracing::debug!(class = self.class().name(), op = op.name(), caller = caller_name(caller), "transition applied");

        match op {
            Transition::Freeze if layer.cascades() => self.cascade(true),
            Transition::Melt if layer.cascades() => self.cascade(false),
            _ => Ok(()),
        }
    }

    pub(crate) fn cascade(&self, frozen: bool) -> Result<()> {
        let Some(owned) = self.class().owned() else {
            return Ok(());
        };
        let data = self.data()?;
        for child in owned(&*data) {
            child.cascade_frozen(frozen)?;
        }
        Ok(())
    }

    fn probe(&self, probe: Probe<'_>) -> Result<bool> {
        let states = self.states()?;
        for (layer, state) in self.wrapped.layers().iter().zip(states.iter()) {
            if let Some(answer) = layer.probe(state, probe) {
                return answer;
            }
        }
        let op = match probe {
            Probe::Frozen => "frozen",
            Probe::Locked(_) => "locked",
        };
        Err(CapError::NoSuchMember(format!("`{}` objects have no `{op}` method", self.class().name())))
    }

    pub(crate) fn frozen(&self) -> Result<bool> {
        self.probe(Probe::Frozen)
    }

    pub(crate) fn locked(&self, key: &str) -> Result<bool> {
        self.probe(Probe::Locked(key))
    }

    /// A view refused `member`; always fails.
    pub(crate) fn refuse_in_view(
        &self,
        policy: PolicyKind,
        kind: ErrorKind,
        member: &str,
        caller: Option<&ClassId>,
        message: String,
    ) -> Result<()> {
        let denial = Denial { kind, policy, member: member.to_string(), caller: caller.cloned(), message };
        self.resolve(denial, false)
    }

    pub(crate) fn debug_as(&self, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        T: fmt::Debug,
    {
        match self.data.read() {
            Ok(data) => f.debug_tuple(name).field(&*data).finish(),
            Err(_) => write!(f, "{name}(<poisoned>)"),
        }
    }

    pub(crate) fn serialize_data<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        T: Serialize,
    {
        let data = self.data.read().map_err(|_| serde::ser::Error::custom("data lock is poisoned"))?;
        data.serialize(serializer)
    }

    pub(crate) fn data_eq(&self, other: &Shared<T>) -> bool
    where
        T: PartialEq,
    {
        if std::ptr::eq(self, other) {
            return true;
        }
        let a = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let b = other.data.read().unwrap_or_else(PoisonError::into_inner);
        *a == *b
    }

    pub(crate) fn duplicate(&self) -> Result<Arc<Shared<T>>>
    where
        T: Clone,
    {
        let states = self.states()?.clone();
        let data = self.data()?.clone();
        Ok(Arc::new(Shared {
            wrapped: Arc::clone(&self.wrapped),
            data: RwLock::new(data),
            states: Mutex::new(states),
        }))
    }
}

/// An instance of a wrapped type.
pub struct Instance<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> Instance<T> {
    pub(crate) fn new(wrapped: Arc<WrappedType<T>>, data: T, states: Vec<PolicyState>) -> Self {
        Self::from_shared(Arc::new(Shared { wrapped, data: RwLock::new(data), states: Mutex::new(states) }))
    }

    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Shared<T> {
        &self.shared
    }

    pub(crate) fn is_target_of(&self, target: &Weak<Shared<T>>) -> bool {
        std::ptr::eq(target.as_ptr(), Arc::as_ptr(&self.shared))
    }

    pub(crate) fn state_of(&self, layer: usize) -> Result<Option<PolicyState>> {
        Ok(self.shared.states()?.get(layer).cloned())
    }

    pub(crate) fn cascade(&self, frozen: bool) -> Result<()> {
        self.shared.cascade(frozen)
    }

    pub fn wrapped_type(&self) -> &Arc<WrappedType<T>> {
        &self.shared.wrapped
    }

    /// Name of the original class.
    pub fn class_name(&self) -> &str {
        self.shared.class().name()
    }

    pub fn qualname(&self) -> &str {
        self.shared.class().qualname()
    }

    /// Name of the wrapped type, one tag per policy layer.
    pub fn real_name(&self) -> &str {
        self.shared.wrapped.real_name()
    }

    pub fn call(&self, name: &str, args: ArgBag) -> Result<Value> {
        self.shared.invoke(None, name, &args)
    }

    pub fn call_as(&self, caller: &ClassId, name: &str, args: ArgBag) -> Result<Value> {
        self.shared.invoke(Some(caller), name, &args)
    }

    pub fn get_attr(&self, name: &str) -> Result<Value> {
        self.shared.read_attr(None, name)
    }

    pub fn get_attr_as(&self, caller: &ClassId, name: &str) -> Result<Value> {
        self.shared.read_attr(Some(caller), name)
    }

    pub fn set_attr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.shared.write_attr(None, name, value.into())
    }

    pub fn set_attr_as(&self, caller: &ClassId, name: &str, value: impl Into<Value>) -> Result<()> {
        self.shared.write_attr(Some(caller), name, value.into())
    }

    pub fn freeze(&self) -> Result<()> {
        self.shared.transition(None, Transition::Freeze)
    }

    pub fn freeze_as(&self, caller: &ClassId) -> Result<()> {
        self.shared.transition(Some(caller), Transition::Freeze)
    }

    pub fn melt(&self) -> Result<()> {
        self.shared.transition(None, Transition::Melt)
    }

    pub fn melt_as(&self, caller: &ClassId) -> Result<()> {
        self.shared.transition(Some(caller), Transition::Melt)
    }

    pub fn lock(&self, key: &str) -> Result<()> {
        self.shared.transition(None, Transition::Lock(key.to_string()))
    }

    pub fn lock_as(&self, caller: &ClassId, key: &str) -> Result<()> {
        self.shared.transition(Some(caller), Transition::Lock(key.to_string()))
    }

    pub fn unlock(&self, key: &str) -> Result<()> {
        self.shared.transition(None, Transition::Unlock(key.to_string()))
    }

    pub fn unlock_as(&self, caller: &ClassId, key: &str) -> Result<()> {
        self.shared.transition(Some(caller), Transition::Unlock(key.to_string()))
    }

    pub fn frozen(&self) -> Result<bool> {
        self.shared.frozen()
    }

    /// Whether `key` is held. Unknown keys are a lock violation.
    pub fn locked(&self, key: &str) -> Result<bool> {
        self.shared.locked(key)
    }

    /// Restricted proxy over this instance, blocking every member any
    /// layer refuses in views.
    pub fn view(&self) -> View<T> {
        View::new(Arc::clone(self.shared.wrapped.view_type()), Arc::downgrade(&self.shared))
    }

    /// Read the underlying data directly, bypassing every policy.
    pub fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        Ok(f(&*self.shared.data()?))
    }
}

impl<T: Clone + Send + Sync + 'static> Instance<T> {
    /// Independent copy carrying the current policy state.
    pub fn copy(&self) -> Result<Instance<T>> {
        Ok(Self::from_shared(self.shared.duplicate()?))
    }

    /// Copy, then force the copy's frozen state (the class acts as caller).
    pub fn copy_with(&self, frozen: Option<bool>) -> Result<Instance<T>> {
        if frozen.is_some() && self.wrapped_type().layer_for(&Transition::Freeze).is_none() {
            return Err(CapError::NoSuchMember(format!(
                "`{}` objects have no `freeze` method",
                self.class_name()
            )));
        }
        let copy = self.copy()?;
        if let Some(frozen) = frozen {
            copy.cascade_frozen(frozen)?;
        }
        Ok(copy)
    }
}

impl<T: Send + Sync + 'static> Freezable for Instance<T> {
    fn cascade_frozen(&self, frozen: bool) -> Result<()> {
        let op = if frozen { Transition::Freeze } else { Transition::Melt };
        if self.shared.wrapped.layer_for(&op).is_none() {
            return Ok(());
        }
        let owner = self.shared.class().id().clone();
        self.shared.transition(Some(&owner), op)
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Instance<T> {
    fn clone(&self) -> Self {
        let states = self.shared.states.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let data = self.shared.data.read().unwrap_or_else(PoisonError::into_inner).clone();
        Self::from_shared(Arc::new(Shared {
            wrapped: Arc::clone(&self.shared.wrapped),
            data: RwLock::new(data),
            states: Mutex::new(states),
        }))
    }
}

impl<T: PartialEq + Send + Sync + 'static> PartialEq for Instance<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shared.data_eq(&other.shared)
    }
}

impl<T: PartialEq + Send + Sync + 'static> PartialEq<View<T>> for Instance<T> {
    fn eq(&self, other: &View<T>) -> bool {
        other == self
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for Instance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.debug_as(self.class_name(), f)
    }
}

impl<T: Serialize + Send + Sync + 'static> Serialize for Instance<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.shared.serialize_data(serializer)
    }
}
