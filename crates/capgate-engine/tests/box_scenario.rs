//! End-to-end freeze/melt walk-through on a single-value box.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;

use serde_json::{json, Value};

use capgate_core::{ArgBag, ClassId, ErrorKind};
use capgate_engine::{CallerSet, ClassDef, Decoration, FreezePolicy, Registry, WrappedType};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
struct Parcel {
    value: Value,
}

fn box_type(reg: &Registry, policy: FreezePolicy) -> Arc<WrappedType<Parcel>> {
    let class = ClassDef::<Parcel>::builder("Box")
        .constructor("value", |a| Ok(Parcel { value: a.get("value").cloned().unwrap_or_default() }))
        .method("get", "", |b: &Parcel, _| Ok(b.value.clone()))
        .method_mut("set", "value", |b: &mut Parcel, a| {
            b.value = a.get("value").cloned().unwrap_or_default();
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    Decoration::of(&class).layer(policy).apply_in(reg).unwrap()
}

#[test]
fn freeze_blocks_set_until_melted() {
    let reg = Registry::new();
    let ty = box_type(&reg, FreezePolicy::builder().method("set").build());
    let b = ty.construct(ArgBag::positional([5])).unwrap();

    b.freeze().unwrap();
    let err = b.call("set", ArgBag::positional([10])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Frozen);
    assert_eq!(
        err.to_string(),
        "Calling `set` method on frozen `Box` objects is not possible. \
         Try making a copy of the object before calling frozen methods."
    );
    assert_eq!(b.call("get", ArgBag::new()).unwrap(), json!(5));

    b.melt().unwrap();
    b.call("set", ArgBag::positional([10])).unwrap();
    assert_eq!(b.call("get", ArgBag::new()).unwrap(), json!(10));
}

#[test]
fn freeze_is_idempotent() {
    let reg = Registry::new();
    let b = box_type(&reg, FreezePolicy::builder().method("set").build())
        .construct(ArgBag::positional([1]))
        .unwrap();
    b.freeze().unwrap();
    b.freeze().unwrap();
    assert!(b.frozen().unwrap());
    b.melt().unwrap();
    b.melt().unwrap();
    assert!(!b.frozen().unwrap());
}

#[test]
fn frozen_at_construction() {
    let reg = Registry::new();
    let ty = box_type(&reg, FreezePolicy::builder().method("set").frozen(true).build());

    let b = ty.construct(ArgBag::positional([1])).unwrap();
    assert!(b.frozen().unwrap());

    // Per-instance override through the constructor.
    let b = ty.construct(ArgBag::positional([1]).kw("frozen", false)).unwrap();
    assert!(!b.frozen().unwrap());
    b.call("set", ArgBag::positional([2])).unwrap();
}

#[test]
fn melt_restricted_to_the_class_itself() {
    let reg = Registry::new();
    let ty = box_type(&reg, FreezePolicy::builder().method("set").let_melt(CallerSet::owner_only()).build());
    let b = ty.construct(ArgBag::positional([1])).unwrap();
    b.freeze().unwrap();

    let err = b.melt_as(&ClassId::new("Stranger")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Frozen);
    assert!(b.frozen().unwrap());

    b.melt_as(&ClassId::new("Box")).unwrap();
    assert!(!b.frozen().unwrap());
}

#[test]
fn copy_keeps_or_overrides_frozen_state() {
    let reg = Registry::new();
    let b = box_type(&reg, FreezePolicy::builder().method("set").build())
        .construct(ArgBag::positional([3]))
        .unwrap();
    b.freeze().unwrap();

    let same = b.copy().unwrap();
    assert!(same.frozen().unwrap());
    assert_eq!(same, b);

    let thawed = b.copy_with(Some(false)).unwrap();
    assert!(!thawed.frozen().unwrap());
    thawed.call("set", ArgBag::positional([4])).unwrap();
    assert_eq!(b.call("get", ArgBag::new()).unwrap(), json!(3));
    assert_ne!(thawed, b);
}

#[test]
fn unknown_members_and_bad_arguments() {
    let reg = Registry::new();
    let b = box_type(&reg, FreezePolicy::builder().method("set").build())
        .construct(ArgBag::positional([3]))
        .unwrap();
    assert_eq!(b.call("explode", ArgBag::new()).unwrap_err().kind(), ErrorKind::NoSuchMember);
    assert_eq!(b.call("freeze", ArgBag::new()).unwrap_err().kind(), ErrorKind::NoSuchMember);
    assert_eq!(b.call("set", ArgBag::new()).unwrap_err().kind(), ErrorKind::Argument);
    assert_eq!(
        b.call("get", ArgBag::new().kw("value", 1)).unwrap_err().kind(),
        ErrorKind::Argument
    );
}
