//! capgate demo
//!
//! Decorates a `Box` class from a YAML config (first argument, or a built-in
//! default) and walks it through freezing, locking and views.
//! Set `RUST_LOG=capgate_engine=debug` to see compilation and denials.

use std::process::ExitCode;
use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use capgate_core::{ArgBag, ClassId, Result};
use capgate_engine::obs::metrics;
use capgate_engine::{config, ClassDef, Registry};

const DEFAULT_CONFIG: &str = r#"
version: 1
classes:
  - name: Box
    freezable:
      methods: [set]
    lockable:
      lock_permissions: { shipping: [Courier] }
      methods: { set: [shipping] }
"#;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
struct Parcel {
    value: Value,
}

fn box_class() -> Result<Arc<ClassDef<Parcel>>> {
    ClassDef::<Parcel>::builder("Box")
        .constructor("value", |a| Ok(Parcel { value: a.get("value").cloned().unwrap_or(Value::Null) }))
        .method("get", "", |b: &Parcel, _| Ok(b.value.clone()))
        .method_mut("set", "value", |b: &mut Parcel, a| {
            b.value = a.get("value").cloned().unwrap_or(Value::Null);
            Ok(Value::Null)
        })
        .build()
}

fn run(cfg: &config::DecorationConfig) -> Result<()> {
    let ty = cfg.decorate(&box_class()?, Registry::global())?;
    tracing::info!(wrapped = ty.real_name(), "decorated");

    let b = ty.construct(ArgBag::positional([5]))?;
    b.freeze()?;
    match b.call("set", ArgBag::positional([10])) {
        Ok(_) => println!("set while frozen: accepted"),
        Err(e) => println!("set while frozen: {} ({})", e, e.kind().as_str()),
    }
    println!("get -> {}", b.call("get", ArgBag::new())?);
    b.melt()?;
    b.call("set", ArgBag::positional([10]))?;
    println!("get after melt -> {}", b.call("get", ArgBag::new())?);

    let courier = ClassId::new("Courier");
    if b.lock_as(&courier, "shipping").is_ok() {
        if let Err(e) = b.call("set", ArgBag::positional([11])) {
            println!("set while locked: {e}");
        }
        b.unlock_as(&courier, "shipping")?;
    }

    let v = b.view();
    println!("view {} blocks {:?}", v.type_name(), v.blocked());
    if let Err(e) = v.freeze() {
        println!("freeze on view: {e}");
    }
    match serde_json::to_string(&b) {
        Ok(text) => println!("serialized: {text}"),
        Err(e) => tracing::warn!(error = %e, "serialization failed"),
    }
    Ok(())
}

fn main() -> ExitCode {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let loaded = match std::env::args().nth(1) {
        Some(path) => config::load_from_file(&path),
        None => config::load_from_str(DEFAULT_CONFIG),
    };
    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&cfg) {
        tracing::error!(error = %e, kind = e.kind().as_str(), "demo failed");
        return ExitCode::FAILURE;
    }
    print!("{}", metrics().render());
    ExitCode::SUCCESS
}
