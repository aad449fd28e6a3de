//! Decoration config loader (strict parsing).

pub mod schema;

use std::fs;
use std::sync::Arc;

use capgate_core::error::{CapError, Result};

use crate::class::ClassDef;
use crate::registry::Registry;
use crate::wrapper::{Decoration, WrappedType};

pub use schema::{ClassDecoration, DecorationConfig, FreezeSection, FriendSection, LockSection, Permit};

pub fn load_from_file(path: &str) -> Result<DecorationConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| CapError::Internal(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<DecorationConfig> {
    let cfg: DecorationConfig = serde_yaml::from_str(s)
        .map_err(|e| CapError::Configuration(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

impl DecorationConfig {
    /// Decorate `class` with the policies configured under its name.
    pub fn decorate<T: Send + Sync + 'static>(
        &self,
        class: &Arc<ClassDef<T>>,
        registry: &Registry,
    ) -> Result<Arc<WrappedType<T>>> {
        let entry = self.class(class.name()).ok_or_else(|| {
            CapError::Configuration(format!("no decoration configured for `{}`", class.name()))
        })?;
        entry
            .policies()?
            .into_iter()
            .fold(Decoration::of(class), Decoration::layer_arc)
            .apply_in(registry)
    }
}
