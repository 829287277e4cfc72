//! Data-driven catalog metadata from JSON.
//!
//! Feature-gated behind `data-loader`. A manifest carries the scheduler
//! configuration and the metadata of each component type. Constructors and
//! factories are code and stay registered on the [`CatalogBuilder`]; a
//! manifest entry for an already registered type replaces only its
//! metadata.

use crate::catalog::CatalogBuilder;
use crate::id::TypeKey;
use crate::metadata::ComponentMeta;
use crate::round::SchedulerConfig;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("type {0} appears more than once in the manifest")]
    DuplicateType(String),
    #[error("type name must not be empty")]
    EmptyTypeName,
}

// ---------------------------------------------------------------------------
// JSON data structures
// ---------------------------------------------------------------------------

/// Top-level manifest.
#[derive(Debug, serde::Deserialize)]
pub struct ManifestData {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub types: Vec<TypeData>,
}

/// One component type. A type without `meta` is registered but cannot be
/// loaded.
#[derive(Debug, serde::Deserialize)]
pub struct TypeData {
    pub name: String,
    #[serde(default)]
    pub meta: Option<ComponentMeta>,
}

/// What a manifest contributed.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub scheduler: SchedulerConfig,
    /// Keys of the manifest's types, in manifest order.
    pub types: Vec<TypeKey>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse `json` and register its types on `builder`.
///
/// Nothing is registered unless the whole document is valid.
pub fn load_manifest_json(json: &str, builder: &mut CatalogBuilder) -> Result<LoadedManifest, DataLoadError> {
    let data: ManifestData = serde_json::from_str(json)?;

    let mut seen: HashSet<&str> = HashSet::new();
    for ty in &data.types {
        if ty.name.is_empty() {
            return Err(DataLoadError::EmptyTypeName);
        }
        if !seen.insert(ty.name.as_str()) {
            return Err(DataLoadError::DuplicateType(ty.name.clone()));
        }
    }

    let types = data
        .types
        .into_iter()
        .map(|ty| builder.register_type(&ty.name, ty.meta))
        .collect::<Vec<_>>();
    tracing::debug!(types = types.len(), "manifest loaded");

    Ok(LoadedManifest {
        scheduler: data.scheduler,
        types,
    })
}
