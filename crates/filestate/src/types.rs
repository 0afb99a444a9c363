use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::module::StateModule;

/// Version of the per-file registry format written by this crate.
pub const REGISTRY_VERSION: u32 = 1;

// ============================================================================
// File metadata
// ============================================================================

/// Bookkeeping kept for every file that has ever been opened.
///
/// The record is created on first open and updated on every subsequent
/// open; it is never removed except by an explicit whole-file clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub first_opened: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    REGISTRY_VERSION
}

impl FileMetadata {
    /// A fresh record for a file first seen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            first_opened: now,
            last_accessed: now,
            access_count: 0,
            schema_version: REGISTRY_VERSION,
        }
    }

    /// Record one more access at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

// ============================================================================
// Per-file state
// ============================================================================

/// A module whose load failed and fell back to its default state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleWarning {
    pub module_id: String,
    pub message: String,
}

/// The combined state of every registered module for one file.
///
/// Module slots are keyed by module id and hold the module's state as JSON;
/// use [`FileSpecificState::get`] for typed access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpecificState {
    pub file_path: String,
    #[serde(default)]
    pub modules: BTreeMap<String, serde_json::Value>,
    pub metadata: FileMetadata,
    /// Non-fatal load failures from the most recent load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ModuleWarning>,
}

impl FileSpecificState {
    pub fn new(file_path: impl Into<String>, metadata: FileMetadata) -> Self {
        Self {
            file_path: file_path.into(),
            modules: BTreeMap::new(),
            metadata,
            warnings: Vec::new(),
        }
    }

    /// Raw JSON slot for a module, if it has state.
    pub fn slot(&self, module_id: &str) -> Option<&serde_json::Value> {
        self.modules.get(module_id)
    }

    /// Typed view of a module slot. Returns `None` when the slot is empty
    /// or no longer deserializes as `M::State`.
    pub fn get<M: StateModule>(&self) -> Option<M::State> {
        self.modules
            .get(M::ID)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn has_module(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
}

/// Snapshot of the in-memory registry: cached file states plus the active
/// file selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStateRegistry {
    pub files: BTreeMap<String, FileSpecificState>,
    pub active_file_path: Option<String>,
    pub last_active_file_path: Option<String>,
    pub metadata: RegistryMetadata,
}

// ============================================================================
// Durable record envelope
// ============================================================================

/// Wire shape of a module record in the durable store.
///
/// Records written before versioning existed are bare JSON values; those are
/// read as version 0 and passed through the module's migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModuleState {
    pub schema_version: u32,
    pub data: serde_json::Value,
}

impl StoredModuleState {
    pub fn new(schema_version: u32, data: serde_json::Value) -> Self {
        Self {
            schema_version,
            data,
        }
    }

    /// Interpret a raw store value, falling back to a version-0 bare record.
    pub fn from_value(value: serde_json::Value) -> Self {
        let is_envelope = value.as_object().is_some_and(|obj| {
            obj.len() == 2 && obj.contains_key("schema_version") && obj.contains_key("data")
        });
        if is_envelope
            && let Ok(stored) = serde_json::from_value::<StoredModuleState>(value.clone())
        {
            return stored;
        }
        Self {
            schema_version: 0,
            data: value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_touch() {
        let t0 = Utc::now();
        let mut meta = FileMetadata::new(t0);
        assert_eq!(meta.access_count, 0);
        meta.touch(t0);
        meta.touch(t0);
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.first_opened, t0);
    }

    #[test]
    fn test_envelope_detection() {
        let stored = StoredModuleState::from_value(json!({"schema_version": 3, "data": {"a": 1}}));
        assert_eq!(stored.schema_version, 3);
        assert_eq!(stored.data, json!({"a": 1}));
    }

    #[test]
    fn test_bare_record_is_version_zero() {
        let stored = StoredModuleState::from_value(json!({"zoom": 2.0}));
        assert_eq!(stored.schema_version, 0);
        assert_eq!(stored.data, json!({"zoom": 2.0}));
    }

    #[test]
    fn test_metadata_camel_case() {
        let meta = FileMetadata::new(Utc::now());
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("firstOpened").is_some());
        assert!(json.get("accessCount").is_some());
    }
}
