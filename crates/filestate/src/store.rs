//! Persistent store adapter contract and an in-memory implementation.
//!
//! The store is a narrow CRUD surface keyed by `(file path, module id)`,
//! plus a file-metadata table and a small key-value registry. Only the
//! [`FileStateManager`](crate::FileStateManager) talks to it.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::types::FileMetadata;

/// Durable storage for per-file module state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_module_state(
        &self,
        file_path: &str,
        module_id: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Fully overwrite the record for `(file_path, module_id)`.
    async fn put_module_state(
        &self,
        file_path: &str,
        module_id: &str,
        state: &serde_json::Value,
    ) -> Result<()>;

    async fn delete_module_state(&self, file_path: &str, module_id: &str) -> Result<()>;

    async fn get_file_metadata(&self, file_path: &str) -> Result<Option<FileMetadata>>;

    /// Create the metadata record if missing, otherwise bump `last_accessed`
    /// and `access_count`. Returns the record as stored.
    async fn touch_file_metadata(&self, file_path: &str) -> Result<FileMetadata>;

    async fn delete_file_metadata(&self, file_path: &str) -> Result<()>;

    /// Every file with metadata or at least one module record, sorted.
    async fn list_tracked_files(&self) -> Result<Vec<String>>;

    async fn get_registry_value(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn put_registry_value(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}

// ── MemoryStore ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryTables {
    modules: BTreeMap<(String, String), String>,
    metadata: BTreeMap<String, FileMetadata>,
    registry: BTreeMap<String, String>,
}

/// A [`StateStore`] that keeps serialized records in memory.
///
/// Records are held as JSON text so that "identical durable bytes" can be
/// checked directly via [`MemoryStore::raw_module_state`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    module_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The serialized record for a module, exactly as stored.
    pub fn raw_module_state(&self, file_path: &str, module_id: &str) -> Option<String> {
        self.tables
            .lock()
            .modules
            .get(&(file_path.to_string(), module_id.to_string()))
            .cloned()
    }

    /// Number of `put_module_state` calls served so far.
    pub fn module_writes(&self) -> u64 {
        self.module_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_module_state(
        &self,
        file_path: &str,
        module_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let raw = self.raw_module_state(file_path, module_id);
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn put_module_state(
        &self,
        file_path: &str,
        module_id: &str,
        state: &serde_json::Value,
    ) -> Result<()> {
        let text = serde_json::to_string(state)?;
        self.tables
            .lock()
            .modules
            .insert((file_path.to_string(), module_id.to_string()), text);
        self.module_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_module_state(&self, file_path: &str, module_id: &str) -> Result<()> {
        self.tables
            .lock()
            .modules
            .remove(&(file_path.to_string(), module_id.to_string()));
        Ok(())
    }

    async fn get_file_metadata(&self, file_path: &str) -> Result<Option<FileMetadata>> {
        Ok(self.tables.lock().metadata.get(file_path).cloned())
    }

    async fn touch_file_metadata(&self, file_path: &str) -> Result<FileMetadata> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let meta = tables
            .metadata
            .entry(file_path.to_string())
            .or_insert_with(|| FileMetadata::new(now));
        meta.touch(now);
        Ok(meta.clone())
    }

    async fn delete_file_metadata(&self, file_path: &str) -> Result<()> {
        self.tables.lock().metadata.remove(file_path);
        Ok(())
    }

    async fn list_tracked_files(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock();
        let files: BTreeSet<String> = tables
            .metadata
            .keys()
            .cloned()
            .chain(tables.modules.keys().map(|(path, _)| path.clone()))
            .collect();
        Ok(files.into_iter().collect())
    }

    async fn get_registry_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw = self.tables.lock().registry.get(key).cloned();
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn put_registry_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.tables.lock().registry.insert(key.to_string(), text);
        Ok(())
    }
}
