//! The state module contract.
//!
//! A state module owns one slice of per-file state (plot settings, analysis
//! history, annotations, ...). Modules are written against the typed
//! [`StateModule`] trait; the manager stores them type-erased as
//! [`DynModule`] keyed by [`StateModule::ID`].

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::{Result, StateError};
use crate::store::StateStore;
use crate::types::StoredModuleState;

/// A pluggable owner of one slice of per-file state.
///
/// Only `ID`, `State` and [`default_state`](StateModule::default_state) are
/// required. The provided load/save/clear methods wrap records in a
/// [`StoredModuleState`] envelope and run [`migrate`](StateModule::migrate)
/// on records written by older schema versions.
#[async_trait]
pub trait StateModule: Send + Sync + 'static {
    /// Registry key and durable record key for this module.
    const ID: &'static str;

    /// Current schema version of `State`.
    const SCHEMA_VERSION: u32 = 1;

    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Pure, deterministic default. Must not touch I/O.
    fn default_state(&self) -> Self::State;

    /// Reject structurally valid but semantically corrupt records.
    fn validate_state(&self, _state: &Self::State) -> bool {
        true
    }

    /// Upgrade a record written at `from_version` to the current shape.
    fn migrate(&self, _from_version: u32, data: serde_json::Value) -> Result<serde_json::Value> {
        Ok(data)
    }

    /// Load and decode this module's record, reporting why it failed.
    async fn try_load_state(
        &self,
        store: &dyn StateStore,
        file_path: &str,
    ) -> Result<Option<Self::State>> {
        let raw = store
            .get_module_state(file_path, Self::ID)
            .await
            .map_err(|e| StateError::retrieval(file_path, Self::ID, e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let stored = StoredModuleState::from_value(raw);
        let data = if stored.schema_version > Self::SCHEMA_VERSION {
            return Err(StateError::validation(
                Self::ID,
                format!(
                    "record schema v{} is newer than supported v{}",
                    stored.schema_version,
                    Self::SCHEMA_VERSION
                ),
            ));
        } else if stored.schema_version < Self::SCHEMA_VERSION {
            self.migrate(stored.schema_version, stored.data)?
        } else {
            stored.data
        };

        let state: Self::State = serde_json::from_value(data)
            .map_err(|e| StateError::retrieval(file_path, Self::ID, format!("corrupt record: {e}")))?;
        if !self.validate_state(&state) {
            return Err(StateError::validation(Self::ID, "record failed validation"));
        }
        Ok(Some(state))
    }

    /// Fail-soft load: any retrieval or decode error yields `None`.
    async fn load_state(&self, store: &dyn StateStore, file_path: &str) -> Option<Self::State> {
        match self.try_load_state(store, file_path).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(module = Self::ID, file = file_path, error = %e, "module load failed");
                None
            }
        }
    }

    /// Overwrite this module's record. Identical state yields identical bytes.
    async fn save_state(
        &self,
        store: &dyn StateStore,
        file_path: &str,
        state: &Self::State,
    ) -> Result<()> {
        let envelope = StoredModuleState::new(Self::SCHEMA_VERSION, serde_json::to_value(state)?);
        store
            .put_module_state(file_path, Self::ID, &serde_json::to_value(&envelope)?)
            .await
    }

    async fn clear_state(&self, store: &dyn StateStore, file_path: &str) -> Result<()> {
        store.delete_module_state(file_path, Self::ID).await
    }
}

// ── Type erasure ─────────────────────────────────────────────────────

/// Object-safe view of a [`StateModule`] operating on JSON values.
///
/// Implemented for every `StateModule`; there is no reason to implement it
/// by hand.
#[async_trait]
pub trait DynModule: Send + Sync {
    fn id(&self) -> &'static str;

    fn schema_version(&self) -> u32;

    fn default_value(&self) -> Result<serde_json::Value>;

    /// Check that `value` decodes as this module's state and passes validation.
    fn check_value(&self, value: &serde_json::Value) -> Result<()>;

    async fn load_value(
        &self,
        store: &dyn StateStore,
        file_path: &str,
    ) -> Result<Option<serde_json::Value>>;

    async fn save_value(
        &self,
        store: &dyn StateStore,
        file_path: &str,
        value: &serde_json::Value,
    ) -> Result<()>;

    async fn clear_value(&self, store: &dyn StateStore, file_path: &str) -> Result<()>;
}

fn decode<M: StateModule>(module: &M, value: &serde_json::Value) -> Result<M::State> {
    let state: M::State = serde_json::from_value(value.clone())
        .map_err(|e| StateError::validation(M::ID, e))?;
    if !module.validate_state(&state) {
        return Err(StateError::validation(M::ID, "state failed validation"));
    }
    Ok(state)
}

#[async_trait]
impl<M: StateModule> DynModule for M {
    fn id(&self) -> &'static str {
        M::ID
    }

    fn schema_version(&self) -> u32 {
        M::SCHEMA_VERSION
    }

    fn default_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.default_state())?)
    }

    fn check_value(&self, value: &serde_json::Value) -> Result<()> {
        decode(self, value).map(|_| ())
    }

    async fn load_value(
        &self,
        store: &dyn StateStore,
        file_path: &str,
    ) -> Result<Option<serde_json::Value>> {
        match self.try_load_state(store, file_path).await? {
            Some(state) => Ok(Some(serde_json::to_value(state)?)),
            None => Ok(None),
        }
    }

    async fn save_value(
        &self,
        store: &dyn StateStore,
        file_path: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let state = decode(self, value)?;
        self.save_state(store, file_path, &state).await
    }

    async fn clear_value(&self, store: &dyn StateStore, file_path: &str) -> Result<()> {
        self.clear_state(store, file_path).await
    }
}

/// A registered module and its load priority (ascending).
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub module: Arc<dyn DynModule>,
    pub priority: i32,
}

impl ModuleDescriptor {
    pub fn new<M: StateModule>(module: M, priority: i32) -> Self {
        Self {
            module: Arc::new(module),
            priority,
        }
    }

    pub fn id(&self) -> &'static str {
        self.module.id()
    }
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id())
            .field("priority", &self.priority)
            .finish()
    }
}
