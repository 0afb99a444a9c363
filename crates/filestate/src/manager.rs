//! The file state manager.
//!
//! Owns the module registry, the per-file cache and the debounced write
//! queue. Every read and write of per-file module state goes through here.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::cache::FileStateCache;
use crate::error::{Result, StateError};
use crate::module::{ModuleDescriptor, StateModule};
use crate::modules::{
    ANALYSIS_PRIORITY, ANNOTATIONS_PRIORITY, AnalysisModule, AnnotationModule, PLOT_PRIORITY,
    PlotModule,
};
use crate::store::StateStore;
use crate::types::{
    FileMetadata, FileSpecificState, FileStateRegistry, ModuleWarning, REGISTRY_VERSION,
    RegistryMetadata,
};

/// Registry key under which the active file path is persisted.
pub const ACTIVE_FILE_KEY: &str = "active_file_path";

/// Configuration for the file state manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of cached file states
    pub cache_size: usize,
    /// Quiet period before a module update is written to the store
    pub flush_debounce: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_size: 10,
            flush_debounce: Duration::from_secs(2),
        }
    }
}

type WriteKey = (String, String);

struct PendingWrite {
    value: serde_json::Value,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct ActiveFiles {
    active: Option<String>,
    last_active: Option<String>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    config: ManagerConfig,
    modules: RwLock<HashMap<&'static str, ModuleDescriptor>>,
    cache: Mutex<FileStateCache>,
    files: Mutex<ActiveFiles>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<FileSpecificState>>>>,
    pending: Mutex<HashMap<WriteKey, PendingWrite>>,
    write_generation: AtomicU64,
    // Serializes durable module writes so two flushes never interleave.
    write_lock: tokio::sync::Mutex<()>,
    last_updated: Mutex<DateTime<Utc>>,
}

/// Coordinates load/save of every registered [`StateModule`] for a file.
///
/// Cheap to clone; clones share the same registry, cache and write queue.
///
/// # Example
///
/// ```rust
/// use filestate::{FileStateManager, ManagerConfig, MemoryStore, PlotModule};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> filestate::Result<()> {
/// let manager = FileStateManager::with_default_modules(
///     Arc::new(MemoryStore::new()),
///     ManagerConfig::default(),
/// );
///
/// let state = manager.open_file("/data/rec1.edf").await;
/// assert_eq!(state.metadata.access_count, 1);
///
/// let mut plot = state.get::<PlotModule>().unwrap();
/// plot.zoom = 2.0;
/// manager.update::<PlotModule>("/data/rec1.edf", &plot)?;
/// manager.flush().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FileStateManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FileStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateManager")
            .field("config", &self.inner.config)
            .field("modules", &self.modules())
            .field("active", &self.active_file_path())
            .finish()
    }
}

impl FileStateManager {
    /// A manager with no modules registered.
    pub fn new(store: Arc<dyn StateStore>, config: ManagerConfig) -> Self {
        let cache = FileStateCache::new(config.cache_size);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                modules: RwLock::new(HashMap::new()),
                cache: Mutex::new(cache),
                files: Mutex::new(ActiveFiles::default()),
                in_flight: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                write_generation: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(()),
                last_updated: Mutex::new(Utc::now()),
            }),
        }
    }

    /// A manager with the plot, analysis and annotation modules registered.
    pub fn with_default_modules(store: Arc<dyn StateStore>, config: ManagerConfig) -> Self {
        let manager = Self::new(store, config);
        manager.register_module(PlotModule, PLOT_PRIORITY);
        manager.register_module(AnalysisModule, ANALYSIS_PRIORITY);
        manager.register_module(AnnotationModule, ANNOTATIONS_PRIORITY);
        manager
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    // ── Module registry ──────────────────────────────────────────────

    /// Register a module. Re-registering an id replaces the previous entry.
    pub fn register_module<M: StateModule>(&self, module: M, priority: i32) {
        self.register_descriptor(ModuleDescriptor::new(module, priority));
    }

    pub fn register_descriptor(&self, descriptor: ModuleDescriptor) {
        let id = descriptor.id();
        let replaced = self.inner.modules.write().insert(id, descriptor).is_some();
        if replaced {
            tracing::debug!(module = id, "replaced module registration");
        }
    }

    pub fn unregister_module(&self, module_id: &str) -> bool {
        self.inner.modules.write().remove(module_id).is_some()
    }

    pub fn is_registered(&self, module_id: &str) -> bool {
        self.inner.modules.read().contains_key(module_id)
    }

    /// Registered `(id, priority)` pairs in load order.
    pub fn modules(&self) -> Vec<(&'static str, i32)> {
        self.sorted_modules()
            .iter()
            .map(|d| (d.id(), d.priority))
            .collect()
    }

    fn sorted_modules(&self) -> Vec<ModuleDescriptor> {
        let mut modules: Vec<ModuleDescriptor> =
            self.inner.modules.read().values().cloned().collect();
        modules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id().cmp(b.id())));
        modules
    }

    fn descriptor(&self, module_id: &str) -> Result<ModuleDescriptor> {
        self.inner
            .modules
            .read()
            .get(module_id)
            .cloned()
            .ok_or_else(|| StateError::UnknownModule(module_id.to_string()))
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Load every registered module's state for `file_path`.
    ///
    /// Concurrent calls for the same path share one underlying load. A
    /// module that fails to load falls back to its default and is listed in
    /// [`FileSpecificState::warnings`]; it never aborts the other modules.
    pub async fn load_file_state(&self, file_path: &str) -> FileSpecificState {
        let cell = self
            .inner
            .in_flight
            .lock()
            .entry(file_path.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let state = cell
            .get_or_init(|| self.load_uncoalesced(file_path))
            .await
            .clone();

        let mut in_flight = self.inner.in_flight.lock();
        if in_flight
            .get(file_path)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            in_flight.remove(file_path);
        }
        state
    }

    async fn load_uncoalesced(&self, file_path: &str) -> FileSpecificState {
        let store = self.inner.store.as_ref();

        let metadata = match store.touch_file_metadata(file_path).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(file = file_path, error = %e, "failed to touch file metadata");
                let mut meta = FileMetadata::new(Utc::now());
                meta.touch(meta.first_opened);
                meta
            }
        };

        let mut state = FileSpecificState::new(file_path, metadata);
        for descriptor in self.sorted_modules() {
            let module = descriptor.module.as_ref();
            let id = module.id();
            let loaded = match module.load_value(store, file_path).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(module = id, file = file_path, error = %e, "module load failed, using default");
                    state.warnings.push(ModuleWarning {
                        module_id: id.to_string(),
                        message: e.to_string(),
                    });
                    None
                }
            };
            let value = match loaded {
                Some(value) => value,
                None => match module.default_value() {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(module = id, error = %e, "module default failed to serialize");
                        continue;
                    }
                },
            };
            state.modules.insert(id.to_string(), value);
        }

        // Unflushed updates are newer than what the store returned.
        for ((path, module_id), write) in self.inner.pending.lock().iter() {
            if path == file_path {
                state.modules.insert(module_id.clone(), write.value.clone());
            }
        }

        self.cache_insert(state.clone());
        state
    }

    fn cache_insert(&self, state: FileSpecificState) {
        let active = self.active_file_path();
        let evicted = self.inner.cache.lock().insert(state, active.as_deref());
        for path in evicted {
            tracing::debug!(file = %path, "evicted file state from cache");
        }
        self.mark_updated();
    }

    fn mark_updated(&self) {
        *self.inner.last_updated.lock() = Utc::now();
    }

    /// The cached state for `file_path`, if present. Does not touch the store.
    pub fn cached_state(&self, file_path: &str) -> Option<FileSpecificState> {
        self.inner.cache.lock().peek(file_path).cloned()
    }

    pub fn is_cached(&self, file_path: &str) -> bool {
        self.inner.cache.lock().contains(file_path)
    }

    /// Typed view of a cached module slot.
    pub fn module_state<M: StateModule>(&self, file_path: &str) -> Option<M::State> {
        self.inner.cache.lock().peek(file_path)?.get::<M>()
    }

    // ── Updating ─────────────────────────────────────────────────────

    /// Replace one module's state for `file_path`.
    ///
    /// The cached state reflects the change immediately; the durable write
    /// happens after [`ManagerConfig::flush_debounce`] of quiet time for the
    /// same `(file_path, module_id)`. Must be called inside a Tokio runtime.
    pub fn update_module_state(
        &self,
        file_path: &str,
        module_id: &str,
        state: serde_json::Value,
    ) -> Result<()> {
        let descriptor = self.descriptor(module_id)?;
        descriptor.module.check_value(&state)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(StateError::store)?;

        let id = descriptor.id();
        {
            let mut cache = self.inner.cache.lock();
            match cache.get_mut(file_path) {
                Some(cached) => {
                    cached.modules.insert(id.to_string(), state.clone());
                }
                None => {
                    let mut fresh = FileSpecificState::new(file_path, FileMetadata::new(Utc::now()));
                    fresh.modules.insert(id.to_string(), state.clone());
                    let active = self.inner.files.lock().active.clone();
                    cache.insert(fresh, active.as_deref());
                }
            }
        }
        self.mark_updated();
        self.schedule_write(&runtime, (file_path.to_string(), id.to_string()), state);
        Ok(())
    }

    /// Typed wrapper over [`update_module_state`](Self::update_module_state).
    pub fn update<M: StateModule>(&self, file_path: &str, state: &M::State) -> Result<()> {
        self.update_module_state(file_path, M::ID, serde_json::to_value(state)?)
    }

    fn schedule_write(
        &self,
        runtime: &tokio::runtime::Handle,
        key: WriteKey,
        value: serde_json::Value,
    ) {
        let generation = self.inner.write_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.inner.config.flush_debounce;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        // Hold the queue lock while spawning so the timer cannot observe the
        // queue before its own entry is in place.
        let mut pending = self.inner.pending.lock();
        let timer_key = key.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let manager = FileStateManager { inner };
                if let Err(e) = manager.write_pending(&timer_key, Some(generation)).await {
                    tracing::warn!(file = %timer_key.0, module = %timer_key.1, error = %e, "debounced write failed");
                }
            }
        });
        if let Some(previous) = pending.insert(
            key,
            PendingWrite {
                value,
                generation,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    /// Write one queued update. With `expected` set, only writes if the
    /// queue still holds that generation (i.e. it was not superseded).
    async fn write_pending(&self, key: &WriteKey, expected: Option<u64>) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;

        let write = {
            let mut pending = self.inner.pending.lock();
            match pending.get(key) {
                Some(w) if expected.is_none_or(|g| g == w.generation) => pending.remove(key),
                _ => None,
            }
        };
        let Some(write) = write else {
            return Ok(());
        };
        if expected.is_none() {
            write.timer.abort();
        }

        let descriptor = match self.descriptor(&key.1) {
            Ok(d) => d,
            Err(_) => {
                tracing::warn!(module = %key.1, "dropping write for unregistered module");
                return Ok(());
            }
        };
        descriptor
            .module
            .save_value(self.inner.store.as_ref(), &key.0, &write.value)
            .await
    }

    fn cancel_pending(&self, file_path: &str, module_id: Option<&str>) {
        let mut pending = self.inner.pending.lock();
        pending.retain(|(path, id), write| {
            let matches = path == file_path && module_id.is_none_or(|m| m == id);
            if matches {
                write.timer.abort();
            }
            !matches
        });
    }

    /// Number of updates waiting for their debounce timer.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Write every queued update now. Keeps going past failures and
    /// returns the first error.
    pub async fn flush(&self) -> Result<()> {
        let keys: Vec<WriteKey> = self.inner.pending.lock().keys().cloned().collect();
        self.write_keys(keys).await
    }

    /// Write queued updates for one file now.
    pub async fn flush_file(&self, file_path: &str) -> Result<()> {
        let keys: Vec<WriteKey> = self
            .inner
            .pending
            .lock()
            .keys()
            .filter(|(path, _)| path == file_path)
            .cloned()
            .collect();
        self.write_keys(keys).await
    }

    async fn write_keys(&self, keys: Vec<WriteKey>) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.write_pending(&key, None).await {
                tracing::warn!(file = %key.0, module = %key.1, error = %e, "flush failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Clearing ─────────────────────────────────────────────────────

    /// Clear one module's state for a file, or every module's state plus the
    /// file's metadata and cache entry when `module_id` is `None`.
    pub async fn clear_file_state(&self, file_path: &str, module_id: Option<&str>) -> Result<()> {
        // A save already past the queue holds this lock; wait it out so it
        // cannot land after the deletes below.
        let _guard = self.inner.write_lock.lock().await;
        let store = self.inner.store.as_ref();
        match module_id {
            Some(module_id) => {
                let descriptor = self.descriptor(module_id)?;
                self.cancel_pending(file_path, Some(module_id));
                descriptor.module.clear_value(store, file_path).await?;
                if let Some(cached) = self.inner.cache.lock().get_mut(file_path) {
                    cached.modules.remove(module_id);
                }
            }
            None => {
                self.cancel_pending(file_path, None);
                for descriptor in self.sorted_modules() {
                    descriptor.module.clear_value(store, file_path).await?;
                }
                store.delete_file_metadata(file_path).await?;
                self.inner.cache.lock().remove(file_path);

                let was_active = {
                    let mut files = self.inner.files.lock();
                    if files.active.as_deref() == Some(file_path) {
                        files.last_active = files.active.take();
                        true
                    } else {
                        false
                    }
                };
                if was_active {
                    self.persist_active(None).await;
                }
            }
        }
        self.mark_updated();
        Ok(())
    }

    // ── Active file ──────────────────────────────────────────────────

    /// Load `file_path` and make it the active file.
    ///
    /// The active path only changes after the load completes, so observers
    /// never see an active file without state.
    pub async fn open_file(&self, file_path: &str) -> FileSpecificState {
        let state = self.load_file_state(file_path).await;
        {
            let mut files = self.inner.files.lock();
            if files.active.as_deref() != Some(file_path) {
                files.last_active = files.active.replace(file_path.to_string());
            }
        }
        // Re-insert so the active entry is the most recent and protected.
        self.cache_insert(state.clone());
        self.persist_active(Some(file_path)).await;
        state
    }

    /// Flush the active file's pending writes and clear the selection.
    pub async fn close_file(&self) -> Result<()> {
        let Some(path) = self.active_file_path() else {
            return Ok(());
        };
        self.flush_file(&path).await?;
        {
            let mut files = self.inner.files.lock();
            files.last_active = files.active.take();
        }
        self.persist_active(None).await;
        Ok(())
    }

    /// Reopen the file that was active when state was last persisted.
    pub async fn restore_active_file(&self) -> Result<Option<FileSpecificState>> {
        let value = self.inner.store.get_registry_value(ACTIVE_FILE_KEY).await?;
        match value.as_ref().and_then(|v| v.as_str()) {
            Some(path) => Ok(Some(self.open_file(path).await)),
            None => Ok(None),
        }
    }

    async fn persist_active(&self, file_path: Option<&str>) {
        let value = serde_json::json!(file_path);
        if let Err(e) = self
            .inner
            .store
            .put_registry_value(ACTIVE_FILE_KEY, &value)
            .await
        {
            tracing::warn!(error = %e, "failed to persist active file");
        }
    }

    pub fn active_file_path(&self) -> Option<String> {
        self.inner.files.lock().active.clone()
    }

    pub fn last_active_file_path(&self) -> Option<String> {
        self.inner.files.lock().last_active.clone()
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Every file the store knows about, independent of the cache.
    pub async fn get_tracked_files(&self) -> Result<Vec<String>> {
        self.inner.store.list_tracked_files().await
    }

    pub fn registry_snapshot(&self) -> FileStateRegistry {
        let files = self.inner.cache.lock().snapshot();
        let active = self.inner.files.lock();
        FileStateRegistry {
            files,
            active_file_path: active.active.clone(),
            last_active_file_path: active.last_active.clone(),
            metadata: RegistryMetadata {
                version: REGISTRY_VERSION,
                last_updated: *self.inner.last_updated.lock(),
            },
        }
    }

    /// Flush everything and cancel every outstanding timer.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.flush().await;
        for (_, write) in self.inner.pending.lock().drain() {
            write.timer.abort();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{Annotation, AnnotationState, AnnotationTarget, PlotState};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Wraps a [`MemoryStore`] with failure injection, latency and call logs.
    #[derive(Default)]
    struct TestStore {
        inner: MemoryStore,
        failing_module: Option<&'static str>,
        delay: Option<Duration>,
        put_delay: Option<Duration>,
        touches: AtomicU64,
        reads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StateStore for TestStore {
        async fn get_module_state(
            &self,
            file_path: &str,
            module_id: &str,
        ) -> Result<Option<serde_json::Value>> {
            self.reads.lock().push(module_id.to_string());
            if self.failing_module == Some(module_id) {
                return Err(StateError::store("disk on fire"));
            }
            self.inner.get_module_state(file_path, module_id).await
        }

        async fn put_module_state(
            &self,
            file_path: &str,
            module_id: &str,
            state: &serde_json::Value,
        ) -> Result<()> {
            if let Some(delay) = self.put_delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.put_module_state(file_path, module_id, state).await
        }

        async fn delete_module_state(&self, file_path: &str, module_id: &str) -> Result<()> {
            self.inner.delete_module_state(file_path, module_id).await
        }

        async fn get_file_metadata(&self, file_path: &str) -> Result<Option<FileMetadata>> {
            self.inner.get_file_metadata(file_path).await
        }

        async fn touch_file_metadata(&self, file_path: &str) -> Result<FileMetadata> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.touch_file_metadata(file_path).await
        }

        async fn delete_file_metadata(&self, file_path: &str) -> Result<()> {
            self.inner.delete_file_metadata(file_path).await
        }

        async fn list_tracked_files(&self) -> Result<Vec<String>> {
            self.inner.list_tracked_files().await
        }

        async fn get_registry_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.get_registry_value(key).await
        }

        async fn put_registry_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
            self.inner.put_registry_value(key, value).await
        }
    }

    fn manager_with(store: Arc<dyn StateStore>, cache_size: usize) -> FileStateManager {
        FileStateManager::with_default_modules(
            store,
            ManagerConfig {
                cache_size,
                ..ManagerConfig::default()
            },
        )
    }

    fn zoomed_plot(zoom: f64) -> PlotState {
        let mut plot = PlotModule.default_state();
        plot.zoom = zoom;
        plot
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_file_gets_defaults_and_metadata() {
        let manager = FileStateManager::new(Arc::new(MemoryStore::new()), ManagerConfig::default());
        manager.register_module(PlotModule, 10);
        manager.register_module(AnnotationModule, 30);

        let state = manager.load_file_state("/data/rec1.edf").await;
        assert_eq!(state.get::<PlotModule>(), Some(PlotModule.default_state()));
        assert_eq!(
            state.get::<AnnotationModule>(),
            Some(AnnotationState::default())
        );
        assert_eq!(state.modules.len(), 2);
        assert_eq!(state.metadata.access_count, 1);
        assert_eq!(state.metadata.first_opened, state.metadata.last_accessed);
        assert!(state.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_flush_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);
        manager
            .update::<PlotModule>("/a.edf", &zoomed_plot(3.5))
            .unwrap();
        manager.flush().await.unwrap();

        let fresh = manager_with(store, 10);
        let state = fresh.load_file_state("/a.edf").await;
        assert_eq!(state.get::<PlotModule>(), Some(zoomed_plot(3.5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_updates_coalesce_into_one_write() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);

        for i in 1..=5 {
            manager
                .update::<PlotModule>("/a.edf", &zoomed_plot(i as f64))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(store.module_writes(), 0);
        assert_eq!(manager.pending_writes(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.module_writes(), 1);
        assert_eq!(manager.pending_writes(), 0);

        let state = PlotModule.load_state(store.as_ref(), "/a.edf").await;
        assert_eq!(state, Some(zoomed_plot(5.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_updates_write_identical_bytes() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);

        manager.update::<PlotModule>("/a.edf", &zoomed_plot(2.0)).unwrap();
        manager.flush().await.unwrap();
        let first = store.raw_module_state("/a.edf", "plot").unwrap();

        manager.update::<PlotModule>("/a.edf", &zoomed_plot(2.0)).unwrap();
        manager.flush().await.unwrap();
        let second = store.raw_module_state("/a.edf", "plot").unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_file_survives_eviction() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 2);
        manager.open_file("/one.edf").await;
        manager.load_file_state("/two.edf").await;
        manager.load_file_state("/three.edf").await;

        assert!(manager.is_cached("/one.edf"));
        assert!(!manager.is_cached("/two.edf"));
        assert!(manager.is_cached("/three.edf"));
        assert_eq!(manager.active_file_path().as_deref(), Some("/one.edf"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_module_rejected_without_side_effects() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 10);
        let before = manager.load_file_state("/data/rec1.edf").await;

        let err = manager
            .update_module_state("/data/rec1.edf", "unknown_module", json!({}))
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownModule(ref id) if id == "unknown_module"));
        assert_eq!(manager.cached_state("/data/rec1.edf"), Some(before));
        assert_eq!(manager.pending_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_state_rejected() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 10);
        let err = manager
            .update::<PlotModule>("/a.edf", &zoomed_plot(-1.0))
            .unwrap_err();
        assert!(matches!(err, StateError::Validation { .. }));
        assert!(!manager.is_cached("/a.edf"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_are_coalesced() {
        let store = Arc::new(TestStore {
            delay: Some(Duration::from_millis(50)),
            ..TestStore::default()
        });
        let manager = manager_with(store.clone(), 10);

        let (a, b) = tokio::join!(
            manager.load_file_state("/a.edf"),
            manager.load_file_state("/a.edf")
        );
        assert_eq!(a, b);
        assert_eq!(store.touches.load(Ordering::SeqCst), 1);

        // A later load is a new load.
        let c = manager.load_file_state("/a.edf").await;
        assert_eq!(c.metadata.access_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_module_falls_back_with_warning() {
        let store = Arc::new(TestStore {
            failing_module: Some("analysis"),
            ..TestStore::default()
        });
        let manager = manager_with(store, 10);

        let state = manager.load_file_state("/a.edf").await;
        assert_eq!(state.warnings.len(), 1);
        assert_eq!(state.warnings[0].module_id, "analysis");
        assert_eq!(
            state.get::<AnalysisModule>(),
            Some(AnalysisModule.default_state())
        );
        assert!(state.has_module("plot"));
        assert!(state.has_module("annotations"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_modules_load_in_priority_order() {
        let store = Arc::new(TestStore::default());
        let manager = FileStateManager::new(store.clone(), ManagerConfig::default());
        manager.register_module(AnnotationModule, 30);
        manager.register_module(PlotModule, 10);
        manager.register_module(AnalysisModule, 20);

        manager.load_file_state("/a.edf").await;
        assert_eq!(
            *store.reads.lock(),
            vec!["plot".to_string(), "analysis".into(), "annotations".into()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_replaces_priority() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 10);
        manager.register_module(PlotModule, 99);
        assert_eq!(
            manager.modules(),
            vec![("analysis", 20), ("annotations", 30), ("plot", 99)]
        );
        assert!(manager.unregister_module("plot"));
        assert!(!manager.is_registered("plot"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unflushed_update_visible_to_load() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 10);
        manager.update::<PlotModule>("/a.edf", &zoomed_plot(4.0)).unwrap();
        let state = manager.load_file_state("/a.edf").await;
        assert_eq!(state.get::<PlotModule>(), Some(zoomed_plot(4.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_single_module() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);
        let mut notes = AnnotationState::default();
        notes.add(&AnnotationTarget::Global, Annotation::new("a1", 1.0, "blink"));
        manager.update::<AnnotationModule>("/a.edf", &notes).unwrap();
        manager.update::<PlotModule>("/a.edf", &zoomed_plot(2.0)).unwrap();
        manager.flush().await.unwrap();

        manager
            .clear_file_state("/a.edf", Some("annotations"))
            .await
            .unwrap();
        assert!(store.raw_module_state("/a.edf", "annotations").is_none());
        assert!(store.raw_module_state("/a.edf", "plot").is_some());
        assert!(manager.module_state::<AnnotationModule>("/a.edf").is_none());

        let err = manager.clear_file_state("/a.edf", Some("nope")).await;
        assert!(matches!(err, Err(StateError::UnknownModule(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_whole_file() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);
        manager.open_file("/a.edf").await;
        manager.update::<PlotModule>("/a.edf", &zoomed_plot(2.0)).unwrap();

        manager.clear_file_state("/a.edf", None).await.unwrap();
        assert_eq!(manager.pending_writes(), 0);
        assert!(!manager.is_cached("/a.edf"));
        assert!(manager.active_file_path().is_none());
        assert_eq!(manager.last_active_file_path().as_deref(), Some("/a.edf"));
        assert!(store.get_file_metadata("/a.edf").await.unwrap().is_none());
        assert!(manager.get_tracked_files().await.unwrap().is_empty());

        // Cancelled timer must not resurrect the record.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.raw_module_state("/a.edf", "plot").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_waits_for_save_in_progress() {
        let store = Arc::new(TestStore {
            put_delay: Some(Duration::from_millis(100)),
            ..TestStore::default()
        });
        let manager = manager_with(store.clone(), 10);
        manager.update::<PlotModule>("/a.edf", &zoomed_plot(2.0)).unwrap();

        // Debounce timer has fired and the slow save is under way.
        tokio::time::sleep(Duration::from_millis(2050)).await;
        assert_eq!(manager.pending_writes(), 0);

        manager.clear_file_state("/a.edf", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.inner.raw_module_state("/a.edf", "plot").is_none());
        assert!(manager.get_tracked_files().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_files_independent_of_cache() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 1);
        manager.load_file_state("/a.edf").await;
        manager.load_file_state("/b.edf").await;
        assert!(!manager.is_cached("/a.edf"));
        assert_eq!(
            manager.get_tracked_files().await.unwrap(),
            vec!["/a.edf".to_string(), "/b.edf".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_switch_and_restore() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);
        manager.open_file("/a.edf").await;
        manager.open_file("/b.edf").await;
        assert_eq!(manager.active_file_path().as_deref(), Some("/b.edf"));
        assert_eq!(manager.last_active_file_path().as_deref(), Some("/a.edf"));

        let restarted = manager_with(store, 10);
        let restored = restarted.restore_active_file().await.unwrap().unwrap();
        assert_eq!(restored.file_path, "/b.edf");
        assert_eq!(restored.metadata.access_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_file_flushes() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);
        manager.open_file("/a.edf").await;
        manager.update::<PlotModule>("/a.edf", &zoomed_plot(6.0)).unwrap();
        manager.close_file().await.unwrap();

        assert_eq!(store.module_writes(), 1);
        assert!(manager.active_file_path().is_none());
        assert!(
            restarted_active(&store).await.is_none(),
            "closed file should not be restored"
        );
    }

    async fn restarted_active(store: &Arc<MemoryStore>) -> Option<String> {
        let value = store.get_registry_value(ACTIVE_FILE_KEY).await.unwrap()?;
        value.as_str().map(str::to_string)
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_snapshot() {
        let manager = manager_with(Arc::new(MemoryStore::new()), 10);
        manager.open_file("/a.edf").await;
        let snapshot = manager.registry_snapshot();
        assert_eq!(snapshot.active_file_path.as_deref(), Some("/a.edf"));
        assert!(snapshot.files.contains_key("/a.edf"));
        assert_eq!(snapshot.metadata.version, REGISTRY_VERSION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_nothing_pending() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), 10);
        manager.update::<PlotModule>("/a.edf", &zoomed_plot(2.0)).unwrap();
        manager.update::<PlotModule>("/b.edf", &zoomed_plot(3.0)).unwrap();
        manager.shutdown().await.unwrap();
        assert_eq!(manager.pending_writes(), 0);
        assert_eq!(store.module_writes(), 2);
    }
}
