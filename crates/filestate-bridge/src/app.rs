//! In-memory [`StateManager`](crate::StateManager) implementation.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use filestate::modules::{
    AnalysisHistoryEntry, AnalysisParameters, MAX_ANALYSIS_HISTORY, TimeWindow,
};
use filestate::{
    AnalysisModule, AnalysisState, Annotation, AnnotationModule, AnnotationState,
    AnnotationTarget, FileSpecificState, FileStateManager, PlotModule, StateModule,
};

use crate::error::Result;
use crate::streaming::{
    BufferLimits, DataChunk, StreamResult, StreamSession, StreamState, StreamStats,
};
use crate::traits::{
    AnalysisStore, AnnotationStore, FileManagerStore, NavigationSnapshot, NavigationStore,
    StreamingStore,
};

#[derive(Debug, Default)]
struct FileSlice {
    selected_file: Option<String>,
    selected_channels: Vec<String>,
    time_window: Option<TimeWindow>,
}

#[derive(Debug, Default)]
struct AnalysisSlice {
    current: Option<String>,
    running: bool,
    parameters: AnalysisParameters,
    selected_variants: Vec<String>,
    history_ids: Vec<String>,
}

/// The application's state store.
///
/// Without a [`FileStateManager`] it is a plain in-memory store. With one,
/// [`open_file`](Self::open_file) hydrates the file-scoped slices from the
/// loaded per-file state, and channel, time-window, analysis and annotation
/// mutations are written through as debounced module updates for the
/// opened file.
#[derive(Debug, Default)]
pub struct AppStateManager {
    navigation: RwLock<NavigationSnapshot>,
    files: RwLock<FileSlice>,
    analysis: RwLock<AnalysisSlice>,
    annotations: RwLock<AnnotationState>,
    streams: RwLock<BTreeMap<String, StreamSession>>,
    file_state: Option<FileStateManager>,
    limits: BufferLimits,
}

impl AppStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_state(manager: FileStateManager) -> Self {
        Self {
            file_state: Some(manager),
            ..Self::default()
        }
    }

    pub fn with_buffer_limits(mut self, limits: BufferLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn file_state(&self) -> Option<&FileStateManager> {
        self.file_state.as_ref()
    }

    pub fn buffer_limits(&self) -> BufferLimits {
        self.limits
    }

    /// Select `file_path` and, when backed by a file state manager, load its
    /// state and hydrate the file-scoped slices from it.
    pub async fn open_file(&self, file_path: &str) -> Option<FileSpecificState> {
        let Some(manager) = &self.file_state else {
            self.select_file(Some(file_path));
            return None;
        };
        let state = manager.open_file(file_path).await;
        for warning in &state.warnings {
            tracing::warn!(file = %file_path, module = %warning.module_id, "{}", warning.message);
        }
        self.hydrate(&state);
        Some(state)
    }

    /// Flush the selected file's pending writes and reset file-scoped slices.
    pub async fn close_file(&self) -> Result<()> {
        if let Some(manager) = &self.file_state {
            manager.close_file().await?;
        }
        *self.files.write() = FileSlice::default();
        *self.analysis.write() = AnalysisSlice::default();
        *self.annotations.write() = AnnotationState::default();
        Ok(())
    }

    /// Add a finished analysis to the selected file's history and make it
    /// current.
    pub fn record_analysis(&self, entry: AnalysisHistoryEntry) {
        {
            let mut analysis = self.analysis.write();
            analysis.history_ids.retain(|id| id != &entry.id);
            analysis.history_ids.insert(0, entry.id.clone());
            analysis.history_ids.truncate(MAX_ANALYSIS_HISTORY);
            analysis.current = Some(entry.id.clone());
            analysis.running = false;
        }
        self.write_through::<AnalysisModule>(|state| state.record(entry));
    }

    fn hydrate(&self, state: &FileSpecificState) {
        let plot = state
            .get::<PlotModule>()
            .unwrap_or_else(|| PlotModule.default_state());
        let analysis = state
            .get::<AnalysisModule>()
            .unwrap_or_else(|| AnalysisModule.default_state());
        let annotations = state
            .get::<AnnotationModule>()
            .unwrap_or_else(|| AnnotationModule.default_state());

        *self.files.write() = FileSlice {
            selected_file: Some(state.file_path.clone()),
            selected_channels: plot.selected_channels,
            time_window: plot.time_window,
        };
        *self.analysis.write() = AnalysisSlice {
            current: analysis.current_analysis_id.clone(),
            running: false,
            parameters: analysis.last_parameters.clone().unwrap_or_default(),
            selected_variants: analysis.selected_variants.clone(),
            history_ids: analysis.history.iter().map(|e| e.id.clone()).collect(),
        };
        *self.annotations.write() = annotations;
    }

    /// Apply `edit` to the selected file's `M` slot and queue the write.
    ///
    /// Only the manager's active file is written; its slots were loaded from
    /// the store, so the edit never overwrites persisted fields with defaults.
    fn write_through<M: StateModule>(&self, edit: impl FnOnce(&mut M::State)) {
        let Some(manager) = &self.file_state else {
            return;
        };
        let Some(path) = self.selected_file() else {
            return;
        };
        if manager.active_file_path().as_deref() != Some(path.as_str()) {
            tracing::warn!(file = %path, module = M::ID, "selected file is not open, change kept in memory only");
            return;
        }
        let Some(mut state) = manager.module_state::<M>(&path) else {
            tracing::warn!(file = %path, module = M::ID, "module state not loaded, change kept in memory only");
            return;
        };
        edit(&mut state);
        if let Err(e) = manager.update::<M>(&path, &state) {
            tracing::warn!(file = %path, module = M::ID, error = %e, "write-through failed");
        }
    }

    fn with_session(&self, stream_id: &str, f: impl FnOnce(&mut StreamSession)) {
        let mut streams = self.streams.write();
        let session = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamSession::new(stream_id, self.limits));
        f(session);
        session.touch();
    }
}

// ── Navigation ───────────────────────────────────────────────────────

impl NavigationStore for AppStateManager {
    fn navigation(&self) -> NavigationSnapshot {
        self.navigation.read().clone()
    }

    fn set_primary_nav(&self, primary: &str) {
        let mut nav = self.navigation.write();
        if nav.primary != primary {
            nav.primary = primary.to_string();
            nav.secondary = None;
        }
    }

    fn set_secondary_nav(&self, secondary: Option<&str>) {
        self.navigation.write().secondary = secondary.map(str::to_string);
    }

    fn set_sidebar_open(&self, open: bool) {
        self.navigation.write().sidebar_open = open;
    }
}

// ── File manager ─────────────────────────────────────────────────────

impl FileManagerStore for AppStateManager {
    fn selected_file(&self) -> Option<String> {
        self.files.read().selected_file.clone()
    }

    fn select_file(&self, file_path: Option<&str>) {
        let mut files = self.files.write();
        if files.selected_file.as_deref() != file_path {
            *files = FileSlice {
                selected_file: file_path.map(str::to_string),
                ..FileSlice::default()
            };
        }
    }

    fn selected_channels(&self) -> Vec<String> {
        self.files.read().selected_channels.clone()
    }

    fn set_selected_channels(&self, channels: Vec<String>) {
        self.files.write().selected_channels = channels.clone();
        self.write_through::<PlotModule>(|plot| plot.selected_channels = channels);
    }

    fn time_window(&self) -> Option<TimeWindow> {
        self.files.read().time_window
    }

    fn set_time_window(&self, window: Option<TimeWindow>) {
        self.files.write().time_window = window;
        self.write_through::<PlotModule>(|plot| plot.time_window = window);
    }
}

// ── Analysis ─────────────────────────────────────────────────────────

impl AnalysisStore for AppStateManager {
    fn current_analysis(&self) -> Option<String> {
        self.analysis.read().current.clone()
    }

    fn set_current_analysis(&self, analysis_id: Option<&str>) {
        self.analysis.write().current = analysis_id.map(str::to_string);
        let id = analysis_id.map(str::to_string);
        self.write_through::<AnalysisModule>(|state: &mut AnalysisState| {
            // Only ids present in the history are persisted as current.
            match id {
                Some(id) if state.history.iter().any(|e| e.id == id) => {
                    state.current_analysis_id = Some(id)
                }
                Some(_) => {}
                None => state.current_analysis_id = None,
            }
        });
    }

    fn analysis_running(&self) -> bool {
        self.analysis.read().running
    }

    fn set_analysis_running(&self, running: bool) {
        self.analysis.write().running = running;
    }

    fn analysis_parameters(&self) -> AnalysisParameters {
        self.analysis.read().parameters.clone()
    }

    fn set_analysis_parameters(&self, parameters: AnalysisParameters) {
        self.analysis.write().parameters = parameters.clone();
        self.write_through::<AnalysisModule>(|state| state.last_parameters = Some(parameters));
    }

    fn selected_variants(&self) -> Vec<String> {
        self.analysis.read().selected_variants.clone()
    }

    fn set_selected_variants(&self, variants: Vec<String>) {
        self.analysis.write().selected_variants = variants.clone();
        self.write_through::<AnalysisModule>(|state| state.selected_variants = variants);
    }

    fn analysis_history_ids(&self) -> Vec<String> {
        self.analysis.read().history_ids.clone()
    }
}

// ── Streaming ────────────────────────────────────────────────────────

impl StreamingStore for AppStateManager {
    fn stream_session(&self, stream_id: &str) -> Option<StreamSession> {
        self.streams.read().get(stream_id).cloned()
    }

    fn stream_ids(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    fn ensure_stream_session(&self, stream_id: &str) -> bool {
        let mut streams = self.streams.write();
        if streams.contains_key(stream_id) {
            return false;
        }
        streams.insert(
            stream_id.to_string(),
            StreamSession::new(stream_id, self.limits),
        );
        true
    }

    fn set_stream_state(&self, stream_id: &str, state: StreamState) {
        self.with_session(stream_id, |s| {
            s.state = state;
            if state != StreamState::Error {
                s.last_error = None;
            }
        });
    }

    fn set_stream_error(&self, stream_id: &str, error: &str) {
        self.with_session(stream_id, |s| {
            s.state = StreamState::Error;
            s.last_error = Some(error.to_string());
        });
    }

    fn set_stream_stats(&self, stream_id: &str, stats: StreamStats) {
        self.with_session(stream_id, |s| s.stats = stats);
    }

    fn replace_stream_data(&self, stream_id: &str, chunks: Vec<DataChunk>) {
        self.with_session(stream_id, |s| s.data.replace(chunks));
    }

    fn replace_stream_results(&self, stream_id: &str, results: Vec<StreamResult>) {
        self.with_session(stream_id, |s| s.results.replace(results));
    }

    fn clear_stream_buffers(&self, stream_id: &str) {
        if let Some(session) = self.streams.write().get_mut(stream_id) {
            session.data.clear();
            session.results.clear();
            session.touch();
        }
    }

    fn reset_stream_session(&self, stream_id: &str) {
        if let Some(session) = self.streams.write().get_mut(stream_id) {
            session.data.clear();
            session.results.clear();
            session.stats = StreamStats::default();
            session.last_error = None;
            session.touch();
        }
    }

    fn remove_stream_session(&self, stream_id: &str) -> bool {
        self.streams.write().remove(stream_id).is_some()
    }

    fn has_stream_session(&self, stream_id: &str) -> bool {
        self.streams.read().contains_key(stream_id)
    }
}

// ── Annotations ──────────────────────────────────────────────────────

impl AnnotationStore for AppStateManager {
    fn annotations(&self) -> AnnotationState {
        self.annotations.read().clone()
    }

    fn add_annotation(&self, target: AnnotationTarget, annotation: Annotation) -> bool {
        {
            let mut annotations = self.annotations.write();
            if annotations.contains(&annotation.id) {
                tracing::warn!(annotation = %annotation.id, "duplicate annotation id rejected");
                return false;
            }
            annotations.add(&target, annotation.clone());
        }
        self.write_through::<AnnotationModule>(|state| state.add(&target, annotation));
        true
    }

    fn remove_annotation(&self, annotation_id: &str) -> Option<Annotation> {
        let removed = self.annotations.write().remove(annotation_id);
        if removed.is_some() {
            self.write_through::<AnnotationModule>(|state| {
                state.remove(annotation_id);
            });
        }
        removed
    }
}
