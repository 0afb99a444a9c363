//! Workflow recording.
//!
//! Every recorded action is stamped with a wall-clock timestamp and a
//! process-wide sequence number at the moment it is captured, before the
//! transport call is spawned. Transport calls may complete in any order;
//! sorting by `sequence` recovers the order the actions happened in.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use filestate::modules::{AnalysisParameters, TimeWindow};
use filestate::{Annotation, AnnotationState, AnnotationTarget};

use crate::error::RecordingError;
use crate::streaming::{DataChunk, StreamResult, StreamSession, StreamState, StreamStats};
use crate::traits::{
    AnalysisStore, AnnotationStore, FileManagerStore, NavigationSnapshot, NavigationStore,
    StateManager, StreamingStore,
};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Next value of the process-wide action sequence. Strictly increasing.
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst) + 1
}

/// A recordable user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowAction {
    LoadFile {
        path: String,
    },
    CloseFile {
        path: String,
    },
    SelectChannels {
        channels: Vec<String>,
    },
    DeselectChannels {
        channels: Vec<String>,
    },
    SelectAllChannels {
        channels: Vec<String>,
    },
    ClearChannelSelection,
    SetTimeWindow {
        start: f64,
        end: f64,
    },
    ClearTimeWindow,
    SetAnalysisParameters {
        parameters: AnalysisParameters,
    },
    SelectVariants {
        variants: Vec<String>,
    },
    RunAnalysis {
        channels: Vec<String>,
        variants: Vec<String>,
        parameters: AnalysisParameters,
        #[serde(default)]
        ct_channel_pairs: Vec<[String; 2]>,
        #[serde(default)]
        cd_channel_pairs: Vec<[String; 2]>,
    },
    ExportResults {
        analysis_id: Option<String>,
        format: String,
        path: String,
    },
    AddAnnotation {
        target: AnnotationTarget,
        annotation_id: String,
        position: f64,
        label: String,
    },
    RemoveAnnotation {
        annotation_id: String,
    },
}

impl WorkflowAction {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowAction::LoadFile { .. } => "LOAD_FILE",
            WorkflowAction::CloseFile { .. } => "CLOSE_FILE",
            WorkflowAction::SelectChannels { .. } => "SELECT_CHANNELS",
            WorkflowAction::DeselectChannels { .. } => "DESELECT_CHANNELS",
            WorkflowAction::SelectAllChannels { .. } => "SELECT_ALL_CHANNELS",
            WorkflowAction::ClearChannelSelection => "CLEAR_CHANNEL_SELECTION",
            WorkflowAction::SetTimeWindow { .. } => "SET_TIME_WINDOW",
            WorkflowAction::ClearTimeWindow => "CLEAR_TIME_WINDOW",
            WorkflowAction::SetAnalysisParameters { .. } => "SET_ANALYSIS_PARAMETERS",
            WorkflowAction::SelectVariants { .. } => "SELECT_VARIANTS",
            WorkflowAction::RunAnalysis { .. } => "RUN_ANALYSIS",
            WorkflowAction::ExportResults { .. } => "EXPORT_RESULTS",
            WorkflowAction::AddAnnotation { .. } => "ADD_ANNOTATION",
            WorkflowAction::RemoveAnnotation { .. } => "REMOVE_ANNOTATION",
        }
    }
}

/// An action as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedAction {
    pub action: WorkflowAction,
    pub active_file_id: Option<String>,
    /// RFC 3339, millisecond precision. Advisory only.
    pub timestamp: String,
    pub sequence: u64,
}

/// Destination of recorded actions (IPC call, log file, ...).
#[async_trait]
pub trait WorkflowTransport: Send + Sync {
    async fn record(&self, action: RecordedAction) -> Result<(), RecordingError>;
}

/// Captures actions and dispatches them to a [`WorkflowTransport`] without
/// waiting for the result.
pub struct WorkflowRecorder {
    transport: Arc<dyn WorkflowTransport>,
    enabled: AtomicBool,
    failures: Arc<AtomicU64>,
}

impl std::fmt::Debug for WorkflowRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRecorder")
            .field("enabled", &self.is_enabled())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

impl WorkflowRecorder {
    pub fn new(transport: Arc<dyn WorkflowTransport>) -> Self {
        Self {
            transport,
            enabled: AtomicBool::new(true),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Transport failures observed so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Stamp `action` and send it in the background.
    ///
    /// Returns the stamped record, or `None` while recording is disabled.
    /// Never fails: transport errors are logged and counted.
    pub fn record(
        &self,
        action: WorkflowAction,
        active_file_id: Option<String>,
    ) -> Option<RecordedAction> {
        if !self.is_enabled() {
            return None;
        }
        let recorded = RecordedAction {
            action,
            active_file_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            sequence: next_sequence(),
        };
        self.dispatch(recorded.clone());
        Some(recorded)
    }

    fn dispatch(&self, recorded: RecordedAction) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(sequence = recorded.sequence, "no runtime, workflow action dropped");
            self.failures.fetch_add(1, Ordering::SeqCst);
            return;
        };
        let transport = self.transport.clone();
        let failures = self.failures.clone();
        runtime.spawn(async move {
            let sequence = recorded.sequence;
            let kind = recorded.action.kind();
            if let Err(e) = transport.record(recorded).await {
                failures.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(sequence, action = kind, error = %e, "workflow recording failed");
            }
        });
    }
}

// ── Middleware ───────────────────────────────────────────────────────

/// A [`StateManager`] decorator that records workflow actions as the
/// matching mutations happen. Reads pass straight through.
pub struct RecordingStateManager<S: ?Sized> {
    inner: Arc<S>,
    recorder: Arc<WorkflowRecorder>,
}

impl<S: StateManager + ?Sized> RecordingStateManager<S> {
    pub fn new(inner: Arc<S>, recorder: Arc<WorkflowRecorder>) -> Self {
        Self { inner, recorder }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn recorder(&self) -> &Arc<WorkflowRecorder> {
        &self.recorder
    }

    fn record(&self, action: WorkflowAction) {
        self.recorder.record(action, self.inner.selected_file());
    }

    /// Select every channel in `channels`.
    pub fn select_all_channels(&self, channels: Vec<String>) {
        self.inner.set_selected_channels(channels.clone());
        self.record(WorkflowAction::SelectAllChannels { channels });
    }

    /// Mark an analysis as started with explicit channel pairs.
    pub fn run_analysis(
        &self,
        ct_channel_pairs: Vec<[String; 2]>,
        cd_channel_pairs: Vec<[String; 2]>,
    ) {
        self.inner.set_analysis_running(true);
        self.record(WorkflowAction::RunAnalysis {
            channels: self.inner.selected_channels(),
            variants: self.inner.selected_variants(),
            parameters: self.inner.analysis_parameters(),
            ct_channel_pairs,
            cd_channel_pairs,
        });
    }

    pub fn record_export(&self, format: &str, path: &str) {
        self.record(WorkflowAction::ExportResults {
            analysis_id: self.inner.current_analysis(),
            format: format.to_string(),
            path: path.to_string(),
        });
    }
}

impl<S: StateManager + ?Sized> NavigationStore for RecordingStateManager<S> {
    fn navigation(&self) -> NavigationSnapshot {
        self.inner.navigation()
    }

    fn set_primary_nav(&self, primary: &str) {
        self.inner.set_primary_nav(primary)
    }

    fn set_secondary_nav(&self, secondary: Option<&str>) {
        self.inner.set_secondary_nav(secondary)
    }

    fn set_sidebar_open(&self, open: bool) {
        self.inner.set_sidebar_open(open)
    }
}

impl<S: StateManager + ?Sized> FileManagerStore for RecordingStateManager<S> {
    fn selected_file(&self) -> Option<String> {
        self.inner.selected_file()
    }

    fn select_file(&self, file_path: Option<&str>) {
        let previous = self.inner.selected_file();
        if previous.as_deref() == file_path {
            return;
        }
        if let Some(path) = previous {
            self.record(WorkflowAction::CloseFile { path });
        }
        self.inner.select_file(file_path);
        if let Some(path) = file_path {
            self.record(WorkflowAction::LoadFile {
                path: path.to_string(),
            });
        }
    }

    fn selected_channels(&self) -> Vec<String> {
        self.inner.selected_channels()
    }

    fn set_selected_channels(&self, channels: Vec<String>) {
        let previous = self.inner.selected_channels();
        self.inner.set_selected_channels(channels.clone());

        if channels.is_empty() {
            if !previous.is_empty() {
                self.record(WorkflowAction::ClearChannelSelection);
            }
            return;
        }
        let before: HashSet<&String> = previous.iter().collect();
        let after: HashSet<&String> = channels.iter().collect();
        let added: Vec<String> = channels
            .iter()
            .filter(|c| !before.contains(c))
            .cloned()
            .collect();
        let removed: Vec<String> = previous
            .iter()
            .filter(|c| !after.contains(c))
            .cloned()
            .collect();
        if !added.is_empty() {
            self.record(WorkflowAction::SelectChannels { channels: added });
        }
        if !removed.is_empty() {
            self.record(WorkflowAction::DeselectChannels { channels: removed });
        }
    }

    fn time_window(&self) -> Option<TimeWindow> {
        self.inner.time_window()
    }

    fn set_time_window(&self, window: Option<TimeWindow>) {
        let had_window = self.inner.time_window().is_some();
        self.inner.set_time_window(window);
        match window {
            Some(w) => {
                self.record(WorkflowAction::SetTimeWindow {
                    start: w.start,
                    end: w.end,
                });
            }
            None if had_window => {
                self.record(WorkflowAction::ClearTimeWindow);
            }
            None => {}
        }
    }
}

impl<S: StateManager + ?Sized> AnalysisStore for RecordingStateManager<S> {
    fn current_analysis(&self) -> Option<String> {
        self.inner.current_analysis()
    }

    fn set_current_analysis(&self, analysis_id: Option<&str>) {
        self.inner.set_current_analysis(analysis_id)
    }

    fn analysis_running(&self) -> bool {
        self.inner.analysis_running()
    }

    fn set_analysis_running(&self, running: bool) {
        if running && !self.inner.analysis_running() {
            self.run_analysis(Vec::new(), Vec::new());
        } else {
            self.inner.set_analysis_running(running);
        }
    }

    fn analysis_parameters(&self) -> AnalysisParameters {
        self.inner.analysis_parameters()
    }

    fn set_analysis_parameters(&self, parameters: AnalysisParameters) {
        self.inner.set_analysis_parameters(parameters.clone());
        self.record(WorkflowAction::SetAnalysisParameters { parameters });
    }

    fn selected_variants(&self) -> Vec<String> {
        self.inner.selected_variants()
    }

    fn set_selected_variants(&self, variants: Vec<String>) {
        self.inner.set_selected_variants(variants.clone());
        self.record(WorkflowAction::SelectVariants { variants });
    }

    fn analysis_history_ids(&self) -> Vec<String> {
        self.inner.analysis_history_ids()
    }
}

impl<S: StateManager + ?Sized> StreamingStore for RecordingStateManager<S> {
    fn stream_session(&self, stream_id: &str) -> Option<StreamSession> {
        self.inner.stream_session(stream_id)
    }

    fn stream_ids(&self) -> Vec<String> {
        self.inner.stream_ids()
    }

    fn ensure_stream_session(&self, stream_id: &str) -> bool {
        self.inner.ensure_stream_session(stream_id)
    }

    fn set_stream_state(&self, stream_id: &str, state: StreamState) {
        self.inner.set_stream_state(stream_id, state)
    }

    fn set_stream_error(&self, stream_id: &str, error: &str) {
        self.inner.set_stream_error(stream_id, error)
    }

    fn set_stream_stats(&self, stream_id: &str, stats: StreamStats) {
        self.inner.set_stream_stats(stream_id, stats)
    }

    fn replace_stream_data(&self, stream_id: &str, chunks: Vec<DataChunk>) {
        self.inner.replace_stream_data(stream_id, chunks)
    }

    fn replace_stream_results(&self, stream_id: &str, results: Vec<StreamResult>) {
        self.inner.replace_stream_results(stream_id, results)
    }

    fn clear_stream_buffers(&self, stream_id: &str) {
        self.inner.clear_stream_buffers(stream_id)
    }

    fn reset_stream_session(&self, stream_id: &str) {
        self.inner.reset_stream_session(stream_id)
    }

    fn remove_stream_session(&self, stream_id: &str) -> bool {
        self.inner.remove_stream_session(stream_id)
    }

    fn has_stream_session(&self, stream_id: &str) -> bool {
        self.inner.has_stream_session(stream_id)
    }
}

impl<S: StateManager + ?Sized> AnnotationStore for RecordingStateManager<S> {
    fn annotations(&self) -> AnnotationState {
        self.inner.annotations()
    }

    fn add_annotation(&self, target: AnnotationTarget, annotation: Annotation) -> bool {
        let action = WorkflowAction::AddAnnotation {
            target: target.clone(),
            annotation_id: annotation.id.clone(),
            position: annotation.position,
            label: annotation.label.clone(),
        };
        let added = self.inner.add_annotation(target, annotation);
        if added {
            self.record(action);
        }
        added
    }

    fn remove_annotation(&self, annotation_id: &str) -> Option<Annotation> {
        let removed = self.inner.remove_annotation(annotation_id);
        if removed.is_some() {
            self.record(WorkflowAction::RemoveAnnotation {
                annotation_id: annotation_id.to_string(),
            });
        }
        removed
    }
}
