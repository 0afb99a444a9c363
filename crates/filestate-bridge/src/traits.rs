//! Narrow capability interfaces over application state.
//!
//! Consumers depend on the slice they need (`StreamingStore` for the
//! stream synchronizer, `FileManagerStore` for file selection, ...) rather
//! than on a concrete store. Every mutator is synchronous: the in-memory
//! view reflects the change before the call returns, even when a durable
//! write is scheduled behind it.

use filestate::modules::{AnalysisParameters, TimeWindow};
use filestate::{Annotation, AnnotationState, AnnotationTarget};
use serde::{Deserialize, Serialize};

use crate::streaming::{DataChunk, StreamResult, StreamSession, StreamState, StreamStats};

// ── Navigation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationSnapshot {
    pub primary: String,
    pub secondary: Option<String>,
    pub sidebar_open: bool,
}

impl Default for NavigationSnapshot {
    fn default() -> Self {
        Self {
            primary: "overview".to_string(),
            secondary: None,
            sidebar_open: true,
        }
    }
}

pub trait NavigationStore: Send + Sync {
    fn navigation(&self) -> NavigationSnapshot;
    /// Switching the primary section resets the secondary one.
    fn set_primary_nav(&self, primary: &str);
    fn set_secondary_nav(&self, secondary: Option<&str>);
    fn set_sidebar_open(&self, open: bool);
}

// ── File manager ─────────────────────────────────────────────────────

pub trait FileManagerStore: Send + Sync {
    fn selected_file(&self) -> Option<String>;
    /// Change the selected file. Does not load per-file state; hosts backed
    /// by a file state manager hydrate separately.
    fn select_file(&self, file_path: Option<&str>);
    fn selected_channels(&self) -> Vec<String>;
    fn set_selected_channels(&self, channels: Vec<String>);
    fn time_window(&self) -> Option<TimeWindow>;
    fn set_time_window(&self, window: Option<TimeWindow>);
}

// ── Analysis ─────────────────────────────────────────────────────────

pub trait AnalysisStore: Send + Sync {
    fn current_analysis(&self) -> Option<String>;
    fn set_current_analysis(&self, analysis_id: Option<&str>);
    fn analysis_running(&self) -> bool;
    fn set_analysis_running(&self, running: bool);
    fn analysis_parameters(&self) -> AnalysisParameters;
    fn set_analysis_parameters(&self, parameters: AnalysisParameters);
    fn selected_variants(&self) -> Vec<String>;
    fn set_selected_variants(&self, variants: Vec<String>);
    /// Ids of past analyses for the selected file, newest first.
    fn analysis_history_ids(&self) -> Vec<String>;
}

// ── Streaming ────────────────────────────────────────────────────────

pub trait StreamingStore: Send + Sync {
    fn stream_session(&self, stream_id: &str) -> Option<StreamSession>;
    fn stream_ids(&self) -> Vec<String>;
    /// Create an idle session if none exists. Returns true when created.
    fn ensure_stream_session(&self, stream_id: &str) -> bool;
    fn set_stream_state(&self, stream_id: &str, state: StreamState);
    /// Record an error and move the session to [`StreamState::Error`].
    fn set_stream_error(&self, stream_id: &str, error: &str);
    fn set_stream_stats(&self, stream_id: &str, stats: StreamStats);
    fn replace_stream_data(&self, stream_id: &str, chunks: Vec<DataChunk>);
    fn replace_stream_results(&self, stream_id: &str, results: Vec<StreamResult>);
    fn clear_stream_buffers(&self, stream_id: &str);
    /// Empty buffers, stats and last error while keeping the session.
    fn reset_stream_session(&self, stream_id: &str);
    fn remove_stream_session(&self, stream_id: &str) -> bool;
    fn has_stream_session(&self, stream_id: &str) -> bool;
}

// ── Annotations ──────────────────────────────────────────────────────

pub trait AnnotationStore: Send + Sync {
    /// Annotations of the selected file.
    fn annotations(&self) -> AnnotationState;
    /// Returns `false` and changes nothing if the id is already in use.
    fn add_annotation(&self, target: AnnotationTarget, annotation: Annotation) -> bool;
    fn remove_annotation(&self, annotation_id: &str) -> Option<Annotation>;
}

// ── Aggregate ────────────────────────────────────────────────────────

/// Everything downstream services may read or mutate.
pub trait StateManager:
    NavigationStore + FileManagerStore + AnalysisStore + StreamingStore + AnnotationStore
{
}

impl<T> StateManager for T where
    T: NavigationStore + FileManagerStore + AnalysisStore + StreamingStore + AnnotationStore
{
}
