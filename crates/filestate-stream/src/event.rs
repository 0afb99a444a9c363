//! Backend push events and the per-(stream, kind) debouncer.

use filestate_bridge::{StreamState, StreamStats};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A notification pushed by the streaming backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChanged {
        stream_id: String,
        state: StreamState,
    },
    DataReceived {
        stream_id: String,
        chunks_count: usize,
    },
    ResultsReady {
        stream_id: String,
        results_count: usize,
    },
    Error {
        stream_id: String,
        error: String,
    },
    StatsUpdate {
        stream_id: String,
        stats: StreamStats,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    DataReceived,
    ResultsReady,
    Error,
    StatsUpdate,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StateChanged => "state_changed",
            EventKind::DataReceived => "data_received",
            EventKind::ResultsReady => "results_ready",
            EventKind::Error => "error",
            EventKind::StatsUpdate => "stats_update",
        }
    }

    /// State changes and errors are never debounced.
    pub fn is_critical(self) -> bool {
        matches!(self, EventKind::StateChanged | EventKind::Error)
    }
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::StateChanged { stream_id, .. }
            | StreamEvent::DataReceived { stream_id, .. }
            | StreamEvent::ResultsReady { stream_id, .. }
            | StreamEvent::Error { stream_id, .. }
            | StreamEvent::StatsUpdate { stream_id, .. } => stream_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::StateChanged { .. } => EventKind::StateChanged,
            StreamEvent::DataReceived { .. } => EventKind::DataReceived,
            StreamEvent::ResultsReady { .. } => EventKind::ResultsReady,
            StreamEvent::Error { .. } => EventKind::Error,
            StreamEvent::StatsUpdate { .. } => EventKind::StatsUpdate,
        }
    }
}

/// Admits the first non-critical event per `(stream_id, kind)` in each
/// window and drops the rest. Dropped events are not merged; the polling
/// fallback picks up anything they would have fetched.
#[derive(Debug)]
pub struct EventDebouncer {
    window: Duration,
    last: HashMap<(String, EventKind), Instant>,
}

impl EventDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn admit(&mut self, event: &StreamEvent, now: Instant) -> bool {
        let kind = event.kind();
        if kind.is_critical() {
            return true;
        }
        let key = (event.stream_id().to_string(), kind);
        match self.last.get(&key) {
            Some(opened) if now.saturating_duration_since(*opened) < self.window => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }

    /// Drop all window state for a stream.
    pub fn forget(&mut self, stream_id: &str) {
        self.last.retain(|(id, _), _| id != stream_id);
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}
