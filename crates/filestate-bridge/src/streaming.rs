//! Stream session types held in the streaming slice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Lifecycle of a live stream.
///
/// `Stopped` and `Error` are terminal for a session; only a fresh
/// transition to `Running` starts a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    Running,
    Stopped,
    Error,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Error)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Running => write!(f, "running"),
            StreamState::Stopped => write!(f, "stopped"),
            StreamState::Error => write!(f, "error"),
        }
    }
}

/// One block of raw samples pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    pub sequence: u64,
    /// Seconds since stream start of the first sample.
    pub timestamp: f64,
    pub channels: Vec<String>,
    /// One row per channel.
    pub samples: Vec<Vec<f32>>,
}

/// One analysis result computed over streamed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub id: String,
    pub chunk_sequence: u64,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub values: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    #[serde(default)]
    pub chunks_received: u64,
    #[serde(default)]
    pub results_generated: u64,
    #[serde(default)]
    pub dropped_chunks: u64,
    #[serde(default)]
    pub throughput_hz: f64,
}

/// Capacities of the per-session buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub data_capacity: usize,
    pub results_capacity: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            data_capacity: 100,
            results_capacity: 50,
        }
    }
}

/// FIFO that drops its oldest items once full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.push(item);
        }
    }

    /// Replace the contents, keeping only the newest `capacity` items.
    pub fn replace<I: IntoIterator<Item = T>>(&mut self, items: I) {
        self.items.clear();
        self.extend(items);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }
}

impl<T: Clone> BoundedBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// In-memory view of one live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub stream_id: String,
    pub state: StreamState,
    pub stats: StreamStats,
    pub data: BoundedBuffer<DataChunk>,
    pub results: BoundedBuffer<StreamResult>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new(stream_id: impl Into<String>, limits: BufferLimits) -> Self {
        let now = Utc::now();
        Self {
            stream_id: stream_id.into(),
            state: StreamState::Idle,
            stats: StreamStats::default(),
            data: BoundedBuffer::new(limits.data_capacity),
            results: BoundedBuffer::new(limits.results_capacity),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
