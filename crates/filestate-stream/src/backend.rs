use async_trait::async_trait;
use filestate_bridge::{DataChunk, StreamResult, StreamState, StreamStats};

use crate::error::Result;

/// Pull contract of the streaming backend, used for catch-up after push
/// events and by the polling fallback.
#[async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// The most recent `count` chunks, oldest first.
    async fn get_stream_data(&self, stream_id: &str, count: usize) -> Result<Vec<DataChunk>>;

    /// The most recent `count` results, oldest first.
    async fn get_stream_results(&self, stream_id: &str, count: usize) -> Result<Vec<StreamResult>>;

    async fn get_stream_stats(&self, stream_id: &str) -> Result<StreamStats>;

    async fn get_stream_state(&self, stream_id: &str) -> Result<StreamState>;

    /// Truncate the backend's buffers for a stream.
    async fn clear_stream_buffers(&self, stream_id: &str) -> Result<()>;

    async fn list_streams(&self) -> Result<Vec<String>>;
}
