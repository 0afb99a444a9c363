use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// A pull from the backend failed. Transient; the next poll retries.
    #[error("fetch {operation} for stream {stream_id} failed: {message}")]
    Fetch {
        stream_id: String,
        operation: &'static str,
        message: String,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("stream sync service is shut down")]
    ShutDown,
}

impl StreamError {
    pub fn fetch(stream_id: &str, operation: &'static str, message: impl ToString) -> Self {
        StreamError::Fetch {
            stream_id: stream_id.to_string(),
            operation,
            message: message.to_string(),
        }
    }

    pub fn backend(message: impl ToString) -> Self {
        StreamError::Backend(message.to_string())
    }
}
