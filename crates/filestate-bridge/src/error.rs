use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// `get_state_manager` was called before `register_state_manager`.
    #[error("no state manager factory registered")]
    NotRegistered,

    #[error(transparent)]
    State(#[from] filestate::StateError),
}

/// A workflow log write failed. Always logged and swallowed.
#[derive(Debug, Clone, Error)]
#[error("workflow recording failed: {0}")]
pub struct RecordingError(pub String);

impl RecordingError {
    pub fn new(message: impl ToString) -> Self {
        RecordingError(message.to_string())
    }
}
