use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// The durable store could not be reached or returned a corrupt record.
    #[error("retrieval error for {file_path} [{module_id}]: {message}")]
    Retrieval {
        file_path: String,
        module_id: String,
        message: String,
    },

    /// A record deserialized but was rejected by its module's validator.
    #[error("validation error for module {module_id}: {message}")]
    Validation { module_id: String, message: String },

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(String),
}

impl StateError {
    pub fn retrieval(file_path: &str, module_id: &str, message: impl ToString) -> Self {
        StateError::Retrieval {
            file_path: file_path.to_string(),
            module_id: module_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn validation(module_id: &str, message: impl ToString) -> Self {
        StateError::Validation {
            module_id: module_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn store(message: impl ToString) -> Self {
        StateError::Store(message.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
