#![doc = include_str!("../README.md")]

pub mod app;
pub mod error;
pub mod history;
pub mod registry;
pub mod streaming;
pub mod traits;
pub mod workflow;

pub use app::AppStateManager;
pub use error::{BridgeError, RecordingError, Result};
pub use history::{DEFAULT_HISTORY_LIMIT, UndoHistory, UndoableAction};
pub use registry::{get_state_manager, is_state_manager_registered, register_state_manager};
pub use streaming::{
    BoundedBuffer, BufferLimits, DataChunk, StreamResult, StreamSession, StreamState, StreamStats,
};
pub use traits::{
    AnalysisStore, AnnotationStore, FileManagerStore, NavigationSnapshot, NavigationStore,
    StateManager, StreamingStore,
};
pub use workflow::{
    RecordedAction, RecordingStateManager, WorkflowAction, WorkflowRecorder, WorkflowTransport,
    next_sequence,
};
