#![doc = include_str!("../README.md")]

pub mod backend;
pub mod error;
pub mod event;
pub mod service;

pub use backend::StreamBackend;
pub use error::{Result, StreamError};
pub use event::{EventDebouncer, EventKind, StreamEvent};
pub use service::{StreamSyncConfig, StreamSyncService, SyncMetrics};
