#![doc = include_str!("../README.md")]

pub mod cache;
pub mod error;
pub mod manager;
pub mod module;
pub mod modules;
pub mod store;
pub mod types;

pub use cache::FileStateCache;
pub use error::{Result, StateError};
pub use manager::{ACTIVE_FILE_KEY, FileStateManager, ManagerConfig};
pub use module::{DynModule, ModuleDescriptor, StateModule};
pub use modules::{
    AnalysisModule, AnalysisState, Annotation, AnnotationModule, AnnotationState,
    AnnotationTarget, PlotModule, PlotState,
};
pub use store::{MemoryStore, StateStore};
pub use types::{
    FileMetadata, FileSpecificState, FileStateRegistry, ModuleWarning, REGISTRY_VERSION,
    RegistryMetadata, StoredModuleState,
};
