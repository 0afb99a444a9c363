//! Reference state modules.

pub mod analysis;
pub mod annotations;
pub mod plot;

pub use analysis::{
    AnalysisHistoryEntry, AnalysisModule, AnalysisParameters, AnalysisState, MAX_ANALYSIS_HISTORY,
};
pub use annotations::{
    Annotation, AnnotationModule, AnnotationState, AnnotationTarget, TimeSeriesAnnotations,
};
pub use plot::{PlotModule, PlotState, PreprocessingOptions, TimeWindow};

pub const PLOT_PRIORITY: i32 = 10;
pub const ANALYSIS_PRIORITY: i32 = 20;
pub const ANNOTATIONS_PRIORITY: i32 = 30;
