use serde::{Deserialize, Serialize};

use crate::module::StateModule;

/// Signal conditioning applied before plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highpass: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowpass: Option<f64>,
    #[serde(default)]
    pub notch: Vec<f64>,
    #[serde(default)]
    pub detrend: bool,
}

/// A `[start, end]` window in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Visualization settings for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotState {
    /// Offset of the visible chunk, in samples.
    pub chunk_start: u64,
    /// Visible chunk length, in samples.
    pub chunk_size: u64,
    pub selected_channels: Vec<String>,
    pub zoom: f64,
    pub amplitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub preprocessing: PreprocessingOptions,
    #[serde(default = "default_true")]
    pub show_annotations: bool,
}

fn default_true() -> bool {
    true
}

pub struct PlotModule;

impl StateModule for PlotModule {
    const ID: &'static str = "plot";
    type State = PlotState;

    fn default_state(&self) -> PlotState {
        PlotState {
            chunk_start: 0,
            chunk_size: 8192,
            selected_channels: Vec::new(),
            zoom: 1.0,
            amplitude: 1.0,
            time_window: None,
            preprocessing: PreprocessingOptions::default(),
            show_annotations: true,
        }
    }

    fn validate_state(&self, state: &PlotState) -> bool {
        if state.chunk_size == 0 || state.zoom <= 0.0 || !state.zoom.is_finite() {
            return false;
        }
        match state.time_window {
            Some(window) => {
                window.start.is_finite() && window.end.is_finite() && window.start <= window.end
            }
            None => true,
        }
    }
}
