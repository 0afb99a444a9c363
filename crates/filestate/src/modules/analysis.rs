use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::module::StateModule;

/// Number of history entries kept per file.
pub const MAX_ANALYSIS_HISTORY: usize = 50;

/// Parameters of one analysis run, as last entered by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParameters {
    pub window_length: u32,
    pub window_step: u32,
    pub delays: Vec<u32>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dimension: Option<u32>,
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            window_length: 2048,
            window_step: 1024,
            delays: vec![7, 10],
            variants: vec!["single_timeseries".to_string()],
            model_dimension: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisHistoryEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Analysis bookkeeping for one file. `history` is newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_analysis_id: Option<String>,
    #[serde(default)]
    pub history: Vec<AnalysisHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_parameters: Option<AnalysisParameters>,
    #[serde(default)]
    pub selected_variants: Vec<String>,
}

impl AnalysisState {
    /// Record a finished run and make it current.
    ///
    /// Re-recording an existing id moves it to the front.
    pub fn record(&mut self, entry: AnalysisHistoryEntry) {
        self.history.retain(|e| e.id != entry.id);
        self.current_analysis_id = Some(entry.id.clone());
        self.history.insert(0, entry);
        self.history.truncate(MAX_ANALYSIS_HISTORY);
    }

    pub fn current(&self) -> Option<&AnalysisHistoryEntry> {
        let id = self.current_analysis_id.as_deref()?;
        self.history.iter().find(|e| e.id == id)
    }

    /// Drop an entry; clears `current_analysis_id` if it pointed there.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.history.len();
        self.history.retain(|e| e.id != id);
        if self.current_analysis_id.as_deref() == Some(id) {
            self.current_analysis_id = None;
        }
        self.history.len() != before
    }
}

pub struct AnalysisModule;

impl StateModule for AnalysisModule {
    const ID: &'static str = "analysis";
    type State = AnalysisState;

    fn default_state(&self) -> AnalysisState {
        AnalysisState::default()
    }

    fn validate_state(&self, state: &AnalysisState) -> bool {
        let mut seen = HashSet::new();
        if !state.history.iter().all(|e| seen.insert(e.id.as_str())) {
            return false;
        }
        match &state.current_analysis_id {
            Some(id) => seen.contains(id.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> AnalysisHistoryEntry {
        AnalysisHistoryEntry {
            id: id.into(),
            created_at: Utc::now(),
            channels: vec!["Fp1".into()],
            variants: vec![],
            name: None,
        }
    }

    #[test]
    fn test_record_moves_to_front() {
        let mut state = AnalysisState::default();
        state.record(entry("a"));
        state.record(entry("b"));
        state.record(entry("a"));
        let ids: Vec<_> = state.history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(state.current().unwrap().id, "a");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = AnalysisState::default();
        for i in 0..(MAX_ANALYSIS_HISTORY + 5) {
            state.record(entry(&format!("run-{i}")));
        }
        assert_eq!(state.history.len(), MAX_ANALYSIS_HISTORY);
        assert_eq!(state.history[0].id, format!("run-{}", MAX_ANALYSIS_HISTORY + 4));
    }

    #[test]
    fn test_remove_current() {
        let mut state = AnalysisState::default();
        state.record(entry("a"));
        assert!(state.remove("a"));
        assert!(state.current_analysis_id.is_none());
        assert!(!state.remove("a"));
    }

    #[test]
    fn test_validation() {
        let module = AnalysisModule;
        let mut state = AnalysisState::default();
        assert!(module.validate_state(&state));

        state.current_analysis_id = Some("ghost".into());
        assert!(!module.validate_state(&state));

        let mut state = AnalysisState::default();
        state.history = vec![entry("dup"), entry("dup")];
        assert!(!module.validate_state(&state));
    }
}
