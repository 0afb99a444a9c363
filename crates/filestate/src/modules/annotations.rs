use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::module::StateModule;

/// A single marker on a plot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    /// Position along the time axis, in seconds.
    pub position: f64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    pub fn new(id: impl Into<String>, position: f64, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position,
            label: label.into(),
            description: None,
            color: None,
            created_at: Utc::now(),
        }
    }
}

/// Where an annotation lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationTarget {
    /// Spans every channel of the raw time series.
    Global,
    Channel { channel: String },
    /// A derived plot: one variant of one analysis result.
    Result { result_id: String, variant_id: String },
}

/// Markers on the raw time series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesAnnotations {
    #[serde(default)]
    pub global: Vec<Annotation>,
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<Annotation>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationState {
    #[serde(default)]
    pub time_series: TimeSeriesAnnotations,
    /// result id -> variant id -> markers
    #[serde(default)]
    pub results: BTreeMap<String, BTreeMap<String, Vec<Annotation>>>,
}

impl AnnotationState {
    pub fn add(&mut self, target: &AnnotationTarget, annotation: Annotation) {
        self.list_mut(target).push(annotation);
    }

    /// Remove an annotation by id from wherever it lives.
    pub fn remove(&mut self, id: &str) -> Option<Annotation> {
        let lists = std::iter::once(&mut self.time_series.global)
            .chain(self.time_series.channels.values_mut())
            .chain(self.results.values_mut().flat_map(|v| v.values_mut()));
        for list in lists {
            if let Some(idx) = list.iter().position(|a| a.id == id) {
                return Some(list.remove(idx));
            }
        }
        None
    }

    pub fn list(&self, target: &AnnotationTarget) -> &[Annotation] {
        let found = match target {
            AnnotationTarget::Global => Some(&self.time_series.global),
            AnnotationTarget::Channel { channel } => self.time_series.channels.get(channel),
            AnnotationTarget::Result {
                result_id,
                variant_id,
            } => self.results.get(result_id).and_then(|v| v.get(variant_id)),
        };
        found.map(Vec::as_slice).unwrap_or(&[])
    }

    fn list_mut(&mut self, target: &AnnotationTarget) -> &mut Vec<Annotation> {
        match target {
            AnnotationTarget::Global => &mut self.time_series.global,
            AnnotationTarget::Channel { channel } => self
                .time_series
                .channels
                .entry(channel.clone())
                .or_default(),
            AnnotationTarget::Result {
                result_id,
                variant_id,
            } => self
                .results
                .entry(result_id.clone())
                .or_default()
                .entry(variant_id.clone())
                .or_default(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.time_series
            .global
            .iter()
            .chain(self.time_series.channels.values().flatten())
            .chain(self.results.values().flat_map(|v| v.values().flatten()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.iter().any(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

pub struct AnnotationModule;

impl StateModule for AnnotationModule {
    const ID: &'static str = "annotations";
    type State = AnnotationState;

    fn default_state(&self) -> AnnotationState {
        AnnotationState::default()
    }

    fn validate_state(&self, state: &AnnotationState) -> bool {
        let mut seen = HashSet::new();
        state.iter().all(|a| seen.insert(a.id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_list_by_target() {
        let mut state = AnnotationState::default();
        let ch = AnnotationTarget::Channel {
            channel: "Cz".into(),
        };
        let res = AnnotationTarget::Result {
            result_id: "r1".into(),
            variant_id: "st".into(),
        };
        state.add(&AnnotationTarget::Global, Annotation::new("g1", 1.0, "start"));
        state.add(&ch, Annotation::new("c1", 2.0, "spike"));
        state.add(&res, Annotation::new("r1a", 3.0, "peak"));

        assert_eq!(state.list(&AnnotationTarget::Global).len(), 1);
        assert_eq!(state.list(&ch)[0].label, "spike");
        assert_eq!(state.list(&res)[0].id, "r1a");
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_remove_anywhere() {
        let mut state = AnnotationState::default();
        let res = AnnotationTarget::Result {
            result_id: "r1".into(),
            variant_id: "st".into(),
        };
        state.add(&res, Annotation::new("x", 3.0, "peak"));
        assert_eq!(state.remove("x").unwrap().label, "peak");
        assert!(state.remove("x").is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn test_duplicate_ids_invalid() {
        let mut state = AnnotationState::default();
        state.add(&AnnotationTarget::Global, Annotation::new("a", 1.0, "one"));
        state.add(
            &AnnotationTarget::Channel {
                channel: "Fz".into(),
            },
            Annotation::new("a", 2.0, "two"),
        );
        assert!(!AnnotationModule.validate_state(&state));
    }

    #[test]
    fn test_target_serde_shape() {
        let target = AnnotationTarget::Channel {
            channel: "O1".into(),
        };
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "channel", "channel": "O1"}));
    }
}
