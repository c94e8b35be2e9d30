//! Edge adapters
//!
//! An adapter transforms a producer's output value before the consumer
//! sees it. The engine applies adapters at run time; values already known
//! at planning time are adapted immediately.

use serde::Serialize;
use serde_json::Value;

/// Block stimulation protocol of a functional scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StimulusSchedule {
    /// Condition names, one per block
    pub names: Vec<String>,
    /// Block onsets in seconds from sequence start
    pub onsets: Vec<f64>,
    /// Block durations in seconds
    pub durations: Vec<f64>,
}

impl StimulusSchedule {
    /// `count` equally spaced blocks named `s1`, `s2`, …
    pub fn blocks(count: usize, first_onset: f64, period: f64, duration: f64) -> Self {
        Self {
            names: (1..=count).map(|i| format!("s{}", i)).collect(),
            onsets: (0..count).map(|i| first_onset + period * i as f64).collect(),
            durations: vec![duration; count],
        }
    }

    /// Model input for one scan, onsets shifted back by the acquisition delay
    pub fn subject_info(&self, delay_s: f64) -> SubjectInfo {
        SubjectInfo {
            conditions: self.names.clone(),
            onsets: self.onsets.iter().map(|o| vec![o - delay_s]).collect(),
            durations: self.durations.iter().map(|d| vec![*d]).collect(),
        }
    }
}

impl Default for StimulusSchedule {
    /// Six 20 s blocks every 180 s, starting at 222 s
    fn default() -> Self {
        Self::blocks(6, 222.0, 180.0, 20.0)
    }
}

/// Per-scan event description consumed by the model specification node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectInfo {
    pub conditions: Vec<String>,
    pub onsets: Vec<Vec<f64>>,
    pub durations: Vec<Vec<f64>>,
}

/// Value transformation attached to an edge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum EdgeAdapter {
    /// String output with a suffix appended
    AppendSuffix { suffix: String },
    /// Length of a list output
    Count,
    /// Delay in seconds turned into subject info
    SubjectInfo { schedule: StimulusSchedule },
}

impl EdgeAdapter {
    pub fn append_suffix(suffix: impl Into<String>) -> Self {
        Self::AppendSuffix {
            suffix: suffix.into(),
        }
    }

    pub fn subject_info(schedule: StimulusSchedule) -> Self {
        Self::SubjectInfo { schedule }
    }

    /// Apply to a known value; `None` if the value has the wrong shape
    pub fn apply(&self, value: &Value) -> Option<Value> {
        match self {
            Self::AppendSuffix { suffix } => {
                let base = value.as_str()?;
                Some(Value::String(format!("{}{}", base, suffix)))
            }
            Self::Count => Some(Value::from(value.as_array()?.len())),
            Self::SubjectInfo { schedule } => {
                let delay = value.as_f64()?;
                serde_json::to_value(vec![schedule.subject_info(delay)]).ok()
            }
        }
    }
}
