use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::working_set::WorkingSet;

/// Per-signal contributions to a runaway score, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunawayComponents {
    pub progress_absence: f64,
    pub trigger_density: f64,
    pub signature_repetition: f64,
    pub error_streak: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunawayScore {
    pub total: f64,
    pub components: RunawayComponents,
    pub consecutive_high_ticks: u32,
    pub is_runaway: bool,
}

/// Dominant cause of a runaway episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunawayType {
    NoProgress,
    SignatureLoop,
    ErrorDriven,
    TriggerStorm,
}

impl RunawayType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunawayType::NoProgress => "no_progress",
            RunawayType::SignatureLoop => "signature_loop",
            RunawayType::ErrorDriven => "error_driven",
            RunawayType::TriggerStorm => "trigger_storm",
        }
    }
}

impl fmt::Display for RunawayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of one runaway episode, written once for offline analysis.
///
/// Only `processed` and `processed_at` ever change after the append, and only
/// the external consumer changes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub runaway_type: RunawayType,
    pub score: RunawayScore,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub tick_count: u64,
    pub working_set_before: WorkingSet,
    pub working_set_after: WorkingSet,
    #[serde(default)]
    pub action_signatures: Vec<String>,
    #[serde(default)]
    pub expected_evidence: Option<String>,
    #[serde(default)]
    pub observed_evidence: Vec<String>,
    #[serde(default)]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub lesson: Option<String>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl LearningEvent {
    pub const RUNAWAY_DETECTED: &'static str = "runaway_detected";
}
