use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::working_set::TaskState;
use crate::TaskId;

/// Lifecycle stage of the runtime. Exactly one is active at a time.
///
/// `Resting` and `DeepRest` are reserved for a future rest cycle. They are fully
/// defined so the config schema stays stable, but no enabled transition targets them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    #[default]
    Idle,
    Thinking,
    Acting,
    Resting,
    DeepRest,
}

impl RuntimeState {
    pub const ALL: [RuntimeState; 5] = [
        RuntimeState::Idle,
        RuntimeState::Thinking,
        RuntimeState::Acting,
        RuntimeState::Resting,
        RuntimeState::DeepRest,
    ];

    /// States that exist in the schema but are never entered by this runtime.
    pub fn is_reserved(self) -> bool {
        matches!(self, RuntimeState::Resting | RuntimeState::DeepRest)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Thinking => "thinking",
            RuntimeState::Acting => "acting",
            RuntimeState::Resting => "resting",
            RuntimeState::DeepRest => "deep_rest",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "idle" => Ok(RuntimeState::Idle),
            "thinking" => Ok(RuntimeState::Thinking),
            "acting" => Ok(RuntimeState::Acting),
            "resting" => Ok(RuntimeState::Resting),
            "deep_rest" | "deeprest" => Ok(RuntimeState::DeepRest),
            other => Err(format!("unknown runtime state '{other}'")),
        }
    }
}

/// What kind of move the reasoning engine is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    ContinueExistingTask,
    StartNewTask,
    Explore,
    EnterSafeMode,
    RequestRest,
}

impl fmt::Display for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionType::ContinueExistingTask => "continue_existing_task",
            TransitionType::StartNewTask => "start_new_task",
            TransitionType::Explore => "explore",
            TransitionType::EnterSafeMode => "enter_safe_mode",
            TransitionType::RequestRest => "request_rest",
        };
        f.write_str(s)
    }
}

/// A progress claim reported by the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedMarker {
    pub marker_type: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

/// A request to move a task in the working set to a new lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
}

/// A state-transition request produced by the reasoning engine.
///
/// Untrusted input: nothing here takes effect until the state machine and the
/// working-set rules have validated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransitionRequest {
    pub desired_state: RuntimeState,
    pub transition_type: TransitionType,
    #[serde(default)]
    pub reason: String,
    /// Opaque handle of the task the engine wants to continue.
    #[serde(default)]
    pub continuation_ref: Option<String>,
    /// Engine self-reported confidence, 0..1.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Suggested seconds until the next tick.
    #[serde(default)]
    pub suggested_next_interval: Option<u64>,

    #[serde(default)]
    pub thought_summary: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub expected_evidence: Option<String>,
    /// Stable signature of the action taken this tick (tool + target, etc.).
    #[serde(default)]
    pub action_signature: Option<String>,
    /// Key identifying an externally visible side effect, for duplicate suppression.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub stop_condition: Option<String>,
    #[serde(default)]
    pub task_update: Option<TaskUpdate>,
    #[serde(default)]
    pub progress_markers: Vec<ReportedMarker>,
}

impl StateTransitionRequest {
    /// A bare request to stay in `state` and keep going.
    pub fn continue_in(state: RuntimeState) -> Self {
        Self {
            desired_state: state,
            transition_type: TransitionType::ContinueExistingTask,
            reason: String::new(),
            continuation_ref: None,
            confidence: None,
            suggested_next_interval: None,
            thought_summary: None,
            intent: None,
            expected_evidence: None,
            action_signature: None,
            idempotency_key: None,
            task_description: None,
            stop_condition: None,
            task_update: None,
            progress_markers: Vec::new(),
        }
    }

    /// Check field-level well-formedness. Adjacency is the state machine's job.
    pub fn validate_fields(&self) -> Result<(), String> {
        if let Some(c) = self.confidence
            && (!c.is_finite() || !(0.0..=1.0).contains(&c))
        {
            return Err(format!("confidence {c} is outside 0..1"));
        }
        if self.suggested_next_interval == Some(0) {
            return Err("suggested_next_interval must be positive".into());
        }
        if let Some(ref r) = self.continuation_ref
            && r.trim().is_empty()
        {
            return Err("continuation_ref is empty".into());
        }
        if self.transition_type == TransitionType::StartNewTask
            && self.task_description.as_deref().is_none_or(|d| d.trim().is_empty())
            && self.reason.trim().is_empty()
        {
            return Err("start_new_task needs a task_description or reason".into());
        }
        for m in &self.progress_markers {
            if m.marker_type.trim().is_empty() {
                return Err("progress marker with empty marker_type".into());
            }
        }
        Ok(())
    }

    /// Description to use when this request starts a task.
    pub fn new_task_description(&self) -> String {
        self.task_description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.reason)
            .to_string()
    }

    /// Signature the runaway detector compares across ticks.
    ///
    /// The engine's own `action_signature` wins. Without one, the signature is
    /// derived from the requested move and its target (the continuation ref,
    /// else `active_task`), so a loop is visible even to an engine that never
    /// reports signatures. Requests to go quiet carry none.
    pub fn effective_signature(&self, active_task: Option<&str>) -> Option<String> {
        if let Some(sig) = self
            .action_signature
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            return Some(sig.to_string());
        }
        if self.transition_type == TransitionType::RequestRest
            || self.desired_state == RuntimeState::Idle
            || self.desired_state.is_reserved()
        {
            return None;
        }
        let target = match self.transition_type {
            TransitionType::StartNewTask => self.new_task_description(),
            _ => self
                .continuation_ref
                .as_deref()
                .or(active_task)
                .unwrap_or("-")
                .to_string(),
        };
        Some(format!(
            "{}:{}:{target}",
            self.desired_state, self.transition_type
        ))
    }
}
