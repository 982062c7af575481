use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use crate::{TaskId, TickId};

/// Most recent progress markers kept in the working set.
pub const MAX_RECENT_MARKERS: usize = 100;
/// Idempotency keys remembered before the oldest is evicted.
pub const MAX_IDEMPOTENCY_KEYS: usize = 1024;

/// Lifecycle state of a task entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Blocked,
    Done,
    Parked,
}

impl TaskState {
    /// Allowed task moves: `pending → active → done`, `active ↔ blocked`,
    /// anything `→ parked`, and `parked → pending | active` to resume.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Done, _) => false,
            (_, Parked) => self != Parked,
            (Pending, Active) => true,
            (Active, Done) | (Active, Blocked) => true,
            (Blocked, Active) => true,
            (Parked, Pending) | (Parked, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Blocked => "blocked",
            TaskState::Done => "done",
            TaskState::Parked => "parked",
        };
        f.write_str(s)
    }
}

/// A unit of work tracked across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub description: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ids of progress markers attributed to this task.
    #[serde(default)]
    pub progress_markers: Vec<Uuid>,
    #[serde(default)]
    pub stop_condition: Option<String>,
}

/// A tagged piece of evidence that something moved forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub id: Uuid,
    pub tick_id: TickId,
    pub timestamp: DateTime<Utc>,
    pub marker_type: String,
    #[serde(default)]
    pub evidence: Option<String>,
    pub verified: bool,
}

impl ProgressMarker {
    pub fn new(tick_id: TickId, marker_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tick_id,
            timestamp: now,
            marker_type: marker_type.into(),
            evidence: None,
            verified: false,
        }
    }

    pub fn with_evidence(mut self, evidence: Option<String>) -> Self {
        self.verified = evidence.is_some();
        self.evidence = evidence;
        self
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }
}

/// Why a task move was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRejection {
    UnknownTask(TaskId),
    IllegalMove {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

impl fmt::Display for TaskRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRejection::UnknownTask(id) => write!(f, "unknown task {id}"),
            TaskRejection::IllegalMove { task_id, from, to } => {
                write!(f, "task {task_id} cannot move {from} → {to}")
            }
        }
    }
}

/// Cross-tick continuity memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingSet {
    pub active: Vec<TaskEntry>,
    pub pending: Vec<TaskEntry>,
    pub parked: Vec<TaskEntry>,
    pub archived: Vec<TaskEntry>,
    pub last_thought_summary: Option<String>,
    pub last_intent: Option<String>,
    pub last_expected_evidence: Option<String>,
    /// Handle of the task the engine is currently continuing.
    pub continuation_ref: Option<String>,
    pub recent_markers: VecDeque<ProgressMarker>,
    /// Insertion-ordered set; the oldest key is evicted past `MAX_IDEMPOTENCY_KEYS`.
    pub idempotency_keys: VecDeque<String>,
    /// Set by runaway mitigation; surfaced as a hint on the next engine call.
    pub replan_requested: bool,
    pub tick_count: u64,
    pub last_tick_id: Option<TickId>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first active task, if any.
    pub fn active_task(&self) -> Option<&TaskEntry> {
        self.active.first()
    }

    pub fn find_task(&self, id: TaskId) -> Option<&TaskEntry> {
        self.lists().find_map(|list| list.iter().find(|t| t.id == id))
    }

    /// Find a task by the opaque reference the engine uses (the id as a string).
    pub fn find_by_ref(&self, reference: &str) -> Option<&TaskEntry> {
        let id = reference.trim().parse::<Uuid>().ok()?;
        self.find_task(id)
    }

    pub fn task_count(&self) -> usize {
        self.active.len() + self.pending.len() + self.parked.len()
    }

    /// Create a new active task. Any currently active task is parked first.
    pub fn start_task(
        &mut self,
        description: String,
        stop_condition: Option<String>,
        now: DateTime<Utc>,
    ) -> TaskId {
        let to_park: Vec<TaskId> = self.active.iter().map(|t| t.id).collect();
        for id in to_park {
            // Active → parked is always legal.
            let _ = self.transition_task(id, TaskState::Parked, now);
        }
        let task = TaskEntry {
            id: Uuid::new_v4(),
            description,
            state: TaskState::Active,
            created_at: now,
            updated_at: now,
            progress_markers: Vec::new(),
            stop_condition,
        };
        let id = task.id;
        self.active.push(task);
        self.continuation_ref = Some(id.to_string());
        id
    }

    /// Move a task to a new lifecycle state, enforcing `TaskState::can_transition_to`.
    /// Returns the state the task moved from.
    pub fn transition_task(
        &mut self,
        id: TaskId,
        to: TaskState,
        now: DateTime<Utc>,
    ) -> Result<TaskState, TaskRejection> {
        let from = self
            .find_task(id)
            .map(|t| t.state)
            .ok_or(TaskRejection::UnknownTask(id))?;
        if !from.can_transition_to(to) {
            return Err(TaskRejection::IllegalMove {
                task_id: id,
                from,
                to,
            });
        }
        let mut task = self
            .take_task(id)
            .ok_or(TaskRejection::UnknownTask(id))?;
        task.state = to;
        task.updated_at = now;
        match to {
            TaskState::Active => self.active.push(task),
            TaskState::Pending | TaskState::Blocked => self.pending.push(task),
            TaskState::Parked => self.parked.push(task),
            TaskState::Done => self.archived.push(task),
        }
        if to != TaskState::Active && self.continuation_ref.as_deref() == Some(&id.to_string()) {
            self.continuation_ref = self.active.first().map(|t| t.id.to_string());
        }
        if to == TaskState::Active {
            self.continuation_ref = Some(id.to_string());
        }
        Ok(from)
    }

    /// Record a marker, attributing it to the active task when there is one.
    pub fn push_marker(&mut self, marker: ProgressMarker) {
        if let Some(task) = self.active.first_mut() {
            task.progress_markers.push(marker.id);
        }
        self.recent_markers.push_back(marker);
        while self.recent_markers.len() > MAX_RECENT_MARKERS {
            self.recent_markers.pop_front();
        }
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.idempotency_keys.iter().any(|k| k == key)
    }

    /// Remember a side-effect key. Returns `false` if it was already known.
    pub fn remember_key(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.has_key(&key) {
            return false;
        }
        self.idempotency_keys.push_back(key);
        while self.idempotency_keys.len() > MAX_IDEMPOTENCY_KEYS {
            self.idempotency_keys.pop_front();
        }
        true
    }

    fn lists(&self) -> impl Iterator<Item = &Vec<TaskEntry>> {
        [&self.active, &self.pending, &self.parked, &self.archived].into_iter()
    }

    fn take_task(&mut self, id: TaskId) -> Option<TaskEntry> {
        for list in [&mut self.active, &mut self.pending, &mut self.parked] {
            if let Some(pos) = list.iter().position(|t| t.id == id) {
                return Some(list.remove(pos));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_rules() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Done));
        assert!(Active.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Active));
        assert!(Pending.can_transition_to(Parked));
        assert!(Parked.can_transition_to(Active));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Blocked.can_transition_to(Done));
        assert!(!Parked.can_transition_to(Done));
        assert!(!Done.can_transition_to(Parked));
        assert!(!Parked.can_transition_to(Parked));
    }

    #[test]
    fn test_start_task_parks_previous() {
        let mut ws = WorkingSet::new();
        let now = Utc::now();
        let first = ws.start_task("first".into(), None, now);
        let second = ws.start_task("second".into(), None, now);

        assert_eq!(ws.active.len(), 1);
        assert_eq!(ws.active[0].id, second);
        assert_eq!(ws.parked.len(), 1);
        assert_eq!(ws.parked[0].id, first);
        assert_eq!(ws.continuation_ref, Some(second.to_string()));
    }

    #[test]
    fn test_done_is_archived_not_deleted() {
        let mut ws = WorkingSet::new();
        let now = Utc::now();
        let id = ws.start_task("ship it".into(), None, now);
        assert_eq!(ws.transition_task(id, TaskState::Done, now), Ok(TaskState::Active));
        assert!(ws.active.is_empty());
        assert_eq!(ws.archived.len(), 1);
        assert_eq!(ws.find_task(id).map(|t| t.state), Some(TaskState::Done));
        assert_eq!(ws.continuation_ref, None);
    }

    #[test]
    fn test_archive_keeps_every_done_task() {
        let mut ws = WorkingSet::new();
        let now = Utc::now();
        let mut finished = Vec::new();
        for i in 0..120 {
            let id = ws.start_task(format!("task {i}"), None, now);
            ws.transition_task(id, TaskState::Done, now).unwrap();
            finished.push(id);
        }
        assert_eq!(ws.archived.len(), 120);
        assert_eq!(ws.archived[0].id, finished[0]);
        assert!(finished.iter().all(|id| ws.find_task(*id).is_some()));
    }

    #[test]
    fn test_parked_to_done_rejected() {
        let mut ws = WorkingSet::new();
        let now = Utc::now();
        let id = ws.start_task("a".into(), None, now);
        ws.transition_task(id, TaskState::Parked, now).unwrap();
        let err = ws.transition_task(id, TaskState::Done, now).unwrap_err();
        assert!(matches!(err, TaskRejection::IllegalMove { .. }));
        assert_eq!(ws.parked.len(), 1);
    }

    #[test]
    fn test_unknown_task() {
        let mut ws = WorkingSet::new();
        let id = Uuid::new_v4();
        assert_eq!(
            ws.transition_task(id, TaskState::Active, Utc::now()),
            Err(TaskRejection::UnknownTask(id))
        );
    }

    #[test]
    fn test_idempotency_keys_evict_oldest() {
        let mut ws = WorkingSet::new();
        assert!(ws.remember_key("k0"));
        assert!(!ws.remember_key("k0"));
        for i in 1..=MAX_IDEMPOTENCY_KEYS {
            ws.remember_key(format!("k{i}"));
        }
        assert_eq!(ws.idempotency_keys.len(), MAX_IDEMPOTENCY_KEYS);
        assert!(!ws.has_key("k0"));
        assert!(ws.has_key(&format!("k{MAX_IDEMPOTENCY_KEYS}")));
    }

    #[test]
    fn test_markers_attributed_to_active_task() {
        let mut ws = WorkingSet::new();
        let now = Utc::now();
        let id = ws.start_task("a".into(), None, now);
        let marker = ProgressMarker::new(Uuid::new_v4(), "step_advanced", now);
        let marker_id = marker.id;
        ws.push_marker(marker);
        assert_eq!(ws.find_task(id).unwrap().progress_markers, vec![marker_id]);
        assert_eq!(ws.recent_markers.len(), 1);
    }
}
