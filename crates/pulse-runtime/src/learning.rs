use chrono::{DateTime, Utc};
use pulse_autonomy::Backoff;
use pulse_core::{
    LearningEvent, LearningSink, RunawayScore, RunawayType, TickId, WorkingSet,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the orchestrator knows about a runaway episode when it fires.
#[derive(Debug, Clone)]
pub struct RunawayContext<'a> {
    pub tick_id: TickId,
    pub score: RunawayScore,
    pub runaway_type: RunawayType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub tick_count: u64,
    pub working_set_before: &'a WorkingSet,
    pub working_set_after: &'a WorkingSet,
    pub action_signatures: Vec<String>,
    pub consecutive_errors: u32,
}

/// Writes one learning event per runaway episode to the append-only log.
pub struct LearningEventEmitter {
    sink: Arc<dyn LearningSink>,
    attempts: u32,
    backoff: Backoff,
    emitted: u64,
    dropped: u64,
}

impl LearningEventEmitter {
    pub fn new(sink: Arc<dyn LearningSink>, retries: u32) -> Self {
        Self {
            sink,
            attempts: retries.max(1),
            backoff: Backoff::new(
                Duration::from_millis(50),
                2.0,
                Duration::from_secs(2),
                0.1,
            ),
            emitted: 0,
            dropped: 0,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Events that never reached the store.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Build the event and append it. Storage failures are retried, then the
    /// event is logged and counted as dropped; the caller always gets it back.
    pub async fn emit(&mut self, ctx: RunawayContext<'_>) -> (LearningEvent, bool) {
        let event = build_event(&ctx, Utc::now());

        let mut attempt = 0;
        loop {
            match self.sink.append_learning_event(&event) {
                Ok(()) => {
                    self.emitted += 1;
                    info!(
                        event_id = %event.id,
                        tick_id = %ctx.tick_id,
                        runaway_type = %event.runaway_type,
                        total = event.score.total,
                        "learning event recorded"
                    );
                    return (event, true);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        self.dropped += 1;
                        let body = serde_json::to_string(&event).unwrap_or_default();
                        error!(
                            event_id = %event.id,
                            error = %e,
                            event = %body,
                            "learning event dropped after retries"
                        );
                        return (event, false);
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(attempt, error = %e, "learning event write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn build_event(ctx: &RunawayContext<'_>, now: DateTime<Utc>) -> LearningEvent {
    let expected_evidence = ctx
        .working_set_after
        .last_expected_evidence
        .clone()
        .or_else(|| ctx.working_set_before.last_expected_evidence.clone());
    let observed_evidence: Vec<String> = ctx
        .working_set_after
        .recent_markers
        .iter()
        .filter(|m| m.timestamp >= ctx.window_start)
        .filter_map(|m| m.evidence.clone())
        .collect();

    let hypothesis = hypothesis(ctx);
    let lesson = lesson(ctx.runaway_type);
    debug!(%hypothesis, "runaway hypothesis");

    LearningEvent {
        id: Uuid::new_v4(),
        timestamp: now,
        event_type: LearningEvent::RUNAWAY_DETECTED.to_string(),
        runaway_type: ctx.runaway_type,
        score: ctx.score,
        window_start: ctx.window_start,
        window_end: ctx.window_end,
        tick_count: ctx.tick_count,
        working_set_before: ctx.working_set_before.clone(),
        working_set_after: ctx.working_set_after.clone(),
        action_signatures: ctx.action_signatures.clone(),
        expected_evidence,
        observed_evidence,
        hypothesis: Some(hypothesis),
        lesson: Some(lesson.to_string()),
        processed: false,
        processed_at: None,
    }
}

fn hypothesis(ctx: &RunawayContext<'_>) -> String {
    let c = &ctx.score.components;
    match ctx.runaway_type {
        RunawayType::ErrorDriven => format!(
            "{} consecutive ticks failed; retries kept firing without a change in approach",
            ctx.consecutive_errors
        ),
        RunawayType::SignatureLoop => match most_frequent(&ctx.action_signatures) {
            Some((sig, n)) => format!(
                "action '{sig}' repeated {n} times in {} ticks without significant progress",
                ctx.tick_count
            ),
            None => "the same action kept repeating without significant progress".to_string(),
        },
        RunawayType::TriggerStorm => format!(
            "engine calls ran at {:.0}% of the reference rate while progress absence was {:.2}",
            c.trigger_density * 100.0,
            c.progress_absence
        ),
        RunawayType::NoProgress => {
            let task = ctx
                .working_set_after
                .active_task()
                .map(|t| format!("task '{}'", t.description))
                .unwrap_or_else(|| "no active task".to_string());
            format!(
                "{} ticks passed with {task} and no significant progress marker",
                ctx.tick_count
            )
        }
    }
}

fn lesson(kind: RunawayType) -> &'static str {
    match kind {
        RunawayType::ErrorDriven => "back off and change strategy after repeated failures",
        RunawayType::SignatureLoop => "vary the action or park the task when it stops paying off",
        RunawayType::TriggerStorm => "slow the cadence when calls outpace results",
        RunawayType::NoProgress => {
            "state a stop condition or expected evidence before continuing a task"
        }
    }
}

fn most_frequent(signatures: &[String]) -> Option<(&str, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for s in signatures {
        *counts.entry(s.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pulse_core::{PulseError, Result, RunawayComponents};

    /// Sink that fails a fixed number of times before accepting.
    struct FlakySink {
        failures_left: Mutex<u32>,
        written: Mutex<Vec<LearningEvent>>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl LearningSink for FlakySink {
        fn append_learning_event(&self, event: &LearningEvent) -> Result<()> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(PulseError::Storage("database is locked".into()));
            }
            self.written.lock().push(event.clone());
            Ok(())
        }
    }

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), 1.0, Duration::from_millis(1), 0.0)
    }

    fn ctx<'a>(ws: &'a WorkingSet, kind: RunawayType) -> RunawayContext<'a> {
        let now = Utc::now();
        RunawayContext {
            tick_id: Uuid::new_v4(),
            score: RunawayScore {
                total: 0.9,
                components: RunawayComponents {
                    progress_absence: 1.0,
                    trigger_density: 0.5,
                    signature_repetition: 1.0,
                    error_streak: 0.0,
                },
                consecutive_high_ticks: 3,
                is_runaway: true,
            },
            runaway_type: kind,
            window_start: now - chrono::Duration::seconds(300),
            window_end: now,
            tick_count: 5,
            working_set_before: ws,
            working_set_after: ws,
            action_signatures: vec!["search:docs".into(); 5],
            consecutive_errors: 0,
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let sink = Arc::new(FlakySink::new(2));
        let mut emitter = LearningEventEmitter::new(sink.clone(), 3).with_backoff(fast());
        let ws = WorkingSet::new();

        let (event, stored) = emitter.emit(ctx(&ws, RunawayType::SignatureLoop)).await;
        assert!(stored);
        assert_eq!(emitter.emitted(), 1);
        assert_eq!(emitter.dropped(), 0);
        assert_eq!(sink.written.lock()[0].id, event.id);
        assert!(event.hypothesis.unwrap().contains("search:docs"));
    }

    #[tokio::test]
    async fn test_drops_after_exhausting_retries() {
        let sink = Arc::new(FlakySink::new(10));
        let mut emitter = LearningEventEmitter::new(sink.clone(), 2).with_backoff(fast());
        let ws = WorkingSet::new();

        let (event, stored) = emitter.emit(ctx(&ws, RunawayType::NoProgress)).await;
        assert!(!stored);
        assert_eq!(emitter.dropped(), 1);
        assert!(sink.written.lock().is_empty());
        assert_eq!(event.event_type, LearningEvent::RUNAWAY_DETECTED);
        assert!(!event.processed);
    }

    #[test]
    fn test_event_carries_window_evidence() {
        let now = Utc::now();
        let mut ws = WorkingSet::new();
        ws.last_expected_evidence = Some("tests pass".into());
        ws.push_marker(
            pulse_core::ProgressMarker::new(Uuid::new_v4(), "heartbeat", now - chrono::Duration::seconds(900))
                .with_evidence(Some("too old".into())),
        );
        ws.push_marker(
            pulse_core::ProgressMarker::new(Uuid::new_v4(), "step_advanced", now)
                .with_evidence(Some("3 of 5 tests pass".into())),
        );
        let event = build_event(&ctx(&ws, RunawayType::NoProgress), now);
        assert_eq!(event.expected_evidence.as_deref(), Some("tests pass"));
        assert_eq!(event.observed_evidence, vec!["3 of 5 tests pass".to_string()]);
        assert_eq!(event.lesson.as_deref(), Some(lesson(RunawayType::NoProgress)));
    }

    #[test]
    fn test_most_frequent_signature() {
        let sigs: Vec<String> = ["a", "b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(most_frequent(&sigs), Some(("a", 2)));
        assert_eq!(most_frequent(&[]), None);
    }
}
