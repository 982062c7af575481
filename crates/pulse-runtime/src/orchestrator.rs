//! The tick loop.
//!
//! One `TickOrchestrator` per process owns the state machine, working set and
//! runaway detector outright. Everything shared with sibling processes goes
//! through the store ports.

use chrono::{DateTime, Utc};
use pulse_autonomy::{
    Backoff, BudgetTracker, CircuitBreaker, REASONING_ENGINE, RunawayDetector, StateMachine,
    TickRecord,
};
use pulse_config::PulseConfig;
use pulse_core::{
    BudgetSnapshot, CircuitStatus, EnvironmentSnapshot, Event, EventBus, ExternalEvent,
    LearningSink, Overrides, ProgressMarker, PulseError, QuotaLedger, Result, RunawayScore,
    RunawayType, RuntimeState, RuntimeStore, ServiceHealth, StateTransitionRequest, TaskState,
    TickId, TransitionType, WorkingSet,
};
use pulse_engine::{ReasoningEngine, parse_transition_request};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::health::{HealthHandle, HealthReport, write_health_file};
use crate::interval::{IntervalInputs, IntervalPolicy};
use crate::learning::{LearningEventEmitter, RunawayContext};
use crate::working_set::WorkingSetStore;

/// Actor name recorded on overrides the loop sets itself.
const OVERRIDE_ACTOR: &str = "pulse-runtime";

/// Marker types the loop records on its own behalf.
const MARKER_TASK_STARTED: &str = "task_started";
const MARKER_TASK_COMPLETED: &str = "task_completed";
const MARKER_TASK_STATE_CHANGED: &str = "task_state_changed";

/// The store seams the loop needs. `pulse_store::Store` implements all three.
#[derive(Clone)]
pub struct Ports {
    pub runtime: Arc<dyn RuntimeStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub learning: Arc<dyn LearningSink>,
}

impl Ports {
    /// Use one store for every port.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RuntimeStore + QuotaLedger + LearningSink + 'static,
    {
        Self {
            runtime: store.clone(),
            ledger: store.clone(),
            learning: store,
        }
    }
}

/// Why a tick skipped the engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Budget,
    Breaker,
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateReason::Budget => f.write_str("budget"),
            GateReason::Breaker => f.write_str("circuit_open"),
        }
    }
}

/// How a tick ended, and how long to sleep before the next one.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed {
        tick_id: TickId,
        state: RuntimeState,
        next: Duration,
    },
    Paused {
        tick_id: TickId,
        next: Duration,
    },
    Gated {
        tick_id: TickId,
        reason: GateReason,
        wait: Duration,
    },
    Failed {
        tick_id: TickId,
        error: String,
        next: Duration,
    },
}

impl TickOutcome {
    pub fn next_interval(&self) -> Duration {
        match self {
            TickOutcome::Completed { next, .. }
            | TickOutcome::Paused { next, .. }
            | TickOutcome::Failed { next, .. } => *next,
            TickOutcome::Gated { wait, .. } => *wait,
        }
    }

    pub fn tick_id(&self) -> TickId {
        match self {
            TickOutcome::Completed { tick_id, .. }
            | TickOutcome::Paused { tick_id, .. }
            | TickOutcome::Gated { tick_id, .. }
            | TickOutcome::Failed { tick_id, .. } => *tick_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TickOutcome::Completed { .. } => "completed",
            TickOutcome::Paused { .. } => "paused",
            TickOutcome::Gated { .. } => "gated",
            TickOutcome::Failed { .. } => "failed",
        }
    }
}

/// Result of scoring one tick.
struct RunawayCheck {
    score: RunawayScore,
    error_driven: bool,
}

pub struct TickOrchestrator {
    config: PulseConfig,
    store: Arc<dyn RuntimeStore>,
    engine: Arc<dyn ReasoningEngine>,
    budget: BudgetTracker,
    breaker: CircuitBreaker,
    machine: StateMachine,
    working_set: WorkingSet,
    ws_store: WorkingSetStore,
    detector: RunawayDetector,
    emitter: LearningEventEmitter,
    backoff: Backoff,
    interval: IntervalPolicy,
    engine_timeout: Duration,
    bus: EventBus,
    health: HealthHandle,
    failed_ticks: u32,
    runaway_active: bool,
    last_tick_at: Option<DateTime<Utc>>,
}

impl TickOrchestrator {
    /// Build the loop and restore the last checkpoint and breaker state.
    pub fn new(
        config: PulseConfig,
        ports: Ports,
        engine: Arc<dyn ReasoningEngine>,
        bus: EventBus,
    ) -> Result<Self> {
        let now = Utc::now();
        let backoff = Backoff::from_config(&config.backoff);
        let io_backoff = backoff.scaled(0.01);

        let mut machine = StateMachine::from_config(&config.states)?;
        let ws_store = WorkingSetStore::new(ports.runtime.clone(), config.storage.persist_retries)
            .with_backoff(io_backoff.clone());
        let (saved_state, working_set) = ws_store.load(machine.current_state())?;
        let state = machine.restore(saved_state);
        if state != saved_state {
            warn!(saved = %saved_state, restored = %state, "checkpoint state is disabled, using initial state");
        }

        let breaker = match ports.runtime.load_breaker(REASONING_ENGINE)? {
            Some(saved) => CircuitBreaker::from_state(saved, &config.circuit_breaker),
            None => CircuitBreaker::new(REASONING_ENGINE, &config.circuit_breaker, now),
        };

        let budget = BudgetTracker::new(ports.ledger.clone(), &config.budget);
        let emitter =
            LearningEventEmitter::new(ports.learning.clone(), config.storage.learning_write_retries)
                .with_backoff(io_backoff);
        let detector = RunawayDetector::new(config.runaway.clone());
        let interval = IntervalPolicy::from_config(&config.tick_loop);
        let engine_timeout = Duration::from_secs(config.engine.timeout.max(1));

        let mut report = HealthReport::starting(state, now);
        report.breaker = breaker.status();
        report.tick_count = working_set.tick_count;
        let health = HealthHandle::new(report);

        info!(
            state = %state,
            engine = engine.name(),
            breaker = %breaker.status(),
            "tick orchestrator ready"
        );

        Ok(Self {
            config,
            store: ports.runtime,
            engine,
            budget,
            breaker,
            machine,
            working_set,
            ws_store,
            detector,
            emitter,
            backoff,
            interval,
            engine_timeout,
            bus,
            health,
            failed_ticks: 0,
            runaway_active: false,
            last_tick_at: None,
        })
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    pub fn current_state(&self) -> RuntimeState {
        self.machine.current_state()
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working_set
    }

    pub fn breaker_status(&self) -> CircuitStatus {
        self.breaker.status()
    }

    pub fn runaway_score(&self) -> RunawayScore {
        self.detector.score()
    }

    pub fn has_pending_checkpoint(&self) -> bool {
        self.ws_store.pending_checkpoint().is_some()
    }

    /// Run ticks until `shutdown` fires. Never returns early on tick failures.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            base_secs = self.interval.base().as_secs(),
            "tick loop started"
        );
        while !shutdown.is_cancelled() {
            let outcome = self.tick().await;
            let wait = outcome.next_interval();
            debug!(outcome = outcome.kind(), wait_secs = wait.as_secs(), "sleeping");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if let Err(e) = self.ws_store.flush_pending().await {
            warn!(error = %e, "final checkpoint flush failed");
        }
        self.bus.publish(Event::Shutdown);
        info!("tick loop stopped");
    }

    /// Run one tick. Never returns an error: every failure becomes an outcome.
    pub async fn tick(&mut self) -> TickOutcome {
        let tick_id = Uuid::new_v4();
        let now = Utc::now();
        self.bus.publish(Event::TickStarted { tick_id });

        let outcome = self.tick_inner(tick_id, now).await;
        self.last_tick_at = Some(now);
        self.finish(&outcome, now);
        outcome
    }

    async fn tick_inner(&mut self, tick_id: TickId, now: DateTime<Utc>) -> TickOutcome {
        if self.ws_store.pending_checkpoint().is_some()
            && let Err(e) = self.ws_store.flush_pending().await
        {
            debug!(error = %e, "carried-over checkpoint still not persisted");
        }

        // (1) Load what this tick decides on.
        let (overrides, budget) = match self.load_inputs(now) {
            Ok(inputs) => inputs,
            Err(e) => return self.tick_failed(tick_id, now, e, false).await,
        };
        self.health.update(|r| {
            r.paused = overrides.paused;
            r.safe_mode = overrides.safe_mode;
            r.throttled = budget.throttle_active;
            r.budget_used = budget.used_in_window;
            r.budget_limit = budget.limit;
        });

        if overrides.paused {
            debug!(%tick_id, "paused, skipping engine call");
            self.bus.publish(Event::TickPaused { tick_id });
            return TickOutcome::Paused {
                tick_id,
                next: self.interval.base(),
            };
        }

        // (2) Gating.
        if budget.throttle_active {
            self.bus.publish(Event::BudgetThrottled {
                used: budget.used_in_window,
                limit: budget.limit,
            });
        }
        if budget.withheld() {
            let wait = self.interval.gated(budget.retry_after());
            info!(
                %tick_id,
                used = budget.used_in_window,
                limit = budget.limit,
                reserved = budget.reserved_for_other_consumer,
                wait_secs = wait.as_secs(),
                "budget withheld, waiting"
            );
            return self.gated(tick_id, GateReason::Budget, wait);
        }
        let before = self.breaker.status();
        let allowed = self.breaker.allow_request_at(now);
        self.save_breaker(before);
        if !allowed {
            let wait = self.interval.gated(self.breaker.retry_after(now));
            info!(%tick_id, wait_secs = wait.as_secs(), "circuit open, waiting");
            return self.gated(tick_id, GateReason::Breaker, wait);
        }

        // (3) Snapshot.
        let external_events = self.pending_external_events();
        let snapshot = self.build_snapshot(tick_id, now, budget.clone(), overrides, external_events);

        // (4) Engine call, bounded.
        let request = match self.call_engine(&snapshot).await {
            Ok(req) => req,
            Err(e) => return self.tick_failed(tick_id, now, e, true).await,
        };

        // (5) The call happened: it counts against the quota exactly once.
        if let Err(e) = self.budget.record_at(&tick_id.to_string(), now) {
            warn!(%tick_id, error = %e, "could not record budget consumption");
        }
        let before = self.breaker.status();
        self.breaker.record_success_at(now);
        self.save_breaker(before);

        // (6) State machine.
        let before_ws = self.working_set.clone();
        let from = self.machine.current_state();
        let accepted = match self.machine.apply(&request) {
            Ok(to) => {
                if from != to {
                    info!(%tick_id, %from, %to, transition = %request.transition_type, "state changed");
                } else {
                    debug!(%tick_id, state = %to, "state unchanged");
                }
                self.bus.publish(Event::TransitionApplied { tick_id, from, to });
                true
            }
            Err(reason) => {
                warn!(%tick_id, %reason, "transition rejected, continuing in current state");
                self.bus.publish(Event::TransitionRejected {
                    tick_id,
                    reason: reason.to_string(),
                });
                false
            }
        };

        // (7) Working set.
        let significant = if accepted {
            self.apply_request(tick_id, &request, overrides, now)
        } else {
            0
        };
        self.working_set.replan_requested = false;
        self.working_set.tick_count += 1;
        self.working_set.last_tick_id = Some(tick_id);
        self.working_set.updated_at = Some(now);

        // (8) Runaway. Rejected requests are scored too: asking for the same
        // refused move every tick is a loop.
        let active_ref = before_ws.active_task().map(|t| t.id.to_string());
        let record = TickRecord {
            significant_progress: significant,
            action_signature: request.effective_signature(active_ref.as_deref()),
            engine_called: true,
            ..TickRecord::new(now)
        };
        let check = self.check_runaway(tick_id, record, &before_ws).await;

        // (9) Persist.
        let state = self.machine.current_state();
        if let Err(e) = self.ws_store.persist(state, &self.working_set, tick_id).await {
            self.detector.mark_last_failed();
            self.bus.publish(Event::PersistFailed {
                tick_id,
                error: e.to_string(),
            });
            let before = self.breaker.status();
            self.breaker.record_failure_at(now);
            self.save_breaker(before);
            self.failed_ticks = self.failed_ticks.saturating_add(1);
            let wait = self.backoff.delay(self.failed_ticks - 1);
            return TickOutcome::Failed {
                tick_id,
                error: e.to_string(),
                next: self.interval.next(IntervalInputs {
                    runaway: check.score.is_runaway,
                    backoff: Some(wait),
                    ..Default::default()
                }),
            };
        }
        self.ack_external_events(&snapshot.external_events);
        self.failed_ticks = 0;

        // (10) Next interval.
        let backoff = check
            .error_driven
            .then(|| self.backoff.delay(self.detector.consecutive_errors()));
        let next = self.interval.next(IntervalInputs {
            throttle: budget.throttle_active,
            runaway: check.score.is_runaway,
            backoff,
            suggested: if accepted {
                request.suggested_next_interval
            } else {
                None
            },
        });
        TickOutcome::Completed {
            tick_id,
            state,
            next,
        }
    }

    fn load_inputs(&self, now: DateTime<Utc>) -> Result<(Overrides, BudgetSnapshot)> {
        let overrides = self.store.overrides()?;
        let budget = self.budget.snapshot_at(now)?;
        Ok((overrides, budget))
    }

    fn pending_external_events(&self) -> Vec<ExternalEvent> {
        match self
            .store
            .pending_external_events(self.config.storage.external_event_batch)
        {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "could not read external events");
                Vec::new()
            }
        }
    }

    fn ack_external_events(&self, events: &[ExternalEvent]) {
        if events.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        if let Err(e) = self.store.ack_external_events(&ids) {
            warn!(count = ids.len(), error = %e, "could not acknowledge external events");
        }
    }

    fn build_snapshot(
        &self,
        tick_id: TickId,
        now: DateTime<Utc>,
        budget: BudgetSnapshot,
        overrides: Overrides,
        external_events: Vec<ExternalEvent>,
    ) -> EnvironmentSnapshot {
        let mut hints = Vec::new();
        if self.working_set.replan_requested {
            hints.push("replan".to_string());
        }
        if overrides.safe_mode {
            hints.push("safe_mode".to_string());
        }
        if budget.throttle_active {
            hints.push("budget_throttled".to_string());
        }

        let engine_health = match self.breaker.status() {
            CircuitStatus::Closed => ServiceHealth::Healthy,
            CircuitStatus::HalfOpen => ServiceHealth::Degraded,
            CircuitStatus::Open => ServiceHealth::Down,
        };
        let store_health = if self.ws_store.pending_checkpoint().is_some() {
            ServiceHealth::Degraded
        } else {
            ServiceHealth::Healthy
        };
        let service_health = BTreeMap::from([
            (REASONING_ENGINE.to_string(), engine_health),
            ("store".to_string(), store_health),
        ]);

        EnvironmentSnapshot {
            tick_id,
            timestamp: now,
            since_last_tick_secs: self
                .last_tick_at
                .map(|t| (now - t).num_seconds().max(0) as u64),
            current_state: self.machine.current_state(),
            error_streak: self.detector.consecutive_errors(),
            breaker: self.breaker.status(),
            budget,
            external_events,
            service_health,
            working_set: self.working_set.clone(),
            overrides,
            hints,
        }
    }

    async fn call_engine(&self, snapshot: &EnvironmentSnapshot) -> Result<StateTransitionRequest> {
        let reply = match tokio::time::timeout(self.engine_timeout, self.engine.invoke(snapshot)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(PulseError::EngineTimeout {
                    secs: self.engine_timeout.as_secs(),
                });
            }
        };
        self.bus.publish(Event::EngineInvoked {
            tick_id: snapshot.tick_id,
            latency_ms: reply.latency_ms,
        });
        parse_transition_request(&reply.body)
    }

    /// Apply an accepted request to the working set. Returns the number of
    /// significant progress markers recorded.
    ///
    /// A request whose idempotency key was already applied only updates the
    /// notes: no task moves, no markers.
    fn apply_request(
        &mut self,
        tick_id: TickId,
        request: &StateTransitionRequest,
        overrides: Overrides,
        now: DateTime<Utc>,
    ) -> u32 {
        if request.thought_summary.is_some() {
            self.working_set.last_thought_summary = request.thought_summary.clone();
        }
        if request.intent.is_some() {
            self.working_set.last_intent = request.intent.clone();
        }
        if request.expected_evidence.is_some() {
            self.working_set.last_expected_evidence = request.expected_evidence.clone();
        }

        if let Some(key) = request.idempotency_key.as_deref()
            && self.working_set.has_key(key)
        {
            info!(%tick_id, key = %key, "side effect already applied, skipping replay");
            return 0;
        }

        let mut markers: Vec<ProgressMarker> = Vec::new();

        match request.transition_type {
            TransitionType::StartNewTask => {
                let id = self.working_set.start_task(
                    request.new_task_description(),
                    request.stop_condition.clone(),
                    now,
                );
                info!(%tick_id, task_id = %id, "task started");
                markers.push(ProgressMarker::new(tick_id, MARKER_TASK_STARTED, now));
            }
            TransitionType::ContinueExistingTask => {
                if let Some(reference) = request.continuation_ref.as_deref() {
                    self.resume_task(tick_id, reference, now, &mut markers);
                }
            }
            TransitionType::EnterSafeMode => self.enter_safe_mode(tick_id, request, overrides),
            TransitionType::Explore | TransitionType::RequestRest => {}
        }

        if let Some(update) = &request.task_update {
            match self
                .working_set
                .transition_task(update.task_id, update.state, now)
            {
                Ok(from) => {
                    debug!(%tick_id, task_id = %update.task_id, %from, to = %update.state, "task moved");
                    let kind = if update.state == TaskState::Done {
                        MARKER_TASK_COMPLETED
                    } else {
                        MARKER_TASK_STATE_CHANGED
                    };
                    markers.push(ProgressMarker::new(tick_id, kind, now).verified());
                }
                Err(rejection) => self.task_rejected(tick_id, rejection.to_string()),
            }
        }

        // Safe mode remembers its key only once the override is written.
        if request.transition_type != TransitionType::EnterSafeMode
            && let Some(key) = &request.idempotency_key
        {
            self.working_set.remember_key(key.clone());
        }

        for reported in &request.progress_markers {
            markers.push(
                ProgressMarker::new(tick_id, reported.marker_type.clone(), now)
                    .with_evidence(reported.evidence.clone()),
            );
        }

        let mut significant = 0;
        for marker in markers {
            if self.config.progress.is_significant(&marker.marker_type) {
                significant += 1;
            }
            self.working_set.push_marker(marker);
        }
        significant
    }

    fn resume_task(
        &mut self,
        tick_id: TickId,
        reference: &str,
        now: DateTime<Utc>,
        markers: &mut Vec<ProgressMarker>,
    ) {
        let Some(task) = self.working_set.find_by_ref(reference) else {
            self.task_rejected(tick_id, format!("unknown continuation_ref '{reference}'"));
            return;
        };
        if task.state == TaskState::Active {
            return;
        }
        let id = task.id;
        match self.working_set.transition_task(id, TaskState::Active, now) {
            Ok(from) => {
                info!(%tick_id, task_id = %id, %from, "task resumed");
                markers.push(ProgressMarker::new(tick_id, MARKER_TASK_STATE_CHANGED, now));
            }
            Err(rejection) => self.task_rejected(tick_id, rejection.to_string()),
        }
    }

    fn enter_safe_mode(
        &mut self,
        tick_id: TickId,
        request: &StateTransitionRequest,
        overrides: Overrides,
    ) {
        if overrides.safe_mode {
            return;
        }
        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("{}:{tick_id}", Overrides::SAFE_MODE));
        match self
            .store
            .set_override(Overrides::SAFE_MODE, true, OVERRIDE_ACTOR)
        {
            Ok(()) => {
                self.working_set.remember_key(key);
                warn!(%tick_id, reason = %request.reason, "safe mode enabled by engine request");
            }
            Err(e) => warn!(%tick_id, error = %e, "could not enable safe mode"),
        }
    }

    fn task_rejected(&self, tick_id: TickId, reason: String) {
        warn!(%tick_id, %reason, "task update rejected");
        self.bus.publish(Event::TaskRejected { tick_id, reason });
    }

    /// Score the tick and mitigate on runaway. Learning events fire once per episode.
    async fn check_runaway(
        &mut self,
        tick_id: TickId,
        record: TickRecord,
        before_ws: &WorkingSet,
    ) -> RunawayCheck {
        let score = self.detector.observe(record);
        let rising = score.is_runaway && !self.runaway_active;
        self.runaway_active = score.is_runaway;

        if !score.is_runaway {
            return RunawayCheck {
                score,
                error_driven: false,
            };
        }

        let runaway_type = RunawayDetector::classify(&score);
        if rising {
            warn!(
                %tick_id,
                %runaway_type,
                total = score.total,
                consecutive = score.consecutive_high_ticks,
                "runaway detected"
            );
            self.bus.publish(Event::RunawayDetected {
                tick_id,
                runaway_type,
                total: score.total,
            });
        }

        self.mitigate(tick_id);

        if rising {
            let now = Utc::now();
            let (window_start, window_end) = self.detector.window_bounds().unwrap_or((now, now));
            let ctx = RunawayContext {
                tick_id,
                score,
                runaway_type,
                window_start,
                window_end,
                tick_count: self.detector.tick_count() as u64,
                working_set_before: before_ws,
                working_set_after: &self.working_set,
                action_signatures: self.detector.signatures(),
                consecutive_errors: self.detector.consecutive_errors(),
            };
            let (event, stored) = self.emitter.emit(ctx).await;
            if stored {
                self.bus.publish(Event::LearningEventEmitted { event_id: event.id });
            } else {
                self.bus.publish(Event::LearningEventDropped { event_id: event.id });
            }
        }

        RunawayCheck {
            score,
            error_driven: runaway_type == RunawayType::ErrorDriven,
        }
    }

    /// Ask for a replan and park an active task that has no way to finish.
    fn mitigate(&mut self, tick_id: TickId) {
        self.working_set.replan_requested = true;

        let no_exit = self.working_set.last_expected_evidence.is_none();
        let to_park: Vec<_> = self
            .working_set
            .active
            .iter()
            .filter(|t| t.stop_condition.is_none() && no_exit)
            .map(|t| t.id)
            .collect();
        for id in to_park {
            if self
                .working_set
                .transition_task(id, TaskState::Parked, Utc::now())
                .is_ok()
            {
                info!(%tick_id, task_id = %id, "parked open-ended task during runaway");
            }
        }
    }

    fn gated(&self, tick_id: TickId, reason: GateReason, wait: Duration) -> TickOutcome {
        self.bus.publish(Event::TickGated {
            tick_id,
            reason: reason.to_string(),
            wait_secs: wait.as_secs(),
        });
        TickOutcome::Gated {
            tick_id,
            reason,
            wait,
        }
    }

    /// Handle a failed tick. Engine failures count against the breaker.
    async fn tick_failed(
        &mut self,
        tick_id: TickId,
        now: DateTime<Utc>,
        error: PulseError,
        engine_called: bool,
    ) -> TickOutcome {
        if error.is_engine_failure() {
            let before = self.breaker.status();
            self.breaker.record_failure_at(now);
            self.save_breaker(before);
            self.bus.publish(Event::EngineFailed {
                tick_id,
                error: error.to_string(),
            });
        }
        self.failed_ticks = self.failed_ticks.saturating_add(1);
        warn!(
            %tick_id,
            error = %error,
            failed_ticks = self.failed_ticks,
            breaker = %self.breaker.status(),
            "tick failed"
        );

        let before_ws = self.working_set.clone();
        let check = self
            .check_runaway(tick_id, TickRecord::failed(now, engine_called), &before_ws)
            .await;

        let wait = self.backoff.delay(self.failed_ticks - 1);
        TickOutcome::Failed {
            tick_id,
            error: error.to_string(),
            next: self.interval.next(IntervalInputs {
                runaway: check.score.is_runaway,
                backoff: Some(wait),
                ..Default::default()
            }),
        }
    }

    fn save_breaker(&self, before: CircuitStatus) {
        let after = self.breaker.status();
        if before != after {
            info!(capability = self.breaker.capability(), from = %before, to = %after, "breaker state changed");
            self.bus.publish(Event::BreakerChanged {
                capability: self.breaker.capability().to_string(),
                status: after,
            });
        }
        if let Err(e) = self.store.save_breaker(self.breaker.state()) {
            warn!(error = %e, "could not save breaker state");
        }
    }

    fn finish(&mut self, outcome: &TickOutcome, now: DateTime<Utc>) {
        let next = outcome.next_interval();
        match outcome {
            TickOutcome::Completed { tick_id, state, .. } => {
                self.bus.publish(Event::TickCompleted {
                    tick_id: *tick_id,
                    state: *state,
                    next_interval_secs: next.as_secs(),
                });
            }
            TickOutcome::Failed { tick_id, error, .. } => {
                self.bus.publish(Event::TickFailed {
                    tick_id: *tick_id,
                    error: error.clone(),
                });
            }
            TickOutcome::Paused { .. } | TickOutcome::Gated { .. } => {}
        }

        let score = self.detector.score();
        let state = self.machine.current_state();
        let breaker = self.breaker.status();
        let error_streak = self.detector.consecutive_errors();
        let persist_pending = self.ws_store.pending_checkpoint().is_some();
        let dropped = self.emitter.dropped();
        let tick_count = self.working_set.tick_count;
        let runaway_active = self.runaway_active;
        self.health.update(|r| {
            r.state = state;
            r.tick_count = tick_count;
            r.last_tick_id = Some(outcome.tick_id());
            r.last_tick_at = Some(now);
            if matches!(outcome, TickOutcome::Completed { .. }) {
                r.last_success_at = Some(now);
            }
            r.last_outcome = Some(outcome.kind().to_string());
            r.next_tick_in_secs = next.as_secs();
            r.breaker = breaker;
            r.error_streak = error_streak;
            r.runaway_score = score.total;
            r.runaway_active = runaway_active;
            r.persist_pending = persist_pending;
            r.learning_events_dropped = dropped;
        });

        if let Some(path) = &self.config.health.file
            && let Err(e) = write_health_file(path, &self.health.snapshot())
        {
            warn!(path = %path.display(), error = %e, "could not write health file");
        }
    }
}
