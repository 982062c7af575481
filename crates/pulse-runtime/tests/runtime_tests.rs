#[cfg(test)]
mod tests {
    use pulse_config::{PulseConfig, RunawayConfig, RunawayWeights};
    use pulse_core::{
        Event, EventBus, Overrides, QuotaLedger, RuntimeState, RuntimeStore,
        StateTransitionRequest, TaskState, TaskUpdate, TransitionType,
    };
    use pulse_engine::MockEngine;
    use pulse_runtime::{GateReason, Ports, TickOrchestrator, TickOutcome};
    use pulse_store::Store;
    use std::sync::Arc;

    fn config() -> PulseConfig {
        let mut config = PulseConfig::default();
        config.engine.provider = "mock".into();
        config.backoff.jitter = 0.0;
        config
    }

    fn orchestrator(
        config: PulseConfig,
        store: &Arc<Store>,
        engine: &MockEngine,
    ) -> TickOrchestrator {
        TickOrchestrator::new(
            config,
            Ports::shared(store.clone()),
            Arc::new(engine.clone()),
            EventBus::default(),
        )
        .unwrap()
    }

    fn request(state: RuntimeState, kind: TransitionType) -> StateTransitionRequest {
        StateTransitionRequest {
            transition_type: kind,
            reason: "test".into(),
            ..StateTransitionRequest::continue_in(state)
        }
    }

    // ── Happy path ─────────────────────────────────────────────

    mod completed {
        use super::*;

        #[tokio::test]
        async fn test_tick_applies_transition_and_persists() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test")
                .with_request(&request(RuntimeState::Thinking, TransitionType::Explore));
            let mut orch = orchestrator(config(), &store, &engine);

            let outcome = orch.tick().await;
            assert!(matches!(
                outcome,
                TickOutcome::Completed {
                    state: RuntimeState::Thinking,
                    ..
                }
            ));
            assert_eq!(outcome.next_interval().as_secs(), 60);
            assert_eq!(orch.current_state(), RuntimeState::Thinking);

            let cp = store.load_checkpoint().unwrap().unwrap();
            assert_eq!(cp.state, RuntimeState::Thinking);
            assert_eq!(cp.tick_id, outcome.tick_id());
            assert_eq!(cp.working_set.tick_count, 1);

            // Exactly one budget entry, keyed by the tick id.
            let now = chrono::Utc::now();
            let usage = store
                .usage("reasoning_engine", now - chrono::Duration::hours(1), now)
                .unwrap();
            assert_eq!(usage.count, 1);
            assert!(
                !store
                    .append(
                        "reasoning_engine",
                        &outcome.tick_id().to_string(),
                        "other",
                        now
                    )
                    .unwrap()
            );
        }

        #[tokio::test]
        async fn test_rejected_transition_continues_in_place() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            // Default table has no idle → acting edge.
            let engine = MockEngine::new("test")
                .with_request(&request(RuntimeState::Acting, TransitionType::Explore));
            let bus = EventBus::default();
            let mut events = bus.subscribe();
            let mut orch = TickOrchestrator::new(
                config(),
                Ports::shared(store.clone()),
                Arc::new(engine.clone()),
                bus,
            )
            .unwrap();

            let outcome = orch.tick().await;
            assert!(matches!(outcome, TickOutcome::Completed { .. }));
            assert_eq!(orch.current_state(), RuntimeState::Idle);

            let mut rejected = false;
            while let Ok(event) = events.try_recv() {
                if matches!(event, Event::TransitionRejected { .. }) {
                    rejected = true;
                }
            }
            assert!(rejected);
        }

        #[tokio::test]
        async fn test_suggested_interval_is_clamped() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test").with_request(&StateTransitionRequest {
                suggested_next_interval: Some(2),
                ..request(RuntimeState::Idle, TransitionType::ContinueExistingTask)
            });
            let mut orch = orchestrator(config(), &store, &engine);
            assert_eq!(orch.tick().await.next_interval().as_secs(), 10);
        }

        #[tokio::test]
        async fn test_checkpoint_survives_restart() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test").with_request(&StateTransitionRequest {
                task_description: Some("write the report".into()),
                ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
            });
            let mut first = orchestrator(config(), &store, &engine);
            first.tick().await;
            let task_id = first.working_set().active_task().unwrap().id;
            drop(first);

            let second = orchestrator(config(), &store, &engine);
            assert_eq!(second.current_state(), RuntimeState::Thinking);
            assert_eq!(second.working_set().active_task().unwrap().id, task_id);
        }
    }

    // ── Working set updates ────────────────────────────────────

    mod working_set {
        use super::*;

        #[tokio::test]
        async fn test_task_lifecycle_through_requests() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test").with_request(&StateTransitionRequest {
                task_description: Some("index the docs".into()),
                stop_condition: Some("index built".into()),
                expected_evidence: Some("index file exists".into()),
                ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
            });
            let mut orch = orchestrator(config(), &store, &engine);
            orch.tick().await;

            let ws = orch.working_set();
            let task = ws.active_task().unwrap().clone();
            assert_eq!(task.stop_condition.as_deref(), Some("index built"));
            assert_eq!(ws.last_expected_evidence.as_deref(), Some("index file exists"));
            assert_eq!(ws.continuation_ref, Some(task.id.to_string()));

            engine.push(pulse_engine::MockReply::Body(
                serde_json::to_string(&StateTransitionRequest {
                    task_update: Some(TaskUpdate {
                        task_id: task.id,
                        state: TaskState::Done,
                    }),
                    ..request(RuntimeState::Thinking, TransitionType::ContinueExistingTask)
                })
                .unwrap(),
            ));
            orch.tick().await;

            let ws = orch.working_set();
            assert!(ws.active.is_empty());
            assert_eq!(ws.archived[0].id, task.id);
            assert!(
                ws.recent_markers
                    .iter()
                    .any(|m| m.marker_type == "task_completed" && m.verified)
            );
        }

        #[tokio::test]
        async fn test_illegal_task_move_is_rejected() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test").with_request(&StateTransitionRequest {
                task_description: Some("first".into()),
                ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
            });
            let mut orch = orchestrator(config(), &store, &engine);
            orch.tick().await;
            let first = orch.working_set().active_task().unwrap().id;

            // Starting a second task parks the first; parked → done is illegal.
            engine.push(pulse_engine::MockReply::Body(
                serde_json::to_string(&StateTransitionRequest {
                    task_description: Some("second".into()),
                    task_update: Some(TaskUpdate {
                        task_id: first,
                        state: TaskState::Done,
                    }),
                    ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
                })
                .unwrap(),
            ));
            orch.tick().await;

            let ws = orch.working_set();
            assert_eq!(ws.parked[0].id, first);
            assert!(ws.archived.is_empty());
        }

        #[tokio::test]
        async fn test_safe_mode_request_sets_override_once() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let enter = StateTransitionRequest {
                idempotency_key: Some("safe-1".into()),
                ..request(RuntimeState::Idle, TransitionType::EnterSafeMode)
            };
            let engine = MockEngine::new("test").with_request(&enter);
            let mut orch = orchestrator(config(), &store, &engine);
            orch.tick().await;

            assert!(store.overrides().unwrap().safe_mode);
            assert!(orch.working_set().has_key("safe-1"));

            // Operator clears it; a replay of the same request is suppressed.
            store
                .set_override(Overrides::SAFE_MODE, false, "operator")
                .unwrap();
            engine.push(pulse_engine::MockReply::Body(
                serde_json::to_string(&enter).unwrap(),
            ));
            orch.tick().await;
            assert!(!store.overrides().unwrap().safe_mode);
        }

        #[tokio::test]
        async fn test_replayed_key_does_not_start_second_task() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let reply = StateTransitionRequest {
                task_description: Some("answer the email".into()),
                idempotency_key: Some("email-1".into()),
                thought_summary: Some("drafting".into()),
                ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
            };
            let engine = MockEngine::new("test")
                .with_request(&reply)
                .with_request(&StateTransitionRequest {
                    thought_summary: Some("drafting again".into()),
                    ..reply.clone()
                });
            let mut orch = orchestrator(config(), &store, &engine);
            orch.tick().await;
            let first = orch.working_set().active_task().unwrap().id;

            assert!(matches!(orch.tick().await, TickOutcome::Completed { .. }));
            let ws = orch.working_set();
            assert_eq!(ws.task_count(), 1);
            assert_eq!(ws.active_task().unwrap().id, first);
            assert!(ws.parked.is_empty());
            assert_eq!(
                ws.recent_markers
                    .iter()
                    .filter(|m| m.marker_type == "task_started")
                    .count(),
                1
            );
            // Notes still follow the latest reply.
            assert_eq!(ws.last_thought_summary.as_deref(), Some("drafting again"));

            // A fresh key is applied as usual.
            engine.push(pulse_engine::MockReply::Body(
                serde_json::to_string(&StateTransitionRequest {
                    task_description: Some("answer the next email".into()),
                    idempotency_key: Some("email-2".into()),
                    ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
                })
                .unwrap(),
            ));
            orch.tick().await;
            assert_eq!(orch.working_set().task_count(), 2);
            assert_eq!(orch.working_set().parked[0].id, first);
        }

        #[tokio::test]
        async fn test_external_events_acked_after_persist() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            store
                .enqueue_external_event("cli", "note", &serde_json::json!({"text": "hello"}))
                .unwrap();
            let engine = MockEngine::new("test");
            let mut orch = orchestrator(config(), &store, &engine);
            orch.tick().await;

            assert_eq!(engine.requests.lock()[0].external_events.len(), 1);
            assert!(store.pending_external_events(10).unwrap().is_empty());
        }
    }

    // ── Gating ─────────────────────────────────────────────────

    mod gating {
        use super::*;

        #[tokio::test]
        async fn test_paused_never_calls_engine() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            store.set_override(Overrides::PAUSED, true, "operator").unwrap();
            let engine = MockEngine::new("test");
            let mut orch = orchestrator(config(), &store, &engine);

            let outcome = orch.tick().await;
            assert!(matches!(outcome, TickOutcome::Paused { .. }));
            assert_eq!(engine.request_count(), 0);
            assert!(orch.health().snapshot().paused);
        }

        #[tokio::test]
        async fn test_budget_withheld_waits_for_oldest_entry() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let mut cfg = config();
            cfg.budget.limit = 2;
            cfg.budget.window_duration = 600;
            cfg.budget.reserved_for_other_consumer = 0;
            let now = chrono::Utc::now();
            store
                .append("reasoning_engine", "sibling-1", "consolidator", now)
                .unwrap();
            store
                .append("reasoning_engine", "sibling-2", "consolidator", now)
                .unwrap();

            let engine = MockEngine::new("test");
            let mut orch = orchestrator(cfg, &store, &engine);
            match orch.tick().await {
                TickOutcome::Gated { reason, wait, .. } => {
                    assert_eq!(reason, GateReason::Budget);
                    assert!(wait.as_secs() > 500 && wait.as_secs() <= 600);
                }
                other => panic!("expected gated, got {other:?}"),
            }
            assert_eq!(engine.request_count(), 0);
        }

        #[tokio::test]
        async fn test_failures_open_breaker_then_gate() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let mut cfg = config();
            cfg.circuit_breaker.error_threshold = 2;
            let engine = MockEngine::new("test").with_error("down").with_error("down");
            let mut orch = orchestrator(cfg, &store, &engine);

            let first = orch.tick().await;
            assert!(matches!(first, TickOutcome::Failed { .. }));
            assert_eq!(first.next_interval().as_secs(), 60);
            assert!(matches!(orch.tick().await, TickOutcome::Failed { .. }));
            assert_eq!(orch.breaker_status(), pulse_core::CircuitStatus::Open);

            let gated = orch.tick().await;
            assert!(matches!(
                gated,
                TickOutcome::Gated {
                    reason: GateReason::Breaker,
                    ..
                }
            ));
            assert_eq!(engine.request_count(), 2);

            // Breaker state is shared through the store.
            let saved = store.load_breaker("reasoning_engine").unwrap().unwrap();
            assert_eq!(saved.status, pulse_core::CircuitStatus::Open);
            assert!(store.load_checkpoint().unwrap().is_none());
        }

        #[tokio::test]
        async fn test_unparseable_reply_is_a_failure() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test").with_body("I would rather not say.");
            let mut orch = orchestrator(config(), &store, &engine);

            assert!(matches!(orch.tick().await, TickOutcome::Failed { .. }));
            assert_eq!(orch.current_state(), RuntimeState::Idle);
            assert_eq!(orch.health().snapshot().error_streak, 1);
        }

        #[tokio::test]
        async fn test_engine_timeout_is_a_failure() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let mut cfg = config();
            cfg.engine.timeout = 1;
            let engine = MockEngine::new("slow").with_delay(
                std::time::Duration::from_secs(3),
                pulse_engine::MockReply::Body("{}".into()),
            );
            let mut orch = orchestrator(cfg, &store, &engine);

            match orch.tick().await {
                TickOutcome::Failed { error, .. } => assert!(error.contains("timed out")),
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    // ── Runaway ────────────────────────────────────────────────

    mod runaway {
        use super::*;

        fn runaway_config() -> PulseConfig {
            let mut cfg = config();
            cfg.runaway = RunawayConfig {
                window_size: 3,
                score_threshold: 0.5,
                consecutive_ticks_required: 2,
                weights: RunawayWeights {
                    progress_absence: 1.0,
                    trigger_density: 0.0,
                    signature_repetition: 0.0,
                    error_streak: 0.0,
                },
                ..RunawayConfig::default()
            };
            cfg
        }

        #[tokio::test]
        async fn test_one_learning_event_per_episode() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test");
            let mut orch = orchestrator(runaway_config(), &store, &engine);

            orch.tick().await;
            assert_eq!(store.learning_event_count().unwrap(), 0);

            let second = orch.tick().await;
            assert_eq!(store.learning_event_count().unwrap(), 1);
            // Runaway doubles the interval.
            assert_eq!(second.next_interval().as_secs(), 120);
            assert!(orch.working_set().replan_requested);
            assert!(orch.health().snapshot().runaway_active);

            orch.tick().await;
            assert_eq!(store.learning_event_count().unwrap(), 1);
            assert!(engine.requests.lock()[2].hints.contains(&"replan".to_string()));

            let event = &store.unprocessed_learning_events(10).unwrap()[0];
            assert_eq!(event.event_type, pulse_core::LearningEvent::RUNAWAY_DETECTED);
            assert!(event.score.is_runaway);
            assert!(event.hypothesis.is_some());
        }

        #[tokio::test]
        async fn test_progress_ends_episode() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test");
            let mut orch = orchestrator(runaway_config(), &store, &engine);
            orch.tick().await;
            orch.tick().await;
            assert!(orch.runaway_score().is_runaway);

            for _ in 0..3 {
                engine.push(pulse_engine::MockReply::Body(
                    serde_json::to_string(&StateTransitionRequest {
                        progress_markers: vec![
                            pulse_core::ReportedMarker {
                                marker_type: "step_advanced".into(),
                                evidence: None,
                            };
                            3
                        ],
                        ..StateTransitionRequest::continue_in(RuntimeState::Idle)
                    })
                    .unwrap(),
                ));
                orch.tick().await;
            }
            assert!(!orch.runaway_score().is_runaway);
            assert!(!orch.health().snapshot().runaway_active);
        }

        #[tokio::test]
        async fn test_repeated_request_without_signature_is_a_loop() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let required = RunawayConfig::default().consecutive_ticks_required;
            let body = r#"{"desired_state":"thinking","transition_type":"explore","reason":"look again"}"#;
            let mut engine = MockEngine::new("test");
            for _ in 0..required {
                engine = engine.with_body(body);
            }
            let mut orch = orchestrator(config(), &store, &engine);

            for i in 1..=required {
                assert!(matches!(orch.tick().await, TickOutcome::Completed { .. }));
                let score = orch.runaway_score();
                assert_eq!(score.components.signature_repetition, 1.0, "tick {i}");
                assert_eq!(score.consecutive_high_ticks, i, "tick {i}");
                assert_eq!(score.is_runaway, i == required, "tick {i}: {score:?}");
            }

            let events = store.unprocessed_learning_events(10).unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].runaway_type, pulse_core::RunawayType::SignatureLoop);
            assert!(
                events[0]
                    .action_signatures
                    .iter()
                    .all(|s| s == "thinking:explore:-")
            );
        }

        #[tokio::test]
        async fn test_open_ended_task_is_parked() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test").with_request(&StateTransitionRequest {
                task_description: Some("think about things".into()),
                ..request(RuntimeState::Thinking, TransitionType::StartNewTask)
            });
            let mut orch = orchestrator(runaway_config(), &store, &engine);
            orch.tick().await;
            assert_eq!(orch.working_set().active.len(), 1);

            orch.tick().await;
            assert!(orch.working_set().active.is_empty());
            assert_eq!(orch.working_set().parked.len(), 1);
        }
    }

    // ── Persistence failures ───────────────────────────────────

    mod persistence {
        use super::*;
        use pulse_core::{
            Checkpoint, CircuitBreakerState, ExternalEvent, PulseError, Result,
        };
        use std::sync::atomic::{AtomicU32, Ordering};
        use uuid::Uuid;

        /// Delegates to a real store but refuses the next N checkpoint commits.
        struct FlakyStore {
            inner: Arc<Store>,
            failures_left: AtomicU32,
        }

        impl FlakyStore {
            fn fail_next(&self, commits: u32) {
                self.failures_left.store(commits, Ordering::SeqCst);
            }
        }

        impl RuntimeStore for FlakyStore {
            fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
                self.inner.load_checkpoint()
            }

            fn commit_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(PulseError::Storage("database is locked".into()));
                }
                self.inner.commit_checkpoint(checkpoint)
            }

            fn load_breaker(&self, capability: &str) -> Result<Option<CircuitBreakerState>> {
                self.inner.load_breaker(capability)
            }

            fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()> {
                self.inner.save_breaker(state)
            }

            fn overrides(&self) -> Result<Overrides> {
                self.inner.overrides()
            }

            fn set_override(&self, name: &str, enabled: bool, set_by: &str) -> Result<()> {
                self.inner.set_override(name, enabled, set_by)
            }

            fn pending_external_events(&self, limit: usize) -> Result<Vec<ExternalEvent>> {
                self.inner.pending_external_events(limit)
            }

            fn ack_external_events(&self, ids: &[Uuid]) -> Result<()> {
                self.inner.ack_external_events(ids)
            }
        }

        #[tokio::test]
        async fn test_failed_commit_keeps_last_checkpoint_and_retries_next_tick() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let flaky = Arc::new(FlakyStore {
                inner: store.clone(),
                failures_left: AtomicU32::new(0),
            });
            let mut cfg = config();
            cfg.storage.persist_retries = 2;
            let engine = MockEngine::new("test")
                .with_request(&request(RuntimeState::Thinking, TransitionType::Explore))
                .with_request(&request(RuntimeState::Acting, TransitionType::Explore));
            let mut orch = TickOrchestrator::new(
                cfg,
                Ports {
                    runtime: flaky.clone(),
                    ledger: store.clone(),
                    learning: store.clone(),
                },
                Arc::new(engine.clone()),
                EventBus::default(),
            )
            .unwrap();

            let first = orch.tick().await;
            assert!(matches!(first, TickOutcome::Completed { .. }));

            // Every attempt of the second tick's commit fails.
            flaky.fail_next(2);
            let second = orch.tick().await;
            match &second {
                TickOutcome::Failed { error, .. } => assert!(error.contains("locked")),
                other => panic!("expected failure, got {other:?}"),
            }

            let cp = store.load_checkpoint().unwrap().unwrap();
            assert_eq!(cp.tick_id, first.tick_id());
            assert_eq!(cp.state, RuntimeState::Thinking);
            assert_eq!(cp.working_set.tick_count, 1);
            assert!(orch.has_pending_checkpoint());
            // The loop itself moved on in memory.
            assert_eq!(orch.current_state(), RuntimeState::Acting);

            let breaker = store.load_breaker("reasoning_engine").unwrap().unwrap();
            assert_eq!(breaker.consecutive_failures, 1);
            let health = orch.health().snapshot();
            assert_eq!(health.error_streak, 1);
            assert!(health.persist_pending);

            // Next tick (paused, so no engine call) flushes the carried checkpoint first.
            store.set_override(Overrides::PAUSED, true, "operator").unwrap();
            assert!(matches!(orch.tick().await, TickOutcome::Paused { .. }));
            assert!(!orch.has_pending_checkpoint());
            let cp = store.load_checkpoint().unwrap().unwrap();
            assert_eq!(cp.tick_id, second.tick_id());
            assert_eq!(cp.state, RuntimeState::Acting);
            assert_eq!(cp.working_set.tick_count, 2);
            assert_eq!(engine.request_count(), 2);
        }
    }

    // ── Loop ───────────────────────────────────────────────────

    mod run_loop {
        use super::*;
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        #[tokio::test]
        async fn test_run_stops_on_cancel() {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let engine = MockEngine::new("test");
            let mut orch = orchestrator(config(), &store, &engine);

            let token = CancellationToken::new();
            let canceller = {
                let token = token.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    token.cancel();
                }
            };
            tokio::join!(orch.run(token), canceller);

            assert_eq!(engine.request_count(), 1);
            assert!(store.load_checkpoint().unwrap().is_some());
        }

        #[tokio::test]
        async fn test_health_file_written_each_tick() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("health.json");
            let store = Arc::new(Store::open_in_memory().unwrap());
            let mut cfg = config();
            cfg.health.file = Some(path.clone());
            let engine = MockEngine::new("test");
            let mut orch = orchestrator(cfg, &store, &engine);
            orch.tick().await;

            let report: pulse_runtime::HealthReport =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(report.tick_count, 1);
            assert_eq!(report.last_outcome.as_deref(), Some("completed"));
        }
    }
}
