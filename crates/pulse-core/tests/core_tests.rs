#[cfg(test)]
mod tests {
    use pulse_core::*;
    use uuid::Uuid;

    // ── RuntimeState tests ─────────────────────────────────────

    #[test]
    fn test_state_parse_and_display() {
        for state in RuntimeState::ALL {
            let parsed: RuntimeState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert_eq!("DeepRest".parse::<RuntimeState>(), Ok(RuntimeState::DeepRest));
        assert!("sleeping".parse::<RuntimeState>().is_err());
    }

    #[test]
    fn test_reserved_states() {
        assert!(RuntimeState::Resting.is_reserved());
        assert!(RuntimeState::DeepRest.is_reserved());
        assert!(!RuntimeState::Idle.is_reserved());
        assert_eq!(RuntimeState::default(), RuntimeState::Idle);
    }

    // ── StateTransitionRequest tests ───────────────────────────

    #[test]
    fn test_request_from_minimal_json() {
        let req: StateTransitionRequest = serde_json::from_str(
            r#"{"desired_state":"thinking","transition_type":"explore"}"#,
        )
        .unwrap();
        assert_eq!(req.desired_state, RuntimeState::Thinking);
        assert_eq!(req.transition_type, TransitionType::Explore);
        assert!(req.reason.is_empty());
        assert!(req.progress_markers.is_empty());
        assert!(req.validate_fields().is_ok());
    }

    #[test]
    fn test_request_unknown_state_is_rejected_by_serde() {
        let res: std::result::Result<StateTransitionRequest, _> = serde_json::from_str(
            r#"{"desired_state":"dreaming","transition_type":"explore"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_request_confidence_out_of_range() {
        let mut req = StateTransitionRequest::continue_in(RuntimeState::Idle);
        req.confidence = Some(1.5);
        assert!(req.validate_fields().is_err());
        req.confidence = Some(f64::NAN);
        assert!(req.validate_fields().is_err());
        req.confidence = Some(0.7);
        assert!(req.validate_fields().is_ok());
    }

    #[test]
    fn test_request_zero_interval_is_malformed() {
        let mut req = StateTransitionRequest::continue_in(RuntimeState::Idle);
        req.suggested_next_interval = Some(0);
        assert!(req.validate_fields().is_err());
    }

    #[test]
    fn test_start_new_task_needs_description() {
        let mut req = StateTransitionRequest::continue_in(RuntimeState::Acting);
        req.transition_type = TransitionType::StartNewTask;
        assert!(req.validate_fields().is_err());
        req.reason = "tidy the notes".into();
        assert!(req.validate_fields().is_ok());
        assert_eq!(req.new_task_description(), "tidy the notes");
        req.task_description = Some("summarise inbox".into());
        assert_eq!(req.new_task_description(), "summarise inbox");
    }

    #[test]
    fn test_signature_derived_when_engine_sends_none() {
        let req: StateTransitionRequest = serde_json::from_str(
            r#"{"desired_state":"thinking","transition_type":"explore","reason":"look again"}"#,
        )
        .unwrap();
        assert_eq!(
            req.effective_signature(None).as_deref(),
            Some("thinking:explore:-")
        );
        assert_eq!(
            req.effective_signature(Some("task-7")).as_deref(),
            Some("thinking:explore:task-7")
        );

        let mut continuing = StateTransitionRequest::continue_in(RuntimeState::Acting);
        continuing.continuation_ref = Some("task-1".into());
        assert_eq!(
            continuing.effective_signature(Some("task-7")).as_deref(),
            Some("acting:continue_existing_task:task-1")
        );

        continuing.action_signature = Some("send:email".into());
        assert_eq!(
            continuing.effective_signature(None).as_deref(),
            Some("send:email")
        );
    }

    #[test]
    fn test_quiet_requests_have_no_signature() {
        let idle = StateTransitionRequest::continue_in(RuntimeState::Idle);
        assert_eq!(idle.effective_signature(Some("task-1")), None);

        let mut rest = StateTransitionRequest::continue_in(RuntimeState::Thinking);
        rest.transition_type = TransitionType::RequestRest;
        assert_eq!(rest.effective_signature(None), None);
    }

    #[test]
    fn test_empty_marker_type_is_malformed() {
        let mut req = StateTransitionRequest::continue_in(RuntimeState::Acting);
        req.progress_markers.push(ReportedMarker {
            marker_type: "  ".into(),
            evidence: None,
        });
        assert!(req.validate_fields().is_err());
    }

    // ── WorkingSet tests ───────────────────────────────────────

    #[test]
    fn test_working_set_serde_keeps_tasks() {
        let mut ws = WorkingSet::new();
        let now = chrono::Utc::now();
        let id = ws.start_task("draft reply".into(), Some("reply sent".into()), now);
        ws.remember_key("notify:42");
        let json = serde_json::to_string(&ws).unwrap();
        let restored: WorkingSet = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, ws);
        assert_eq!(restored.active_task().map(|t| t.id), Some(id));
        assert!(restored.has_key("notify:42"));
    }

    #[test]
    fn test_working_set_tolerates_missing_fields() {
        let ws: WorkingSet = serde_json::from_str("{}").unwrap();
        assert_eq!(ws, WorkingSet::default());
    }

    #[test]
    fn test_find_by_ref() {
        let mut ws = WorkingSet::new();
        let id = ws.start_task("a".into(), None, chrono::Utc::now());
        assert!(ws.find_by_ref(&id.to_string()).is_some());
        assert!(ws.find_by_ref("not-a-uuid").is_none());
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_display() {
        let err = PulseError::EngineTimeout { secs: 15 };
        assert_eq!(err.to_string(), "reasoning engine timed out after 15s");
        let err = PulseError::ConfigValidation {
            field: "budget.limit".into(),
            reason: "must be > 0".into(),
        };
        assert!(err.to_string().contains("budget.limit: must be > 0"));
    }

    #[test]
    fn test_engine_failure_classification() {
        assert!(PulseError::EngineTimeout { secs: 30 }.is_engine_failure());
        assert!(PulseError::EngineParse("bad".into()).is_engine_failure());
        assert!(!PulseError::Storage("locked".into()).is_engine_failure());
    }

    // ── Event tests ────────────────────────────────────────────

    #[test]
    fn test_event_serde_tagged() {
        let event = Event::TickGated {
            tick_id: Uuid::nil(),
            reason: "budget".into(),
            wait_secs: 15,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "tick_gated");
        assert_eq!(json["wait_secs"], 15);
    }

    #[tokio::test]
    async fn test_event_bus_delivers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::Shutdown);
        assert!(matches!(rx.recv().await.unwrap(), Event::Shutdown));
    }

    #[test]
    fn test_event_bus_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(Event::Shutdown);
    }
}
