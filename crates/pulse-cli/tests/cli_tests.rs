//! CLI parsing and read-side command tests.

#[cfg(test)]
mod tests {
    mod parsing {
        use clap::Parser;
        use pulse_cli::Cli;
        use pulse_cli::commands::resolve_log_level;

        #[test]
        fn test_verbose_conflicts_with_quiet() {
            assert!(Cli::try_parse_from(["pulse", "-v", "-q", "status"]).is_err());
        }

        #[test]
        fn test_subcommands_parse() {
            assert!(Cli::try_parse_from(["pulse", "run", "--no-server"]).is_ok());
            assert!(Cli::try_parse_from(["pulse", "learning", "--unprocessed", "-n", "5"]).is_ok());
            assert!(
                Cli::try_parse_from(["pulse", "notify", "message", "--payload", "{\"text\":\"hi\"}"])
                    .is_ok()
            );
            assert!(Cli::try_parse_from(["pulse", "safe-mode", "--off"]).is_ok());
            assert!(Cli::try_parse_from(["pulse", "--config", "/tmp/p.toml", "pause"]).is_ok());
        }

        #[test]
        fn test_unknown_subcommand_rejected() {
            assert!(Cli::try_parse_from(["pulse", "chat"]).is_err());
        }

        #[test]
        fn test_log_level_precedence() {
            assert_eq!(resolve_log_level(true, false, Some("warn"), "info"), "debug");
            assert_eq!(resolve_log_level(false, true, Some("warn"), "info"), "error");
            assert_eq!(resolve_log_level(false, false, Some("warn"), "info"), "warn");
            assert_eq!(resolve_log_level(false, false, None, "info"), "info");
        }
    }

    mod status {
        use pulse_cli::commands::inspect::{collect_status, open_store};
        use pulse_config::PulseConfig;
        use pulse_core::{Overrides, RuntimeStore};

        fn config_in(dir: &tempfile::TempDir) -> PulseConfig {
            let mut config = PulseConfig::default();
            config.storage.db_path = Some(dir.path().join("pulse.db"));
            config.storage.audit_path = Some(dir.path().join("audit.db"));
            config
        }

        #[test]
        fn test_status_reflects_overrides() {
            let dir = tempfile::tempdir().unwrap();
            let config = config_in(&dir);

            let store = open_store(&config).unwrap();
            store.set_override(Overrides::PAUSED, true, "cli").unwrap();
            drop(store);

            let report = collect_status(&config, open_store(&config).unwrap()).unwrap();
            assert!(report.overrides.paused);
            assert!(!report.overrides.safe_mode);
            assert!(report.render().contains("paused=true"));
        }

        #[test]
        fn test_status_counts_budget_usage() {
            use chrono::Utc;
            use pulse_core::QuotaLedger;

            let dir = tempfile::tempdir().unwrap();
            let config = config_in(&dir);
            let store = open_store(&config).unwrap();
            for i in 0..3 {
                store
                    .append(&config.budget.quota, &format!("call-{i}"), "other", Utc::now())
                    .unwrap();
            }

            let report = collect_status(&config, store).unwrap();
            assert_eq!(report.budget.used_in_window, 3);
            assert_eq!(report.learning_events, 0);
            assert!(report.render().contains("Budget:      3/100"));
        }

        #[test]
        fn test_notify_queues_external_event() {
            let dir = tempfile::tempdir().unwrap();
            let config = config_in(&dir);
            let store = open_store(&config).unwrap();

            store
                .enqueue_external_event("cli", "message", &serde_json::json!({"text": "hi"}))
                .unwrap();
            let pending = store.pending_external_events(10).unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].kind, "message");
        }
    }
}
