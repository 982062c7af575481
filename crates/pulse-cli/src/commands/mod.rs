use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pulse_config::{ConfigLoader, PulseConfig};
use pulse_core::{Overrides, PulseError, Result, RuntimeStore};

pub mod inspect;
mod run;

/// Pulse: continuous-existence runtime for an autonomous agent
#[derive(Parser)]
#[command(name = "pulse", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to pulse.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick loop (plus the health server unless disabled)
    Run {
        /// Don't start the health/metrics server
        #[arg(long)]
        no_server: bool,
    },
    /// Show checkpoint, overrides, budget and breaker state from the shared store
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pause the loop; running ticks stop calling the engine
    Pause,
    /// Clear the paused override
    Resume,
    /// Set or clear the safe_mode override
    SafeMode {
        /// Clear instead of set
        #[arg(long)]
        off: bool,
    },
    /// Queue an external event for the next tick's snapshot
    Notify {
        /// Event kind, e.g. "message" or "reminder"
        kind: String,
        /// Who sent it
        #[arg(long, default_value = "cli")]
        source: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// List learning events, or mark one processed
    Learning {
        /// Maximum number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        /// Only events not yet processed
        #[arg(long)]
        unprocessed: bool,
        /// Mark the given event processed instead of listing
        #[arg(long, value_name = "ID")]
        mark_processed: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Resolve the effective log level: --verbose > --quiet > --log-level > config.
pub fn resolve_log_level<'a>(
    verbose: bool,
    quiet: bool,
    flag: Option<&'a str>,
    configured: &'a str,
) -> &'a str {
    if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        flag.unwrap_or(configured)
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get().clone();

        let log_level = resolve_log_level(
            self.verbose,
            self.quiet,
            self.log_level.as_deref(),
            &config.logging.level,
        );
        init_tracing(log_level, &config.logging.format);

        match self.command {
            Commands::Run { no_server } => run::cmd_run(config, no_server).await,
            Commands::Status { json } => Self::cmd_status(&config, json),
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Pause => Self::cmd_override(&config, Overrides::PAUSED, true),
            Commands::Resume => Self::cmd_override(&config, Overrides::PAUSED, false),
            Commands::SafeMode { off } => Self::cmd_override(&config, Overrides::SAFE_MODE, !off),
            Commands::Notify {
                kind,
                source,
                payload,
            } => Self::cmd_notify(&config, &kind, &source, &payload),
            Commands::Learning {
                limit,
                unprocessed,
                mark_processed,
                json,
            } => Self::cmd_learning(&config, limit, unprocessed, mark_processed, json),
        }
    }

    fn cmd_status(config: &PulseConfig, json: bool) -> Result<()> {
        let store = inspect::open_store(config)?;
        let report = inspect::collect_status(config, store)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", report.render());
        }
        Ok(())
    }

    fn cmd_config(config: &PulseConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| PulseError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_override(config: &PulseConfig, name: &str, enabled: bool) -> Result<()> {
        let store = inspect::open_store(config)?;
        store.set_override(name, enabled, "cli")?;
        println!("{name} = {enabled}");
        Ok(())
    }

    fn cmd_notify(config: &PulseConfig, kind: &str, source: &str, payload: &str) -> Result<()> {
        let payload: serde_json::Value = serde_json::from_str(payload)?;
        let store = inspect::open_store(config)?;
        let id = store.enqueue_external_event(source, kind, &payload)?;
        println!("queued {kind} event {id}");
        Ok(())
    }

    fn cmd_learning(
        config: &PulseConfig,
        limit: usize,
        unprocessed: bool,
        mark_processed: Option<String>,
        json: bool,
    ) -> Result<()> {
        let store = inspect::open_store(config)?;

        if let Some(raw) = mark_processed {
            let id = uuid::Uuid::parse_str(&raw)
                .map_err(|e| PulseError::Other(anyhow::anyhow!("invalid event id '{raw}': {e}")))?;
            if store.mark_learning_event_processed(id)? {
                println!("marked {id} processed");
            } else {
                println!("{id} was already processed or does not exist");
            }
            return Ok(());
        }

        let events = if unprocessed {
            store.unprocessed_learning_events(limit)?
        } else {
            store.recent_learning_events(limit)?
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&events)?);
            return Ok(());
        }
        if events.is_empty() {
            println!("no learning events");
            return Ok(());
        }
        for event in &events {
            println!("{}", inspect::learning_line(event));
        }
        Ok(())
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init(),
    }
}
