use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pulse_config::PulseConfig;
use pulse_core::{EventBus, Result};
use pulse_engine::build_engine;
use pulse_runtime::{Ports, TickOrchestrator};
use pulse_server::{AppState, Metrics, spawn_metrics_listener, start_server};

pub(super) async fn cmd_run(config: PulseConfig, no_server: bool) -> Result<()> {
    println!("pulse v{}", env!("CARGO_PKG_VERSION"));
    println!("   Engine: {} ({})", config.engine.provider, config.engine.endpoint);
    println!(
        "   Interval: {}s (min {}s, max {}s)",
        config.tick_loop.tick_interval_base,
        config.tick_loop.tick_interval_min,
        config.tick_loop.tick_interval_max
    );
    println!(
        "   Budget: {} calls / {}s, {} reserved",
        config.budget.limit, config.budget.window_duration, config.budget.reserved_for_other_consumer
    );
    println!();

    let store = super::inspect::open_store(&config)?;
    let engine = build_engine(&config.engine)?;
    if let Err(e) = engine.health_check().await {
        warn!(engine = engine.name(), error = %e, "reasoning engine not reachable yet");
    }

    let bus = EventBus::default();
    let metrics = Metrics::new();
    let metrics_task = spawn_metrics_listener(&bus, metrics.clone());

    let mut orchestrator =
        TickOrchestrator::new(config.clone(), Ports::shared(store), engine, bus)?;

    let shutdown = CancellationToken::new();

    let server_task = if config.health.enabled && !no_server {
        println!("   Health: http://{}/health", config.health.listen);
        let state = Arc::new(AppState {
            health: orchestrator.health(),
            metrics,
        });
        let listen = config.health.listen.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_server(&listen, state, token).await {
                error!(error = %e, "health server failed");
            }
        }))
    } else {
        None
    };

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, finishing current tick");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    // Blocks until shutdown; the in-flight tick always completes.
    orchestrator.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(task) = server_task {
        let _ = task.await;
    }
    let _ = metrics_task.await;

    println!("pulse stopped");
    Ok(())
}
