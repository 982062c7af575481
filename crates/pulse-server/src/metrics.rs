//! Prometheus-compatible metrics for the tick loop.
//!
//! Counters are fed from the event bus; gauges are read from the health report
//! at render time.

use pulse_core::{CircuitStatus, Event, EventBus, RuntimeState};
use pulse_runtime::HealthReport;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Global metrics registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    ticks_total: AtomicU64,
    ticks_completed_total: AtomicU64,
    ticks_failed_total: AtomicU64,
    ticks_gated_total: AtomicU64,
    ticks_paused_total: AtomicU64,
    engine_calls_total: AtomicU64,
    engine_failures_total: AtomicU64,
    engine_latency_ms_total: AtomicU64,
    transitions_applied_total: AtomicU64,
    transitions_rejected_total: AtomicU64,
    task_rejections_total: AtomicU64,
    budget_throttled_total: AtomicU64,
    breaker_changes_total: AtomicU64,
    runaway_episodes_total: AtomicU64,
    learning_events_total: AtomicU64,
    learning_events_dropped_total: AtomicU64,
    persist_failures_total: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                ticks_total: AtomicU64::new(0),
                ticks_completed_total: AtomicU64::new(0),
                ticks_failed_total: AtomicU64::new(0),
                ticks_gated_total: AtomicU64::new(0),
                ticks_paused_total: AtomicU64::new(0),
                engine_calls_total: AtomicU64::new(0),
                engine_failures_total: AtomicU64::new(0),
                engine_latency_ms_total: AtomicU64::new(0),
                transitions_applied_total: AtomicU64::new(0),
                transitions_rejected_total: AtomicU64::new(0),
                task_rejections_total: AtomicU64::new(0),
                budget_throttled_total: AtomicU64::new(0),
                breaker_changes_total: AtomicU64::new(0),
                runaway_episodes_total: AtomicU64::new(0),
                learning_events_total: AtomicU64::new(0),
                learning_events_dropped_total: AtomicU64::new(0),
                persist_failures_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner
            .http_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Update counters for one bus event.
    pub fn record(&self, event: &Event) {
        let m = &self.inner;
        let counter = match event {
            Event::TickStarted { .. } => &m.ticks_total,
            Event::TickCompleted { .. } => &m.ticks_completed_total,
            Event::TickFailed { .. } => &m.ticks_failed_total,
            Event::TickGated { .. } => &m.ticks_gated_total,
            Event::TickPaused { .. } => &m.ticks_paused_total,
            Event::EngineInvoked { latency_ms, .. } => {
                m.engine_latency_ms_total
                    .fetch_add(*latency_ms, Ordering::Relaxed);
                &m.engine_calls_total
            }
            Event::EngineFailed { .. } => &m.engine_failures_total,
            Event::TransitionApplied { .. } => &m.transitions_applied_total,
            Event::TransitionRejected { .. } => &m.transitions_rejected_total,
            Event::TaskRejected { .. } => &m.task_rejections_total,
            Event::BudgetThrottled { .. } => &m.budget_throttled_total,
            Event::BreakerChanged { .. } => &m.breaker_changes_total,
            Event::RunawayDetected { .. } => &m.runaway_episodes_total,
            Event::LearningEventEmitted { .. } => &m.learning_events_total,
            Event::LearningEventDropped { .. } => &m.learning_events_dropped_total,
            Event::PersistFailed { .. } => &m.persist_failures_total,
            Event::Shutdown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self, report: &HealthReport) -> String {
        let m = &self.inner;
        let mut out = String::new();

        gauge(
            &mut out,
            "pulse_uptime_seconds",
            "Time since the process started.",
            m.started_at.elapsed().as_secs(),
        );

        let counters: [(&str, &str, &AtomicU64); 18] = [
            ("pulse_http_requests_total", "HTTP requests served.", &m.http_requests_total),
            ("pulse_ticks_total", "Ticks started.", &m.ticks_total),
            ("pulse_ticks_completed_total", "Ticks that reached persist.", &m.ticks_completed_total),
            ("pulse_ticks_failed_total", "Ticks that failed and backed off.", &m.ticks_failed_total),
            ("pulse_ticks_gated_total", "Ticks withheld by budget or breaker.", &m.ticks_gated_total),
            ("pulse_ticks_paused_total", "Ticks skipped while paused.", &m.ticks_paused_total),
            ("pulse_engine_calls_total", "Reasoning engine calls answered.", &m.engine_calls_total),
            ("pulse_engine_failures_total", "Failed, timed out or unparseable engine calls.", &m.engine_failures_total),
            ("pulse_engine_latency_ms_total", "Summed engine latency in milliseconds.", &m.engine_latency_ms_total),
            ("pulse_transitions_applied_total", "Transition requests accepted.", &m.transitions_applied_total),
            ("pulse_transitions_rejected_total", "Transition requests rejected.", &m.transitions_rejected_total),
            ("pulse_task_rejections_total", "Task updates rejected.", &m.task_rejections_total),
            ("pulse_budget_throttled_total", "Ticks run under budget throttle.", &m.budget_throttled_total),
            ("pulse_breaker_changes_total", "Circuit breaker state changes.", &m.breaker_changes_total),
            ("pulse_runaway_episodes_total", "Runaway episodes detected.", &m.runaway_episodes_total),
            ("pulse_learning_events_total", "Learning events written.", &m.learning_events_total),
            ("pulse_learning_events_dropped_total", "Learning events lost after retries.", &m.learning_events_dropped_total),
            ("pulse_persist_failures_total", "Checkpoints that could not be committed.", &m.persist_failures_total),
        ];
        for (name, help, value) in counters {
            counter(&mut out, name, help, value.load(Ordering::Relaxed));
        }

        gauge(&mut out, "pulse_tick_count", "Ticks recorded in the working set.", report.tick_count);
        gauge(&mut out, "pulse_error_streak", "Consecutive failed ticks.", report.error_streak);
        gauge(&mut out, "pulse_budget_used", "Engine calls in the current window.", report.budget_used);
        gauge(&mut out, "pulse_budget_limit", "Engine calls allowed per window.", report.budget_limit);
        gauge(&mut out, "pulse_runaway_score", "Latest runaway score.", format!("{:.4}", report.runaway_score));
        gauge(&mut out, "pulse_paused", "1 while the paused override is set.", u8::from(report.paused));
        gauge(&mut out, "pulse_safe_mode", "1 while the safe_mode override is set.", u8::from(report.safe_mode));
        gauge(&mut out, "pulse_persist_pending", "1 while a checkpoint awaits commit.", u8::from(report.persist_pending));

        header(&mut out, "pulse_runtime_state", "Current runtime state.", "gauge");
        for state in RuntimeState::ALL {
            let _ = writeln!(
                out,
                "pulse_runtime_state{{state=\"{state}\"}} {}",
                u8::from(report.state == state)
            );
        }
        out.push('\n');

        header(&mut out, "pulse_breaker_state", "Reasoning engine circuit breaker state.", "gauge");
        for status in [CircuitStatus::Closed, CircuitStatus::Open, CircuitStatus::HalfOpen] {
            let _ = writeln!(
                out,
                "pulse_breaker_state{{status=\"{status}\"}} {}",
                u8::from(report.breaker == status)
            );
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    header(out, name, help, "counter");
    let _ = writeln!(out, "{name} {value}\n");
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    header(out, name, help, "gauge");
    let _ = writeln!(out, "{name} {value}\n");
}

/// Feed bus events into `metrics` until the bus closes.
pub fn spawn_metrics_listener(bus: &EventBus, metrics: Metrics) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let shutdown = matches!(event, Event::Shutdown);
                    metrics.record(&event);
                    if shutdown {
                        debug!("metrics listener stopping");
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "metrics listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
