use pulse_core::RuntimeState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Root configuration, maps to `pulse.toml`.
///
/// Every section except `[states]` may be omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    #[serde(rename = "loop", default)]
    pub tick_loop: LoopConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    pub states: StatesConfig,
    #[serde(default)]
    pub runaway: RunawayConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Loop ───────────────────────────────────────────────────────

/// Tick cadence, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub tick_interval_base: u64,
    pub tick_interval_min: u64,
    pub tick_interval_max: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_base: 60,
            tick_interval_min: 10,
            tick_interval_max: 900,
        }
    }
}

// ── Budget ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Calls allowed per window, shared with the other consumer of the quota.
    pub limit: u32,
    /// Rolling window length in seconds.
    pub window_duration: u64,
    /// Usage ratio above which the loop slows down.
    pub throttle_threshold: f64,
    /// Calls this process must leave for the other consumer.
    pub reserved_for_other_consumer: u32,
    /// Ledger key shared by every process drawing on the same quota.
    pub quota: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_duration: 3600,
            throttle_threshold: 0.8,
            reserved_for_other_consumer: 10,
            quota: "reasoning_engine".into(),
        }
    }
}

// ── States ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatesConfig {
    #[serde(default)]
    pub initial: RuntimeState,
    /// `from` state name → states it may move to. Self-moves must be listed.
    pub allowed_transitions: BTreeMap<String, Vec<RuntimeState>>,
    /// States that can never be entered.
    #[serde(default = "default_disabled_states")]
    pub disabled: Vec<RuntimeState>,
}

fn default_disabled_states() -> Vec<RuntimeState> {
    vec![RuntimeState::Resting, RuntimeState::DeepRest]
}

impl Default for StatesConfig {
    fn default() -> Self {
        use RuntimeState::*;
        let mut allowed = BTreeMap::new();
        allowed.insert("idle".to_string(), vec![Idle, Thinking]);
        allowed.insert("thinking".to_string(), vec![Thinking, Acting, Idle]);
        allowed.insert("acting".to_string(), vec![Acting, Thinking, Idle]);
        Self {
            initial: Idle,
            allowed_transitions: allowed,
            disabled: default_disabled_states(),
        }
    }
}

impl StatesConfig {
    /// Parse the string-keyed table into typed adjacency sets.
    pub fn transition_table(
        &self,
    ) -> Result<BTreeMap<RuntimeState, BTreeSet<RuntimeState>>, String> {
        let mut table = BTreeMap::new();
        for (from, targets) in &self.allowed_transitions {
            let from: RuntimeState = from
                .parse()
                .map_err(|e| format!("states.allowed_transitions: {e}"))?;
            table
                .entry(from)
                .or_insert_with(BTreeSet::new)
                .extend(targets.iter().copied());
        }
        Ok(table)
    }

    pub fn is_disabled(&self, state: RuntimeState) -> bool {
        state.is_reserved() || self.disabled.contains(&state)
    }
}

// ── Runaway ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunawayConfig {
    /// Number of recent ticks scored.
    pub window_size: usize,
    pub score_threshold: f64,
    pub consecutive_ticks_required: u32,
    /// Engine calls per minute that count as a fully dense trigger pattern.
    pub reference_rate_per_minute: f64,
    pub weights: RunawayWeights,
}

impl Default for RunawayConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            score_threshold: 0.65,
            consecutive_ticks_required: 3,
            reference_rate_per_minute: 2.0,
            weights: RunawayWeights::default(),
        }
    }
}

/// Component weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RunawayWeights {
    pub progress_absence: f64,
    pub trigger_density: f64,
    pub signature_repetition: f64,
    pub error_streak: f64,
}

impl Default for RunawayWeights {
    fn default() -> Self {
        Self {
            progress_absence: 0.35,
            trigger_density: 0.15,
            signature_repetition: 0.35,
            error_streak: 0.15,
        }
    }
}

impl RunawayWeights {
    pub fn sum(&self) -> f64 {
        self.progress_absence + self.trigger_density + self.signature_repetition + self.error_streak
    }

    fn all(&self) -> [(&'static str, f64); 4] {
        [
            ("progress_absence", self.progress_absence),
            ("trigger_density", self.trigger_density),
            ("signature_repetition", self.signature_repetition),
            ("error_streak", self.error_streak),
        ]
    }
}

// ── Progress ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Marker types that count as real progress. Anything else is ignored.
    pub significant_marker_types: Vec<String>,
    /// Marker types known to be noise. Informational only.
    pub noise_marker_types: Vec<String>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            significant_marker_types: vec![
                "task_completed".into(),
                "step_advanced".into(),
                "evidence_verified".into(),
                "artifact_produced".into(),
            ],
            noise_marker_types: vec![
                "heartbeat".into(),
                "thought_logged".into(),
                "state_changed".into(),
            ],
        }
    }
}

impl ProgressConfig {
    pub fn is_significant(&self, marker_type: &str) -> bool {
        self.significant_marker_types.iter().any(|m| m == marker_type)
    }
}

// ── Circuit breaker / backoff ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub error_threshold: u32,
    /// Seconds an open breaker waits before letting a probe through.
    pub reset_timeout: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            reset_timeout: 60,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay in seconds.
    pub initial: u64,
    pub multiplier: f64,
    /// Upper bound in seconds.
    pub max: u64,
    /// Fractional randomisation, 0.0 – 1.0.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: 5,
            multiplier: 2.0,
            max: 300,
            jitter: 0.1,
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// "http" or "mock".
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Seconds before a call counts as failed.
    pub timeout: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "http".into(),
            endpoint: "http://127.0.0.1:8080/v1/transition".into(),
            model: "default".into(),
            api_key: None,
            timeout: 30,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Shared SQLite file. Defaults to `~/.pulse/pulse.db`.
    pub db_path: Option<PathBuf>,
    /// Secondary file that receives a copy of every checkpoint.
    pub audit_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub persist_retries: u32,
    pub learning_write_retries: u32,
    /// Max external events surfaced per tick.
    pub external_event_batch: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            audit_path: None,
            busy_timeout_ms: 5000,
            persist_retries: 3,
            learning_write_retries: 3,
            external_event_batch: 20,
        }
    }
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pulse")
                .join("pulse.db")
        })
    }
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub listen: String,
    /// Optional JSON file rewritten after every tick.
    pub file: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:3710".into(),
            file: None,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty", "json", or "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl ConfigWarning {
    fn error(field: impl Into<String>, message: impl Into<String>, hint: Option<&str>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: WarningSeverity::Error,
            hint: hint.map(Into::into),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>, hint: Option<&str>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: WarningSeverity::Warning,
            hint: hint.map(Into::into),
        }
    }
}

impl PulseConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Intervals ───
        let l = &self.tick_loop;
        if l.tick_interval_min == 0 {
            warnings.push(ConfigWarning::error(
                "loop.tick_interval_min",
                "minimum interval is 0; the loop would spin",
                Some("Set to at least 1 second"),
            ));
        }
        if !(l.tick_interval_min <= l.tick_interval_base
            && l.tick_interval_base <= l.tick_interval_max)
        {
            warnings.push(ConfigWarning::error(
                "loop.tick_interval_base",
                format!(
                    "expected min ≤ base ≤ max, got {} / {} / {}",
                    l.tick_interval_min, l.tick_interval_base, l.tick_interval_max
                ),
                None,
            ));
        }

        // ── Budget ───
        let b = &self.budget;
        if b.limit == 0 {
            warnings.push(ConfigWarning::error(
                "budget.limit",
                "limit is 0; the engine could never be called",
                None,
            ));
        } else if b.reserved_for_other_consumer >= b.limit {
            warnings.push(ConfigWarning::error(
                "budget.reserved_for_other_consumer",
                format!(
                    "reservation {} leaves nothing of limit {}",
                    b.reserved_for_other_consumer, b.limit
                ),
                Some("Reserve fewer calls than the limit"),
            ));
        }
        if b.window_duration == 0 {
            warnings.push(ConfigWarning::error(
                "budget.window_duration",
                "window is 0 seconds",
                None,
            ));
        }
        if !(b.throttle_threshold > 0.0 && b.throttle_threshold <= 1.0) {
            warnings.push(ConfigWarning::error(
                "budget.throttle_threshold",
                format!("threshold {} is outside (0, 1]", b.throttle_threshold),
                None,
            ));
        }
        if b.quota.trim().is_empty() {
            warnings.push(ConfigWarning::error("budget.quota", "quota name is empty", None));
        }

        // ── States ───
        self.validate_states(&mut warnings);

        // ── Runaway ───
        let r = &self.runaway;
        for (name, w) in r.weights.all() {
            if !w.is_finite() || w < 0.0 {
                warnings.push(ConfigWarning::error(
                    format!("runaway.weights.{name}"),
                    format!("weight {w} must be a non-negative number"),
                    None,
                ));
            }
        }
        let sum = r.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            warnings.push(ConfigWarning::error(
                "runaway.weights",
                format!("weights sum to {sum:.4}, expected 1.0"),
                Some("Adjust the four weights so they add up to exactly 1.0"),
            ));
        }
        if !(r.score_threshold > 0.0 && r.score_threshold <= 1.0) {
            warnings.push(ConfigWarning::error(
                "runaway.score_threshold",
                format!("threshold {} is outside (0, 1]", r.score_threshold),
                None,
            ));
        }
        if r.window_size == 0 {
            warnings.push(ConfigWarning::error("runaway.window_size", "window is empty", None));
        }
        if r.consecutive_ticks_required == 0 {
            warnings.push(ConfigWarning::error(
                "runaway.consecutive_ticks_required",
                "must be at least 1",
                None,
            ));
        }
        if !(r.reference_rate_per_minute > 0.0) {
            warnings.push(ConfigWarning::error(
                "runaway.reference_rate_per_minute",
                "must be positive",
                None,
            ));
        }

        // ── Progress markers ───
        let p = &self.progress;
        if p.significant_marker_types.is_empty() {
            warnings.push(ConfigWarning::warning(
                "progress.significant_marker_types",
                "no significant marker types; every window will look like no progress",
                None,
            ));
        }
        for m in &p.significant_marker_types {
            if p.noise_marker_types.contains(m) {
                warnings.push(ConfigWarning::error(
                    "progress",
                    format!("marker type '{m}' is listed as both significant and noise"),
                    None,
                ));
            }
        }

        // ── Circuit breaker ───
        let c = &self.circuit_breaker;
        if c.error_threshold == 0 {
            warnings.push(ConfigWarning::error(
                "circuit_breaker.error_threshold",
                "must be at least 1",
                None,
            ));
        }
        if c.half_open_max_calls == 0 {
            warnings.push(ConfigWarning::error(
                "circuit_breaker.half_open_max_calls",
                "must be at least 1 or the breaker can never close again",
                None,
            ));
        }
        if c.reset_timeout == 0 {
            warnings.push(ConfigWarning::warning(
                "circuit_breaker.reset_timeout",
                "reset timeout is 0; an open breaker retries immediately",
                None,
            ));
        }

        // ── Backoff ───
        let bo = &self.backoff;
        if !(bo.multiplier >= 1.0) {
            warnings.push(ConfigWarning::error(
                "backoff.multiplier",
                format!("multiplier {} is below 1.0", bo.multiplier),
                None,
            ));
        }
        if !(0.0..=1.0).contains(&bo.jitter) {
            warnings.push(ConfigWarning::error(
                "backoff.jitter",
                format!("jitter {} is outside [0, 1]", bo.jitter),
                None,
            ));
        }
        if bo.initial > bo.max {
            warnings.push(ConfigWarning::warning(
                "backoff.initial",
                "initial delay is larger than max and will always be capped",
                None,
            ));
        }

        // ── Engine ───
        let valid_providers = ["http", "mock"];
        if !valid_providers.contains(&self.engine.provider.as_str()) {
            warnings.push(ConfigWarning::error(
                "engine.provider",
                format!("unknown engine provider '{}'", self.engine.provider),
                Some("Valid values: http, mock"),
            ));
        }
        if self.engine.provider == "http" && self.engine.endpoint.trim().is_empty() {
            warnings.push(ConfigWarning::error("engine.endpoint", "endpoint is empty", None));
        }
        if self.engine.timeout == 0 {
            warnings.push(ConfigWarning::error("engine.timeout", "timeout is 0", None));
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }

    fn validate_states(&self, warnings: &mut Vec<ConfigWarning>) {
        let s = &self.states;
        if s.allowed_transitions.is_empty() {
            warnings.push(ConfigWarning::error(
                "states.allowed_transitions",
                "transition table is empty",
                Some("Add at least an entry for the initial state"),
            ));
            return;
        }
        let table = match s.transition_table() {
            Ok(t) => t,
            Err(e) => {
                warnings.push(ConfigWarning::error("states.allowed_transitions", e, None));
                return;
            }
        };
        if !table.contains_key(&s.initial) {
            warnings.push(ConfigWarning::error(
                "states.initial",
                format!("initial state '{}' has no entry in allowed_transitions", s.initial),
                None,
            ));
        }
        if s.is_disabled(s.initial) {
            warnings.push(ConfigWarning::error(
                "states.initial",
                format!("initial state '{}' is disabled", s.initial),
                None,
            ));
        }
        for (from, targets) in &table {
            if s.is_disabled(*from) {
                warnings.push(ConfigWarning::warning(
                    format!("states.allowed_transitions.{from}"),
                    "entry for a disabled state is never used",
                    None,
                ));
            }
            for to in targets {
                if s.is_disabled(*to) {
                    warnings.push(ConfigWarning::warning(
                        format!("states.allowed_transitions.{from}"),
                        format!("target '{to}' is disabled and will always be rejected"),
                        None,
                    ));
                }
            }
        }
    }
}
