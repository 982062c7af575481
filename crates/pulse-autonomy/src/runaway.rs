use chrono::{DateTime, Utc};
use pulse_config::RunawayConfig;
use pulse_core::{RunawayComponents, RunawayScore, RunawayType};
use std::collections::{HashMap, VecDeque};

/// Consecutive errors at which the error component saturates.
const ERROR_STREAK_SATURATION: f64 = 5.0;

/// What the detector remembers about one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub at: DateTime<Utc>,
    /// Whitelisted progress markers produced this tick.
    pub significant_progress: u32,
    pub action_signature: Option<String>,
    pub engine_called: bool,
    pub error: bool,
}

impl TickRecord {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            significant_progress: 0,
            action_signature: None,
            engine_called: false,
            error: false,
        }
    }

    pub fn failed(at: DateTime<Utc>, engine_called: bool) -> Self {
        Self {
            engine_called,
            error: true,
            ..Self::new(at)
        }
    }
}

/// Weighted anomaly score over a sliding window of recent ticks.
///
/// Cheap to update every tick and conservative to declare: a runaway needs
/// `consecutive_ticks_required` ticks in a row above the threshold.
#[derive(Debug, Clone)]
pub struct RunawayDetector {
    config: RunawayConfig,
    window: VecDeque<TickRecord>,
    consecutive_high: u32,
    consecutive_errors: u32,
    /// Error streak as it stood before the newest tick was observed.
    prior_errors: u32,
}

impl RunawayDetector {
    pub fn new(config: RunawayConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            consecutive_high: 0,
            consecutive_errors: 0,
            prior_errors: 0,
        }
    }

    /// Add a tick and score the updated window.
    pub fn observe(&mut self, record: TickRecord) -> RunawayScore {
        self.prior_errors = self.consecutive_errors;
        if record.error {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        } else {
            self.consecutive_errors = 0;
        }
        self.window.push_back(record);
        while self.window.len() > self.config.window_size.max(1) {
            self.window.pop_front();
        }

        let components = self.components();
        let total = self.weighted(&components);
        if total > self.config.score_threshold {
            self.consecutive_high = self.consecutive_high.saturating_add(1);
        } else {
            self.consecutive_high = 0;
        }
        self.score_with(components, total)
    }

    /// Score the current window without adding a tick.
    pub fn score(&self) -> RunawayScore {
        let components = self.components();
        let total = self.weighted(&components);
        self.score_with(components, total)
    }

    pub fn components(&self) -> RunawayComponents {
        RunawayComponents {
            progress_absence: self.progress_absence(),
            trigger_density: self.trigger_density(),
            signature_repetition: self.signature_repetition(),
            error_streak: (self.consecutive_errors as f64 / ERROR_STREAK_SATURATION).min(1.0),
        }
    }

    /// Dominant cause of a high score.
    pub fn classify(score: &RunawayScore) -> RunawayType {
        let c = &score.components;
        if c.error_streak >= 0.8 {
            RunawayType::ErrorDriven
        } else if c.signature_repetition >= 0.6 {
            RunawayType::SignatureLoop
        } else if c.trigger_density >= 0.8 {
            RunawayType::TriggerStorm
        } else {
            RunawayType::NoProgress
        }
    }

    /// Reclassify the newest tick as failed, when something after scoring
    /// (the checkpoint write) went wrong. The error streak continues from
    /// where it stood before that tick.
    pub fn mark_last_failed(&mut self) {
        let Some(last) = self.window.back_mut() else {
            return;
        };
        if last.error {
            return;
        }
        last.error = true;
        self.consecutive_errors = self.prior_errors.saturating_add(1);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn tick_count(&self) -> usize {
        self.window.len()
    }

    /// Timestamps of the oldest and newest tick in the window.
    pub fn window_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.window.front()?.at, self.window.back()?.at))
    }

    /// Action signatures in the window, oldest first.
    pub fn signatures(&self) -> Vec<String> {
        self.window
            .iter()
            .filter_map(|r| r.action_signature.clone())
            .collect()
    }

    fn progress_absence(&self) -> f64 {
        let progress: u32 = self.window.iter().map(|r| r.significant_progress).sum();
        let window_size = self.config.window_size.max(1) as f64;
        1.0 - (progress as f64 / window_size).min(1.0)
    }

    fn trigger_density(&self) -> f64 {
        let (Some(first), Some(last)) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };
        if self.window.len() < 2 {
            return 0.0;
        }
        let span_minutes = (last.at - first.at).num_milliseconds() as f64 / 60_000.0;
        if span_minutes <= 0.0 {
            // Several engine calls at the same instant.
            return if self.window.iter().filter(|r| r.engine_called).count() > 1 {
                1.0
            } else {
                0.0
            };
        }
        let calls = self.window.iter().filter(|r| r.engine_called).count() as f64;
        let rate = calls / span_minutes;
        (rate / self.config.reference_rate_per_minute).clamp(0.0, 1.0)
    }

    fn signature_repetition(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for sig in self.window.iter().filter_map(|r| r.action_signature.as_deref()) {
            if !sig.trim().is_empty() {
                *counts.entry(sig).or_default() += 1;
            }
        }
        let top = counts.values().copied().max().unwrap_or(0);
        top as f64 / self.window.len() as f64
    }

    fn weighted(&self, c: &RunawayComponents) -> f64 {
        let w = &self.config.weights;
        w.progress_absence * c.progress_absence
            + w.trigger_density * c.trigger_density
            + w.signature_repetition * c.signature_repetition
            + w.error_streak * c.error_streak
    }

    fn score_with(&self, components: RunawayComponents, total: f64) -> RunawayScore {
        RunawayScore {
            total,
            components,
            consecutive_high_ticks: self.consecutive_high,
            is_runaway: total > self.config.score_threshold
                && self.consecutive_high >= self.config.consecutive_ticks_required,
        }
    }
}
