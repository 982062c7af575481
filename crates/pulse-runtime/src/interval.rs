use pulse_config::LoopConfig;
use std::time::Duration;

/// What shaped this tick, as far as the next sleep is concerned.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalInputs {
    pub throttle: bool,
    pub runaway: bool,
    pub backoff: Option<Duration>,
    /// Engine-suggested interval in seconds.
    pub suggested: Option<u64>,
}

/// Computes the sleep between ticks.
///
/// Base interval, doubled under budget throttle, doubled again under runaway
/// mitigation, widened to any backoff delay. An engine suggestion is clamped
/// first; it replaces the base only when nothing is widening the interval,
/// otherwise the larger value wins. The result is always inside `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct IntervalPolicy {
    base: Duration,
    min: Duration,
    max: Duration,
}

impl IntervalPolicy {
    pub fn new(base: Duration, min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            base: base.clamp(min, max),
            min,
            max,
        }
    }

    pub fn from_config(config: &LoopConfig) -> Self {
        Self::new(
            Duration::from_secs(config.tick_interval_base),
            Duration::from_secs(config.tick_interval_min),
            Duration::from_secs(config.tick_interval_max),
        )
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn clamp(&self, d: Duration) -> Duration {
        d.clamp(self.min, self.max)
    }

    pub fn next(&self, inputs: IntervalInputs) -> Duration {
        let mut interval = self.base;
        if inputs.throttle {
            interval = interval.saturating_mul(2);
        }
        if inputs.runaway {
            interval = interval.saturating_mul(2);
        }
        if let Some(b) = inputs.backoff {
            interval = interval.max(b);
        }

        if let Some(secs) = inputs.suggested {
            let suggested = self.clamp(Duration::from_secs(secs));
            let widened = inputs.throttle || inputs.runaway || inputs.backoff.is_some();
            interval = if widened {
                interval.max(suggested)
            } else {
                suggested
            };
        }

        self.clamp(interval)
    }

    /// Sleep for a gated tick: the gate's own wait, bounded by `max`.
    pub fn gated(&self, wait: Duration) -> Duration {
        wait.clamp(Duration::from_secs(1), self.max)
    }
}
