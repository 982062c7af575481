use pulse_config::BackoffConfig;
use std::time::Duration;

/// Exponential backoff with fractional jitter: `initial × multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial),
            config.multiplier,
            Duration::from_secs(config.max),
            config.jitter,
        )
    }

    /// Same curve with every step multiplied by `factor`, for short I/O retries.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            initial: self.initial.mul_f64(factor),
            max: self.max.mul_f64(factor),
            ..self.clone()
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(63) as i32);
        let secs = self.initial.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay with ±jitter applied, never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        // Spread attempts so sibling processes don't retry in lockstep.
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        base.mul_f64((1.0 + spread).max(0.0)).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(60), jitter)
    }

    #[test]
    fn test_exponential_growth_capped() {
        let b = backoff(0.0);
        assert_eq!(b.delay(0), Duration::from_secs(5));
        assert_eq!(b.delay(1), Duration::from_secs(10));
        assert_eq!(b.delay(2), Duration::from_secs(20));
        assert_eq!(b.delay(3), Duration::from_secs(40));
        assert_eq!(b.delay(4), Duration::from_secs(60));
        assert_eq!(b.delay(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let b = backoff(0.25);
        for _ in 0..200 {
            let d = b.delay(1).as_secs_f64();
            assert!((7.5..=12.5).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let b = backoff(1.0);
        for _ in 0..200 {
            assert!(b.delay(10) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_scaled() {
        let b = backoff(0.0).scaled(0.5);
        assert_eq!(b.delay(0), Duration::from_millis(2500));
        assert_eq!(b.max(), Duration::from_secs(30));
    }
}
