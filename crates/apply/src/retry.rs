//! Exponential backoff with jitter for per-node cluster mutations.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts per node before it is marked failed (at least 1).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self { Self { max_attempts: attempts.max(1), ..Default::default() } }

    /// No sleeping between attempts; for tests and dry runs.
    pub fn immediate(attempts: u32) -> Self {
        Self { initial_delay: Duration::ZERO, max_delay: Duration::ZERO, ..Self::with_max_attempts(attempts) }
    }

    /// `KEEL_APPLY_MAX_ATTEMPTS` overrides the attempt budget.
    pub fn from_env() -> Self {
        match std::env::var("KEEL_APPLY_MAX_ATTEMPTS").ok().and_then(|s| s.parse::<u32>().ok()) {
            Some(n) => Self::with_max_attempts(n),
            None => Self::default(),
        }
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based), capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Jitter: 0.5x to 1.5x of the base delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }
}
