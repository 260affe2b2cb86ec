use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No delay
    Immediate,
    /// `initial_delay` every time
    FixedDelay,
    /// `initial_delay * (n + 1)`
    LinearBackoff,
    /// `initial_delay * multiplier^n`
    ExponentialBackoff,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of executions, including the first
    pub max_attempts: u32,
    /// Base delay
    pub initial_delay: Duration,
    /// Upper bound for any computed delay (before jitter)
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub backoff_multiplier: f64,
    /// Delay growth strategy
    pub strategy: RetryStrategy,
    /// Scale each delay by a random factor in `[0.5, 1.5)`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            strategy: RetryStrategy::ExponentialBackoff,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for pipeline stages: 5 attempts, 2s initial, 120s cap.
    #[must_use]
    pub fn pipeline_step() -> Self {
        Self::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(120))
    }

    /// Policy for plain API calls: 3 attempts, 500ms initial, 30s cap.
    #[must_use]
    pub fn api_call() -> Self {
        Self::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(30))
    }

    /// Set maximum attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0 for the first retry), capped at
    /// `max_delay`, without jitter.
    ///
    /// Never decreases as `retry` grows; multipliers below 1 are treated as 1.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let secs = match self.strategy {
            RetryStrategy::Immediate => 0.0,
            RetryStrategy::FixedDelay => initial,
            RetryStrategy::LinearBackoff => initial * f64::from(retry + 1),
            RetryStrategy::ExponentialBackoff => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                initial * self.backoff_multiplier.max(1.0).powi(exponent)
            }
        };
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// [`base_delay`](Self::base_delay) with jitter applied when enabled.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter && !base.is_zero() {
            base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            base
        }
    }
}
