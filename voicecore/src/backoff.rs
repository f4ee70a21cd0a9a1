use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The ceiling is never allowed below this.
pub const MIN_BACKOFF_CEILING: Duration = Duration::from_millis(3_000);

/// Capped exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(20_000),
            multiplier: 2.0,
            jitter: 0.4,
        }
    }
}

impl BackoffConfig {
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    fn ceiling(&self) -> Duration {
        self.max_delay.max(MIN_BACKOFF_CEILING)
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let ceiling = self.config.ceiling().as_secs_f64();
        let exp = self.config.multiplier.powi(self.attempts.min(64) as i32);
        let secs = (self.config.initial_delay.as_secs_f64() * exp).min(ceiling);
        Duration::from_secs_f64(secs)
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.base_delay().as_secs_f64();
        self.attempts = self.attempts.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rng.random_range(-jitter..=jitter)
        } else {
            1.0
        };
        let secs = (base * factor).clamp(0.0, self.config.ceiling().as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}
