use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Jitter applied to every delay, as a fraction of the base delay.
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff with jitter for stream reconnects.
///
/// The first attempt after a reset is immediate. Each later attempt waits the
/// current base delay (±50% jitter), after which the base grows by the
/// backoff factor up to the max delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    /// Makes the next attempt immediate.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait the max delay, e.g. after the backend
    /// reported resource exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Returns the delay before the next attempt and advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = base * RANDOM_FACTOR * rng.gen_range(-1.0..=1.0);
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        let grown = self.current_base.mul_f64(self.config.backoff_factor);
        self.current_base = grown.clamp(self.config.initial_delay, self.config.max_delay);
        if delay > Duration::ZERO {
            log::debug!(
                target: "firestore::backoff",
                "Backing off for {} ms (base delay: {} ms)",
                delay.as_millis(),
                self.current_base.as_millis()
            );
        }
        delay
    }
}
