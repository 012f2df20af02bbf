//! Table-driven backoff for reconnecting the shared connection

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

const FALLBACK_DELAY_MS: u64 = 1_000;

/// Bounded backoff over a fixed, ascending delay table.
///
/// `delay` is a pure function of the attempt number; the attempt counter
/// itself lives in the connection state machine.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    max_attempts: u32,
    jitter_factor: f64,
}

impl ReconnectPolicy {
    /// Create a policy with the default table (1s, 2s, 4s, 8s, 16s)
    pub fn new() -> Self {
        Self::with_config(&ReconnectConfig::default())
    }

    pub fn with_config(config: &ReconnectConfig) -> Self {
        let mut delays: Vec<Duration> = config
            .delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();

        if delays.is_empty() {
            tracing::warn!(
                fallback_ms = FALLBACK_DELAY_MS,
                "Empty reconnect delay table, using fallback"
            );
            delays.push(Duration::from_millis(FALLBACK_DELAY_MS));
        }

        if delays.windows(2).any(|w| w[0] > w[1]) {
            tracing::warn!(delays_ms = ?config.delays_ms, "Reconnect delay table is not ascending, sorting it");
            delays.sort();
        }

        Self {
            delays,
            max_attempts: config.max_attempts,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before the given attempt, clamped to the last table entry
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// `delay` with the configured jitter applied
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let jitter_range = base_ms * self.jitter_factor;
        let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
        Duration::from_millis((base_ms + jitter).max(1.0) as u64)
    }

    /// Whether the attempt is past the diagnostic "giving up" threshold.
    /// Retrying continues regardless.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}
