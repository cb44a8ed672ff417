//! Poll interval backoff

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Configuration for the poll interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Minimum poll interval (after a pass that found work)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no work was found
    pub backoff_multiplier: f64,

    /// Random extra delay as a fraction of the interval (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter fraction
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Geometric poll backoff
///
/// Resets to the minimum interval when work is found and grows by the
/// multiplier while idle, capped at the maximum.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    config: PollerConfig,
    current_interval: Duration,
}

impl PollBackoff {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
        }
    }

    /// Get the current poll interval (without jitter)
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Reset backoff to minimum interval
    pub fn reset(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    /// Increase backoff interval
    pub fn increase(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval
            .max(self.config.min_interval)
            .min(self.config.max_interval);
        trace!(
            interval_ms = self.current_interval.as_millis() as u64,
            "backing off"
        );
    }

    /// Current interval plus random jitter
    pub fn next_delay(&self) -> Duration {
        if self.config.jitter <= 0.0 {
            return self.current_interval;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.config.jitter);
        self.current_interval + self.current_interval.mul_f64(factor)
    }

    /// Sleep for the next delay
    ///
    /// Returns `false` if cancellation was signaled while waiting.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.next_delay()) => true,
            _ = cancel.cancelled() => {
                debug!("shutdown signal received during wait");
                false
            }
        }
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
