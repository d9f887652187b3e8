use app_state::PoolSettings;
use chrono::Duration;

/// Exponential back-off between retries of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_seconds: i64,
    pub cap_seconds: i64,
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            base_seconds: settings.retry_backoff_seconds,
            cap_seconds: settings.retry_backoff_cap_seconds,
        }
    }

    /// Failed jobs are claimable again right away.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            base_seconds: 0,
            cap_seconds: 0,
        }
    }

    /// Delay after the `attempts`-th claim failed: `base * 2^(attempts - 1)`, capped.
    #[must_use]
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
        let secs = self
            .base_seconds
            .saturating_mul(2_i64.pow(exponent))
            .min(self.cap_seconds)
            .max(0);
        Duration::seconds(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 10,
            cap_seconds: 3600,
        }
    }
}
