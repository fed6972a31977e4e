//! Connection retry with exponential backoff and jitter
//!
//! Attempts are strictly sequential. Each attempt goes through the
//! [`Connector`], so a fresh credential is fetched every time.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::protocol::SessionConfig;
use super::ClientError;

/// Something that can make one connection attempt
#[async_trait]
pub trait Connector: Send {
    async fn attempt(&mut self, config: &SessionConfig) -> Result<(), ClientError>;
}

/// Backoff parameters for [`connect_with_retry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) of the random extra delay
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 300,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before the retry following failed attempt `attempt` (0-based),
    /// without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// `min(max, base·2^attempt) + uniform[0, jitter)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// Attempt to connect until success or `policy.max_attempts` failures
///
/// Sleeps only between attempts. Returns the last attempt's error.
pub async fn connect_with_retry<C>(
    connector: &mut C,
    config: &SessionConfig,
    policy: &RetryPolicy,
) -> Result<(), ClientError>
where
    C: Connector + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            log::info!(
                "Retry: reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                max_attempts
            );
            tokio::time::sleep(delay).await;
        }

        match connector.attempt(config).await {
            Ok(()) => {
                if attempt > 0 {
                    log::info!("Retry: connected on attempt {}", attempt + 1);
                }
                return Ok(());
            }
            Err(e) => {
                log::warn!("Retry: connection attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    log::error!("Retry: giving up after {} attempts", max_attempts);
    Err(last_error.unwrap_or(ClientError::NotConnected))
}
