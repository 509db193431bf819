//! Invoker and pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Serialization;
use crate::protocol::framing::MAX_FRAME_SIZE;

/// What `invoke` does when every connection to an endpoint is lent out.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail immediately with `Error::PoolExhausted`.
    FailFast,
    /// Wait for a released connection until the call's own deadline.
    #[default]
    Wait,
}

/// Backoff for (re)establishing pooled connections.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: u32,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Delay to wait after `attempt` failed attempts (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

/// Configuration for per-endpoint connection pools.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Connections kept per endpoint.
    pub pool_size: usize,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Maximum frame payload.
    pub max_frame_size: usize,
    /// Behavior when all connections are lent out.
    pub exhaustion: ExhaustionPolicy,
    /// Connection (re)establishment backoff.
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            connect_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
            exhaustion: ExhaustionPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for the invoker.
#[derive(Clone, Debug)]
pub struct InvokerConfig {
    /// Name of the invoking application, stamped on every request.
    pub app_name: String,
    /// Timeout for requests that do not carry their own.
    pub default_timeout: Duration,
    /// Process-wide wire serialization.
    pub serialization: Serialization,
    /// Connection pool configuration.
    pub pool: PoolConfig,
}

impl InvokerConfig {
    /// Reject configurations that can never work.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.pool.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::Config("default_timeout must be non-zero".to_string()));
        }
        if self.pool.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be non-zero".to_string()));
        }
        if self.pool.max_frame_size == 0 || self.pool.max_frame_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_frame_size {} out of range",
                self.pool.max_frame_size
            )));
        }
        if self.pool.retry.max_attempts == Some(0) {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            default_timeout: Duration::from_secs(30),
            serialization: Serialization::default(),
            pool: PoolConfig::default(),
        }
    }
}
