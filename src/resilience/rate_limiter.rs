//! Rate limiter using token bucket algorithm.

use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::observability::{ComponentHealth, HealthStatus};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Configuration for rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Tokens refilled per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Give up instead of waiting longer than this
    pub max_wait: Option<Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 10,
            max_wait: None,
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration with a rate and burst
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            max_wait: None,
        }
    }

    /// Set maximum wait time
    pub fn max_wait(mut self, duration: Duration) -> Self {
        self.max_wait = Some(duration);
        self
    }

    /// Rate must be positive and finite, burst at least 1
    pub fn validate(&self) -> SenderResult<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 || self.burst == 0 {
            return Err(SenderError::Configuration(ConfigurationError::InvalidValue {
                field: "rate_limit".to_string(),
                message: format!(
                    "rate must be positive and finite and burst at least 1 (rate {}, burst {})",
                    self.rate, self.burst
                ),
            }));
        }
        Ok(())
    }
}

/// Token bucket state
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, config: &RateLimiterConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.rate).min(config.burst as f64);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, config: &RateLimiterConfig) -> bool {
        self.refill(config);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&self, config: &RateLimiterConfig) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / config.rate)
    }
}

/// Token-bucket admission control.
///
/// Over any window `W` at most `rate * W + burst` calls are admitted.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// Create a limiter; the bucket starts full.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero, negative or non-finite rate
    /// or a zero burst.
    pub fn new(config: RateLimiterConfig) -> SenderResult<Self> {
        config.validate()?;
        Ok(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
            config,
        })
    }

    /// Shorthand for `new(RateLimiterConfig::new(rate, burst))`
    pub fn per_second(rate: f64, burst: u32) -> SenderResult<Self> {
        Self::new(RateLimiterConfig::new(rate, burst))
    }

    /// Configuration in use
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take a token if one is available, without waiting
    pub fn allow(&self) -> bool {
        self.bucket.lock().try_acquire(&self.config)
    }

    /// Wait for a token, honoring cancellation and the context deadline
    pub async fn wait(&self, ctx: &SendContext) -> SenderResult<()> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.try_acquire(&self.config) {
                    return Ok(());
                }
                bucket.time_until_available(&self.config)
            };

            if let Some(max_wait) = self.config.max_wait {
                if wait > max_wait {
                    return Err(SenderError::RateLimited {
                        retry_after: Some(wait),
                    });
                }
            }
            if let Some(remaining) = ctx.remaining() {
                if wait > remaining {
                    return Err(SenderError::RateLimited {
                        retry_after: Some(wait),
                    });
                }
            }

            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            ctx.sleep(wait).await?;
        }
    }

    /// Tokens currently available
    pub fn remaining(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(&self.config);
        bucket.tokens
    }

    /// Refill the bucket
    pub fn reset(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = self.config.burst as f64;
        bucket.last_refill = Instant::now();
    }

    /// Degraded while the bucket is empty
    pub fn health(&self) -> ComponentHealth {
        if self.remaining() < 1.0 {
            ComponentHealth::with_status("rate_limiter", HealthStatus::Degraded, "no tokens available")
        } else {
            ComponentHealth::healthy("rate_limiter")
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("remaining", &self.remaining())
            .finish()
    }
}
