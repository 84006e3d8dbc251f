//! Retry with exponential backoff for transient failures.

use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides per attempt whether an error should be retried
pub type RetryFilter = Arc<dyn Fn(u32, &SenderError) -> bool + Send + Sync>;

/// Retry configuration.
///
/// `max_attempts` counts retries, so an operation runs at most
/// `max_attempts + 1` times.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Growth factor per retry; must be at least 1
    pub backoff_factor: f64,
    /// Add a random extra in `[0, delay)` to each delay
    pub jitter: bool,
    /// Overrides default retryability when set
    pub filter: Option<RetryFilter>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            filter: None,
        }
    }
}

impl RetryPolicy {
    /// Create a default policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff factor
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Enable or disable jitter
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set a custom retry filter
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &SenderError) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Check the invariants the backoff computation relies on
    pub fn validate(&self) -> SenderResult<()> {
        let invalid = |msg: &str| {
            Err(SenderError::Configuration(ConfigurationError::InvalidRetryPolicy(
                msg.to_string(),
            )))
        };
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid("backoff_factor must be >= 1");
        }
        if self.max_delay < self.initial_delay {
            return invalid("max_delay must be >= initial_delay");
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `attempt`, with jitter if enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0..base.as_millis() as u64);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }

    /// Whether `error` on retry `attempt` should be retried
    pub fn should_retry(&self, attempt: u32, error: &SenderError) -> bool {
        match &self.filter {
            Some(filter) => filter(attempt, error),
            None => error.is_retryable(),
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    ///
    /// Sleeps between attempts observe the context; a vendor-supplied
    /// retry-after replaces the computed delay.
    pub async fn execute<F, Fut, T>(&self, ctx: &SendContext, operation: F) -> SenderResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = SenderResult<T>>,
    {
        let mut attempt = 0;

        loop {
            ctx.check()?;
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt > self.max_attempts || !self.should_retry(attempt, &error) {
                        if attempt > 1 {
                            warn!(
                                attempts = attempt,
                                max_attempts = self.max_attempts,
                                error = %error,
                                "Operation failed permanently"
                            );
                        }
                        return Err(error);
                    }

                    let delay = error
                        .retry_after()
                        .unwrap_or_else(|| self.delay_for_attempt(attempt));

                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient error"
                    );
                    ctx.sleep(delay).await?;
                }
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::NetworkError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max: u32) -> RetryPolicy {
        RetryPolicy::new()
            .max_attempts(max)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(false)
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_millis(100))
            .backoff_factor(2.0)
            .jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped_and_monotonic() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .backoff_factor(10.0)
            .jitter(false);

        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        let delays: Vec<Duration> = (1..10).map(|k| policy.base_delay(k)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_stays_below_double() {
        let policy = RetryPolicy::new().initial_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(200));
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new().validate().is_ok());
        assert!(RetryPolicy::new().backoff_factor(0.5).validate().is_err());
        assert!(RetryPolicy::new()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_retry_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = fast(3)
            .execute(&SendContext::new(), || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(SenderError::Network(NetworkError::Timeout))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result: SenderResult<()> = fast(2)
            .execute(&SendContext::new(), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(SenderError::Network(NetworkError::Timeout))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result: SenderResult<()> = fast(5)
            .execute(&SendContext::new(), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(SenderError::validation("bad"))
                }
            })
            .await;

        assert!(matches!(result, Err(SenderError::Validation { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filter_overrides_default() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = fast(5).filter(|attempt, err| {
            attempt < 2 && matches!(err, SenderError::Validation { .. })
        });
        let _: SenderResult<()> = policy
            .execute(&SendContext::new(), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(SenderError::validation("flaky"))
                }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_backoff() {
        let policy = RetryPolicy::new()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(10))
            .jitter(false);
        let ctx = SendContext::new().with_timeout(Duration::from_millis(20));

        let result: SenderResult<()> = policy
            .execute(&ctx, || async { Err(SenderError::Network(NetworkError::Timeout)) })
            .await;
        assert!(matches!(result, Err(SenderError::DeadlineExceeded)));
    }
}
