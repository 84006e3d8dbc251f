//! Circuit breaker pattern for fault tolerance.

use crate::errors::{SenderError, SenderResult};
use crate::observability::{ComponentHealth, HealthStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, a single probe is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub threshold: u32,
    /// How long the circuit stays open before allowing a probe
    pub cooldown: Duration,
    /// Rolling window over which failures are counted
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn threshold(mut self, n: u32) -> Self {
        self.threshold = n;
        self
    }

    /// Set cooldown
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set failure window
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Internal circuit breaker state
struct CircuitBreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-provider circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a breaker with custom configuration
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::default()),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Name reported in `CircuitOpen` errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.maybe_transition_to_half_open(&mut state);
        state.state
    }

    /// Execute an operation through the circuit breaker
    pub async fn execute<F, Fut, T>(&self, operation: F) -> SenderResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SenderResult<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.try_acquire() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(SenderError::CircuitOpen {
                provider: self.name.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(error) if error.is_failure() => self.record_failure(),
            Err(_) => self.release_probe(),
        }
        result
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.maybe_transition_to_half_open(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failures.clear();
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker transitioning to CLOSED");
                *state = CircuitBreakerState::default();
            }
            CircuitState::Open => {
                warn!(breaker = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => {
                state.failures.push_back(now);
                while let Some(first) = state.failures.front() {
                    if now.duration_since(*first) > self.config.window {
                        state.failures.pop_front();
                    } else {
                        break;
                    }
                }

                if state.failures.len() as u32 >= self.config.threshold.max(1) {
                    info!(
                        breaker = %self.name,
                        failures = state.failures.len(),
                        "Circuit breaker transitioning to OPEN"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.failures.clear();
                }
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker returning to OPEN from half-open");
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.probe_in_flight = false;
            }
            CircuitState::Open => {
                state.opened_at = Some(now);
            }
        }
    }

    // A probe that ended in a non-failure error (e.g. validation) neither
    // closes nor reopens the circuit.
    fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.probe_in_flight = false;
        }
    }

    fn maybe_transition_to_half_open(&self, state: &mut CircuitBreakerState) {
        if state.state == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    debug!(breaker = %self.name, "Circuit breaker transitioning to HALF_OPEN");
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = false;
                }
            }
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        *self.state.lock() = CircuitBreakerState::default();
        debug!(breaker = %self.name, "Circuit breaker reset to CLOSED");
    }

    /// Unhealthy when open, degraded while probing
    pub fn health(&self) -> ComponentHealth {
        let component = format!("circuit_breaker:{}", self.name);
        match self.state() {
            CircuitState::Closed => ComponentHealth::healthy(component),
            CircuitState::HalfOpen => {
                ComponentHealth::with_status(component, HealthStatus::Degraded, "half-open")
            }
            CircuitState::Open => {
                ComponentHealth::with_status(component, HealthStatus::Unhealthy, "open")
            }
        }
    }

    /// Get total call count
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total failure count
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total rejection count
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("total_calls", &self.total_calls())
            .field("total_failures", &self.total_failures())
            .field("total_rejections", &self.total_rejections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::NetworkError;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig::new()
                .threshold(threshold)
                .cooldown(cooldown)
                .window(Duration::from_secs(1)),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> SenderResult<()> {
        cb.execute(|| async { Err(SenderError::Network(NetworkError::Timeout)) })
            .await
    }

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreaker::new("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failures_open_circuit() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.health().status, HealthStatus::Unhealthy);

        let result = cb.execute(|| async { Ok("unreachable") }).await;
        assert!(matches!(result, Err(SenderError::CircuitOpen { ref provider }) if provider == "test"));
        assert_eq!(cb.total_rejections(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        cb.execute(|| async { Ok(()) }).await.unwrap();
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_failures_do_not_count() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = cb
            .execute(|| async { Err::<(), _>(SenderError::validation("bad")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failures_outside_window_expire() {
        let cb = CircuitBreaker::with_config(
            "test",
            CircuitBreakerConfig::new()
                .threshold(2)
                .window(Duration::from_millis(20)),
        );
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_single_probe() {
        let cb = breaker(1, Duration::from_millis(10));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.health().status, HealthStatus::Degraded);

        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(10));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = fail(&cb).await;
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
