//! Resilience patterns for the dispatch pipeline.
//!
//! Provides retry logic, circuit breaker, and rate limiting. The sender
//! layers them as rate limit, then circuit breaker, then retry around each
//! provider call.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryFilter, RetryPolicy};
