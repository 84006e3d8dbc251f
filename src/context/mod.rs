//! Per-send context and options.
//!
//! [`SendContext`] carries cancellation, an optional deadline and routing
//! hints. Every blocking step of the pipeline observes it.

use crate::errors::{SenderError, SenderResult};
use crate::strategy::StrategyKind;
use crate::transport::HttpTransport;
use crate::types::SendResult;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Routing hints attached to a context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    /// Pin a specific account by name
    pub account_name: Option<String>,
    /// Override the provider's default strategy
    pub strategy: Option<StrategyKind>,
}

/// Cancellation, deadline and routing for one send
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    route: RouteInfo,
}

impl SendContext {
    /// Create a context with no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context driven by an existing cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..Default::default()
        }
    }

    /// Derive a context whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with an absolute deadline; an earlier deadline wins
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
            route: self.route.clone(),
        }
    }

    /// Pin an account by name
    pub fn with_account(mut self, name: impl Into<String>) -> Self {
        self.route.account_name = Some(name.into());
        self
    }

    /// Override the selection strategy
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.route.strategy = Some(strategy);
        self
    }

    /// Routing hints
    pub fn route(&self) -> &RouteInfo {
        &self.route
    }

    /// The cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context was canceled
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Absolute deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already done
    pub fn check(&self) -> SenderResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SenderError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(SenderError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolve when the context is canceled or its deadline elapses
    pub async fn done(&self) -> SenderError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => SenderError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => SenderError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                SenderError::Canceled
            }
        }
    }

    /// Drive `fut` to completion unless the context ends first
    pub async fn run<F, T>(&self, fut: F) -> SenderResult<T>
    where
        F: Future<Output = SenderResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }

    /// Sleep for `duration` unless the context ends first
    pub async fn sleep(&self, duration: Duration) -> SenderResult<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

/// Callback invoked with the final outcome of a send
pub type Callback = Arc<dyn Fn(&SenderResult<SendResult>) + Send + Sync>;

/// Per-call options
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Return immediately and deliver in the background
    pub send_async: bool,
    /// Invoked exactly once with the outcome
    pub callback: Option<Callback>,
    /// Per-call HTTP client override
    pub http_client: Option<Arc<dyn HttpTransport>>,
    /// Per-call timeout
    pub timeout: Option<Duration>,
    /// Free-form metadata echoed into the result
    pub metadata: HashMap<String, String>,
    /// Pin an account by name
    pub route_account_name: Option<String>,
    /// Override the selection strategy
    pub route_strategy: Option<StrategyKind>,
    /// Earliest delivery time for queued sends
    pub delay: Option<Duration>,
}

impl SendOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver in the background
    pub fn send_async(mut self) -> Self {
        self.send_async = true;
        self
    }

    /// Set the completion callback
    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&SenderResult<SendResult>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }

    /// Override the HTTP client
    pub fn http_client(mut self, client: Arc<dyn HttpTransport>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Set the per-call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Pin an account by name
    pub fn account(mut self, name: impl Into<String>) -> Self {
        self.route_account_name = Some(name.into());
        self
    }

    /// Override the selection strategy
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.route_strategy = Some(strategy);
        self
    }

    /// Delay delivery (queued sends only)
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Apply timeout and routing hints to a context
    pub(crate) fn apply(&self, ctx: &SendContext) -> SendContext {
        let mut ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        if let Some(name) = &self.route_account_name {
            ctx.route.account_name = Some(name.clone());
        }
        if let Some(strategy) = self.route_strategy {
            ctx.route.strategy = Some(strategy);
        }
        ctx
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("send_async", &self.send_async)
            .field("callback", &self.callback.is_some())
            .field("http_client", &self.http_client.is_some())
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .field("route_account_name", &self.route_account_name)
            .field("route_strategy", &self.route_strategy)
            .field("delay", &self.delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canceled_context_fails_fast() {
        let ctx = SendContext::new();
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(SenderError::Canceled)));

        let res = ctx.sleep(Duration::from_secs(10)).await;
        assert!(matches!(res, Err(SenderError::Canceled)));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_sleep() {
        let ctx = SendContext::new().with_timeout(Duration::from_millis(20));
        let start = std::time::Instant::now();
        let res = ctx.sleep(Duration::from_secs(5)).await;
        assert!(matches!(res, Err(SenderError::DeadlineExceeded)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let outer = SendContext::new().with_timeout(Duration::from_millis(50));
        let inner = outer.with_timeout(Duration::from_secs(60));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[test]
    fn test_options_apply_routing() {
        let ctx = SendContext::new().with_account("a");
        let opts = SendOptions::new()
            .account("b")
            .strategy(StrategyKind::Weighted);
        let applied = opts.apply(&ctx);
        assert_eq!(applied.route().account_name.as_deref(), Some("b"));
        assert_eq!(applied.route().strategy, Some(StrategyKind::Weighted));
    }

    #[test]
    fn test_options_debug_hides_callback() {
        let opts = SendOptions::new().callback(|_| {});
        let debug = format!("{:?}", opts);
        assert!(debug.contains("callback: true"));
    }
}
