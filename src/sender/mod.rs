//! The sender façade.
//!
//! A [`Sender`] owns the provider registry and the middleware shared by
//! every send. Each send runs through rate limiting, then the provider's
//! circuit breaker, then the retry policy, then the provider itself.
//! Metrics are recorded once per completed send and the callback, if any,
//! is invoked exactly once.

use crate::config::SenderConfig;
use crate::context::{SendContext, SendOptions};
use crate::errors::{QueueError, SenderError, SenderResult};
use crate::observability::{ComponentHealth, MetricsSink, NoopMetrics, SendRecord, SenderHealth};
use crate::provider::Provider;
use crate::queue::{MemoryQueue, Queue, QueueItem};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RetryPolicy};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::types::{Message, ProviderType, SendResult};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, instrument, warn, Dispatch};

/// Middleware overrides for one provider.
///
/// Unset fields fall back to the sender-wide setting.
#[derive(Debug, Clone, Default)]
pub struct ProviderMiddleware {
    /// Rate limiter used instead of the sender-wide one
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Circuit breaker used instead of one built from the sender-wide config
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    /// Retry policy used instead of the sender-wide one
    pub retry: Option<RetryPolicy>,
}

impl ProviderMiddleware {
    /// Empty overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the rate limiter
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Override the circuit breaker
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Override the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

#[derive(Clone)]
struct Registration {
    provider: Arc<dyn Provider>,
    middleware: ProviderMiddleware,
}

struct SenderInner {
    providers: RwLock<HashMap<ProviderType, Registration>>,
    rate_limiter: RwLock<Option<Arc<RateLimiter>>>,
    retry: RwLock<Option<RetryPolicy>>,
    breaker_config: RwLock<Option<CircuitBreakerConfig>>,
    breakers: Mutex<HashMap<ProviderType, Arc<CircuitBreaker>>>,
    queue: RwLock<Option<Arc<dyn Queue>>>,
    metrics: RwLock<Arc<dyn MetricsSink>>,
    metrics_lock: Mutex<()>,
    http_client: RwLock<Option<Arc<dyn HttpTransport>>>,
    logger: RwLock<Option<Dispatch>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for SenderInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Routes messages to registered providers through the middleware stack
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    /// Create a sender with no providers and no middleware
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SenderInner {
                providers: RwLock::new(HashMap::new()),
                rate_limiter: RwLock::new(None),
                retry: RwLock::new(None),
                breaker_config: RwLock::new(None),
                breakers: Mutex::new(HashMap::new()),
                queue: RwLock::new(None),
                metrics: RwLock::new(Arc::new(NoopMetrics)),
                metrics_lock: Mutex::new(()),
                http_client: RwLock::new(None),
                logger: RwLock::new(None),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a sender with middleware and a default HTTP client from config.
    ///
    /// Must be called inside a tokio runtime when the config enables the queue.
    pub fn with_config(config: &SenderConfig) -> SenderResult<Self> {
        let transport = ReqwestTransport::with_user_agent(config.timeout, &config.user_agent)?;
        Self::with_config_and_transport(config, Arc::new(transport))
    }

    /// Create a sender from settings around an existing HTTP client
    pub fn with_config_and_transport(
        config: &SenderConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> SenderResult<Self> {
        config.validate()?;
        let sender = Self::new();
        sender.set_http_client(Some(transport));
        let limiter = match config.rate_limit.clone() {
            Some(c) => Some(Arc::new(RateLimiter::new(c)?)),
            None => None,
        };
        sender.set_rate_limiter(limiter);
        sender.set_retry_policy(config.retry.clone())?;
        sender.set_circuit_breaker(config.circuit_breaker.clone());
        if let Some(capacity) = config.queue_capacity {
            sender.set_queue(Some(Arc::new(MemoryQueue::new(capacity))), config.workers);
        }
        Ok(sender)
    }

    /// Register a provider under its provider type, replacing any previous one
    pub fn register_provider(
        &self,
        provider: Arc<dyn Provider>,
        middleware: Option<ProviderMiddleware>,
    ) -> SenderResult<()> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        let provider_type = provider.provider_type();
        info!(provider = %provider_type, "Registering provider");
        self.inner.breakers.lock().remove(&provider_type);
        self.inner.providers.write().insert(
            provider_type,
            Registration {
                provider,
                middleware: middleware.unwrap_or_default(),
            },
        );
        Ok(())
    }

    /// Remove a provider and close it; returns whether one was registered
    pub async fn unregister_provider(&self, provider_type: &ProviderType) -> SenderResult<bool> {
        let removed = self.inner.providers.write().remove(provider_type);
        self.inner.breakers.lock().remove(provider_type);
        match removed {
            Some(registration) => {
                info!(provider = %provider_type, "Unregistering provider");
                registration.provider.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Registered provider types
    pub fn providers(&self) -> Vec<ProviderType> {
        let mut types: Vec<ProviderType> = self.inner.providers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Set or clear the sender-wide rate limiter
    pub fn set_rate_limiter(&self, limiter: Option<Arc<RateLimiter>>) {
        *self.inner.rate_limiter.write() = limiter;
    }

    /// Set or clear the sender-wide retry policy
    pub fn set_retry_policy(&self, policy: Option<RetryPolicy>) -> SenderResult<()> {
        if let Some(policy) = &policy {
            policy.validate()?;
        }
        *self.inner.retry.write() = policy;
        Ok(())
    }

    /// Set or clear circuit breaking; each provider gets its own breaker
    pub fn set_circuit_breaker(&self, config: Option<CircuitBreakerConfig>) {
        *self.inner.breaker_config.write() = config;
        self.inner.breakers.lock().clear();
    }

    /// Set or clear the async queue and start `workers` workers draining it.
    ///
    /// A replaced queue is closed; its pending items fail with `Closed`.
    /// Must be called inside a tokio runtime.
    pub fn set_queue(&self, queue: Option<Arc<dyn Queue>>, workers: usize) {
        let previous = std::mem::replace(&mut *self.inner.queue.write(), queue.clone());
        if let Some(previous) = previous {
            previous.close();
            fail_pending(previous.as_ref());
        }

        if let Some(queue) = queue {
            let mut handles = self.inner.workers.lock();
            handles.retain(|h| !h.is_finished());
            for id in 0..workers.max(1) {
                handles.push(tokio::spawn(run_worker(
                    id,
                    Arc::downgrade(&self.inner),
                    queue.clone(),
                    self.inner.shutdown.child_token(),
                )));
            }
        }
    }

    /// Set the metrics sink; `None` restores the no-op sink
    pub fn set_metrics(&self, sink: Option<Arc<dyn MetricsSink>>) {
        *self.inner.metrics.write() = sink.unwrap_or_else(|| Arc::new(NoopMetrics));
    }

    /// Set or clear the HTTP client injected into sends that do not set one
    pub fn set_http_client(&self, client: Option<Arc<dyn HttpTransport>>) {
        *self.inner.http_client.write() = client;
    }

    /// Default HTTP client, if any
    pub fn http_client(&self) -> Option<Arc<dyn HttpTransport>> {
        self.inner.http_client.read().clone()
    }

    /// Route this sender's log events to `dispatch` instead of the global subscriber
    pub fn set_logger(&self, dispatch: Option<Dispatch>) {
        *self.inner.logger.write() = dispatch;
    }

    /// Send a message.
    ///
    /// With `send_async` the call returns once the message is queued (or
    /// handed to a background task) and the outcome goes to the callback.
    pub async fn send<M: Message>(
        &self,
        ctx: &SendContext,
        msg: M,
        opts: SendOptions,
    ) -> SenderResult<()> {
        self.send_arc(ctx, Arc::new(msg), opts).await
    }

    /// [`send`](Self::send) for an already shared message
    pub async fn send_arc(
        &self,
        ctx: &SendContext,
        msg: Arc<dyn Message>,
        opts: SendOptions,
    ) -> SenderResult<()> {
        if opts.send_async {
            return self.dispatch_async(ctx, msg, opts).await;
        }
        self.dispatch_sync(ctx, msg, opts).await.map(|_| ())
    }

    /// Send synchronously and return the result
    pub async fn send_with_result<M: Message>(
        &self,
        ctx: &SendContext,
        msg: M,
        opts: SendOptions,
    ) -> SenderResult<SendResult> {
        if opts.send_async {
            return Err(SenderError::validation(
                "send_with_result cannot be combined with send_async",
            ));
        }
        self.dispatch_sync(ctx, Arc::new(msg), opts).await
    }

    /// Send through a specific account of the message's provider
    pub async fn send_via<M: Message>(
        &self,
        ctx: &SendContext,
        account_name: &str,
        msg: M,
        opts: SendOptions,
    ) -> SenderResult<SendResult> {
        let ctx = ctx.clone().with_account(account_name);
        self.send_with_result(&ctx, msg, opts).await
    }

    /// Aggregate provider and middleware health
    pub async fn health_check(&self, ctx: &SendContext) -> SenderHealth {
        let registrations: Vec<(ProviderType, Registration)> = self
            .inner
            .providers
            .read()
            .iter()
            .map(|(t, r)| (t.clone(), r.clone()))
            .collect();

        let providers: Vec<ComponentHealth> =
            join_all(registrations.iter().map(|(provider_type, registration)| async move {
                registration
                    .provider
                    .health_check(ctx)
                    .await
                    .unwrap_or_else(|| ComponentHealth::healthy(provider_type.as_str()))
            }))
            .await;

        let mut components = Vec::new();
        for (provider_type, registration) in &registrations {
            if let Some(limiter) = &registration.middleware.rate_limiter {
                let mut health = limiter.health();
                health.name = format!("rate_limiter:{}", provider_type);
                components.push(health);
            }
            if let Some(breaker) = &registration.middleware.circuit_breaker {
                components.push(breaker.health());
            }
        }

        if let Some(limiter) = self.inner.rate_limiter.read().clone() {
            components.push(limiter.health());
        }
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.inner.breakers.lock().values().cloned().collect();
        components.extend(breakers.iter().map(|b| b.health()));
        if let Some(queue) = self.inner.queue.read().clone() {
            components.push(queue.health());
        }
        if let Some(health) = self.inner.metrics.read().health() {
            components.push(health);
        }

        SenderHealth::aggregate(providers, components)
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop workers, fail queued sends and close every provider.
    ///
    /// Idempotent: later calls return `Ok(())`.
    pub async fn close(&self) -> SenderResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing sender");
        self.inner.shutdown.cancel();

        let queue = self.inner.queue.write().take();
        if let Some(queue) = &queue {
            queue.close();
        }

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        let mut errors = Vec::new();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Queue worker ended abnormally");
            }
        }
        if let Some(queue) = &queue {
            fail_pending(queue.as_ref());
        }

        let providers: Vec<(ProviderType, Registration)> =
            self.inner.providers.write().drain().collect();
        for (provider_type, registration) in providers {
            if let Err(e) = registration.provider.close().await {
                warn!(provider = %provider_type, error = %e, "Provider close failed");
                errors.push(e);
            }
        }
        self.inner.breakers.lock().clear();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SenderError::Multiple(errors)),
        }
    }

    async fn dispatch_sync(
        &self,
        ctx: &SendContext,
        msg: Arc<dyn Message>,
        opts: SendOptions,
    ) -> SenderResult<SendResult> {
        let result = self.with_logger(self.execute(ctx, msg.as_ref(), &opts)).await;
        complete(&opts, &result);
        result
    }

    async fn dispatch_async(
        &self,
        ctx: &SendContext,
        msg: Arc<dyn Message>,
        mut opts: SendOptions,
    ) -> SenderResult<()> {
        if let Err(err) = self.admit(msg.as_ref()) {
            let result = Err(err.clone());
            complete(&opts, &result);
            return Err(err);
        }

        // Routing hints on the caller's context travel with the item.
        let route = ctx.route();
        if opts.route_account_name.is_none() {
            opts.route_account_name = route.account_name.clone();
        }
        if opts.route_strategy.is_none() {
            opts.route_strategy = route.strategy;
        }

        let queue = self.inner.queue.read().clone();
        match queue {
            Some(queue) => {
                let delay = opts.delay;
                let item = QueueItem::new(msg, opts.clone());
                let queued = match delay {
                    Some(delay) => queue.enqueue_delayed(item, delay).await,
                    None => queue.enqueue(item).await,
                };
                if let Err(err) = queued {
                    complete(&opts, &Err(err.clone()));
                    return Err(err);
                }
                debug!(queue_size = queue.size(), "Message queued");
            }
            None => {
                let sender = self.clone();
                let ctx = SendContext::with_token(self.inner.shutdown.child_token());
                tokio::spawn(async move {
                    if let Some(delay) = opts.delay {
                        if let Err(err) = ctx.sleep(delay).await {
                            complete(&opts, &Err(err));
                            return;
                        }
                    }
                    let result = sender
                        .with_logger(sender.execute(&ctx, msg.as_ref(), &opts))
                        .await;
                    complete(&opts, &result);
                });
            }
        }
        Ok(())
    }

    // Steps shared by every path before the provider is involved.
    fn admit(&self, msg: &dyn Message) -> SenderResult<Registration> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        let provider_type = msg.provider_type();
        let registration = self
            .inner
            .providers
            .read()
            .get(&provider_type)
            .cloned()
            .ok_or_else(|| SenderError::UnknownProvider(provider_type.to_string()))?;
        msg.validate()?;
        Ok(registration)
    }

    #[instrument(skip_all, fields(provider = %msg.provider_type(), msg_id = msg.msg_id()))]
    async fn execute(
        &self,
        ctx: &SendContext,
        msg: &dyn Message,
        opts: &SendOptions,
    ) -> SenderResult<SendResult> {
        let start = Instant::now();
        let registration = self.admit(msg)?;

        let mut opts = opts.clone();
        if opts.http_client.is_none() {
            opts.http_client = self.inner.http_client.read().clone();
        }
        let ctx = opts.apply(ctx);

        let result = self.pipeline(&ctx, &registration, msg, &opts).await;
        self.record(msg, &ctx, &result, start);

        match &result {
            Ok(r) => debug!(account = %r.account_name, status = r.status_code, "Send succeeded"),
            Err(e) => warn!(error = %e, kind = e.kind(), "Send failed"),
        }
        result
    }

    async fn pipeline(
        &self,
        ctx: &SendContext,
        registration: &Registration,
        msg: &dyn Message,
        opts: &SendOptions,
    ) -> SenderResult<SendResult> {
        let provider = &registration.provider;

        let limiter = registration
            .middleware
            .rate_limiter
            .clone()
            .or_else(|| self.inner.rate_limiter.read().clone());
        if let Some(limiter) = limiter {
            limiter.wait(ctx).await?;
        }

        let retry = registration
            .middleware
            .retry
            .clone()
            .or_else(|| self.inner.retry.read().clone());
        let attempt = || async {
            match &retry {
                Some(policy) => policy.execute(ctx, || provider.send(ctx, msg, opts)).await,
                None => {
                    ctx.check()?;
                    provider.send(ctx, msg, opts).await
                }
            }
        };

        match self.breaker_for(&provider.provider_type(), &registration.middleware) {
            Some(breaker) => breaker.execute(attempt).await,
            None => attempt().await,
        }
    }

    fn breaker_for(
        &self,
        provider_type: &ProviderType,
        middleware: &ProviderMiddleware,
    ) -> Option<Arc<CircuitBreaker>> {
        if let Some(breaker) = &middleware.circuit_breaker {
            return Some(breaker.clone());
        }
        let config = self.inner.breaker_config.read().clone()?;
        Some(
            self.inner
                .breakers
                .lock()
                .entry(provider_type.clone())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::with_config(provider_type.as_str(), config))
                })
                .clone(),
        )
    }

    fn record(
        &self,
        msg: &dyn Message,
        ctx: &SendContext,
        result: &SenderResult<SendResult>,
        start: Instant,
    ) {
        let record = SendRecord {
            provider_type: msg.provider_type().to_string(),
            account_name: match result {
                Ok(r) => r.account_name.clone(),
                Err(_) => ctx.route().account_name.clone().unwrap_or_default(),
            },
            sub_type: msg.sub_type().unwrap_or_default().to_string(),
            status_code: match result {
                Ok(r) => r.status_code,
                Err(e) => e.http_status().unwrap_or(0),
            },
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
            error_kind: result.as_ref().err().map(|e| e.kind()),
        };

        let sink = self.inner.metrics.read().clone();
        let _serial = self.inner.metrics_lock.lock();
        sink.record(&record);
    }

    async fn with_logger<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let logger = self.inner.logger.read().clone();
        match logger {
            Some(dispatch) => fut.with_subscriber(dispatch).await,
            None => fut.await,
        }
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("providers", &self.providers())
            .field("closed", &self.is_closed())
            .field("queue", &self.inner.queue.read().is_some())
            .finish_non_exhaustive()
    }
}

fn complete(opts: &SendOptions, result: &SenderResult<SendResult>) {
    if let Some(callback) = &opts.callback {
        callback(result);
    }
}

fn fail_pending(queue: &dyn Queue) {
    let pending = queue.drain();
    if !pending.is_empty() {
        warn!(count = pending.len(), "Dropping queued messages");
    }
    for item in pending {
        complete(&item.options, &Err(SenderError::Closed));
    }
}

async fn run_worker(
    id: usize,
    sender: Weak<SenderInner>,
    queue: Arc<dyn Queue>,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "Queue worker started");
    let ctx = SendContext::with_token(shutdown);
    loop {
        let item = match queue.dequeue(&ctx).await {
            Ok(item) => item,
            Err(SenderError::Queue(QueueError::Closed)) => break,
            Err(err) => {
                debug!(worker = id, error = %err, "Queue worker stopping");
                break;
            }
        };

        let Some(inner) = sender.upgrade() else {
            complete(&item.options, &Err(SenderError::Closed));
            break;
        };
        let sender = Sender { inner };
        let result = sender
            .with_logger(sender.execute(&ctx, item.message.as_ref(), &item.options))
            .await;
        complete(&item.options, &result);
    }
    debug!(worker = id, "Queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::NetworkError;
    use crate::mocks::{MockProvider, TestMessage};
    use crate::observability::{HealthStatus, MetricsCollector};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn sender_with(provider: MockProvider) -> (Sender, Arc<MockProvider>) {
        let sender = Sender::new();
        let provider = Arc::new(provider);
        sender.register_provider(provider.clone(), None).unwrap();
        (sender, provider)
    }

    fn timeout() -> SenderError {
        SenderError::Network(NetworkError::Timeout)
    }

    #[tokio::test]
    async fn test_routes_by_provider_type() {
        let (sender, provider) = sender_with(MockProvider::new("test"));
        let result = sender
            .send_with_result(&SendContext::new(), TestMessage::new("test"), SendOptions::new())
            .await
            .unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(provider.calls(), 1);
        assert_eq!(sender.providers(), vec![ProviderType::new("test")]);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let sender = Sender::new();
        let err = sender
            .send(&SendContext::new(), TestMessage::new("nope"), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::UnknownProvider(ref p) if p == "nope"));
    }

    #[tokio::test]
    async fn test_validation_runs_before_provider() {
        let (sender, provider) = sender_with(MockProvider::new("test"));
        let err = sender
            .send(
                &SendContext::new(),
                TestMessage::new("test").with_text(""),
                SendOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Validation { .. }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let (sender, provider) = sender_with(MockProvider::new("test").fail_times(10, timeout()));
        sender
            .set_retry_policy(Some(
                RetryPolicy::new()
                    .max_attempts(2)
                    .initial_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(2))
                    .jitter(false),
            ))
            .unwrap();

        let result = sender
            .send(&SendContext::new(), TestMessage::new("test"), SendOptions::new())
            .await;
        assert!(result.is_err());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_retry_policy_rejected() {
        let sender = Sender::new();
        let err = sender
            .set_retry_policy(Some(RetryPolicy::new().backoff_factor(0.5)))
            .unwrap_err();
        assert!(matches!(err, SenderError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_circuit_opens_per_provider() {
        let (sender, provider) = sender_with(MockProvider::new("test").fail_times(3, timeout()));
        sender.set_circuit_breaker(Some(
            CircuitBreakerConfig::new()
                .threshold(3)
                .cooldown(Duration::from_secs(60)),
        ));

        for _ in 0..3 {
            let _ = sender
                .send(&SendContext::new(), TestMessage::new("test"), SendOptions::new())
                .await;
        }
        let err = sender
            .send(&SendContext::new(), TestMessage::new("test"), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::CircuitOpen { .. }));
        assert_eq!(provider.calls(), 3);

        let health = sender.health_check(&SendContext::new()).await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_callback_invoked_once_sync() {
        let (sender, _) = sender_with(MockProvider::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let opts = SendOptions::new().callback(move |r| {
            assert!(r.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sender
            .send(&SendContext::new(), TestMessage::new("test"), opts)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_without_queue_returns_immediately() {
        let (sender, _) =
            sender_with(MockProvider::new("test").with_delay(Duration::from_millis(200)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let opts = SendOptions::new().send_async().callback(move |r| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(r.is_ok());
            }
        });

        let start = Instant::now();
        sender
            .send(&SendContext::new(), TestMessage::new("test"), opts)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_workers_deliver() {
        let (sender, provider) = sender_with(MockProvider::new("test"));
        sender.set_queue(Some(Arc::new(MemoryQueue::new(10))), 2);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..5 {
            let tx = tx.clone();
            let opts = SendOptions::new()
                .send_async()
                .callback(move |r| {
                    let _ = tx.send(r.is_ok());
                });
            sender
                .send(&SendContext::new(), TestMessage::new("test"), opts)
                .await
                .unwrap();
        }
        for _ in 0..5 {
            assert!(rx.recv().await.unwrap());
        }
        assert_eq!(provider.calls(), 5);
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_with_result_rejects_async() {
        let (sender, _) = sender_with(MockProvider::new("test"));
        let err = sender
            .send_with_result(
                &SendContext::new(),
                TestMessage::new("test"),
                SendOptions::new().send_async(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_aggregates() {
        let sender = Sender::new();
        let a = Arc::new(MockProvider::new("a").with_close_error(SenderError::validation("a")));
        let b = Arc::new(MockProvider::new("b").with_close_error(SenderError::validation("b")));
        sender.register_provider(a.clone(), None).unwrap();
        sender.register_provider(b.clone(), None).unwrap();

        let err = sender.close().await.unwrap_err();
        assert!(matches!(err, SenderError::Multiple(ref errs) if errs.len() == 2));
        assert!(a.is_closed() && b.is_closed());
        assert!(sender.close().await.is_ok());
        assert!(sender.is_closed());

        let err = sender
            .send(&SendContext::new(), TestMessage::new("a"), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Closed));
        assert!(sender
            .register_provider(Arc::new(MockProvider::new("c")), None)
            .is_err());
    }

    #[tokio::test]
    async fn test_close_fails_delayed_items() {
        let (sender, provider) = sender_with(MockProvider::new("test"));
        sender.set_queue(Some(Arc::new(MemoryQueue::new(10))), 1);

        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let opts = SendOptions::new()
            .send_async()
            .delay(Duration::from_secs(60))
            .callback(move |r| {
                *slot.lock() = Some(matches!(r, Err(SenderError::Closed)));
            });
        sender
            .send(&SendContext::new(), TestMessage::new("test"), opts)
            .await
            .unwrap();

        sender.close().await.unwrap();
        assert_eq!(*outcome.lock(), Some(true));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_unregister_closes_provider() {
        let (sender, provider) = sender_with(MockProvider::new("test"));
        assert!(sender
            .unregister_provider(&ProviderType::new("test"))
            .await
            .unwrap());
        assert!(provider.is_closed());
        assert!(!sender
            .unregister_provider(&ProviderType::new("test"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (sender, _) = sender_with(MockProvider::new("test").fail(timeout()));
        let metrics = Arc::new(MetricsCollector::new());
        sender.set_metrics(Some(metrics.clone()));

        let _ = sender
            .send(&SendContext::new(), TestMessage::new("test"), SendOptions::new())
            .await;
        sender
            .send(&SendContext::new(), TestMessage::new("test"), SendOptions::new())
            .await
            .unwrap();

        assert_eq!(metrics.send_count("test"), 2);
        assert_eq!(metrics.error_count("test"), 1);
        assert_eq!(metrics.error_kind_count("network"), 1);
    }

    #[tokio::test]
    async fn test_health_aggregates_providers() {
        let sender = Sender::new();
        sender
            .register_provider(
                Arc::new(MockProvider::new("a").with_health(ComponentHealth::with_status(
                    "a",
                    HealthStatus::Degraded,
                    "slow",
                ))),
                None,
            )
            .unwrap();
        sender
            .register_provider(Arc::new(MockProvider::new("b")), None)
            .unwrap();

        let health = sender.health_check(&SendContext::new()).await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.providers.len(), 2);
    }
}
