//! Mock implementations for testing.
//!
//! Provides a scripted HTTP transport, a scripted provider and a minimal
//! message type so pipeline behavior can be tested without a network.

use crate::context::{SendContext, SendOptions};
use crate::errors::{NetworkError, SenderError, SenderResult};
use crate::observability::ComponentHealth;
use crate::provider::Provider;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::types::{new_message_id, Message, ProviderType, SendResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mock response configuration
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Response body
    pub body: String,
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Delay before response
    pub delay: Option<Duration>,
    /// Error to return instead
    pub error: Option<SenderError>,
}

impl MockResponse {
    /// Create a successful JSON response
    pub fn json<T: Serialize>(data: &T) -> Self {
        Self::ok(serde_json::to_string(data).unwrap_or_default())
    }

    /// Create a successful response with raw body
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    /// Create a response with an arbitrary status
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status,
            headers: Vec::new(),
            delay: None,
            error: None,
        }
    }

    /// Fail at the transport level
    pub fn error(error: SenderError) -> Self {
        Self {
            error: Some(error),
            ..Self::status(0, "")
        }
    }

    /// Fail with a network timeout
    pub fn timeout() -> Self {
        Self::error(SenderError::Network(NetworkError::Timeout))
    }

    /// Add a response header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add delay to response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn into_response(self) -> SenderResult<HttpResponse> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut response = HttpResponse::new(self.status, self.body);
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::try_from(name.as_str()),
                http::HeaderValue::from_str(value),
            ) {
                response.headers.insert(name, value);
            }
        }
        Ok(response)
    }
}

/// Recorded request for verification
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request URL
    pub url: String,
    /// Request method
    pub method: String,
    /// Request body, empty for multipart
    pub body: Bytes,
    /// Request headers
    pub headers: http::HeaderMap,
}

impl RecordedRequest {
    /// Body as lossy UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Mock HTTP transport for testing
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    default_response: Option<MockResponse>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            default_response: None,
        }
    }

    /// Add a response to the queue
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.lock().push_back(response);
        self
    }

    /// Add multiple responses
    pub fn add_responses(self, responses: impl IntoIterator<Item = MockResponse>) -> Self {
        self.responses.lock().extend(responses);
        self
    }

    /// Set default response when queue is empty
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Get the last recorded request
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().last().cloned()
    }

    /// Number of requests seen
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Get remaining response count
    pub fn remaining_responses(&self) -> usize {
        self.responses.lock().len()
    }

    /// Wrap in an `Arc<dyn HttpTransport>` while keeping a typed handle
    pub fn shared(self) -> (Arc<MockTransport>, Arc<dyn HttpTransport>) {
        let typed = Arc::new(self);
        let erased: Arc<dyn HttpTransport> = typed.clone();
        (typed, erased)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("pending_responses", &self.responses.lock().len())
            .field("recorded_requests", &self.requests.lock().len())
            .finish()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> SenderResult<HttpResponse> {
        self.requests.lock().push(RecordedRequest {
            url: request.url.clone(),
            method: request.method.to_string(),
            body: request.body_bytes().cloned().unwrap_or_default(),
            headers: request.headers.clone(),
        });

        let response = self
            .responses
            .lock()
            .pop_front()
            .or_else(|| self.default_response.clone())
            .ok_or_else(|| SenderError::Network(NetworkError::Http(
                "no mock response configured".to_string(),
            )))?;

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        response.into_response()
    }
}

/// Provider returning scripted outcomes
pub struct MockProvider {
    provider_type: ProviderType,
    outcomes: Mutex<VecDeque<SenderResult<u16>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    closed: AtomicBool,
    close_error: Option<SenderError>,
    health: Option<ComponentHealth>,
}

impl MockProvider {
    /// Provider that succeeds with status 200 unless scripted otherwise
    pub fn new(provider_type: impl Into<ProviderType>) -> Self {
        Self {
            provider_type: provider_type.into(),
            outcomes: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_error: None,
            health: None,
        }
    }

    /// Queue a successful outcome with this status
    pub fn succeed(self, status: u16) -> Self {
        self.outcomes.lock().push_back(Ok(status));
        self
    }

    /// Queue a failure
    pub fn fail(self, error: SenderError) -> Self {
        self.outcomes.lock().push_back(Err(error));
        self
    }

    /// Queue the same failure `n` times
    pub fn fail_times(self, n: usize, error: SenderError) -> Self {
        {
            let mut outcomes = self.outcomes.lock();
            for _ in 0..n {
                outcomes.push_back(Err(error.clone()));
            }
        }
        self
    }

    /// Sleep before every send
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail `close` with this error
    pub fn with_close_error(mut self, error: SenderError) -> Self {
        self.close_error = Some(error);
        self
    }

    /// Report this health
    pub fn with_health(mut self, health: ComponentHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Number of `send` invocations
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("provider_type", &self.provider_type)
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        self.provider_type.as_str()
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type.clone()
    }

    async fn send(
        &self,
        ctx: &SendContext,
        msg: &dyn Message,
        opts: &SendOptions,
    ) -> SenderResult<SendResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            ctx.sleep(delay).await?;
        }
        let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(200));
        let status = outcome?;

        let mut result = SendResult::new(msg.msg_id(), status, Bytes::from_static(b"{}"));
        result.provider = self.provider_type.to_string();
        result.account_name = "mock".to_string();
        result.metadata = opts.metadata.clone();
        Ok(result)
    }

    async fn health_check(&self, _ctx: &SendContext) -> Option<ComponentHealth> {
        self.health.clone()
    }

    async fn close(&self) -> SenderResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        match &self.close_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Minimal message for pipeline tests
#[derive(Debug, Clone)]
pub struct TestMessage {
    id: String,
    provider_type: ProviderType,
    sub_type: Option<String>,
    /// Text payload; empty text fails validation when `strict` is set
    pub text: String,
    strict: bool,
}

impl TestMessage {
    /// Message routed to `provider_type`
    pub fn new(provider_type: impl Into<ProviderType>) -> Self {
        Self {
            id: new_message_id(),
            provider_type: provider_type.into(),
            sub_type: None,
            text: "hello".to_string(),
            strict: false,
        }
    }

    /// Target a vendor subtype
    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    /// Set the text and require it to be non-empty
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self.strict = true;
        self
    }
}

impl Message for TestMessage {
    fn provider_type(&self) -> ProviderType {
        self.provider_type.clone()
    }

    fn sub_type(&self) -> Option<&str> {
        self.sub_type.as_deref()
    }

    fn validate(&self) -> SenderResult<()> {
        if self.strict {
            crate::types::message::require(&self.text, "text")?;
        }
        Ok(())
    }

    fn msg_id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
