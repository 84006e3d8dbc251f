//! Delivery scenarios through a fully wired sender.

use crate::context::{SendContext, SendOptions};
use crate::errors::SenderError;
use crate::mocks::{MockProvider, MockResponse, MockTransport, TestMessage};
use crate::provider::{Provider, ProviderConfig};
use crate::providers::sms::{self, SmsAccount, SmsMessage, SmsVendor};
use crate::providers::webhook::{self, WebhookAccount, WebhookMessage};
use crate::providers::wecomapp::{self, WeComAppAccount, WeComAppMessage};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, RetryPolicy};
use crate::sender::{ProviderMiddleware, Sender};
use crate::types::ProviderType;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn register(sender: &Sender, provider: impl Provider + 'static) {
    sender.register_provider(Arc::new(provider), None).unwrap();
}

#[tokio::test]
async fn test_webhook_delivered_through_sender() {
    let (mock, transport) = MockTransport::new()
        .add_response(MockResponse::ok(r#"{"ok":true}"#))
        .shared();
    let account = WebhookAccount::new("ops", "https://hooks.example.com/notify")
        .with_header("X-Source", "monitor")
        .with_query("team", "infra");
    let sender = Sender::new();
    register(&sender, webhook::provider(ProviderConfig::new(vec![account]), transport).unwrap());

    let msg = WebhookMessage::json(&serde_json::json!({"event": "deploy", "status": "done"})).unwrap();
    let result = sender
        .send_with_result(&SendContext::new(), msg, SendOptions::new().metadata("run", "42"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.provider, "webhook");
    assert_eq!(result.account_name, "ops");
    assert_eq!(result.status_code, 200);
    assert_eq!(result.metadata.get("run").map(String::as_str), Some("42"));

    let request = mock.last_request().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.url, "https://hooks.example.com/notify?team=infra");
    assert_eq!(request.header("x-source"), Some("monitor"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    let body: Value = serde_json::from_str(&request.body_text()).unwrap();
    assert_eq!(body["event"], "deploy");
}

#[tokio::test]
async fn test_webhook_raw_body_sent_verbatim() {
    let (mock, transport) = MockTransport::new()
        .add_response(MockResponse::ok("{}"))
        .shared();
    let account = WebhookAccount::new("primary", "https://host/hook").with_method("POST");
    let sender = Sender::new();
    register(&sender, webhook::provider(ProviderConfig::new(vec![account]), transport).unwrap());

    let msg = WebhookMessage::new(r#"{"x":1}"#).with_header("Content-Type", "application/json");
    let result = sender
        .send_with_result(&SendContext::new(), msg, SendOptions::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.status_code, 200);

    let requests = mock.recorded_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].url, "https://host/hook");
    assert_eq!(requests[0].body_text(), r#"{"x":1}"#);
}

#[tokio::test]
async fn test_sms_subtype_routes_to_matching_vendor() {
    let (mock, transport) = MockTransport::new()
        .with_default_response(MockResponse::ok(
            r#"{"Response":{"SendStatusSet":[{"Code":"Ok","Message":"send success"}],"RequestId":"r1"}}"#,
        ))
        .shared();
    let accounts = vec![
        SmsAccount::new("a", SmsVendor::Aliyun, "AK", "SK").with_sign_name("Acme"),
        SmsAccount::new("b", SmsVendor::Tencent, "SID", "SKEY")
            .with_sign_name("Acme")
            .with_app_id("1400000000"),
    ];
    let sender = Sender::new();
    register(&sender, sms::provider(ProviderConfig::new(accounts), transport).unwrap());

    for _ in 0..4 {
        let msg = SmsMessage::tencent("1234567").to("+8613800000000").param("code", "9527");
        let result = sender
            .send_with_result(&SendContext::new(), msg, SendOptions::new())
            .await
            .unwrap();
        assert_eq!(result.account_name, "b");
    }
    assert_eq!(mock.request_count(), 4);
    assert!(mock
        .recorded_requests()
        .iter()
        .all(|r| r.header("x-tc-action") == Some("SendSms")));
}

#[tokio::test]
async fn test_transient_failures_retried_with_backoff() {
    let (mock, transport) = MockTransport::new()
        .add_response(MockResponse::status(500, "upstream down"))
        .add_response(MockResponse::status(500, "upstream down"))
        .add_response(MockResponse::ok("accepted"))
        .shared();
    let sender = Sender::new();
    register(
        &sender,
        webhook::provider(
            ProviderConfig::new(vec![WebhookAccount::new("only", "https://hooks.example.com/in")]),
            transport,
        )
        .unwrap(),
    );
    sender
        .set_retry_policy(Some(
            RetryPolicy::new()
                .max_attempts(2)
                .initial_delay(Duration::from_millis(10))
                .backoff_factor(2.0)
                .max_delay(Duration::from_millis(100))
                .jitter(false),
        ))
        .unwrap();

    let start = Instant::now();
    let result = sender
        .send_with_result(&SendContext::new(), WebhookMessage::new("ping"), SendOptions::new())
        .await
        .unwrap();

    assert_eq!(result.status_code, 200);
    assert_eq!(result.account_name, "only");
    assert_eq!(mock.request_count(), 3);
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_exhausted_retries_surface_last_error() {
    let (mock, transport) = MockTransport::new()
        .with_default_response(MockResponse::status(503, "busy"))
        .shared();
    let sender = Sender::new();
    register(
        &sender,
        webhook::provider(
            ProviderConfig::new(vec![WebhookAccount::new("only", "https://hooks.example.com/in")]),
            transport,
        )
        .unwrap(),
    );
    sender
        .set_retry_policy(Some(
            RetryPolicy::new()
                .max_attempts(1)
                .initial_delay(Duration::from_millis(1))
                .jitter(false),
        ))
        .unwrap();

    let err = sender
        .send(&SendContext::new(), WebhookMessage::new("ping"), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::Http { status: 503, .. }));
    assert_eq!(mock.request_count(), 2);
}

#[tokio::test]
async fn test_circuit_opens_then_probes_after_cooldown() {
    let timeout = SenderError::Network(crate::errors::NetworkError::Timeout);
    let provider = Arc::new(MockProvider::new("alerts").fail_times(3, timeout));
    let breaker = Arc::new(CircuitBreaker::with_config(
        "alerts",
        CircuitBreakerConfig::new()
            .threshold(3)
            .cooldown(Duration::from_millis(50)),
    ));
    let sender = Sender::new();
    sender
        .register_provider(
            provider.clone(),
            Some(ProviderMiddleware::new().circuit_breaker(breaker.clone())),
        )
        .unwrap();

    let ctx = SendContext::new();
    for _ in 0..3 {
        let err = sender
            .send(&ctx, TestMessage::new("alerts"), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Network(_)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = sender
        .send(&ctx, TestMessage::new("alerts"), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::CircuitOpen { ref provider } if provider == "alerts"));
    assert_eq!(provider.calls(), 3);

    tokio::time::sleep(Duration::from_millis(80)).await;
    sender
        .send(&ctx, TestMessage::new("alerts"), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(provider.calls(), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_rate_limited_send_canceled_while_waiting() {
    let sender = Sender::new();
    let provider = Arc::new(MockProvider::new("chat"));
    sender.register_provider(provider.clone(), None).unwrap();
    sender.set_rate_limiter(Some(Arc::new(RateLimiter::per_second(1.0, 1).unwrap())));

    let token = CancellationToken::new();
    let waiting = SendContext::with_token(token.clone());
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };

    let first_ctx = SendContext::new();
    let first = sender.send(&first_ctx, TestMessage::new("chat"), SendOptions::new());
    let second = async {
        // Let the first send take the only token.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender
            .send(&waiting, TestMessage::new("chat"), SendOptions::new())
            .await
    };

    let start = Instant::now();
    let (first, second, _) = tokio::join!(first, second, canceller);
    assert!(first.is_ok());
    assert!(matches!(second, Err(SenderError::Canceled)));
    assert!(start.elapsed() < Duration::from_millis(900));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_expired_token_refreshed_through_sender() {
    let (mock, transport) = MockTransport::new()
        .add_response(MockResponse::ok(r#"{"errcode":0,"access_token":"T1","expires_in":7200}"#))
        .add_response(MockResponse::ok(r#"{"errcode":42001,"errmsg":"access_token expired"}"#))
        .add_response(MockResponse::ok(r#"{"errcode":0,"access_token":"T2","expires_in":7200}"#))
        .add_response(MockResponse::ok(r#"{"errcode":0,"errmsg":"ok"}"#))
        .shared();
    let account = WeComAppAccount::new("app", "corp1", "s3cret", "1000002")
        .with_endpoint("https://wecom.example.com");
    let sender = Sender::new();
    register(&sender, wecomapp::provider(ProviderConfig::new(vec![account]), transport).unwrap());

    let result = sender
        .send_with_result(&SendContext::new(), WeComAppMessage::text("disk full"), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(result.account_name, "app");

    let requests = mock.recorded_requests();
    let token_fetches = requests
        .iter()
        .filter(|r| r.url.contains("/cgi-bin/gettoken"))
        .count();
    assert_eq!(token_fetches, 2);
    assert_eq!(requests.len(), 4);
    assert!(requests[3].url.ends_with("access_token=T2"));
}

#[tokio::test]
async fn test_pinned_account_and_unknown_pin() {
    let (mock, transport) = MockTransport::new()
        .with_default_response(MockResponse::ok("{}"))
        .shared();
    let accounts = vec![
        WebhookAccount::new("a", "https://a.example.com/hook"),
        WebhookAccount::new("b", "https://b.example.com/hook"),
        WebhookAccount::new("c", "https://c.example.com/hook").disabled(),
    ];
    let sender = Sender::new();
    register(&sender, webhook::provider(ProviderConfig::new(accounts), transport).unwrap());

    for _ in 0..3 {
        let result = sender
            .send_via(&SendContext::new(), "b", WebhookMessage::new("x"), SendOptions::new())
            .await
            .unwrap();
        assert_eq!(result.account_name, "b");
    }
    assert!(mock
        .recorded_requests()
        .iter()
        .all(|r| r.url.starts_with("https://b.example.com")));

    let err = sender
        .send_via(&SendContext::new(), "c", WebhookMessage::new("x"), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::NoAccount { .. }));
    assert_eq!(sender.providers(), vec![ProviderType::WEBHOOK]);
}
