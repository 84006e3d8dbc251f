//! Account selection, background delivery and shutdown against a live server.

use super::*;
use integrations_sender::providers::webhook::WebhookMessage;
use integrations_sender::{SendContext, SendOptions, SenderError};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::Mock;

fn webhook_pool(base: &str) -> String {
    format!(
        r#"{{"accounts": [
            {{"provider": "webhook", "name": "a", "url": "{base}/a"}},
            {{"provider": "webhook", "name": "b", "url": "{base}/b"}},
            {{"provider": "webhook", "name": "c", "url": "{base}/c", "disabled": true}}
        ]}}"#
    )
}

async fn mount_counted(server: &wiremock::MockServer, route: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(success_response(json!({"ok": true})))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_round_robin_spreads_evenly_and_skips_disabled() {
    let mock_server = setup_mock_server().await;
    mount_counted(&mock_server, "/a", 3).await;
    mount_counted(&mock_server, "/b", 3).await;
    mount_counted(&mock_server, "/c", 0).await;

    let sender = sender_from_json(&webhook_pool(&mock_server.uri()));
    let mut names = Vec::new();
    for _ in 0..6 {
        let result = sender
            .send_with_result(&SendContext::new(), WebhookMessage::new("tick"), SendOptions::new())
            .await
            .unwrap();
        names.push(result.account_name);
    }
    names.sort();
    assert_eq!(names, vec!["a", "a", "a", "b", "b", "b"]);
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_queued_sends_report_through_callbacks() {
    let mock_server = setup_mock_server().await;
    mount_counted(&mock_server, "/a", 2).await;
    mount_counted(&mock_server, "/b", 2).await;

    let root = RootConfig::from_json(&webhook_pool(&mock_server.uri())).unwrap();
    let config = SenderConfig::builder().queue(16).workers(2).build().unwrap();
    let sender = build_sender(&root, &config).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for i in 0..4 {
        let tx = tx.clone();
        let opts = SendOptions::new()
            .send_async()
            .metadata("seq", i.to_string())
            .callback(move |result| {
                let _ = tx.send(result.as_ref().map(|r| r.metadata["seq"].clone()).map_err(|e| e.to_string()));
            });
        sender
            .send(&SendContext::new(), WebhookMessage::new("queued"), opts)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(outcome.unwrap());
    }
    seen.sort();
    assert_eq!(seen, vec!["0", "1", "2", "3"]);
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_async_callback_runs_exactly_once() {
    let mock_server = setup_mock_server().await;
    Mock::given(method("POST"))
        .respond_with(success_response(json!({"ok": true})).set_delay(Duration::from_millis(50)))
        .mount(&mock_server)
        .await;

    let sender = sender_from_json(&webhook_pool(&mock_server.uri()));
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let counter = calls.clone();
    let opts = SendOptions::new().send_async().callback(move |result| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(result.is_ok());
        }
    });

    sender
        .send(&SendContext::new(), WebhookMessage::new("later"), opts)
        .await
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_new_sends() {
    let mock_server = setup_mock_server().await;
    mount_counted(&mock_server, "/a", 0).await;
    mount_counted(&mock_server, "/b", 0).await;

    let sender = sender_from_json(&webhook_pool(&mock_server.uri()));
    sender.close().await.unwrap();
    sender.close().await.unwrap();
    assert!(sender.is_closed());

    let err = sender
        .send(&SendContext::new(), WebhookMessage::new("late"), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::Closed));

    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = rejected.clone();
    let opts = SendOptions::new().send_async().callback(move |result| {
        if matches!(result, Err(SenderError::Closed)) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert!(sender
        .send(&SendContext::new(), WebhookMessage::new("late"), opts)
        .await
        .is_err());
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pinned_disabled_account_is_not_used() {
    let mock_server = setup_mock_server().await;
    mount_counted(&mock_server, "/c", 0).await;

    let sender = sender_from_json(&webhook_pool(&mock_server.uri()));
    let err = sender
        .send_via(&SendContext::new(), "c", WebhookMessage::new("x"), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::NoAccount { .. }));
    sender.close().await.unwrap();
}
