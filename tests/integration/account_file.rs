//! Senders built from account files talk to each vendor correctly.

use super::*;
use integrations_sender::providers::dingtalk::DingTalkMessage;
use integrations_sender::providers::email_api::{EmailMessage, EmailVendor};
use integrations_sender::providers::telegram::TelegramMessage;
use integrations_sender::providers::webhook::WebhookMessage;
use integrations_sender::{SendContext, SendOptions, SenderError};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::Mock;

#[tokio::test]
async fn test_webhook_account_from_file() {
    let mock_server = setup_mock_server().await;
    Mock::given(method("PUT"))
        .and(path("/hooks/deploy"))
        .and(query_param("env", "prod"))
        .and(header("x-api-key", "k-123"))
        .and(body_partial_json(json!({"service": "billing"})))
        .respond_with(success_response(json!({"status": "accepted"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let sender = sender_from_json(&format!(
        r#"{{"accounts": [{{
            "provider": "webhook",
            "name": "deploys",
            "url": "{}/hooks/deploy",
            "method": "PUT",
            "headers": {{"X-Api-Key": "k-123"}},
            "query": {{"env": "prod"}},
            "response": {{"check_body": true, "success_path": "status", "success_value": "accepted"}}
        }}]}}"#,
        mock_server.uri()
    ));

    let msg = WebhookMessage::json(&json!({"service": "billing", "version": "1.4.2"})).unwrap();
    let result = sender
        .send_with_result(&SendContext::new(), msg, SendOptions::new())
        .await
        .unwrap();
    assert_eq!(result.account_name, "deploys");
    assert_eq!(result.provider, "webhook");
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_dingtalk_signed_request() {
    let mock_server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path("/robot/send"))
        .and(query_param("access_token", "tok-1"))
        .and(body_partial_json(json!({"msgtype": "text", "text": {"content": "disk at 91%"}})))
        .respond_with(success_response(json!({"errcode": 0, "errmsg": "ok"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let sender = sender_from_json(&format!(
        r#"{{"accounts": [{{
            "provider": "dingtalk",
            "name": "ops",
            "api_key": "tok-1",
            "api_secret": "SEC-1",
            "endpoint": "{}/robot/send"
        }}]}}"#,
        mock_server.uri()
    ));

    sender
        .send(&SendContext::new(), DingTalkMessage::text("disk at 91%"), SendOptions::new())
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    let keys: Vec<String> = requests[0]
        .url
        .query_pairs()
        .map(|(k, _)| k.into_owned())
        .collect();
    assert_eq!(keys, vec!["access_token", "timestamp", "sign"]);
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_dingtalk_error_code_surfaces() {
    let mock_server = setup_mock_server().await;
    Mock::given(method("POST"))
        .respond_with(success_response(json!({"errcode": 310000, "errmsg": "keywords not in content"})))
        .mount(&mock_server)
        .await;

    let sender = sender_from_json(&format!(
        r#"{{"accounts": [{{"provider": "dingtalk", "name": "ops", "api_key": "tok-1", "endpoint": "{}/robot/send"}}]}}"#,
        mock_server.uri()
    ));

    let err = sender
        .send(&SendContext::new(), DingTalkMessage::text("hello"), SendOptions::new())
        .await
        .unwrap_err();
    match err {
        SenderError::ProviderApi(api) => {
            assert_eq!(api.code, "310000");
            assert_eq!(api.message, "keywords not in content");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_telegram_uses_account_chat() {
    let mock_server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path("/bot123:abc/sendMessage"))
        .and(body_partial_json(json!({"chat_id": "-100200", "text": "build green"})))
        .respond_with(success_response(json!({"ok": true, "result": {"message_id": 9}})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let sender = sender_from_json(&format!(
        r#"{{"accounts": [{{
            "provider": "telegram",
            "name": "ci",
            "api_key": "123:abc",
            "chat_id": "-100200",
            "endpoint": "{}"
        }}]}}"#,
        mock_server.uri()
    ));

    sender
        .send(&SendContext::new(), TelegramMessage::new("build green"), SendOptions::new())
        .await
        .unwrap();
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_resend_bearer_auth() {
    let mock_server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path("/emails"))
        .and(header("authorization", "Bearer re_test"))
        .and(body_partial_json(json!({
            "from": "alerts@example.com",
            "to": ["oncall@example.com"],
            "subject": "Disk alert"
        })))
        .respond_with(success_response(json!({"id": "49a3999c"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let sender = sender_from_json(&format!(
        r#"{{"accounts": [{{
            "provider": "email_api",
            "name": "resend",
            "sub_type": "resend",
            "api_key": "re_test",
            "from": "alerts@example.com",
            "endpoint": "{}"
        }}]}}"#,
        mock_server.uri()
    ));

    let msg = EmailMessage::new(EmailVendor::Resend, "Disk alert")
        .to("oncall@example.com")
        .text("disk at 91%");
    let result = sender
        .send_with_result(&SendContext::new(), msg, SendOptions::new())
        .await
        .unwrap();
    assert_eq!(result.account_name, "resend");
    sender.close().await.unwrap();
}

#[test]
fn test_incomplete_account_rejected() {
    let root = RootConfig::from_json(
        r#"{"accounts": [{"provider": "sms", "name": "ali", "sub_type": "aliyun", "api_key": "AK"}]}"#,
    )
    .unwrap();
    let err = build_sender(&root, &SenderConfig::default()).unwrap_err();
    assert!(matches!(err, SenderError::Configuration(_)));
}
