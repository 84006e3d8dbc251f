//! DingTalk custom robots.
//!
//! The account's `api_key` is the robot access token. When `api_secret` is
//! set the request is signed: `timestamp` and `sign` query parameters carry
//! an HMAC-SHA256 of `"{timestamp}\n{secret}"`.

use super::signing;
use crate::config::require_credential;
use crate::context::SendContext;
use crate::errors::SenderResult;
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::ResponseHandlerConfig;
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::HttpTransport;
use crate::types::message::require;
use crate::types::{downcast_message, new_message_id, BaseAccount, Credentials, Message, ProviderType};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;

const DEFAULT_ENDPOINT: &str = "https://oapi.dingtalk.com/robot/send";

/// DingTalk robot account
#[derive(Debug, Clone, Deserialize)]
pub struct DingTalkAccount {
    /// Shared account fields; `api_key` is the access token
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Overrides the robot endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(DingTalkAccount);

impl DingTalkAccount {
    /// Robot with an access token and optional signing secret
    pub fn new(name: impl Into<String>, access_token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name).with_credentials(Credentials::new(access_token, secret)),
            endpoint: None,
        }
    }

    /// Send to another endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Message body kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DingTalkContent {
    /// Plain text
    Text(String),
    /// Markdown with a title shown in notifications
    Markdown {
        /// Notification title
        title: String,
        /// Markdown body
        text: String,
    },
}

/// DingTalk robot message
#[derive(Debug, Clone)]
pub struct DingTalkMessage {
    id: String,
    /// Body
    pub content: DingTalkContent,
    /// Mobiles to mention
    pub at_mobiles: Vec<String>,
    /// Mention everyone
    pub at_all: bool,
}

impl DingTalkMessage {
    /// Plain text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_content(DingTalkContent::Text(text.into()))
    }

    /// Markdown message
    pub fn markdown(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_content(DingTalkContent::Markdown {
            title: title.into(),
            text: text.into(),
        })
    }

    fn with_content(content: DingTalkContent) -> Self {
        Self {
            id: new_message_id(),
            content,
            at_mobiles: Vec::new(),
            at_all: false,
        }
    }

    /// Mention these mobiles
    pub fn at_mobiles(mut self, mobiles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.at_mobiles = mobiles.into_iter().map(Into::into).collect();
        self
    }

    /// Mention everyone
    pub fn at_all(mut self) -> Self {
        self.at_all = true;
        self
    }

    fn body(&self) -> serde_json::Value {
        let at = json!({ "atMobiles": self.at_mobiles, "isAtAll": self.at_all });
        match &self.content {
            DingTalkContent::Text(text) => json!({
                "msgtype": "text",
                "text": { "content": text },
                "at": at,
            }),
            DingTalkContent::Markdown { title, text } => json!({
                "msgtype": "markdown",
                "markdown": { "title": title, "text": text },
                "at": at,
            }),
        }
    }
}

impl Message for DingTalkMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::DINGTALK
    }

    fn validate(&self) -> SenderResult<()> {
        match &self.content {
            DingTalkContent::Text(text) => require(text, "text"),
            DingTalkContent::Markdown { title, text } => {
                require(title, "title")?;
                require(text, "text")
            }
        }?;
        for mobile in &self.at_mobiles {
            require(mobile, "mobile")?;
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

/// `sign` parameter for a millisecond timestamp
pub fn sign(timestamp_ms: i64, secret: &str) -> SenderResult<String> {
    let payload = format!("{}\n{}", timestamp_ms, secret);
    let mac = signing::hmac_sha256(secret.as_bytes(), payload.as_bytes())?;
    Ok(signing::base64(&mac))
}

/// Builds robot requests
#[derive(Debug, Default)]
pub struct DingTalkTransformer;

#[async_trait]
impl Transformer<DingTalkAccount> for DingTalkTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::DINGTALK
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &DingTalkAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<DingTalkMessage>(msg)?;
        let endpoint = account.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let credentials = &account.base.credentials;

        let mut spec = HttpRequestSpec::post_json(endpoint, &msg.body())?
            .query("access_token", credentials.api_key.clone());
        if credentials.has_secret() {
            let timestamp = Utc::now().timestamp_millis();
            spec = spec
                .query("timestamp", timestamp.to_string())
                .query("sign", sign(timestamp, credentials.secret())?);
        }
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("errcode", "0").with_error_paths("errcode", "errmsg")
    }
}

/// Transformers for DingTalk messages
pub fn transformers() -> TransformerRegistry<DingTalkAccount> {
    TransformerRegistry::new().with(Arc::new(DingTalkTransformer))
}

/// Build a DingTalk provider
pub fn provider(
    config: ProviderConfig<DingTalkAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<DingTalkAccount>> {
    for account in &config.items {
        require_credential(&account.base, ProviderType::DINGTALK)?;
    }
    HttpProvider::new(ProviderType::DINGTALK, config, Arc::new(transformers()), transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SendOptions;
    use crate::errors::SenderError;
    use crate::mocks::{MockResponse, MockTransport};
    use crate::provider::Provider;

    #[test]
    fn test_sign_matches_reference() {
        // HMAC-SHA256("SEC1", "1700000000000\nSEC1"), base64
        let expected = signing::base64(
            &signing::hmac_sha256(b"SEC1", b"1700000000000\nSEC1").unwrap(),
        );
        assert_eq!(sign(1_700_000_000_000, "SEC1").unwrap(), expected);
        assert_ne!(sign(1_700_000_000_001, "SEC1").unwrap(), expected);
    }

    #[tokio::test]
    async fn test_signed_request() {
        let account = DingTalkAccount::new("robot", "tok", "SEC1");
        let output = DingTalkTransformer
            .transform(
                &SendContext::new(),
                &DingTalkMessage::text("deploy done").at_all(),
                &account,
            )
            .await
            .unwrap();
        let keys: Vec<&str> = output.spec.query_params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["access_token", "timestamp", "sign"]);

        let body: serde_json::Value = serde_json::from_slice(&output.spec.body).unwrap();
        assert_eq!(body["msgtype"], "text");
        assert_eq!(body["text"]["content"], "deploy done");
        assert_eq!(body["at"]["isAtAll"], true);
    }

    #[tokio::test]
    async fn test_unsigned_request_has_only_token() {
        let account = DingTalkAccount::new("robot", "tok", "");
        let output = DingTalkTransformer
            .transform(&SendContext::new(), &DingTalkMessage::markdown("t", "**x**"), &account)
            .await
            .unwrap();
        assert_eq!(output.spec.query_params.len(), 1);
    }

    #[tokio::test]
    async fn test_errcode_failure() {
        let (_, transport) = MockTransport::new()
            .add_response(MockResponse::ok(r#"{"errcode":310000,"errmsg":"sign not match"}"#))
            .shared();
        let provider = provider(
            ProviderConfig::new(vec![DingTalkAccount::new("robot", "tok", "SEC1")]),
            transport,
        )
        .unwrap();

        let err = provider
            .send(&SendContext::new(), &DingTalkMessage::text("hi"), &SendOptions::new())
            .await
            .unwrap_err();
        match err {
            SenderError::ProviderApi(api) => {
                assert_eq!(api.code, "310000");
                assert_eq!(api.message, "sign not match");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validation() {
        assert!(DingTalkMessage::text("").validate().is_err());
        assert!(DingTalkMessage::markdown("", "x").validate().is_err());
        assert!(DingTalkMessage::text("ok").validate().is_ok());
    }
}
