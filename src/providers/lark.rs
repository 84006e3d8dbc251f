//! Lark / Feishu custom bots.
//!
//! `api_key` is the hook token appended to the endpoint. A signing secret
//! in `api_secret` adds `timestamp` and `sign` fields to the body, where
//! `sign` is the base64 HMAC-SHA256 keyed by `"{timestamp}\n{secret}"` over
//! an empty message.

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
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;

const DEFAULT_ENDPOINT: &str = "https://open.feishu.cn/open-apis/bot/v2/hook";

/// Lark bot account
#[derive(Debug, Clone, Deserialize)]
pub struct LarkAccount {
    /// Shared account fields; `api_key` is the hook token
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Overrides the hook base URL
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(LarkAccount);

impl LarkAccount {
    /// Bot with a hook token and optional signing secret
    pub fn new(name: impl Into<String>, token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name).with_credentials(Credentials::new(token, secret)),
            endpoint: None,
        }
    }

    /// Send to another hook base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn hook_url(&self) -> String {
        let base = self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        format!("{}/{}", base.trim_end_matches('/'), self.base.credentials.api_key)
    }
}

/// Lark bot message
#[derive(Debug, Clone)]
pub struct LarkMessage {
    id: String,
    /// Card title; a title turns the message into a markdown card
    pub title: Option<String>,
    /// Text or markdown content
    pub text: String,
}

impl LarkMessage {
    /// Plain text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            title: None,
            text: text.into(),
        }
    }

    /// Interactive card with a title and markdown body
    pub fn card(title: impl Into<String>, markdown: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::text(markdown)
        }
    }

    fn body(&self) -> Value {
        match &self.title {
            None => json!({
                "msg_type": "text",
                "content": { "text": self.text },
            }),
            Some(title) => json!({
                "msg_type": "interactive",
                "card": {
                    "header": { "title": { "tag": "plain_text", "content": title } },
                    "elements": [{ "tag": "markdown", "content": self.text }],
                },
            }),
        }
    }
}

impl Message for LarkMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::LARK
    }

    fn validate(&self) -> SenderResult<()> {
        if let Some(title) = &self.title {
            require(title, "title")?;
        }
        require(&self.text, "text")
    }

    fn msg_id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `sign` field for a timestamp in seconds
pub fn sign(timestamp: i64, secret: &str) -> SenderResult<String> {
    let key = format!("{}\n{}", timestamp, secret);
    let mac = signing::hmac_sha256(key.as_bytes(), b"")?;
    Ok(signing::base64(&mac))
}

/// Builds bot requests
#[derive(Debug, Default)]
pub struct LarkTransformer;

#[async_trait]
impl Transformer<LarkAccount> for LarkTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::LARK
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &LarkAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<LarkMessage>(msg)?;
        let mut body = msg.body();
        let credentials = &account.base.credentials;
        if credentials.has_secret() {
            let timestamp = Utc::now().timestamp();
            body["timestamp"] = Value::String(timestamp.to_string());
            body["sign"] = Value::String(sign(timestamp, credentials.secret())?);
        }
        Ok(TransformOutput::new(HttpRequestSpec::post_json(
            account.hook_url(),
            &body,
        )?))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("code", "0").with_error_paths("code", "msg")
    }
}

/// Transformers for Lark messages
pub fn transformers() -> TransformerRegistry<LarkAccount> {
    TransformerRegistry::new().with(Arc::new(LarkTransformer))
}

/// Build a Lark provider
pub fn provider(
    config: ProviderConfig<LarkAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<LarkAccount>> {
    for account in &config.items {
        require_credential(&account.base, ProviderType::LARK)?;
    }
    HttpProvider::new(ProviderType::LARK, config, Arc::new(transformers()), transport)
}
