//! WeCom group robots.
//!
//! `api_key` is the robot key passed as the `key` query parameter.

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
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;

const DEFAULT_ENDPOINT: &str = "https://qyapi.weixin.qq.com/cgi-bin/webhook/send";

/// WeCom robot account
#[derive(Debug, Clone, Deserialize)]
pub struct WeComBotAccount {
    /// Shared account fields; `api_key` is the robot key
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Overrides the robot endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(WeComBotAccount);

impl WeComBotAccount {
    /// Robot with a key
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name).with_credentials(Credentials::new(key, "")),
            endpoint: None,
        }
    }

    /// Send to another endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Robot message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeComBotKind {
    /// Plain text with optional mentions
    Text,
    /// Markdown subset supported by WeCom
    Markdown,
}

/// WeCom robot message
#[derive(Debug, Clone)]
pub struct WeComBotMessage {
    id: String,
    /// Message kind
    pub kind: WeComBotKind,
    /// Content
    pub content: String,
    /// User ids to mention; `@all` mentions everyone
    pub mentioned_list: Vec<String>,
    /// Mobiles to mention
    pub mentioned_mobile_list: Vec<String>,
}

impl WeComBotMessage {
    /// Plain text message
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            kind: WeComBotKind::Text,
            content: content.into(),
            mentioned_list: Vec::new(),
            mentioned_mobile_list: Vec::new(),
        }
    }

    /// Markdown message
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            kind: WeComBotKind::Markdown,
            ..Self::text(content)
        }
    }

    /// Mention users by id
    pub fn mention(mut self, user: impl Into<String>) -> Self {
        self.mentioned_list.push(user.into());
        self
    }

    /// Mention users by mobile
    pub fn mention_mobile(mut self, mobile: impl Into<String>) -> Self {
        self.mentioned_mobile_list.push(mobile.into());
        self
    }

    fn body(&self) -> Value {
        match self.kind {
            WeComBotKind::Text => json!({
                "msgtype": "text",
                "text": {
                    "content": self.content,
                    "mentioned_list": self.mentioned_list,
                    "mentioned_mobile_list": self.mentioned_mobile_list,
                },
            }),
            WeComBotKind::Markdown => json!({
                "msgtype": "markdown",
                "markdown": { "content": self.content },
            }),
        }
    }
}

impl Message for WeComBotMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WECOM_BOT
    }

    fn validate(&self) -> SenderResult<()> {
        require(&self.content, "content")?;
        // Vendor limit for both kinds
        if self.content.len() > 4096 {
            return Err(crate::errors::SenderError::validation(
                "content exceeds 4096 bytes",
            ));
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

/// Builds robot requests
#[derive(Debug, Default)]
pub struct WeComBotTransformer;

#[async_trait]
impl Transformer<WeComBotAccount> for WeComBotTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WECOM_BOT
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &WeComBotAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<WeComBotMessage>(msg)?;
        let endpoint = account.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let spec = HttpRequestSpec::post_json(endpoint, &msg.body())?
            .query("key", account.base.credentials.api_key.clone());
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("errcode", "0").with_error_paths("errcode", "errmsg")
    }
}

/// Transformers for WeCom robot messages
pub fn transformers() -> TransformerRegistry<WeComBotAccount> {
    TransformerRegistry::new().with(Arc::new(WeComBotTransformer))
}

/// Build a WeCom robot provider
pub fn provider(
    config: ProviderConfig<WeComBotAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<WeComBotAccount>> {
    for account in &config.items {
        require_credential(&account.base, ProviderType::WECOM_BOT)?;
    }
    HttpProvider::new(ProviderType::WECOM_BOT, config, Arc::new(transformers()), transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SendOptions;
    use crate::mocks::{MockResponse, MockTransport};
    use crate::provider::Provider;

    #[tokio::test]
    async fn test_text_with_mentions() {
        let (mock, transport) = MockTransport::new()
            .add_response(MockResponse::ok(r#"{"errcode":0,"errmsg":"ok"}"#))
            .shared();
        let provider = provider(
            ProviderConfig::new(vec![WeComBotAccount::new("ops", "k-123")]),
            transport,
        )
        .unwrap();

        let msg = WeComBotMessage::text("build failed").mention("@all");
        let result = provider
            .send(&SendContext::new(), &msg, &SendOptions::new())
            .await
            .unwrap();
        assert_eq!(result.account_name, "ops");

        let request = mock.last_request().unwrap();
        assert!(request.url.contains("key=k-123"));
        let body: Value = serde_json::from_str(&request.body_text()).unwrap();
        assert_eq!(body["text"]["mentioned_list"][0], "@all");
    }

    #[test]
    fn test_validation() {
        assert!(WeComBotMessage::markdown("").validate().is_err());
        assert!(WeComBotMessage::text("x".repeat(5000)).validate().is_err());
        assert!(WeComBotMessage::markdown("# ok").validate().is_ok());
    }
}
