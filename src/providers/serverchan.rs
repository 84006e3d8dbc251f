//! ServerChan push.
//!
//! `api_key` is the SendKey. Keys of the form `sctp{uid}t...` go to the
//! per-user ServerChan3 host; other keys use the Turbo endpoint.

use crate::config::require_credential;
use crate::context::SendContext;
use crate::errors::{SenderError, SenderResult};
use crate::observability::redact_token;
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::ResponseHandlerConfig;
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::HttpTransport;
use crate::types::message::require;
use crate::types::{downcast_message, new_message_id, BaseAccount, Credentials, Message, ProviderType};
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// ServerChan account
#[derive(Debug, Clone, Deserialize)]
pub struct ServerChanAccount {
    /// Shared account fields; `api_key` is the SendKey
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Overrides the push base URL; the key is appended as `/{key}.send`
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(ServerChanAccount);

impl ServerChanAccount {
    /// Account for a SendKey
    pub fn new(name: impl Into<String>, send_key: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name).with_credentials(Credentials::new(send_key, "")),
            endpoint: None,
        }
    }

    /// Use another push base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Push URL for this key
    pub fn push_url(&self) -> String {
        let key = &self.base.credentials.api_key;
        if let Some(endpoint) = &self.endpoint {
            return format!("{}/{}.send", endpoint.trim_end_matches('/'), key);
        }
        match sc3_uid(key) {
            Some(uid) => format!("https://{}.push.ft07.com/send/{}.send", uid, key),
            None => format!("https://sctapi.ftqq.com/{}.send", key),
        }
    }
}

fn sc3_uid(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("sctp")?;
    let end = rest.find('t')?;
    let uid = &rest[..end];
    (!uid.is_empty() && uid.bytes().all(|b| b.is_ascii_digit())).then_some(uid)
}

/// ServerChan message
#[derive(Debug, Clone)]
pub struct ServerChanMessage {
    id: String,
    /// Title, at most 32 characters
    pub title: String,
    /// Markdown body
    pub desp: String,
    /// Card summary
    pub short: Option<String>,
    /// Delivery channels, e.g. `9|66`
    pub channel: Option<String>,
}

impl ServerChanMessage {
    /// Message with a title and markdown body
    pub fn new(title: impl Into<String>, desp: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            title: title.into(),
            desp: desp.into(),
            short: None,
            channel: None,
        }
    }

    /// Set the card summary
    pub fn short(mut self, short: impl Into<String>) -> Self {
        self.short = Some(short.into());
        self
    }

    /// Choose delivery channels
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl Message for ServerChanMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SERVERCHAN
    }

    fn validate(&self) -> SenderResult<()> {
        require(&self.title, "title")?;
        if self.title.chars().count() > 32 {
            return Err(SenderError::validation("title exceeds 32 characters"));
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

/// Builds push requests
#[derive(Debug, Default)]
pub struct ServerChanTransformer;

#[async_trait]
impl Transformer<ServerChanAccount> for ServerChanTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SERVERCHAN
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &ServerChanAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<ServerChanMessage>(msg)?;
        let mut fields = vec![
            ("title".to_string(), msg.title.clone()),
            ("desp".to_string(), msg.desp.clone()),
        ];
        if let Some(short) = &msg.short {
            fields.push(("short".to_string(), short.clone()));
        }
        if let Some(channel) = &msg.channel {
            fields.push(("channel".to_string(), channel.clone()));
        }

        let url = account.push_url();
        debug!(
            key = %redact_token(&account.base.credentials.api_key),
            "Built ServerChan request"
        );
        Ok(TransformOutput::new(HttpRequestSpec::post_form(url, &fields)))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("code", "0").with_error_paths("code", "message")
    }
}

/// Transformers for ServerChan messages
pub fn transformers() -> TransformerRegistry<ServerChanAccount> {
    TransformerRegistry::new().with(Arc::new(ServerChanTransformer))
}

/// Build a ServerChan provider
pub fn provider(
    config: ProviderConfig<ServerChanAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<ServerChanAccount>> {
    for account in &config.items {
        require_credential(&account.base, ProviderType::SERVERCHAN)?;
    }
    HttpProvider::new(ProviderType::SERVERCHAN, config, Arc::new(transformers()), transport)
}
