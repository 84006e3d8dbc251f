//! Telegram Bot API `sendMessage`.
//!
//! `api_key` holds the bot token, which is part of the request path, so
//! only a redacted form of it is ever logged.

use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::observability::redact_token;
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::ResponseHandlerConfig;
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::HttpTransport;
use crate::types::message::require;
use crate::types::{downcast_message, new_message_id, BaseAccount, Credentials, Message, ProviderType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://api.telegram.org";
const MAX_TEXT_LEN: usize = 4096;

/// Telegram bot account
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramAccount {
    /// Shared account fields; `api_key` is the bot token
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Chat used when the message names none
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Overrides the Bot API base URL
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(TelegramAccount);

impl TelegramAccount {
    /// Bot account
    pub fn new(name: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name).with_credentials(Credentials::new(bot_token, "")),
            chat_id: None,
            endpoint: None,
        }
    }

    /// Set the default chat
    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Use another Bot API base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// A bot token is required
    pub fn validate(&self) -> SenderResult<()> {
        if self.base.credentials.api_key.trim().is_empty() {
            return Err(SenderError::Configuration(ConfigurationError::MissingField {
                field: format!("telegram.{}.api_key", self.base.name),
            }));
        }
        Ok(())
    }
}

/// Text formatting mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    /// Legacy Markdown
    Markdown,
    /// MarkdownV2
    MarkdownV2,
    /// HTML
    #[serde(rename = "HTML")]
    Html,
}

impl ParseMode {
    fn as_str(self) -> &'static str {
        match self {
            ParseMode::Markdown => "Markdown",
            ParseMode::MarkdownV2 => "MarkdownV2",
            ParseMode::Html => "HTML",
        }
    }
}

/// Telegram text message
#[derive(Debug, Clone)]
pub struct TelegramMessage {
    id: String,
    /// Message text
    pub text: String,
    /// Target chat; the account default when unset
    pub chat_id: Option<String>,
    /// Formatting mode
    pub parse_mode: Option<ParseMode>,
    /// Deliver without sound
    pub disable_notification: bool,
    /// Do not render link previews
    pub disable_web_page_preview: bool,
}

impl TelegramMessage {
    /// Text message to the account's default chat
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            text: text.into(),
            chat_id: None,
            parse_mode: None,
            disable_notification: false,
            disable_web_page_preview: false,
        }
    }

    /// Send to a specific chat
    pub fn to_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Set the formatting mode
    pub fn parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = Some(mode);
        self
    }

    /// Deliver silently
    pub fn silent(mut self) -> Self {
        self.disable_notification = true;
        self
    }

    /// Suppress link previews
    pub fn without_preview(mut self) -> Self {
        self.disable_web_page_preview = true;
        self
    }
}

impl Message for TelegramMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::TELEGRAM
    }

    fn validate(&self) -> SenderResult<()> {
        require(&self.text, "text")?;
        if self.text.chars().count() > MAX_TEXT_LEN {
            return Err(SenderError::validation(format!(
                "text exceeds {} characters",
                MAX_TEXT_LEN
            )));
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

/// Builds `sendMessage` calls
#[derive(Debug, Default)]
pub struct TelegramTransformer;

#[async_trait]
impl Transformer<TelegramAccount> for TelegramTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::TELEGRAM
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &TelegramAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<TelegramMessage>(msg)?;
        let chat_id = msg
            .chat_id
            .as_deref()
            .or(account.chat_id.as_deref())
            .ok_or_else(|| SenderError::transform("no chat_id on message or account"))?;

        let mut body = json!({
            "chat_id": chat_id,
            "text": msg.text,
            "disable_notification": msg.disable_notification,
            "disable_web_page_preview": msg.disable_web_page_preview,
        });
        if let Some(mode) = msg.parse_mode {
            body["parse_mode"] = json!(mode.as_str());
        }

        let base = account.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let url = format!(
            "{}/bot{}/sendMessage",
            base.trim_end_matches('/'),
            account.base.credentials.api_key
        );
        debug!(
            bot = %redact_token(&account.base.credentials.api_key),
            chat_id,
            "Built Telegram request"
        );
        Ok(TransformOutput::new(HttpRequestSpec::post_json(url, &body)?))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("ok", "true").with_error_paths("error_code", "description")
    }
}

/// Transformers for Telegram messages
pub fn transformers() -> TransformerRegistry<TelegramAccount> {
    TransformerRegistry::new().with(Arc::new(TelegramTransformer))
}

/// Build a Telegram provider
pub fn provider(
    config: ProviderConfig<TelegramAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<TelegramAccount>> {
    for account in &config.items {
        account.validate()?;
    }
    HttpProvider::new(ProviderType::TELEGRAM, config, Arc::new(transformers()), transport)
}
