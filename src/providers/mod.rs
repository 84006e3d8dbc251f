//! Vendor families.
//!
//! Each module defines an account type, a message type and the
//! transformers that turn one into a vendor request. [`build_sender`] wires
//! a parsed account file into a ready [`Sender`].

pub mod dingtalk;
pub mod email_api;
pub mod lark;
pub mod serverchan;
pub mod sms;
pub mod smtp;
pub mod telegram;
pub mod webhook;
pub mod wecomapp;
pub mod wecombot;

mod signing;

use crate::config::{AccountRecord, RootConfig, SenderConfig};
use crate::errors::SenderResult;
use crate::provider::{Provider, ProviderConfig};
use crate::sender::Sender;
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::types::ProviderType;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct Accounts {
    webhook: Vec<webhook::WebhookAccount>,
    sms: Vec<sms::SmsAccount>,
    email_api: Vec<email_api::EmailApiAccount>,
    smtp: Vec<smtp::SmtpAccount>,
    dingtalk: Vec<dingtalk::DingTalkAccount>,
    lark: Vec<lark::LarkAccount>,
    wecombot: Vec<wecombot::WeComBotAccount>,
    wecomapp: Vec<wecomapp::WeComAppAccount>,
    telegram: Vec<telegram::TelegramAccount>,
    serverchan: Vec<serverchan::ServerChanAccount>,
}

impl Accounts {
    fn group(records: &[AccountRecord]) -> Self {
        let mut accounts = Self::default();
        for record in records.iter().cloned() {
            match record {
                AccountRecord::Webhook(a) => accounts.webhook.push(a),
                AccountRecord::Sms(a) => accounts.sms.push(a),
                AccountRecord::EmailApi(a) => accounts.email_api.push(a),
                AccountRecord::Smtp(a) => accounts.smtp.push(a),
                AccountRecord::DingTalk(a) => accounts.dingtalk.push(a),
                AccountRecord::Lark(a) => accounts.lark.push(a),
                AccountRecord::WeComBot(a) => accounts.wecombot.push(a),
                AccountRecord::WeComApp(a) => accounts.wecomapp.push(a),
                AccountRecord::Telegram(a) => accounts.telegram.push(a),
                AccountRecord::ServerChan(a) => accounts.serverchan.push(a),
            }
        }
        accounts
    }
}

/// Provider config for one family, or `None` when it has no accounts or is
/// disabled in the account file
fn family<A>(root: &RootConfig, provider_type: ProviderType, items: Vec<A>) -> Option<ProviderConfig<A>> {
    if items.is_empty() {
        return None;
    }
    let meta = root.meta(&provider_type);
    if meta.disabled {
        info!(provider = %provider_type, "Provider disabled in configuration");
        return None;
    }
    Some(ProviderConfig::new(items).with_strategy(meta.strategy))
}

/// Build one provider per family present in the account file
pub fn build_providers(
    root: &RootConfig,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<Vec<Arc<dyn Provider>>> {
    let accounts = Accounts::group(&root.accounts);
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(c) = family(root, ProviderType::WEBHOOK, accounts.webhook) {
        providers.push(Arc::new(webhook::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::SMS, accounts.sms) {
        providers.push(Arc::new(sms::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::EMAIL_API, accounts.email_api) {
        providers.push(Arc::new(email_api::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::SMTP, accounts.smtp) {
        providers.push(smtp_provider(c)?);
    }
    if let Some(c) = family(root, ProviderType::DINGTALK, accounts.dingtalk) {
        providers.push(Arc::new(dingtalk::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::LARK, accounts.lark) {
        providers.push(Arc::new(lark::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::WECOM_BOT, accounts.wecombot) {
        providers.push(Arc::new(wecombot::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::WECOM_APP, accounts.wecomapp) {
        providers.push(Arc::new(wecomapp::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::TELEGRAM, accounts.telegram) {
        providers.push(Arc::new(telegram::provider(c, transport.clone())?));
    }
    if let Some(c) = family(root, ProviderType::SERVERCHAN, accounts.serverchan) {
        providers.push(Arc::new(serverchan::provider(c, transport)?));
    }
    Ok(providers)
}

#[cfg(feature = "smtp")]
fn smtp_provider(config: ProviderConfig<smtp::SmtpAccount>) -> SenderResult<Arc<dyn Provider>> {
    Ok(Arc::new(smtp::SmtpProvider::new(config)?))
}

#[cfg(not(feature = "smtp"))]
fn smtp_provider(_config: ProviderConfig<smtp::SmtpAccount>) -> SenderResult<Arc<dyn Provider>> {
    Err(crate::errors::ConfigurationError::InvalidValue {
        field: "smtp".to_string(),
        message: "built without the `smtp` feature".to_string(),
    }
    .into())
}

/// Build a sender from settings and an account file.
///
/// Empty credentials are filled from `GO_SENDER_<PROVIDER>_*` variables
/// before accounts are validated. Must be called inside a tokio runtime
/// when the settings enable the queue.
pub fn build_sender(root: &RootConfig, config: &SenderConfig) -> SenderResult<Sender> {
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::with_user_agent(
        config.timeout,
        &config.user_agent,
    )?);
    build_sender_with_transport(root, config, transport)
}

/// [`build_sender`] over a caller-supplied HTTP client shared by the sender
/// and every provider
pub fn build_sender_with_transport(
    root: &RootConfig,
    config: &SenderConfig,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<Sender> {
    let mut root = root.clone();
    root.apply_env();
    root.validate()?;

    let sender = Sender::with_config_and_transport(config, transport.clone())?;
    for provider in build_providers(&root, transport)? {
        sender.register_provider(provider, None)?;
    }
    Ok(sender)
}
