//! Core contracts shared by every provider family.
//!
//! Messages describe *what* to send, accounts describe *who* sends it,
//! and [`SendResult`] captures what the vendor answered.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

pub mod account;
pub mod message;
pub mod result;

pub use account::*;
pub use message::*;
pub use result::*;

/// Provider family tag (e.g. `sms`, `webhook`)
///
/// Known families are exposed as constants; any other string is accepted so
/// callers can register their own providers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderType(Cow<'static, str>);

impl ProviderType {
    /// SMS gateways
    pub const SMS: ProviderType = ProviderType(Cow::Borrowed("sms"));
    /// HTTP email APIs
    pub const EMAIL_API: ProviderType = ProviderType(Cow::Borrowed("email_api"));
    /// SMTP relays
    pub const SMTP: ProviderType = ProviderType(Cow::Borrowed("smtp"));
    /// Generic webhooks
    pub const WEBHOOK: ProviderType = ProviderType(Cow::Borrowed("webhook"));
    /// DingTalk robots
    pub const DINGTALK: ProviderType = ProviderType(Cow::Borrowed("dingtalk"));
    /// Lark / Feishu bots
    pub const LARK: ProviderType = ProviderType(Cow::Borrowed("lark"));
    /// WeCom group robots
    pub const WECOM_BOT: ProviderType = ProviderType(Cow::Borrowed("wecombot"));
    /// WeCom applications
    pub const WECOM_APP: ProviderType = ProviderType(Cow::Borrowed("wecomapp"));
    /// Telegram bots
    pub const TELEGRAM: ProviderType = ProviderType(Cow::Borrowed("telegram"));
    /// ServerChan push
    pub const SERVERCHAN: ProviderType = ProviderType(Cow::Borrowed("serverchan"));

    /// Create a custom provider type
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Get the tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProviderType {
    fn from(s: String) -> Self {
        Self(Cow::Owned(s))
    }
}

/// Generate a fresh message identifier
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
