//! Configuration management for the sender.
//!
//! Supports configuration via:
//! - Explicit values
//! - Environment variables (`GO_SENDER_*`, optionally from a `.env` file)
//! - Builder pattern
//! - A JSON account file ([`RootConfig`])

use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::observability::LogLevel;
use crate::providers::{
    dingtalk::DingTalkAccount, email_api::EmailApiAccount, lark::LarkAccount,
    serverchan::ServerChanAccount, sms::SmsAccount, smtp::SmtpAccount,
    telegram::TelegramAccount, webhook::WebhookAccount, wecomapp::WeComAppAccount,
    wecombot::WeComBotAccount,
};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryPolicy};
use crate::strategy::StrategyKind;
use crate::types::{BaseAccount, ProviderType};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable read by this crate
pub const ENV_PREFIX: &str = "GO_SENDER";

/// Sender-wide settings
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Default request timeout
    pub timeout: Duration,
    /// User agent for requests that set none
    pub user_agent: String,
    /// Log level
    pub log_level: LogLevel,
    /// Queue capacity; `None` runs async sends as detached tasks
    pub queue_capacity: Option<usize>,
    /// Number of queue workers
    pub workers: usize,
    /// Sender-wide rate limit
    pub rate_limit: Option<RateLimiterConfig>,
    /// Sender-wide retry policy
    pub retry: Option<RetryPolicy>,
    /// Per-provider circuit breaker settings
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS),
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            log_level: LogLevel::default(),
            queue_capacity: None,
            workers: crate::DEFAULT_WORKERS,
            rate_limit: None,
            retry: None,
            circuit_breaker: None,
        }
    }
}

impl SenderConfig {
    /// Create a new configuration builder
    pub fn builder() -> SenderConfigBuilder {
        SenderConfigBuilder::new()
    }

    /// Create configuration from the process environment.
    ///
    /// Loads `.env` first when present. Reads:
    /// - `GO_SENDER_TIMEOUT` - request timeout in seconds
    /// - `GO_SENDER_USER_AGENT`
    /// - `GO_SENDER_LOG_LEVEL`
    /// - `GO_SENDER_QUEUE_SIZE` - enables the async queue
    /// - `GO_SENDER_WORKERS`
    /// - `GO_SENDER_RATE_LIMIT` / `GO_SENDER_RATE_BURST`
    /// - `GO_SENDER_MAX_RETRIES`
    /// - `GO_SENDER_CB_THRESHOLD` / `GO_SENDER_CB_COOLDOWN`
    pub fn from_env() -> SenderResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from the environment, falling back to the
    /// account file's `log_level` when `GO_SENDER_LOG_LEVEL` is unset
    pub fn from_env_with_root(root: &RootConfig) -> SenderResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup_with_root(|key| std::env::var(key).ok(), root)
    }

    /// [`SenderConfig::from_lookup`] with the account file's `log_level` as fallback
    pub fn from_lookup_with_root<F>(lookup: F, root: &RootConfig) -> SenderResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let level_from_env = lookup(&env_key(&["LOG_LEVEL"])).is_some();
        let mut config = Self::from_lookup(lookup)?;
        if let (false, Some(level)) = (level_from_env, root.log_level) {
            config.log_level = level;
        }
        Ok(config)
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> SenderResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&env_key(&[name]));
        let mut builder = SenderConfigBuilder::new();

        if let Some(secs) = get("TIMEOUT") {
            builder = builder.timeout(Duration::from_secs(parse_env("TIMEOUT", &secs)?));
        }
        if let Some(ua) = get("USER_AGENT") {
            builder = builder.user_agent(ua);
        }
        if let Some(level) = get("LOG_LEVEL") {
            builder = builder.log_level(parse_env("LOG_LEVEL", &level)?);
        }
        if let Some(size) = get("QUEUE_SIZE") {
            builder = builder.queue(parse_env("QUEUE_SIZE", &size)?);
        }
        if let Some(workers) = get("WORKERS") {
            builder = builder.workers(parse_env("WORKERS", &workers)?);
        }
        if let Some(rate) = get("RATE_LIMIT") {
            let burst = match get("RATE_BURST") {
                Some(b) => parse_env("RATE_BURST", &b)?,
                None => 1,
            };
            builder = builder.rate_limit(RateLimiterConfig::new(parse_env("RATE_LIMIT", &rate)?, burst));
        }
        if let Some(retries) = get("MAX_RETRIES") {
            builder = builder.retry(RetryPolicy::new().max_attempts(parse_env("MAX_RETRIES", &retries)?));
        }
        if let Some(threshold) = get("CB_THRESHOLD") {
            let mut cb = CircuitBreakerConfig::new().threshold(parse_env("CB_THRESHOLD", &threshold)?);
            if let Some(cooldown) = get("CB_COOLDOWN") {
                cb = cb.cooldown(Duration::from_secs(parse_env("CB_COOLDOWN", &cooldown)?));
            }
            builder = builder.circuit_breaker(cb);
        }

        builder.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> SenderResult<()> {
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if let Some(rate) = &self.rate_limit {
            rate.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// Builder for SenderConfig
#[derive(Default)]
pub struct SenderConfigBuilder {
    config: SenderConfig,
}

impl SenderConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Enable the async queue with this capacity
    pub fn queue(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    /// Enable the async queue with the default capacity
    pub fn default_queue(self) -> Self {
        self.queue(DEFAULT_QUEUE_CAPACITY)
    }

    /// Set the number of queue workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the rate limit
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    /// Set circuit breaker settings
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> SenderResult<SenderConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation (for testing)
    pub fn build_unchecked(self) -> SenderConfig {
        self.config
    }
}

/// Provider-level settings in the account file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderMeta {
    /// Disable the provider
    #[serde(default)]
    pub disabled: bool,
    /// Selection strategy
    #[serde(default)]
    pub strategy: StrategyKind,
}

/// One account, tagged by provider family
#[derive(Debug, Clone)]
pub enum AccountRecord {
    /// Generic webhook endpoint
    Webhook(WebhookAccount),
    /// SMS gateway account
    Sms(SmsAccount),
    /// REST email API account
    EmailApi(EmailApiAccount),
    /// SMTP relay account
    Smtp(SmtpAccount),
    /// DingTalk robot
    DingTalk(DingTalkAccount),
    /// Lark bot
    Lark(LarkAccount),
    /// WeCom group robot
    WeComBot(WeComBotAccount),
    /// WeCom application
    WeComApp(WeComAppAccount),
    /// Telegram bot
    Telegram(TelegramAccount),
    /// ServerChan key
    ServerChan(ServerChanAccount),
}

impl AccountRecord {
    /// Parse one untyped record using its `provider` tag.
    ///
    /// Fields are not checked here so that credentials can still be filled
    /// from the environment; see [`AccountRecord::validate`].
    pub fn from_value(value: serde_json::Value) -> SenderResult<Self> {
        let tag = value
            .get("provider")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SenderError::Configuration(ConfigurationError::MissingField {
                    field: "provider".to_string(),
                })
            })?
            .to_string();

        fn typed<T: serde::de::DeserializeOwned>(
            tag: &str,
            value: serde_json::Value,
        ) -> SenderResult<T> {
            serde_json::from_value(value).map_err(|e| {
                SenderError::Configuration(ConfigurationError::Parse(format!(
                    "{} account: {}",
                    tag, e
                )))
            })
        }

        let record = match ProviderType::new(tag.clone()) {
            t if t == ProviderType::WEBHOOK => Self::Webhook(typed(&tag, value)?),
            t if t == ProviderType::SMS => Self::Sms(typed(&tag, value)?),
            t if t == ProviderType::EMAIL_API => Self::EmailApi(typed(&tag, value)?),
            t if t == ProviderType::SMTP => Self::Smtp(typed(&tag, value)?),
            t if t == ProviderType::DINGTALK => Self::DingTalk(typed(&tag, value)?),
            t if t == ProviderType::LARK => Self::Lark(typed(&tag, value)?),
            t if t == ProviderType::WECOM_BOT => Self::WeComBot(typed(&tag, value)?),
            t if t == ProviderType::WECOM_APP => Self::WeComApp(typed(&tag, value)?),
            t if t == ProviderType::TELEGRAM => Self::Telegram(typed(&tag, value)?),
            t if t == ProviderType::SERVERCHAN => Self::ServerChan(typed(&tag, value)?),
            _ => {
                return Err(SenderError::Configuration(
                    ConfigurationError::UnknownProvider(tag),
                ))
            }
        };
        Ok(record)
    }

    /// Provider family of this record
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Webhook(_) => ProviderType::WEBHOOK,
            Self::Sms(_) => ProviderType::SMS,
            Self::EmailApi(_) => ProviderType::EMAIL_API,
            Self::Smtp(_) => ProviderType::SMTP,
            Self::DingTalk(_) => ProviderType::DINGTALK,
            Self::Lark(_) => ProviderType::LARK,
            Self::WeComBot(_) => ProviderType::WECOM_BOT,
            Self::WeComApp(_) => ProviderType::WECOM_APP,
            Self::Telegram(_) => ProviderType::TELEGRAM,
            Self::ServerChan(_) => ProviderType::SERVERCHAN,
        }
    }

    /// Shared account fields
    pub fn base(&self) -> &BaseAccount {
        match self {
            Self::Webhook(a) => &a.base,
            Self::Sms(a) => &a.base,
            Self::EmailApi(a) => &a.base,
            Self::Smtp(a) => &a.base,
            Self::DingTalk(a) => &a.base,
            Self::Lark(a) => &a.base,
            Self::WeComBot(a) => &a.base,
            Self::WeComApp(a) => &a.base,
            Self::Telegram(a) => &a.base,
            Self::ServerChan(a) => &a.base,
        }
    }

    fn base_mut(&mut self) -> &mut BaseAccount {
        match self {
            Self::Webhook(a) => &mut a.base,
            Self::Sms(a) => &mut a.base,
            Self::EmailApi(a) => &mut a.base,
            Self::Smtp(a) => &mut a.base,
            Self::DingTalk(a) => &mut a.base,
            Self::Lark(a) => &mut a.base,
            Self::WeComBot(a) => &mut a.base,
            Self::WeComApp(a) => &mut a.base,
            Self::Telegram(a) => &mut a.base,
            Self::ServerChan(a) => &mut a.base,
        }
    }

    /// Check the fields the family requires
    pub fn validate(&self) -> SenderResult<()> {
        if self.base().name.trim().is_empty() {
            return Err(SenderError::Configuration(ConfigurationError::MissingField {
                field: format!("{}.name", self.provider_type()),
            }));
        }
        match self {
            Self::Webhook(a) => a.validate(),
            Self::Sms(a) => a.validate(),
            Self::EmailApi(a) => a.validate(),
            Self::Smtp(a) => a.validate(),
            Self::WeComApp(a) => a.validate(),
            Self::Telegram(a) => a.validate(),
            Self::DingTalk(_) | Self::Lark(_) | Self::WeComBot(_) | Self::ServerChan(_) => {
                require_credential(self.base(), self.provider_type())
            }
        }
    }

    /// Fill empty credentials from `GO_SENDER_<PROVIDER>_API_KEY` and friends
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = self.provider_type().as_str().to_uppercase();
        let credentials = &mut self.base_mut().credentials;
        if credentials.api_key.is_empty() {
            if let Some(key) = lookup(&env_key(&[&provider, "API_KEY"])) {
                credentials.api_key = key;
            }
        }
        if !credentials.has_secret() {
            if let Some(secret) = lookup(&env_key(&[&provider, "API_SECRET"])) {
                credentials.api_secret = SecretString::new(secret);
            }
        }
        if credentials.app_id.is_empty() {
            if let Some(app_id) = lookup(&env_key(&[&provider, "APP_ID"])) {
                credentials.app_id = app_id;
            }
        }
    }
}

#[derive(Deserialize)]
struct RawRootConfig {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    providers: HashMap<String, ProviderMeta>,
    #[serde(default)]
    accounts: Vec<serde_json::Value>,
}

/// Account file contents
#[derive(Debug, Clone, Default)]
pub struct RootConfig {
    /// Log level; `GO_SENDER_LOG_LEVEL` takes precedence when set
    pub log_level: Option<LogLevel>,
    /// Provider-level settings keyed by provider type
    pub providers: HashMap<String, ProviderMeta>,
    /// Typed accounts
    pub accounts: Vec<AccountRecord>,
}

impl RootConfig {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> SenderResult<Self> {
        let raw: RawRootConfig = serde_json::from_str(json).map_err(|e| {
            SenderError::Configuration(ConfigurationError::Parse(e.to_string()))
        })?;

        let log_level = match raw.log_level.as_deref() {
            Some(level) => Some(LogLevel::from_str(level).map_err(|_| invalid("log_level", level))?),
            None => None,
        };
        let accounts = raw
            .accounts
            .into_iter()
            .map(AccountRecord::from_value)
            .collect::<SenderResult<Vec<_>>>()?;

        Ok(Self {
            log_level,
            providers: raw.providers,
            accounts,
        })
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> SenderResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SenderError::Configuration(ConfigurationError::Parse(format!(
                "{}: {}",
                path.display(),
                e
            )))
        })?;
        Self::from_json(&json)
    }

    /// Fill missing credentials from the process environment
    pub fn apply_env(&mut self) {
        dotenvy::dotenv().ok();
        for account in &mut self.accounts {
            account.apply_env(|key| std::env::var(key).ok());
        }
    }

    /// Check every account
    pub fn validate(&self) -> SenderResult<()> {
        self.accounts.iter().try_for_each(AccountRecord::validate)
    }

    /// Settings for one provider
    pub fn meta(&self, provider_type: &ProviderType) -> ProviderMeta {
        self.providers
            .get(provider_type.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

/// Join parts under the crate prefix with `_`
pub fn env_key(parts: &[&str]) -> String {
    std::iter::once(ENV_PREFIX)
        .chain(parts.iter().copied())
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> SenderResult<T> {
    value.trim().parse().map_err(|_| {
        SenderError::Configuration(ConfigurationError::EnvVar(format!(
            "{}: invalid value {:?}",
            env_key(&[name]),
            value
        )))
    })
}

fn invalid(field: &str, message: &str) -> SenderError {
    SenderError::Configuration(ConfigurationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    })
}

pub(crate) fn require_credential(base: &BaseAccount, provider: ProviderType) -> SenderResult<()> {
    if base.credentials.api_key.trim().is_empty() {
        return Err(SenderError::Configuration(ConfigurationError::MissingField {
            field: format!("{}.{}.api_key", provider, base.name),
        }));
    }
    Ok(())
}
