//! Email over SMTP.
//!
//! Unlike the other families this one does not go through the HTTP
//! transformer pipeline. Account selection is shared; delivery uses a
//! `lettre` transport built once per account. `api_key` and `api_secret`
//! are the SMTP username and password.

use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::types::message::{require, require_any};
use crate::types::{new_message_id, BaseAccount, Message, ProviderType};
use serde::Deserialize;
use std::any::Any;

/// Connection security
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Upgrade a plain connection with STARTTLS (port 587)
    #[default]
    StartTls,
    /// Implicit TLS (port 465)
    Tls,
    /// No encryption; local relays only
    None,
}

/// SMTP relay account
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpAccount {
    /// Shared account fields; key and secret are username and password
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Server host
    #[serde(default)]
    pub host: String,
    /// Server port; the TLS mode's default when unset
    #[serde(default)]
    pub port: Option<u16>,
    /// Default sender address
    #[serde(default)]
    pub from: String,
    /// Connection security
    #[serde(default)]
    pub tls: SmtpTls,
}

crate::impl_selectable!(SmtpAccount);

impl SmtpAccount {
    /// Account for a relay host
    pub fn new(name: impl Into<String>, host: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name),
            host: host.into(),
            port: None,
            from: from.into(),
            tls: SmtpTls::default(),
        }
    }

    /// Authenticate with username and password
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.base.credentials = crate::types::Credentials::new(username, password);
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the connection security
    pub fn with_tls(mut self, tls: SmtpTls) -> Self {
        self.tls = tls;
        self
    }

    /// Host and sender are required
    pub fn validate(&self) -> SenderResult<()> {
        for (value, field) in [(&self.host, "host"), (&self.from, "from")] {
            if value.trim().is_empty() {
                return Err(SenderError::Configuration(ConfigurationError::MissingField {
                    field: format!("smtp.{}.{}", self.base.name, field),
                }));
            }
        }
        Ok(())
    }
}

/// Email message for SMTP delivery
#[derive(Debug, Clone)]
pub struct SmtpMessage {
    id: String,
    /// Overrides the account sender
    pub from: Option<String>,
    /// Recipients
    pub to: Vec<String>,
    /// Carbon copies
    pub cc: Vec<String>,
    /// Blind carbon copies
    pub bcc: Vec<String>,
    /// Reply-To address
    pub reply_to: Option<String>,
    /// Subject
    pub subject: String,
    /// Plain-text body
    pub text: Option<String>,
    /// HTML body
    pub html: Option<String>,
}

impl SmtpMessage {
    /// Message with a subject
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: subject.into(),
            text: None,
            html: None,
        }
    }

    /// Add a recipient
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    /// Add a carbon copy
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    /// Add a blind carbon copy
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    /// Override the sender
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    /// Set Reply-To
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Set the plain-text body
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the HTML body
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }
}

impl Message for SmtpMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SMTP
    }

    fn validate(&self) -> SenderResult<()> {
        require_any(&self.to, "recipient")?;
        require(&self.subject, "subject")?;
        if self.text.is_none() && self.html.is_none() {
            return Err(SenderError::validation("text or html body is required"));
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

#[cfg(feature = "smtp")]
pub use self::delivery::{build_email, SmtpProvider};

#[cfg(feature = "smtp")]
mod delivery {
    use super::{SmtpAccount, SmtpMessage, SmtpTls};
    use crate::context::{SendContext, SendOptions};
    use crate::errors::{SenderError, SenderResult};
    use crate::observability::ComponentHealth;
    use crate::provider::{AccountSelector, Provider, ProviderConfig};
    use crate::types::{downcast_message, Message, ProviderType, SendResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use http::HeaderMap;
    use lettre::message::header::ContentType;
    use lettre::message::{Mailbox, MultiPart, SinglePart};
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fmt;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tracing::{debug, instrument, warn};

    type Mailer = AsyncSmtpTransport<Tokio1Executor>;

    fn mailbox(address: &str, field: &str) -> SenderResult<Mailbox> {
        address
            .parse()
            .map_err(|e| SenderError::transform(format!("invalid {} address {}: {}", field, address, e)))
    }

    /// Build the MIME message for an account
    pub fn build_email(msg: &SmtpMessage, account: &SmtpAccount) -> SenderResult<lettre::Message> {
        let from = msg.from.as_deref().unwrap_or(&account.from);
        let mut builder = lettre::Message::builder()
            .from(mailbox(from, "from")?)
            .subject(msg.subject.clone());
        for address in &msg.to {
            builder = builder.to(mailbox(address, "to")?);
        }
        for address in &msg.cc {
            builder = builder.cc(mailbox(address, "cc")?);
        }
        for address in &msg.bcc {
            builder = builder.bcc(mailbox(address, "bcc")?);
        }
        if let Some(reply_to) = &msg.reply_to {
            builder = builder.reply_to(mailbox(reply_to, "reply_to")?);
        }

        let built = match (&msg.text, &msg.html) {
            (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
                text.clone(),
                html.clone(),
            )),
            (None, Some(html)) => builder.singlepart(SinglePart::html(html.clone())),
            (text, None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone().unwrap_or_default()),
        };
        built.map_err(|e| SenderError::transform(format!("failed to build email: {}", e)))
    }

    fn build_mailer(account: &SmtpAccount) -> SenderResult<Mailer> {
        let invalid_host = |e: lettre::transport::smtp::Error| {
            SenderError::Configuration(crate::errors::ConfigurationError::InvalidValue {
                field: format!("smtp.{}.host", account.base.name),
                message: e.to_string(),
            })
        };
        let mut builder = match account.tls {
            SmtpTls::StartTls => Mailer::starttls_relay(&account.host).map_err(invalid_host)?,
            SmtpTls::Tls => Mailer::relay(&account.host).map_err(invalid_host)?,
            SmtpTls::None => Mailer::builder_dangerous(&account.host),
        };
        if let Some(port) = account.port {
            builder = builder.port(port);
        }
        let credentials = &account.base.credentials;
        if !credentials.api_key.is_empty() {
            builder = builder.credentials(Credentials::new(
                credentials.api_key.clone(),
                credentials.secret().to_string(),
            ));
        }
        Ok(builder
            .timeout(Some(Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS)))
            .build())
    }

    fn map_smtp_error(e: lettre::transport::smtp::Error) -> SenderError {
        SenderError::Smtp {
            message: e.to_string(),
            permanent: e.is_permanent(),
        }
    }

    /// SMTP provider with one cached transport per account
    pub struct SmtpProvider {
        name: String,
        selector: AccountSelector<SmtpAccount>,
        mailers: Mutex<HashMap<String, Arc<Mailer>>>,
    }

    impl SmtpProvider {
        /// Validate accounts and create the provider
        pub fn new(config: ProviderConfig<SmtpAccount>) -> SenderResult<Self> {
            for account in &config.items {
                account.validate()?;
            }
            let name = ProviderType::SMTP.to_string();
            Ok(Self {
                selector: AccountSelector::new(name.clone(), config)?,
                name,
                mailers: Mutex::new(HashMap::new()),
            })
        }

        /// Account selector
        pub fn selector(&self) -> &AccountSelector<SmtpAccount> {
            &self.selector
        }

        fn mailer(&self, account: &SmtpAccount) -> SenderResult<Arc<Mailer>> {
            let mut mailers = self.mailers.lock();
            if let Some(mailer) = mailers.get(&account.base.name) {
                return Ok(mailer.clone());
            }
            let mailer = Arc::new(build_mailer(account)?);
            mailers.insert(account.base.name.clone(), mailer.clone());
            Ok(mailer)
        }
    }

    #[async_trait]
    impl Provider for SmtpProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn provider_type(&self) -> ProviderType {
            ProviderType::SMTP
        }

        #[instrument(skip(self, ctx, msg, opts), fields(provider = %self.name, msg_id = msg.msg_id()))]
        async fn send(
            &self,
            ctx: &SendContext,
            msg: &dyn Message,
            opts: &SendOptions,
        ) -> SenderResult<SendResult> {
            let email_msg = downcast_message::<SmtpMessage>(msg)?;
            let account = self.selector.select(ctx, msg)?;
            let email = build_email(email_msg, &account)?;
            let mailer = self.mailer(&account)?;

            let start = Instant::now();
            let result = ctx
                .run(async { mailer.send(email).await.map_err(map_smtp_error) })
                .await;
            let duration = start.elapsed();

            let result = result.map(|response| {
                let code: u16 = response.code().to_string().parse().unwrap_or(250);
                let text = response
                    .message()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");
                debug!(provider = %self.name, account = %account.base.name, code, "SMTP server accepted message");
                SendResult {
                    success: true,
                    message_id: msg.msg_id().to_string(),
                    provider: self.name.clone(),
                    account_name: account.base.name.clone(),
                    status_code: code,
                    body: Bytes::from(text),
                    headers: HeaderMap::new(),
                    metadata: opts.metadata.clone(),
                    timestamp: Utc::now(),
                    duration,
                }
            });

            match &result {
                Err(SenderError::Smtp { permanent: false, .. }) => {
                    warn!(provider = %self.name, account = %account.base.name, "SMTP delivery failed");
                    self.selector
                        .health()
                        .mark(&account.base.name, crate::observability::HealthStatus::Unhealthy);
                }
                other => self.selector.observe(&account.base.name, other),
            }
            result
        }

        async fn health_check(&self, _ctx: &SendContext) -> Option<ComponentHealth> {
            Some(self.selector.health_report())
        }

        async fn close(&self) -> SenderResult<()> {
            self.mailers.lock().clear();
            Ok(())
        }
    }

    impl fmt::Debug for SmtpProvider {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("SmtpProvider")
                .field("name", &self.name)
                .field("accounts", &self.selector.accounts().len())
                .finish()
        }
    }
}
