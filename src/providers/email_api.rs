//! Transactional email over REST APIs: Resend and Mailgun.

use super::signing;
use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::ResponseHandlerConfig;
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::HttpTransport;
use crate::types::message::{require, require_any};
use crate::types::{downcast_message, new_message_id, BaseAccount, Credentials, Message, ProviderType};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;

const RESEND_ENDPOINT: &str = "https://api.resend.com";
const MAILGUN_ENDPOINT: &str = "https://api.mailgun.net";

/// Email API vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailVendor {
    /// resend.com
    Resend,
    /// mailgun.com
    Mailgun,
}

impl EmailVendor {
    /// Subtype string
    pub fn as_str(self) -> &'static str {
        match self {
            EmailVendor::Resend => "resend",
            EmailVendor::Mailgun => "mailgun",
        }
    }

    fn parse(sub_type: &str) -> Option<Self> {
        match sub_type {
            "resend" => Some(EmailVendor::Resend),
            "mailgun" => Some(EmailVendor::Mailgun),
            _ => None,
        }
    }
}

/// Email API account
#[derive(Debug, Clone, Deserialize)]
pub struct EmailApiAccount {
    /// Shared account fields; `api_key` is the API key
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Default sender address
    #[serde(default)]
    pub from: String,
    /// Sending domain (Mailgun)
    #[serde(default)]
    pub domain: Option<String>,
    /// Overrides the API base URL
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(EmailApiAccount);

impl EmailApiAccount {
    /// Account for a vendor
    pub fn new(
        name: impl Into<String>,
        vendor: EmailVendor,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            base: BaseAccount::new(name)
                .with_sub_type(vendor.as_str())
                .with_credentials(Credentials::new(api_key, "")),
            from: from.into(),
            domain: None,
            endpoint: None,
        }
    }

    /// Set the sending domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Use another API base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Vendor named by the subtype
    pub fn vendor(&self) -> Option<EmailVendor> {
        self.base.sub_type.as_deref().and_then(EmailVendor::parse)
    }

    /// Key and sender are always required; Mailgun also needs a domain
    pub fn validate(&self) -> SenderResult<()> {
        let missing = |field: &str| {
            SenderError::Configuration(ConfigurationError::MissingField {
                field: format!("email_api.{}.{}", self.base.name, field),
            })
        };
        let vendor = self.vendor().ok_or_else(|| {
            SenderError::Configuration(ConfigurationError::InvalidValue {
                field: format!("email_api.{}.sub_type", self.base.name),
                message: "expected resend or mailgun".to_string(),
            })
        })?;
        if self.base.credentials.api_key.trim().is_empty() {
            return Err(missing("api_key"));
        }
        if self.from.trim().is_empty() {
            return Err(missing("from"));
        }
        if vendor == EmailVendor::Mailgun && self.domain.as_deref().unwrap_or("").is_empty() {
            return Err(missing("domain"));
        }
        Ok(())
    }

    fn base_url(&self, default: &str) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

/// Email message for REST APIs
#[derive(Debug, Clone)]
pub struct EmailMessage {
    id: String,
    /// Target vendor
    pub vendor: EmailVendor,
    /// Overrides the account sender
    pub from: Option<String>,
    /// Recipients
    pub to: Vec<String>,
    /// Carbon copies
    pub cc: Vec<String>,
    /// Blind carbon copies
    pub bcc: Vec<String>,
    /// Subject
    pub subject: String,
    /// Plain-text body
    pub text: Option<String>,
    /// HTML body
    pub html: Option<String>,
    /// Reply-To address
    pub reply_to: Option<String>,
}

impl EmailMessage {
    /// Message with a subject for a vendor
    pub fn new(vendor: EmailVendor, subject: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            vendor,
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            text: None,
            html: None,
            reply_to: None,
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

    /// Set Reply-To
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    fn sender<'a>(&'a self, account: &'a EmailApiAccount) -> &'a str {
        self.from.as_deref().unwrap_or(&account.from)
    }
}

impl Message for EmailMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::EMAIL_API
    }

    fn sub_type(&self) -> Option<&str> {
        Some(self.vendor.as_str())
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

/// Resend `POST /emails`
#[derive(Debug, Default)]
pub struct ResendTransformer;

#[async_trait]
impl Transformer<EmailApiAccount> for ResendTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::EMAIL_API
    }

    fn sub_type(&self) -> &str {
        EmailVendor::Resend.as_str()
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &EmailApiAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<EmailMessage>(msg)?;
        let mut body = json!({
            "from": msg.sender(account),
            "to": msg.to,
            "subject": msg.subject,
        });
        if !msg.cc.is_empty() {
            body["cc"] = json!(msg.cc);
        }
        if !msg.bcc.is_empty() {
            body["bcc"] = json!(msg.bcc);
        }
        if let Some(text) = &msg.text {
            body["text"] = Value::String(text.clone());
        }
        if let Some(html) = &msg.html {
            body["html"] = Value::String(html.clone());
        }
        if let Some(reply_to) = &msg.reply_to {
            body["reply_to"] = Value::String(reply_to.clone());
        }

        let url = format!("{}/emails", account.base_url(RESEND_ENDPOINT));
        let bearer = format!("Bearer {}", account.base.credentials.api_key);
        let spec = HttpRequestSpec::post_json(url, &body)?.header("authorization", &bearer)?;
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_exists("id").with_error_paths("name", "message")
    }
}

/// Mailgun `POST /v3/{domain}/messages`
#[derive(Debug, Default)]
pub struct MailgunTransformer;

#[async_trait]
impl Transformer<EmailApiAccount> for MailgunTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::EMAIL_API
    }

    fn sub_type(&self) -> &str {
        EmailVendor::Mailgun.as_str()
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &EmailApiAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<EmailMessage>(msg)?;
        let domain = account
            .domain
            .as_deref()
            .ok_or_else(|| SenderError::transform("mailgun account has no domain"))?;

        let mut fields = vec![("from".to_string(), msg.sender(account).to_string())];
        fields.extend(msg.to.iter().map(|a| ("to".to_string(), a.clone())));
        fields.extend(msg.cc.iter().map(|a| ("cc".to_string(), a.clone())));
        fields.extend(msg.bcc.iter().map(|a| ("bcc".to_string(), a.clone())));
        fields.push(("subject".to_string(), msg.subject.clone()));
        if let Some(text) = &msg.text {
            fields.push(("text".to_string(), text.clone()));
        }
        if let Some(html) = &msg.html {
            fields.push(("html".to_string(), html.clone()));
        }
        if let Some(reply_to) = &msg.reply_to {
            fields.push(("h:Reply-To".to_string(), reply_to.clone()));
        }

        let url = format!("{}/v3/{}/messages", account.base_url(MAILGUN_ENDPOINT), domain);
        let basic = format!(
            "Basic {}",
            signing::base64(format!("api:{}", account.base.credentials.api_key).as_bytes())
        );
        let spec = HttpRequestSpec::post_form(url, &fields).header("authorization", &basic)?;
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_exists("id").with_error_paths("", "message")
    }
}

/// Transformers for every email API vendor
pub fn transformers() -> TransformerRegistry<EmailApiAccount> {
    TransformerRegistry::new()
        .with(Arc::new(ResendTransformer))
        .with(Arc::new(MailgunTransformer))
}

/// Build an email API provider
pub fn provider(
    config: ProviderConfig<EmailApiAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<EmailApiAccount>> {
    for account in &config.items {
        account.validate()?;
    }
    HttpProvider::new(ProviderType::EMAIL_API, config, Arc::new(transformers()), transport)
}
