//! Generic HTTP webhooks.
//!
//! Each account is one endpoint: URL, method, fixed headers and query, and
//! an optional response rule. The message supplies the body and may add
//! headers and query parameters of its own.

use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::{interpret, ResponseHandlerConfig};
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::{BodyType, HttpTransport};
use crate::types::{downcast_message, new_message_id, BaseAccount, Message, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use serde::Deserialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// One webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAccount {
    /// Shared account fields
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Target URL
    pub url: String,
    /// HTTP method, POST when unset
    #[serde(default)]
    pub method: Option<String>,
    /// Headers sent on every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters sent on every request
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// How to judge the response; status only when unset
    #[serde(default)]
    pub response: Option<ResponseHandlerConfig>,
}

crate::impl_selectable!(WebhookAccount);

impl WebhookAccount {
    /// Endpoint posting to `url`
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            base: BaseAccount::new(name),
            url: url.into(),
            method: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            response: None,
        }
    }

    /// Set the method
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Add a fixed header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a fixed query parameter
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Set the response rule
    pub fn with_response(mut self, response: ResponseHandlerConfig) -> Self {
        self.response = Some(response);
        self
    }

    /// Disable the endpoint
    pub fn disabled(mut self) -> Self {
        self.base.disabled = true;
        self
    }

    /// Check URL, method, headers and response rule
    pub fn validate(&self) -> SenderResult<()> {
        url::Url::parse(&self.url).map_err(|e| invalid("url", e.to_string()))?;
        self.parsed_method()?;
        for (name, value) in &self.headers {
            header_pair(name, value)?;
        }
        if let Some(response) = &self.response {
            response.validate()?;
        }
        Ok(())
    }

    fn parsed_method(&self) -> SenderResult<Option<Method>> {
        self.method
            .as_deref()
            .map(|m| Method::from_str(&m.to_ascii_uppercase()).map_err(|e| invalid("method", e.to_string())))
            .transpose()
    }
}

fn invalid(field: &str, message: String) -> SenderError {
    SenderError::Configuration(ConfigurationError::InvalidValue {
        field: format!("webhook.{}", field),
        message,
    })
}

fn header_pair(name: &str, value: &str) -> SenderResult<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| SenderError::validation(format!("invalid header name {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| SenderError::validation(format!("invalid header value for {}: {}", name, e)))?;
    Ok((name, value))
}

/// Raw webhook payload
#[derive(Debug, Clone)]
pub struct WebhookMessage {
    id: String,
    /// Request body, sent verbatim
    pub body: Bytes,
    /// Headers added on top of the endpoint's
    pub headers: Vec<(String, String)>,
    /// Query parameters added on top of the endpoint's
    pub query: Vec<(String, String)>,
    /// Overrides the endpoint's method
    pub method: Option<Method>,
}

impl WebhookMessage {
    /// Message with a raw body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: new_message_id(),
            body: body.into(),
            headers: Vec::new(),
            query: Vec::new(),
            method: None,
        }
    }

    /// Message with a JSON body and matching content type
    pub fn json(value: &serde_json::Value) -> SenderResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| SenderError::validation(format!("failed to encode body: {}", e)))?;
        Ok(Self::new(body).with_header(CONTENT_TYPE.as_str(), "application/json"))
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a query parameter
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Override the method
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }
}

impl Message for WebhookMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WEBHOOK
    }

    fn validate(&self) -> SenderResult<()> {
        for (name, value) in &self.headers {
            header_pair(name, value)?;
        }
        if self.body.is_empty() && matches!(self.method, Some(Method::POST) | Some(Method::PUT)) {
            return Err(SenderError::validation("body is required for POST and PUT"));
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

/// Builds the endpoint request from a webhook message
#[derive(Debug, Default)]
pub struct WebhookTransformer;

#[async_trait]
impl Transformer<WebhookAccount> for WebhookTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WEBHOOK
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &WebhookAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<WebhookMessage>(msg)?;
        let method = match &msg.method {
            Some(m) => m.clone(),
            None => account.parsed_method()?.unwrap_or(Method::POST),
        };

        let mut spec = HttpRequestSpec::new(method, account.url.clone());
        if !msg.body.is_empty() {
            spec = spec.with_body(BodyType::Raw, msg.body.clone());
        }

        let mut headers = HeaderMap::new();
        let pairs = account
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(msg.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for (name, value) in pairs {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }
        spec.headers = headers;

        spec.query_params = account
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(msg.query.iter().cloned())
            .collect();

        let mut output = TransformOutput::new(spec);
        if let Some(rule) = account.response.clone() {
            output.handler = Some(Arc::new(move |status, headers, body| {
                interpret(&rule, status, headers, body)
            }));
        }
        Ok(output)
    }
}

/// Transformers for webhook messages
pub fn transformers() -> TransformerRegistry<WebhookAccount> {
    TransformerRegistry::new().with(Arc::new(WebhookTransformer))
}

/// Build a webhook provider over the given endpoints
pub fn provider(
    config: ProviderConfig<WebhookAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<WebhookAccount>> {
    for account in &config.items {
        account.validate()?;
    }
    HttpProvider::new(
        ProviderType::WEBHOOK,
        config,
        Arc::new(transformers()),
        transport,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SendOptions;
    use crate::mocks::{MockResponse, MockTransport};
    use crate::provider::Provider;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_headers_merge_and_message_wins() {
        let account = WebhookAccount::new("primary", "https://hooks.example.com/in")
            .with_header("X-Env", "prod")
            .with_header("X-Trace", "account")
            .with_query("token", "t1");
        let msg = WebhookMessage::new("ping")
            .with_header("X-Trace", "message")
            .with_query("extra", "1");

        let output = WebhookTransformer
            .transform(&SendContext::new(), &msg, &account)
            .await
            .unwrap();
        let spec = output.spec;
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.headers["x-env"], "prod");
        assert_eq!(spec.headers["x-trace"], "message");
        assert_eq!(
            spec.query_params,
            vec![
                ("token".to_string(), "t1".to_string()),
                ("extra".to_string(), "1".to_string())
            ]
        );
        assert_eq!(spec.body, Bytes::from_static(b"ping"));
        assert!(output.handler.is_none());
    }

    #[tokio::test]
    async fn test_account_response_rule_is_applied() {
        let (mock, transport) = MockTransport::new()
            .add_response(MockResponse::ok(r#"{"status":"rejected"}"#))
            .shared();
        let account = WebhookAccount::new("primary", "https://hooks.example.com/in")
            .with_response(ResponseHandlerConfig::json_eq("status", "accepted"));
        let provider = provider(ProviderConfig::new(vec![account]), transport).unwrap();

        let err = provider
            .send(&SendContext::new(), &WebhookMessage::new("{}"), &SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::ProviderApi(ref api) if api.code == "rejected"));
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_method_from_account() {
        let account = WebhookAccount::new("primary", "https://hooks.example.com/in").with_method("put");
        let output = WebhookTransformer
            .transform(&SendContext::new(), &WebhookMessage::new("x"), &account)
            .await
            .unwrap();
        assert_eq!(output.spec.method, Method::PUT);
    }

    #[test]
    fn test_account_validation() {
        assert!(WebhookAccount::new("a", "not a url").validate().is_err());
        assert!(WebhookAccount::new("a", "https://x.example.com")
            .with_method("NOT A METHOD")
            .validate()
            .is_err());
        assert!(WebhookAccount::new("a", "https://x.example.com")
            .with_header("bad header", "v")
            .validate()
            .is_err());
        assert!(WebhookAccount::new("a", "https://x.example.com").validate().is_ok());
    }

    #[test]
    fn test_message_validation() {
        assert!(WebhookMessage::new("").with_method(Method::POST).validate().is_err());
        assert!(WebhookMessage::new("").with_method(Method::GET).validate().is_ok());
        assert!(WebhookMessage::json(&serde_json::json!({"x": 1})).unwrap().validate().is_ok());
    }
}
