//! WeCom application messages.
//!
//! Accounts carry the corp id in `api_key`, the application secret in
//! `api_secret` and the agent id in `app_id`. Requests need an
//! `access_token` fetched from `gettoken`; tokens are cached per corp and
//! agent and dropped when WeCom reports them invalid or expired.

use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::{interpret, ResponseHandlerConfig};
use crate::token::{cache_key, FetchedToken, MemoryTokenCache, TokenCache, TokenRefresher};
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::{self, HttpTransport, RequestOptions};
use crate::types::message::require;
use crate::types::{downcast_message, new_message_id, BaseAccount, Credentials, Message, ProviderType};
use async_trait::async_trait;
use http::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DEFAULT_ENDPOINT: &str = "https://qyapi.weixin.qq.com";

/// Codes meaning the access token must be refetched
pub const AUTH_ERROR_CODES: &[&str] = &["40014", "42001", "40001"];

/// WeCom application account
#[derive(Debug, Clone, Deserialize)]
pub struct WeComAppAccount {
    /// Shared account fields
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Overrides the API base URL
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(WeComAppAccount);

impl WeComAppAccount {
    /// Application account
    pub fn new(
        name: impl Into<String>,
        corp_id: impl Into<String>,
        secret: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            base: BaseAccount::new(name)
                .with_credentials(Credentials::new(corp_id, secret).with_app_id(agent_id)),
            endpoint: None,
        }
    }

    /// Use another API base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Corp id, secret and a numeric agent id are required
    pub fn validate(&self) -> SenderResult<()> {
        let credentials = &self.base.credentials;
        let missing = |field: &str| {
            SenderError::Configuration(ConfigurationError::MissingField {
                field: format!("wecomapp.{}.{}", self.base.name, field),
            })
        };
        if credentials.api_key.trim().is_empty() {
            return Err(missing("api_key"));
        }
        if !credentials.has_secret() {
            return Err(missing("api_secret"));
        }
        self.agent_id()?;
        Ok(())
    }

    fn agent_id(&self) -> SenderResult<i64> {
        self.base.credentials.app_id.trim().parse().map_err(|_| {
            SenderError::Configuration(ConfigurationError::InvalidValue {
                field: format!("wecomapp.{}.app_id", self.base.name),
                message: "agent id must be numeric".to_string(),
            })
        })
    }

    fn base_url(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
    }

    fn token_key(&self) -> String {
        cache_key(
            ProviderType::WECOM_APP.as_str(),
            &self.base.credentials.api_key,
            &self.base.credentials.app_id,
        )
    }
}

/// Application message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeComAppKind {
    /// Plain text
    Text,
    /// Markdown
    Markdown,
}

/// WeCom application message
#[derive(Debug, Clone)]
pub struct WeComAppMessage {
    id: String,
    /// Message kind
    pub kind: WeComAppKind,
    /// Content
    pub content: String,
    /// Recipient user ids; everyone when all recipient lists are empty
    pub to_users: Vec<String>,
    /// Recipient department ids
    pub to_parties: Vec<String>,
    /// Recipient tag ids
    pub to_tags: Vec<String>,
    /// Mark as confidential
    pub safe: bool,
}

impl WeComAppMessage {
    /// Text message to everyone
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            kind: WeComAppKind::Text,
            content: content.into(),
            to_users: Vec::new(),
            to_parties: Vec::new(),
            to_tags: Vec::new(),
            safe: false,
        }
    }

    /// Markdown message to everyone
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            kind: WeComAppKind::Markdown,
            ..Self::text(content)
        }
    }

    /// Add a recipient user
    pub fn to_user(mut self, user: impl Into<String>) -> Self {
        self.to_users.push(user.into());
        self
    }

    /// Add a recipient department
    pub fn to_party(mut self, party: impl Into<String>) -> Self {
        self.to_parties.push(party.into());
        self
    }

    /// Add a recipient tag
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tags.push(tag.into());
        self
    }

    /// Mark as confidential
    pub fn safe(mut self) -> Self {
        self.safe = true;
        self
    }

    fn body(&self, agent_id: i64) -> Value {
        let everyone = self.to_users.is_empty() && self.to_parties.is_empty() && self.to_tags.is_empty();
        let touser = if everyone {
            "@all".to_string()
        } else {
            self.to_users.join("|")
        };
        let (msgtype, payload) = match self.kind {
            WeComAppKind::Text => ("text", json!({ "content": self.content })),
            WeComAppKind::Markdown => ("markdown", json!({ "content": self.content })),
        };

        let mut body = json!({
            "touser": touser,
            "toparty": self.to_parties.join("|"),
            "totag": self.to_tags.join("|"),
            "msgtype": msgtype,
            "agentid": agent_id,
            "safe": i32::from(self.safe),
        });
        body[msgtype] = payload;
        body
    }
}

impl Message for WeComAppMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WECOM_APP
    }

    fn validate(&self) -> SenderResult<()> {
        require(&self.content, "content")
    }

    fn msg_id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    7200
}

fn wecom_response() -> ResponseHandlerConfig {
    ResponseHandlerConfig::json_eq("errcode", "0").with_error_paths("errcode", "errmsg")
}

async fn fetch_token(
    ctx: &SendContext,
    url: String,
    corp_id: String,
    secret: String,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<FetchedToken> {
    let options = RequestOptions::new()
        .method(Method::GET)
        .query("corpid", corp_id)
        .query("corpsecret", secret);
    let response = transport::send(ctx, &url, options, &transport).await?;
    interpret(&wecom_response(), response.status, &response.headers, &response.body)?;

    let parsed: TokenResponse =
        serde_json::from_slice(&response.body).map_err(|e| SenderError::MalformedResponse {
            message: format!("invalid gettoken response: {}", e),
        })?;
    Ok(FetchedToken {
        token: parsed.access_token,
        expires_in: Duration::from_secs(parsed.expires_in),
    })
}

/// Builds application message requests and manages access tokens
#[derive(Debug)]
pub struct WeComAppTransformer {
    tokens: Arc<TokenRefresher>,
}

impl WeComAppTransformer {
    /// Transformer caching tokens in `cache`
    pub fn new(cache: Arc<dyn TokenCache>) -> Self {
        Self {
            tokens: Arc::new(TokenRefresher::new(cache)),
        }
    }

    /// Token refresher
    pub fn tokens(&self) -> &Arc<TokenRefresher> {
        &self.tokens
    }
}

#[async_trait]
impl Transformer<WeComAppAccount> for WeComAppTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WECOM_APP
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &WeComAppAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<WeComAppMessage>(msg)?;
        let agent_id = account.agent_id().map_err(|e| SenderError::transform(e.to_string()))?;
        let url = format!("{}/cgi-bin/message/send", account.base_url());
        Ok(TransformOutput::new(HttpRequestSpec::post_json(url, &msg.body(agent_id))?))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        wecom_response()
    }

    fn auth_error_codes(&self) -> &[&'static str] {
        AUTH_ERROR_CODES
    }

    async fn authorize(
        &self,
        ctx: &SendContext,
        account: &WeComAppAccount,
        spec: &mut HttpRequestSpec,
        transport: &Arc<dyn HttpTransport>,
    ) -> SenderResult<()> {
        let url = format!("{}/cgi-bin/gettoken", account.base_url());
        let corp_id = account.base.credentials.api_key.clone();
        let secret = account.base.credentials.secret().to_string();
        let transport = transport.clone();

        let token = self
            .tokens
            .get_or_refresh(&account.token_key(), move || {
                fetch_token(ctx, url, corp_id, secret, transport)
            })
            .await?;
        spec.query_params
            .push(("access_token".to_string(), token));
        Ok(())
    }

    async fn on_auth_error(&self, account: &WeComAppAccount) {
        if let Err(e) = self.tokens.invalidate(&account.token_key()).await {
            warn!(account = %account.base.name, error = %e, "Failed to drop access token");
        }
    }
}

/// Transformers for application messages sharing one token cache
pub fn transformers(cache: Arc<dyn TokenCache>) -> TransformerRegistry<WeComAppAccount> {
    TransformerRegistry::new().with(Arc::new(WeComAppTransformer::new(cache)))
}

/// Build a provider with an in-memory token cache
pub fn provider(
    config: ProviderConfig<WeComAppAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<WeComAppAccount>> {
    provider_with_cache(config, transport, Arc::new(MemoryTokenCache::new()))
}

/// Build a provider over a caller-supplied token cache
pub fn provider_with_cache(
    config: ProviderConfig<WeComAppAccount>,
    transport: Arc<dyn HttpTransport>,
    cache: Arc<dyn TokenCache>,
) -> SenderResult<HttpProvider<WeComAppAccount>> {
    for account in &config.items {
        account.validate()?;
    }
    HttpProvider::new(
        ProviderType::WECOM_APP,
        config,
        Arc::new(transformers(cache)),
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

    fn account() -> WeComAppAccount {
        WeComAppAccount::new("app", "corp1", "s3cret", "1000002")
            .with_endpoint("https://wecom.example.com")
    }

    #[tokio::test]
    async fn test_token_fetched_once_and_attached() {
        let (mock, transport) = MockTransport::new()
            .add_response(MockResponse::ok(
                r#"{"errcode":0,"access_token":"T1","expires_in":7200}"#,
            ))
            .add_response(MockResponse::ok(r#"{"errcode":0,"errmsg":"ok"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":0,"errmsg":"ok"}"#))
            .shared();
        let provider = provider(ProviderConfig::new(vec![account()]), transport).unwrap();

        for _ in 0..2 {
            provider
                .send(&SendContext::new(), &WeComAppMessage::text("hi"), &SendOptions::new())
                .await
                .unwrap();
        }

        let requests = mock.recorded_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].url.contains("/cgi-bin/gettoken?corpid=corp1&corpsecret=s3cret"));
        assert!(requests[1].url.ends_with("/cgi-bin/message/send?access_token=T1"));
        assert!(requests[2].url.ends_with("access_token=T1"));

        let body: Value = serde_json::from_str(&requests[1].body_text()).unwrap();
        assert_eq!(body["touser"], "@all");
        assert_eq!(body["agentid"], 1000002);
        assert_eq!(body["text"]["content"], "hi");
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_and_retried() {
        let (mock, transport) = MockTransport::new()
            .add_response(MockResponse::ok(r#"{"errcode":0,"access_token":"T1"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":42001,"errmsg":"access_token expired"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":0,"access_token":"T2"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":0,"errmsg":"ok"}"#))
            .shared();
        let provider = provider(ProviderConfig::new(vec![account()]), transport).unwrap();

        let result = provider
            .send(&SendContext::new(), &WeComAppMessage::text("hi"), &SendOptions::new())
            .await
            .unwrap();
        assert_eq!(result.status_code, 200);

        let requests = mock.recorded_requests();
        assert_eq!(requests.len(), 4);
        assert!(requests[3].url.ends_with("access_token=T2"));
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_final() {
        let (mock, transport) = MockTransport::new()
            .add_response(MockResponse::ok(r#"{"errcode":0,"access_token":"T1"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":40014,"errmsg":"invalid access_token"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":0,"access_token":"T2"}"#))
            .add_response(MockResponse::ok(r#"{"errcode":40014,"errmsg":"invalid access_token"}"#))
            .shared();
        let provider = provider(ProviderConfig::new(vec![account()]), transport).unwrap();

        let err = provider
            .send(&SendContext::new(), &WeComAppMessage::text("hi"), &SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Auth(ref api) if api.code == "40014"));
        assert!(!err.is_retryable());
        assert_eq!(mock.request_count(), 4);
    }

    #[test]
    fn test_account_validation() {
        assert!(account().validate().is_ok());
        assert!(WeComAppAccount::new("app", "corp1", "s", "abc").validate().is_err());
        assert!(WeComAppAccount::new("app", "corp1", "", "1").validate().is_err());
    }

    #[test]
    fn test_recipients() {
        let msg = WeComAppMessage::markdown("**x**").to_user("alice").to_user("bob").to_party("7");
        let body = msg.body(1);
        assert_eq!(body["touser"], "alice|bob");
        assert_eq!(body["toparty"], "7");
        assert_eq!(body["markdown"]["content"], "**x**");
    }
}
