//! Message-to-request transformers.
//!
//! A transformer turns one message plus one account into a vendor HTTP
//! request. Transformers are pure; anything that needs I/O before the
//! request goes out (fetching an access token) happens in
//! [`Transformer::authorize`].

use crate::context::SendContext;
use crate::errors::{SenderError, SenderResult};
use crate::response::ResponseHandlerConfig;
use crate::transport::{BodyType, FileUpload, HttpTransport, RequestOptions};
use crate::types::{Message, ProviderType, Selectable};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Subtype key matching any message subtype
pub const WILDCARD: &str = "*";

/// A vendor-ready HTTP request description
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    /// Method
    pub method: Method,
    /// URL, possibly with query already set
    pub url: String,
    /// Headers
    pub headers: HeaderMap,
    /// Extra query parameters
    pub query_params: Vec<(String, String)>,
    /// Encoded body
    pub body: Bytes,
    /// Body encoding
    pub body_type: BodyType,
    /// Multipart text fields
    pub form_fields: Vec<(String, String)>,
    /// Multipart files
    pub files: Vec<FileUpload>,
    /// Per-request timeout
    pub timeout: Option<Duration>,
}

impl HttpRequestSpec {
    /// Create a spec with no body
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query_params: Vec::new(),
            body: Bytes::new(),
            body_type: BodyType::None,
            form_fields: Vec::new(),
            files: Vec::new(),
            timeout: None,
        }
    }

    /// POST a JSON document
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> SenderResult<Self> {
        let encoded = serde_json::to_vec(body)
            .map_err(|e| SenderError::transform(format!("failed to encode body: {}", e)))?;
        Ok(Self::new(Method::POST, url).with_body(BodyType::Json, encoded))
    }

    /// POST urlencoded fields
    pub fn post_form(url: impl Into<String>, fields: &[(String, String)]) -> Self {
        Self::new(Method::POST, url)
            .with_body(BodyType::Form, crate::transport::encode_form(fields))
    }

    /// Set the body and its type
    pub fn with_body(mut self, body_type: BodyType, body: impl Into<Bytes>) -> Self {
        self.body_type = body_type;
        self.body = body.into();
        self
    }

    /// Add a header, failing on invalid values
    pub fn header(mut self, name: &'static str, value: &str) -> SenderResult<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            SenderError::transform(format!("invalid header {}: {}", name, e))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Add a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    /// Convert into transport options
    pub fn into_options(self) -> RequestOptions {
        let mut options = RequestOptions::new().method(self.method);
        options.headers = self.headers;
        options.query = self.query_params;
        options.timeout = self.timeout;

        match self.body_type {
            BodyType::None => {}
            BodyType::Multipart => {
                options.form = self.form_fields;
                options.uploads = self.files;
            }
            other => {
                if let Some(ct) = other.content_type() {
                    if !options.headers.contains_key(CONTENT_TYPE) {
                        options
                            .headers
                            .insert(CONTENT_TYPE, HeaderValue::from_static(ct));
                    }
                }
                options.raw = Some(self.body);
            }
        }
        options
    }
}

/// Custom response check returned alongside a request
pub type ResponseHandler = Arc<dyn Fn(u16, &HeaderMap, &[u8]) -> SenderResult<()> + Send + Sync>;

/// Result of a transform
pub struct TransformOutput {
    /// The request to send
    pub spec: HttpRequestSpec,
    /// Overrides the transformer's default response configuration
    pub handler: Option<ResponseHandler>,
}

impl TransformOutput {
    /// Output with the default response handling
    pub fn new(spec: HttpRequestSpec) -> Self {
        Self {
            spec,
            handler: None,
        }
    }
}

impl fmt::Debug for TransformOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformOutput")
            .field("spec", &self.spec)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Turns messages into vendor requests for one account type
#[async_trait]
pub trait Transformer<A: Selectable>: Send + Sync {
    /// Provider family served
    fn provider_type(&self) -> ProviderType;

    /// Subtype served, or [`WILDCARD`]
    fn sub_type(&self) -> &str {
        WILDCARD
    }

    /// Whether this transformer handles the message
    fn can_transform(&self, msg: &dyn Message) -> bool {
        msg.provider_type() == self.provider_type()
            && (self.sub_type() == WILDCARD || msg.sub_type() == Some(self.sub_type()))
    }

    /// Build the request
    async fn transform(
        &self,
        ctx: &SendContext,
        msg: &dyn Message,
        account: &A,
    ) -> SenderResult<TransformOutput>;

    /// Default response interpretation
    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::status_only()
    }

    /// Vendor codes meaning the credential is no longer valid
    fn auth_error_codes(&self) -> &[&'static str] {
        &[]
    }

    /// Attach credentials that require I/O (e.g. access tokens)
    async fn authorize(
        &self,
        _ctx: &SendContext,
        _account: &A,
        _spec: &mut HttpRequestSpec,
        _transport: &Arc<dyn HttpTransport>,
    ) -> SenderResult<()> {
        Ok(())
    }

    /// Called after an auth error so cached credentials can be dropped
    async fn on_auth_error(&self, _account: &A) {}
}

/// Transformers keyed by subtype, with [`WILDCARD`] as fallback
pub struct TransformerRegistry<A: Selectable> {
    transformers: RwLock<HashMap<String, Arc<dyn Transformer<A>>>>,
}

impl<A: Selectable> TransformerRegistry<A> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            transformers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a transformer under its subtype; replaces any previous one
    pub fn register(&self, transformer: Arc<dyn Transformer<A>>) {
        let key = transformer.sub_type().to_string();
        self.transformers.write().insert(key, transformer);
    }

    /// Builder-style register
    pub fn with(self, transformer: Arc<dyn Transformer<A>>) -> Self {
        self.register(transformer);
        self
    }

    /// Exact subtype match, then wildcard
    pub fn get(&self, sub_type: Option<&str>) -> Option<Arc<dyn Transformer<A>>> {
        let transformers = self.transformers.read();
        sub_type
            .and_then(|s| transformers.get(s))
            .or_else(|| transformers.get(WILDCARD))
            .cloned()
    }

    /// Find a transformer able to handle the message
    pub fn resolve(&self, msg: &dyn Message) -> SenderResult<Arc<dyn Transformer<A>>> {
        self.get(msg.sub_type())
            .filter(|t| t.can_transform(msg))
            .ok_or_else(|| {
                SenderError::transform(format!(
                    "no transformer for {} message (subtype {})",
                    msg.provider_type(),
                    msg.sub_type().unwrap_or(WILDCARD)
                ))
            })
    }

    /// Number of registered transformers
    pub fn len(&self) -> usize {
        self.transformers.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Selectable> Default for TransformerRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Selectable> fmt::Debug for TransformerRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.transformers.read().keys().cloned().collect();
        f.debug_struct("TransformerRegistry")
            .field("sub_types", &keys)
            .finish()
    }
}
