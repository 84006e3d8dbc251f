//! HTTP transport layer.
//!
//! [`RequestOptions`] describes a request the way callers think about it
//! (query, JSON, form, files). [`RequestOptions::into_request`] resolves
//! that into a concrete [`HttpRequest`] which an [`HttpTransport`] executes.
//! Non-2xx/3xx statuses are not errors at this layer; the body is always
//! read in full and judged later by the response handler.

use crate::context::SendContext;
use crate::errors::{ConfigurationError, NetworkError, SenderError, SenderResult};
use crate::{DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

/// Content type of a request or response body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    /// No body
    #[default]
    None,
    /// `application/json`
    Json,
    /// `application/x-www-form-urlencoded`
    Form,
    /// `multipart/form-data`
    Multipart,
    /// Opaque bytes
    Raw,
    /// `application/xml`
    Xml,
    /// `text/plain`
    Text,
}

impl BodyType {
    /// Default content type header value
    pub fn content_type(self) -> Option<&'static str> {
        match self {
            BodyType::Json => Some("application/json"),
            BodyType::Form => Some("application/x-www-form-urlencoded"),
            BodyType::Xml => Some("application/xml"),
            BodyType::Text => Some("text/plain; charset=utf-8"),
            BodyType::Raw => Some("application/octet-stream"),
            BodyType::Multipart | BodyType::None => None,
        }
    }
}

/// File upload data
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// Form field name
    pub field_name: String,
    /// File name
    pub file_name: String,
    /// File content
    pub content: Bytes,
    /// MIME type
    pub mime_type: String,
}

impl FileUpload {
    /// Create a new file upload, guessing the MIME type from the name
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .to_string();

        Self {
            field_name: field_name.into(),
            file_name,
            content: content.into(),
            mime_type,
        }
    }

    /// Read a file from disk; an unreadable file is a validation error
    pub async fn from_path(field_name: impl Into<String>, path: &std::path::Path) -> SenderResult<Self> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            SenderError::validation(format!("cannot read upload {}: {}", path.display(), e))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(field_name, file_name, content))
    }
}

/// Resolved request body
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// Pre-encoded bytes
    Bytes(Bytes),
    /// Multipart form
    Multipart {
        /// Text fields
        fields: Vec<(String, String)>,
        /// File parts
        files: Vec<FileUpload>,
    },
}

/// A concrete HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Absolute URL including query
    pub url: String,
    /// Headers
    pub headers: HeaderMap,
    /// Body
    pub body: RequestBody,
    /// Timeout for the whole exchange
    pub timeout: Duration,
}

impl HttpRequest {
    /// Body bytes, if the body is not multipart
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            RequestBody::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// A fully-read HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Headers
    pub headers: HeaderMap,
    /// Body
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a response
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Body as lossy UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Status range treated as transport-level success
pub fn is_acceptable_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Executes concrete HTTP requests
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Execute a request and read the whole response body
    async fn execute(&self, request: HttpRequest) -> SenderResult<HttpResponse>;
}

/// Streamed raw body source
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Caller-level description of a request.
///
/// Body precedence is raw, raw reader, JSON, multipart (form fields or
/// files), then urlencoded data.
#[derive(Default)]
pub struct RequestOptions {
    /// Method; defaults to POST with a body, GET without
    pub method: Option<Method>,
    /// Extra headers
    pub headers: HeaderMap,
    /// Timeout; defaults to the transport default
    pub timeout: Option<Duration>,
    /// Query parameters merged into the URL's existing query
    pub query: Vec<(String, String)>,
    /// urlencoded body fields
    pub data: Vec<(String, String)>,
    /// JSON body
    pub json: Option<serde_json::Value>,
    /// Multipart text fields
    pub form: Vec<(String, String)>,
    /// Pre-encoded body
    pub raw: Option<Bytes>,
    /// Streamed body, read in full before sending
    pub raw_reader: Option<BodyReader>,
    /// Multipart files read from disk: (field name, path)
    pub files: Vec<(String, PathBuf)>,
    /// In-memory multipart files
    pub uploads: Vec<FileUpload>,
    /// Per-request client override
    pub client: Option<Arc<dyn HttpTransport>>,
    /// Turn non-2xx/3xx statuses into errors
    pub throw_on_http_error: bool,
}

impl RequestOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Add a header; invalid names or values are rejected
    pub fn header(mut self, name: &str, value: &str) -> SenderResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid_header(name, e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid_header(name.as_str(), e))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Add a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set a JSON body
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.json = Some(value);
        self
    }

    /// Add a urlencoded field
    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((key.into(), value.into()));
        self
    }

    /// Add a multipart text field
    pub fn form(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    /// Add a multipart file from disk
    pub fn file(mut self, field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push((field.into(), path.into()));
        self
    }

    /// Set a pre-encoded body
    pub fn raw(mut self, body: impl Into<Bytes>) -> Self {
        self.raw = Some(body.into());
        self
    }

    /// Set a streamed body
    pub fn raw_reader(mut self, reader: impl AsyncRead + Send + 'static) -> Self {
        self.raw_reader = Some(Box::pin(reader));
        self
    }

    /// Set the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the client
    pub fn client(mut self, client: Arc<dyn HttpTransport>) -> Self {
        self.client = Some(client);
        self
    }

    /// Fail on non-2xx/3xx statuses
    pub fn throw_on_http_error(mut self) -> Self {
        self.throw_on_http_error = true;
        self
    }

    /// Resolve into a concrete request
    pub async fn into_request(self, url: &str) -> SenderResult<HttpRequest> {
        let url = merge_query(url, &self.query)?;
        let mut headers = self.headers;
        let mut content_type: Option<&'static str> = None;

        let body = if let Some(raw) = self.raw {
            RequestBody::Bytes(raw)
        } else if let Some(mut reader) = self.raw_reader {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.map_err(|e| {
                SenderError::Network(NetworkError::Io {
                    message: e.to_string(),
                })
            })?;
            RequestBody::Bytes(Bytes::from(buf))
        } else if let Some(json) = self.json {
            content_type = BodyType::Json.content_type();
            let encoded = serde_json::to_vec(&json)
                .map_err(|e| SenderError::transform(format!("failed to encode JSON body: {}", e)))?;
            RequestBody::Bytes(Bytes::from(encoded))
        } else if !self.form.is_empty() || !self.files.is_empty() || !self.uploads.is_empty() {
            let mut files = self.uploads;
            for (field, path) in &self.files {
                files.push(FileUpload::from_path(field.clone(), path).await?);
            }
            RequestBody::Multipart {
                fields: self.form,
                files,
            }
        } else if !self.data.is_empty() {
            content_type = BodyType::Form.content_type();
            RequestBody::Bytes(Bytes::from(encode_form(&self.data)))
        } else {
            RequestBody::Empty
        };

        if let Some(ct) = content_type {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
            }
        }

        let method = self.method.unwrap_or(match body {
            RequestBody::Empty => Method::GET,
            _ => Method::POST,
        });

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        })
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("headers", &self.headers.len())
            .field("timeout", &self.timeout)
            .field("query", &self.query)
            .field("has_json", &self.json.is_some())
            .field("has_raw", &(self.raw.is_some() || self.raw_reader.is_some()))
            .field("files", &self.files)
            .field("throw_on_http_error", &self.throw_on_http_error)
            .finish()
    }
}

fn invalid_header(name: &str, e: impl fmt::Display) -> SenderError {
    SenderError::Configuration(ConfigurationError::InvalidValue {
        field: format!("header {}", name),
        message: e.to_string(),
    })
}

/// urlencode key/value pairs
pub fn encode_form(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Append query parameters, keeping whatever query the URL already has
pub fn merge_query(url: &str, query: &[(String, String)]) -> SenderResult<String> {
    let mut parsed = url::Url::parse(url).map_err(|e| {
        SenderError::Configuration(ConfigurationError::InvalidValue {
            field: "url".to_string(),
            message: format!("{}: {}", url, e),
        })
    })?;
    if !query.is_empty() {
        let mut pairs = parsed.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(parsed.into())
}

/// Resolve and execute a request under a send context.
///
/// The effective timeout is the smaller of the request timeout and the
/// context's remaining time.
pub async fn send(
    ctx: &SendContext,
    url: &str,
    mut options: RequestOptions,
    default: &Arc<dyn HttpTransport>,
) -> SenderResult<HttpResponse> {
    let transport = options.client.take().unwrap_or_else(|| default.clone());
    let throw = options.throw_on_http_error;
    let mut request = options.into_request(url).await?;
    if let Some(remaining) = ctx.remaining() {
        request.timeout = request.timeout.min(remaining);
    }

    let response = ctx.run(transport.execute(request)).await?;
    if throw && !is_acceptable_status(response.status) {
        return Err(SenderError::Http {
            status: response.status,
            body: response.text(),
        });
    }
    Ok(response)
}

/// Default transport backed by reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with the given default timeout
    pub fn new(timeout: Duration) -> SenderResult<Self> {
        Self::with_user_agent(timeout, DEFAULT_USER_AGENT)
    }

    /// Create a transport sending `user_agent` on requests that set none
    pub fn with_user_agent(timeout: Duration, user_agent: &str) -> SenderResult<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .user_agent(user_agent)
            .build()
            .map_err(|e| SenderError::Network(NetworkError::Http(e.to_string())))?;

        Ok(Self { client })
    }

    /// Wrap a pre-built client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %crate::observability::redact_url(&request.url)))]
    async fn execute(&self, request: HttpRequest) -> SenderResult<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(request.timeout);

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Multipart { fields, files } => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                for file in files {
                    let part = reqwest::multipart::Part::bytes(file.content.to_vec())
                        .file_name(file.file_name)
                        .mime_str(&file.mime_type)
                        .map_err(|e| SenderError::transform(e.to_string()))?;
                    form = form.part(file.field_name, part);
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(status, body_len = body.len(), "Received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::USER_AGENT;
    use std::io::Write;

    #[tokio::test]
    async fn test_default_method_follows_body() {
        let get = RequestOptions::new()
            .into_request("https://example.com/a")
            .await
            .unwrap();
        assert_eq!(get.method, Method::GET);
        assert!(matches!(get.body, RequestBody::Empty));

        let post = RequestOptions::new()
            .data("k", "v")
            .into_request("https://example.com/a")
            .await
            .unwrap();
        assert_eq!(post.method, Method::POST);
        assert_eq!(
            post.headers[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
        assert_eq!(post.body_bytes().unwrap().as_ref(), b"k=v");
    }

    #[tokio::test]
    async fn test_query_merge_preserves_existing() {
        let req = RequestOptions::new()
            .query("b", "2 3")
            .into_request("https://example.com/p?a=1")
            .await
            .unwrap();
        assert_eq!(req.url, "https://example.com/p?a=1&b=2+3");
    }

    #[tokio::test]
    async fn test_raw_beats_json() {
        let req = RequestOptions::new()
            .raw("raw-body")
            .json(serde_json::json!({"ignored": true}))
            .into_request("https://example.com")
            .await
            .unwrap();
        assert_eq!(req.body_bytes().unwrap().as_ref(), b"raw-body");
        assert!(!req.headers.contains_key(CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_json_sets_content_type() {
        let req = RequestOptions::new()
            .json(serde_json::json!({"x": 1}))
            .into_request("https://example.com")
            .await
            .unwrap();
        assert_eq!(req.headers[CONTENT_TYPE], "application/json");
        assert!(!req.headers.contains_key(USER_AGENT));
        assert_eq!(req.body_bytes().unwrap().as_ref(), br#"{"x":1}"#);
    }

    #[tokio::test]
    async fn test_explicit_content_type_is_kept() {
        let req = RequestOptions::new()
            .header("Content-Type", "application/json; charset=utf-8")
            .unwrap()
            .json(serde_json::json!({}))
            .into_request("https://example.com")
            .await
            .unwrap();
        assert_eq!(req.headers[CONTENT_TYPE], "application/json; charset=utf-8");
    }

    #[tokio::test]
    async fn test_files_become_multipart() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello").unwrap();

        let req = RequestOptions::new()
            .form("title", "report")
            .file("attachment", tmp.path())
            .data("ignored", "x")
            .into_request("https://example.com/upload")
            .await
            .unwrap();

        match req.body {
            RequestBody::Multipart { fields, files } => {
                assert_eq!(fields, vec![("title".to_string(), "report".to_string())]);
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].field_name, "attachment");
                assert_eq!(files[0].content.as_ref(), b"hello");
            }
            other => panic!("expected multipart, got {:?}", other),
        }
        assert_eq!(req.method, Method::POST);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_retryable() {
        let err = RequestOptions::new()
            .file("f", "/nonexistent/definitely-missing.txt")
            .into_request("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Validation { .. }));
        assert!(!err.is_retryable());
        assert!(!err.is_failure());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = RequestOptions::new().into_request("not a url").await.unwrap_err();
        assert!(matches!(err, SenderError::Configuration(_)));
    }

    #[test]
    fn test_acceptable_status() {
        assert!(is_acceptable_status(200));
        assert!(is_acceptable_status(302));
        assert!(!is_acceptable_status(400));
        assert!(!is_acceptable_status(199));
    }

    #[test]
    fn test_file_upload_mime_detection() {
        let upload = FileUpload::new("file", "test.png", vec![0u8; 10]);
        assert_eq!(upload.mime_type, "image/png");
    }
}
