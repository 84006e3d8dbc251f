//! Declarative response interpretation.
//!
//! Vendors report failure in many shapes: a non-2xx status, an `errcode`
//! field, `"ok": false`, a `Code` string. [`ResponseHandlerConfig`] states
//! where to look and what success looks like, and [`interpret`] applies it.

use crate::errors::{ConfigurationError, ProviderApiError, SenderError, SenderResult};
use crate::transport::BodyType;
use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// How the value at `success_path` is compared with `success_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Equal after string conversion
    #[default]
    Eq,
    /// Not equal after string conversion
    Ne,
    /// Regular expression match
    Regex,
    /// Present and non-empty
    Exists,
}

/// Where to look for success and error details in a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHandlerConfig {
    /// Accepted status codes; empty means 200..400
    pub accept_status: Vec<u16>,
    /// Inspect the body at all
    pub check_body: bool,
    /// How to parse the body
    pub body_type: BodyType,
    /// Dotted path to the success indicator
    pub success_path: String,
    /// Expected value at `success_path`
    pub success_value: String,
    /// Comparison mode
    pub mode: MatchMode,
    /// Dotted path to the vendor error code
    pub code_path: String,
    /// Dotted path to the vendor error message
    pub message_path: String,
}

impl Default for ResponseHandlerConfig {
    fn default() -> Self {
        Self {
            accept_status: Vec::new(),
            check_body: false,
            body_type: BodyType::Json,
            success_path: String::new(),
            success_value: String::new(),
            mode: MatchMode::Eq,
            code_path: String::new(),
            message_path: String::new(),
        }
    }
}

impl ResponseHandlerConfig {
    /// Accept any 2xx/3xx status without looking at the body
    pub fn status_only() -> Self {
        Self::default()
    }

    /// JSON body whose `path` must equal `value`
    pub fn json_eq(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            check_body: true,
            success_path: path.into(),
            success_value: value.into(),
            ..Self::default()
        }
    }

    /// JSON body in which `path` must be present
    pub fn json_exists(path: impl Into<String>) -> Self {
        Self {
            check_body: true,
            success_path: path.into(),
            mode: MatchMode::Exists,
            ..Self::default()
        }
    }

    /// Set the error code and message paths
    pub fn with_error_paths(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.code_path = code.into();
        self.message_path = message.into();
        self
    }

    /// Restrict accepted statuses
    pub fn with_accept_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.accept_status = statuses.into_iter().collect();
        self
    }

    /// Set the match mode
    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether a status passes the status check
    pub fn accepts(&self, status: u16) -> bool {
        if self.accept_status.is_empty() {
            (200..400).contains(&status)
        } else {
            self.accept_status.contains(&status)
        }
    }

    /// Reject configurations that can never match
    pub fn validate(&self) -> SenderResult<()> {
        if self.mode == MatchMode::Regex {
            compile(&self.success_value)?;
        }
        if self.check_body
            && self.mode != MatchMode::Exists
            && self.body_type == BodyType::Json
            && self.success_path.is_empty()
        {
            return Err(invalid("success_path", "required when checking a JSON body"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> SenderError {
    SenderError::Configuration(ConfigurationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    })
}

fn compile(pattern: &str) -> SenderResult<Regex> {
    Regex::new(pattern).map_err(|e| invalid("success_value", e.to_string()))
}

/// Judge a response against a handler configuration.
///
/// Returns `Ok(())` for success. A rejected status yields
/// [`SenderError::Http`] (or [`SenderError::RateLimited`] for 429), an
/// unparseable body yields [`SenderError::MalformedResponse`], and a failed
/// predicate yields [`SenderError::ProviderApi`] with the extracted code
/// and message.
pub fn interpret(
    config: &ResponseHandlerConfig,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
) -> SenderResult<()> {
    let text = String::from_utf8_lossy(body);

    if !config.accepts(status) {
        if status == 429 {
            return Err(SenderError::RateLimited {
                retry_after: retry_after(headers),
            });
        }
        return Err(SenderError::Http {
            status,
            body: text.into_owned(),
        });
    }

    if !config.check_body {
        return Ok(());
    }

    let doc = match config.body_type {
        BodyType::Json => Some(serde_json::from_slice::<Value>(body).map_err(|e| {
            SenderError::MalformedResponse {
                message: format!("invalid JSON body: {}", e),
            }
        })?),
        _ => None,
    };

    let lookup = |path: &str| -> Option<String> {
        match &doc {
            Some(v) if path.is_empty() => Some(stringify(v)),
            Some(v) => lookup_path(v, path).map(stringify),
            None => Some(text.to_string()),
        }
    };

    let found = lookup(&config.success_path);
    let ok = match config.mode {
        MatchMode::Eq => found.as_deref().unwrap_or("") == config.success_value,
        MatchMode::Ne => found.as_deref().unwrap_or("") != config.success_value,
        MatchMode::Regex => {
            compile(&config.success_value)?.is_match(found.as_deref().unwrap_or(""))
        }
        MatchMode::Exists => found.as_deref().is_some_and(|s| !s.is_empty()),
    };
    if ok {
        return Ok(());
    }

    let mut code = non_empty(&config.code_path).and_then(&lookup).unwrap_or_default();
    if code.is_empty() {
        code = found
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| status.to_string());
    }
    let message = non_empty(&config.message_path)
        .and_then(&lookup)
        .unwrap_or_default();

    Err(SenderError::ProviderApi(
        ProviderApiError::new(code, message).with_raw(text.into_owned()),
    ))
}

fn non_empty(path: &str) -> Option<&str> {
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Walk a dotted path; numeric segments index into arrays
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// String form used for comparisons; null becomes empty
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) if items.is_empty() => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}
