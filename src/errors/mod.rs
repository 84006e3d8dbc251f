//! Error types for the sender.
//!
//! Provides an error hierarchy covering configuration, account selection,
//! transport, vendor responses and middleware, with retry classification.

use std::time::Duration;
use thiserror::Error;

/// Result type for sender operations
pub type SenderResult<T> = Result<T, SenderError>;

/// Root error type for the dispatch pipeline
#[derive(Error, Debug, Clone)]
pub enum SenderError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Message failed self-validation
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
    },

    /// No eligible account after filtering
    #[error("No available account for provider {provider}: {reason}")]
    NoAccount {
        /// Provider name
        provider: String,
        /// Why nothing was eligible
        reason: String,
    },

    /// Selected account is disabled
    #[error("Account {name} is disabled")]
    AccountDisabled {
        /// Account name
        name: String,
    },

    /// Transformer could not build a request
    #[error("Transform error: {message}")]
    Transform {
        /// Error message
        message: String,
    },

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Response status outside the accepted range
    #[error("HTTP error: status {status}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body (lossy UTF-8)
        body: String,
    },

    /// Response body could not be parsed
    #[error("Malformed response: {message}")]
    MalformedResponse {
        /// Error message
        message: String,
    },

    /// Vendor-declared failure
    #[error("Provider API error: {0}")]
    ProviderApi(ProviderApiError),

    /// Vendor-declared authentication failure
    #[error("Authentication error: {0}")]
    Auth(ProviderApiError),

    /// Admission denied or 429 observed
    #[error("Rate limited{}", retry_after.map(|d| format!(", retry after {:?}", d)).unwrap_or_default())]
    RateLimited {
        /// Suggested wait before retrying
        retry_after: Option<Duration>,
    },

    /// Circuit breaker is open
    #[error("Circuit breaker is open for {provider}")]
    CircuitOpen {
        /// Provider name
        provider: String,
    },

    /// Context was canceled
    #[error("Operation canceled")]
    Canceled,

    /// Context deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Sender has been closed
    #[error("Sender is closed")]
    Closed,

    /// No provider registered for the message's provider type
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Async queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// SMTP delivery error
    #[error("SMTP error: {message}")]
    Smtp {
        /// Error message
        message: String,
        /// Whether the server rejected permanently (5xx)
        permanent: bool,
    },

    /// Several errors collected while closing
    #[error("Multiple errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<SenderError>),
}

impl SenderError {
    /// Stable kind name used by metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "config",
            Self::Validation { .. } => "validation",
            Self::NoAccount { .. } => "no_account",
            Self::AccountDisabled { .. } => "account_disabled",
            Self::Transform { .. } => "transform",
            Self::Network(_) => "network",
            Self::Http { .. } => "http",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::ProviderApi(_) => "provider_api",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Canceled | Self::DeadlineExceeded => "canceled",
            Self::Closed => "closed",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Queue(_) => "queue",
            Self::Smtp { .. } => "smtp",
            Self::Multiple(_) => "multiple",
        }
    }

    /// Check if this error is retryable by default
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            Self::RateLimited { .. } => true,
            Self::ProviderApi(e) | Self::Auth(e) => e.retryable,
            Self::Smtp { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// Whether this error should count against a circuit breaker
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Http { .. }
                | Self::MalformedResponse { .. }
                | Self::ProviderApi(_)
                | Self::Auth(_)
                | Self::RateLimited { .. }
                | Self::Smtp { .. }
        )
    }

    /// Get retry-after duration if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Get HTTP status code if applicable
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Vendor error details, for both plain and auth API failures
    pub fn provider_api(&self) -> Option<&ProviderApiError> {
        match self {
            Self::ProviderApi(e) | Self::Auth(e) => Some(e),
            _ => None,
        }
    }

    /// Shorthand for a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a transform error
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform {
            message: message.into(),
        }
    }
}

/// Statuses worth retrying: 408, 425, 429 and 5xx
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

/// Vendor-reported failure extracted by the response handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderApiError {
    /// Vendor error code
    pub code: String,
    /// Vendor error message
    pub message: String,
    /// Raw response body
    pub raw: String,
    /// Whether the transformer classified this as retryable
    pub retryable: bool,
}

impl ProviderApiError {
    /// Create a new non-retryable API error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            raw: String::new(),
            retryable: false,
        }
    }

    /// Attach the raw body
    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Mark as retryable
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for ProviderApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    /// Required field is missing
    #[error("Missing required field: {field}")]
    MissingField {
        /// Field name
        field: String,
    },

    /// Field has an invalid value
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Error message
        message: String,
    },

    /// Provider is disabled in configuration
    #[error("Provider {provider} is disabled")]
    ProviderDisabled {
        /// Provider name
        provider: String,
    },

    /// Provider has no configured items
    #[error("Provider {provider} has no accounts configured")]
    NoItems {
        /// Provider name
        provider: String,
    },

    /// Every configured item is disabled
    #[error("Provider {provider} has no enabled accounts")]
    AllItemsDisabled {
        /// Provider name
        provider: String,
    },

    /// Two accounts share a name
    #[error("Duplicate account name {name} for provider {provider}")]
    DuplicateAccount {
        /// Provider name
        provider: String,
        /// Account name
        name: String,
    },

    /// Unrecognized provider tag
    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),

    /// Unrecognized strategy tag
    #[error("Unknown selection strategy: {0}")]
    UnknownStrategy(String),

    /// Retry policy failed validation
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// Config file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Network errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection failed
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        /// Error message
        message: String,
    },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// DNS resolution failed
    #[error("DNS resolution failed: {message}")]
    DnsResolutionFailed {
        /// Error message
        message: String,
    },

    /// Local I/O failure (reading upload files, etc.)
    #[error("I/O error: {message}")]
    Io {
        /// Error message
        message: String,
    },

    /// Other HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_connect() {
            NetworkError::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            NetworkError::Http(err.to_string())
        }
    }
}

impl From<reqwest::Error> for SenderError {
    fn from(err: reqwest::Error) -> Self {
        SenderError::Network(NetworkError::from(err))
    }
}

/// Async queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue is at capacity
    #[error("Queue is full (capacity {capacity})")]
    Full {
        /// Maximum size
        capacity: usize,
    },

    /// Queue has been closed
    #[error("Queue is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retryable() {
        assert!(SenderError::Network(NetworkError::Timeout).is_retryable());
        assert!(SenderError::RateLimited { retry_after: None }.is_retryable());
        assert!(SenderError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(SenderError::Http {
            status: 429,
            body: String::new()
        }
        .is_retryable());

        assert!(!SenderError::Http {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!SenderError::transform("bad template").is_retryable());
        assert!(!SenderError::CircuitOpen {
            provider: "sms".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_provider_api_retryability_follows_flag() {
        let plain = SenderError::ProviderApi(ProviderApiError::new("40001", "bad"));
        assert!(!plain.is_retryable());

        let auth = SenderError::Auth(ProviderApiError::new("42001", "expired").retryable(true));
        assert!(auth.is_retryable());
        assert_eq!(auth.kind(), "auth");
        assert_eq!(auth.provider_api().map(|e| e.code.as_str()), Some("42001"));
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 425, 429, 500, 502, 599] {
            assert!(is_retryable_status(status), "{status} should retry");
        }
        for status in [200, 301, 400, 401, 404] {
            assert!(!is_retryable_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn test_multiple_display() {
        let err = SenderError::Multiple(vec![SenderError::Closed, SenderError::Canceled]);
        assert_eq!(err.to_string(), "Multiple errors: Sender is closed; Operation canceled");
    }
}
