//! Logging setup and sensitive data redaction.

use std::fmt;
use std::str::FromStr;
use tracing::Dispatch;
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Wrapper for sensitive data that redacts on display
#[derive(Clone)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    /// Create a new redacted value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Get the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a credential, keeping a short prefix for debugging
pub fn redact_token(token: &str) -> String {
    if token.len() <= 8 || !token.is_char_boundary(4) {
        "[REDACTED]".to_string()
    } else {
        format!("{}...[REDACTED]", &token[..4])
    }
}

const SENSITIVE_PARAMS: &[&str] = &[
    "token",
    "access_token",
    "key",
    "secret",
    "corpsecret",
    "password",
    "api_key",
    "sign",
];

/// Redact a URL, hiding credentials in query parameters
pub fn redact_url(url: &str) -> String {
    let Some(query_start) = url.find('?') else {
        return url.to_string();
    };
    let (base, query) = url.split_at(query_start);

    let redacted: Vec<String> = query
        .trim_start_matches('?')
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if SENSITIVE_PARAMS.iter().any(|s| key.eq_ignore_ascii_case(s)) => {
                format!("{}=[REDACTED]", key)
            }
            _ => pair.to_string(),
        })
        .collect();

    format!("{}?{}", base, redacted.join("&"))
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Most verbose
    Trace,
    /// Debug
    Debug,
    /// Info
    #[default]
    Info,
    /// Warnings
    Warn,
    /// Errors only
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" | "" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl From<LogLevel> for tracing::level_filters::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
            LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
            LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
    /// Single-line compact
    Compact,
}

/// Global subscriber configuration.
///
/// The library only emits `tracing` events; applications that want output
/// call [`LoggingConfig::init`] once at startup.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Minimum level
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include module target
    pub include_target: bool,
}

impl LoggingConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self {
            include_target: true,
            ..Default::default()
        }
    }

    /// Set the level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Build the env filter; `RUST_LOG` directives are honored on top of the level
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::from_default_env().add_directive(tracing::level_filters::LevelFilter::from(self.level).into())
    }

    /// Subscriber as a [`Dispatch`] that can be scoped to one sender
    /// with `Sender::set_logger`
    pub fn dispatch(&self) -> Dispatch {
        let registry = tracing_subscriber::registry().with(self.filter());
        match self.format {
            LogFormat::Pretty => {
                Dispatch::new(registry.with(tfmt::layer().with_target(self.include_target)))
            }
            LogFormat::Json => Dispatch::new(registry.with(tfmt::layer().json())),
            LogFormat::Compact => Dispatch::new(registry.with(tfmt::layer().compact())),
        }
    }

    /// Install the global subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber is already set.
    pub fn init(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let filter = self.filter();
        match self.format {
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(tfmt::layer().with_target(self.include_target))
                .try_init()?,
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(tfmt::layer().json())
                .try_init()?,
            LogFormat::Compact => tracing_subscriber::registry()
                .with(filter)
                .with(tfmt::layer().compact())
                .try_init()?,
        }
        Ok(())
    }
}
