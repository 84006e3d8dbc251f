//! Unified notification dispatch
//!
//! One [`Sender`] fronts many notification vendors:
//! - Provider families for SMS, REST and SMTP email, chat bots, Telegram,
//!   ServerChan and generic webhooks
//! - Account pools per provider with round-robin, random or weighted selection
//! - Vendor transformers that turn a message into a signed HTTP request
//! - Resilience middleware (rate limiting, retry, circuit breaking)
//! - Background delivery through a bounded queue with callbacks
//! - Observability (tracing, metrics, health)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use integrations_sender::providers::wecombot::{self, WeComBotAccount, WeComBotMessage};
//! use integrations_sender::{ProviderConfig, ReqwestTransport, SendContext, Sender};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(10))?);
//!     let provider = wecombot::provider(
//!         ProviderConfig::new(vec![WeComBotAccount::new("ops", "robot-key")]),
//!         transport,
//!     )?;
//!
//!     let sender = Sender::new();
//!     sender.register_provider(Arc::new(provider), None)?;
//!
//!     let result = sender
//!         .send_with_result(&SendContext::new(), WeComBotMessage::text("deploy finished"), Default::default())
//!         .await?;
//!     println!("sent via {}", result.account_name);
//!
//!     sender.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `rustls` (default) - TLS through rustls
//! - `native-tls` - TLS through the platform library
//! - `smtp` (default) - SMTP delivery through `lettre`

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod context;
pub mod errors;
pub mod transport;
pub mod types;

// Dispatch
pub mod provider;
pub mod response;
pub mod sender;
pub mod strategy;
pub mod token;
pub mod transformer;

// Vendors
pub mod providers;

// Background delivery
pub mod queue;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Testing utilities
pub mod mocks;

// Tests
#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use config::{RootConfig, SenderConfig, SenderConfigBuilder};
pub use context::{SendContext, SendOptions};
pub use errors::{SenderError, SenderResult};
pub use provider::{HttpProvider, Provider, ProviderConfig};
pub use providers::{build_sender, build_sender_with_transport};
pub use sender::{ProviderMiddleware, Sender};
pub use strategy::StrategyKind;
pub use transport::{HttpTransport, ReqwestTransport};
pub use types::{Message, ProviderType, SendResult};

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default User-Agent for vendor requests
pub const DEFAULT_USER_AGENT: &str = concat!("integrations-sender/", env!("CARGO_PKG_VERSION"));

/// Default number of queue workers
pub const DEFAULT_WORKERS: usize = 1;

/// Build a sender from `GO_SENDER_*` settings and a JSON account file
pub fn create_sender_from_env(accounts_path: impl AsRef<std::path::Path>) -> SenderResult<Sender> {
    let root = RootConfig::from_file(accounts_path)?;
    let config = SenderConfig::from_env_with_root(&root)?;
    let sender = build_sender(&root, &config)?;
    sender.set_logger(Some(
        observability::LoggingConfig::new()
            .with_level(config.log_level)
            .dispatch(),
    ));
    Ok(sender)
}
