//! Outcome of a successful send.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::collections::HashMap;
use std::time::Duration;

/// What the vendor answered for an accepted send.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Always true; failures are returned as errors
    pub success: bool,
    /// Message identifier
    pub message_id: String,
    /// Provider name that handled the send
    pub provider: String,
    /// Account that was selected
    pub account_name: String,
    /// HTTP status code (or SMTP reply code)
    pub status_code: u16,
    /// Raw response body
    pub body: Bytes,
    /// Response headers
    pub headers: HeaderMap,
    /// Caller-supplied metadata echoed back
    pub metadata: HashMap<String, String>,
    /// When the response was received
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration of the vendor call
    pub duration: Duration,
}

impl SendResult {
    /// Create a successful result
    pub fn new(message_id: impl Into<String>, status_code: u16, body: Bytes) -> Self {
        Self {
            success: true,
            message_id: message_id.into(),
            provider: String::new(),
            account_name: String::new(),
            status_code,
            body,
            headers: HeaderMap::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Body as lossy UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
