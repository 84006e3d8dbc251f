//! Integration tests using WireMock
//!
//! These tests build senders from account files that point at a mock HTTP
//! server and drive real requests through the reqwest transport.

mod account_file;
mod dispatch;

use integrations_sender::{build_sender, RootConfig, Sender, SenderConfig};
use wiremock::{MockServer, ResponseTemplate};

/// Start a fresh mock server
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Build a sender from an account file with default settings
pub fn sender_from_json(json: &str) -> Sender {
    let root = RootConfig::from_json(json).expect("account file should parse");
    build_sender(&root, &SenderConfig::default()).expect("sender should build")
}

/// Successful JSON response
pub fn success_response(body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}
