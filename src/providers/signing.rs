//! Request signing primitives shared by vendor transformers.

use crate::errors::{SenderError, SenderResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `data` under `key`
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> SenderResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SenderError::transform(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Raw SHA-256 digest
pub(crate) fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Lowercase hex SHA-256 digest
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Standard base64 with padding
pub(crate) fn base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Random nonce for signature schemes that require one
pub(crate) fn nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Host header value for a URL, including a non-default port
pub(crate) fn host_of(url: &str) -> SenderResult<String> {
    let parsed = url::Url::parse(url)
        .map_err(|e| SenderError::transform(format!("invalid endpoint {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SenderError::transform(format!("endpoint {} has no host", url)))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
