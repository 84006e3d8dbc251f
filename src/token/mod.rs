//! Access token caching for vendors that exchange credentials for
//! short-lived tokens.
//!
//! Cache keys are `"<family>:<tenant>:<app>"`, e.g. `wecomapp:corp1:1000002`.
//! [`TokenRefresher`] stores each fetched token with its lifetime shortened
//! by the refresh buffer, so any [`TokenCache`] stops serving it before the
//! vendor does.

use crate::errors::SenderResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default margin cut from a fetched token's reported lifetime
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// A bearer token with its absolute expiry
#[derive(Clone)]
pub struct AccessToken {
    token: SecretString,
    /// Absolute expiry after which the token is not served
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Token valid for `ttl` from now
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: SecretString::new(token.into()),
            expires_at: Utc::now() + to_chrono(ttl),
        }
    }

    /// Token value
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }

    /// Whether the token is still usable with `buffer` to spare
    pub fn is_valid(&self, buffer: Duration) -> bool {
        Utc::now() + to_chrono(buffer) < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36500))
}

/// Pluggable token store
#[async_trait]
pub trait TokenCache: Send + Sync {
    /// Fetch a token that is still valid, if any
    async fn get(&self, key: &str) -> SenderResult<Option<AccessToken>>;

    /// Store a token
    async fn set(&self, key: &str, token: AccessToken) -> SenderResult<()>;

    /// Remove a token; returns whether one was present
    async fn delete(&self, key: &str) -> SenderResult<bool>;
}

/// Process-local token cache
pub struct MemoryTokenCache {
    tokens: RwLock<HashMap<String, AccessToken>>,
    buffer: Duration,
}

impl MemoryTokenCache {
    /// Create a cache that serves tokens until their stored expiry
    pub fn new() -> Self {
        Self::with_buffer(Duration::ZERO)
    }

    /// Create a cache that drops tokens `buffer` before their stored expiry
    pub fn with_buffer(buffer: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            buffer,
        }
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryTokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTokenCache")
            .field("entries", &self.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, key: &str) -> SenderResult<Option<AccessToken>> {
        let token = self.tokens.read().get(key).cloned();
        match token {
            Some(t) if t.is_valid(self.buffer) => Ok(Some(t)),
            Some(_) => {
                self.tokens.write().remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, token: AccessToken) -> SenderResult<()> {
        self.tokens.write().insert(key.to_string(), token);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SenderResult<bool> {
        Ok(self.tokens.write().remove(key).is_some())
    }
}

/// What a vendor token endpoint returned
#[derive(Debug, Clone)]
pub struct FetchedToken {
    /// Token value
    pub token: String,
    /// Lifetime reported by the vendor
    pub expires_in: Duration,
}

/// Cache-aside token lookup with one in-flight fetch per key
pub struct TokenRefresher {
    cache: Arc<dyn TokenCache>,
    buffer: Duration,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    fetches: AtomicU64,
}

impl TokenRefresher {
    /// Create a refresher over a cache with the default refresh buffer
    pub fn new(cache: Arc<dyn TokenCache>) -> Self {
        Self::with_buffer(cache, DEFAULT_REFRESH_BUFFER)
    }

    /// Create a refresher that cuts `buffer` from every fetched lifetime
    pub fn with_buffer(cache: Arc<dyn TokenCache>, buffer: Duration) -> Self {
        Self {
            cache,
            buffer,
            flights: Mutex::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Return a cached token or fetch, store and return a fresh one.
    ///
    /// Concurrent callers for the same key wait for a single fetch.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, fetch: F) -> SenderResult<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = SenderResult<FetchedToken>> + Send,
    {
        if let Some(token) = self.cache.get(key).await? {
            return Ok(token.expose().to_string());
        }

        let flight = self
            .flights
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = flight.lock().await;

        if let Some(token) = self.cache.get(key).await? {
            return Ok(token.expose().to_string());
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = fetch().await?;
        debug!(key, expires_in_secs = fetched.expires_in.as_secs(), "Fetched access token");

        let ttl = fetched.expires_in.saturating_sub(self.buffer);
        self.cache
            .set(key, AccessToken::new(fetched.token.clone(), ttl))
            .await?;
        Ok(fetched.token)
    }

    /// Drop a cached token so the next call refetches
    pub async fn invalidate(&self, key: &str) -> SenderResult<bool> {
        debug!(key, "Invalidating access token");
        self.cache.delete(key).await
    }

    /// Number of fetches performed
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("buffer", &self.buffer)
            .field("fetches", &self.fetch_count())
            .finish_non_exhaustive()
    }
}

/// Build a cache key from its parts
pub fn cache_key(family: &str, tenant: &str, app: &str) -> String {
    format!("{}:{}:{}", family, tenant, app)
}
