//! Account contracts used by selection strategies.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;

/// Anything a selection strategy can choose between.
pub trait Selectable: Send + Sync + fmt::Debug + 'static {
    /// Unique name within its provider
    fn name(&self) -> &str;

    /// Selection weight; non-positive weights count as 1
    fn weight(&self) -> i64;

    /// Whether the account may be selected
    fn is_enabled(&self) -> bool;

    /// Vendor subtype this account serves, if any
    fn sub_type(&self) -> Option<&str>;
}

/// Opaque vendor credentials.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// API key, access key id, robot token, etc.
    #[serde(default)]
    pub api_key: String,
    /// Matching secret
    #[serde(default = "empty_secret")]
    pub api_secret: SecretString,
    /// Application or tenant identifier
    #[serde(default)]
    pub app_id: String,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

impl Credentials {
    /// Create credentials from key and secret
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::new(api_secret.into()),
            app_id: String::new(),
        }
    }

    /// Set the application id
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Expose the secret for signing
    pub fn secret(&self) -> &str {
        self.api_secret.expose_secret()
    }

    /// Whether a secret was configured
    pub fn has_secret(&self) -> bool {
        !self.api_secret.expose_secret().is_empty()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &crate::observability::redact_token(&self.api_key))
            .field("api_secret", &"[REDACTED]")
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// Fields shared by every account record.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseAccount {
    /// Unique account name
    pub name: String,
    /// Selection weight
    #[serde(default = "default_weight")]
    pub weight: i64,
    /// Selectable; `false` has the same effect as `disabled`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Exclude from selection
    #[serde(default)]
    pub disabled: bool,
    /// Vendor subtype
    #[serde(default, rename = "sub_type", alias = "subtype")]
    pub sub_type: Option<String>,
    /// Vendor credentials
    #[serde(flatten)]
    pub credentials: Credentials,
}

fn default_weight() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Default for BaseAccount {
    fn default() -> Self {
        Self {
            name: String::new(),
            weight: default_weight(),
            enabled: true,
            disabled: false,
            sub_type: None,
            credentials: Credentials::default(),
        }
    }
}

impl BaseAccount {
    /// Create an enabled account with weight 1
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1,
            ..Default::default()
        }
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the subtype
    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    /// Set credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Mark as disabled
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Whether the account may be selected
    pub fn is_active(&self) -> bool {
        self.enabled && !self.disabled
    }
}

impl Selectable for BaseAccount {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> i64 {
        self.weight
    }

    fn is_enabled(&self) -> bool {
        self.is_active()
    }

    fn sub_type(&self) -> Option<&str> {
        self.sub_type.as_deref()
    }
}

/// Implement [`Selectable`] for a struct carrying a `base: BaseAccount` field.
#[macro_export]
macro_rules! impl_selectable {
    ($ty:ty) => {
        impl $crate::types::Selectable for $ty {
            fn name(&self) -> &str {
                &self.base.name
            }

            fn weight(&self) -> i64 {
                self.base.weight
            }

            fn is_enabled(&self) -> bool {
                self.base.is_active()
            }

            fn sub_type(&self) -> Option<&str> {
                self.base.sub_type.as_deref()
            }
        }
    };
}
