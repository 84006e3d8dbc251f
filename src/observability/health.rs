//! Health reporting.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    #[default]
    Healthy,
    /// Operational with reduced capacity
    Degraded,
    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one named component
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Optional detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    /// Healthy component
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    /// Component with an explicit status and message
    pub fn with_status(
        name: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            message: Some(message.into()),
        }
    }
}

/// Aggregate health of a sender
#[derive(Debug, Clone, Serialize)]
pub struct SenderHealth {
    /// Worst status across providers and components
    pub status: HealthStatus,
    /// Per-provider health
    pub providers: Vec<ComponentHealth>,
    /// Middleware and queue health
    pub components: Vec<ComponentHealth>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

impl SenderHealth {
    /// Aggregate component reports
    pub fn aggregate(providers: Vec<ComponentHealth>, components: Vec<ComponentHealth>) -> Self {
        let status = providers
            .iter()
            .chain(components.iter())
            .fold(HealthStatus::Healthy, |acc, c| acc.worst(c.status));
        Self {
            status,
            providers,
            components,
            checked_at: Utc::now(),
        }
    }
}

/// Last known health per account, fed by send outcomes
#[derive(Debug, Default)]
pub struct AccountHealth {
    statuses: RwLock<HashMap<String, HealthStatus>>,
}

impl AccountHealth {
    /// Create an empty tracker; unknown accounts are healthy
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest status for an account
    pub fn mark(&self, account: &str, status: HealthStatus) {
        self.statuses.write().insert(account.to_string(), status);
    }

    /// Last known status
    pub fn status(&self, account: &str) -> HealthStatus {
        self.statuses
            .read()
            .get(account)
            .copied()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Overall status: unhealthy only if every known account is unhealthy
    pub fn summary(&self, accounts: usize) -> HealthStatus {
        let statuses = self.statuses.read();
        let unhealthy = statuses
            .values()
            .filter(|s| **s == HealthStatus::Unhealthy)
            .count();
        if accounts > 0 && unhealthy >= accounts {
            HealthStatus::Unhealthy
        } else if unhealthy > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
