//! Account selection strategies.
//!
//! Strategies pick an index into a list of already-eligible candidates.
//! Eligibility (enabled, subtype, pinned name) is decided by the caller.

use crate::errors::ConfigurationError;
use crate::observability::{AccountHealth, HealthStatus};
use crate::types::Selectable;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Strategy tag used in configuration and routing hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cycle through candidates in order
    #[default]
    RoundRobin,
    /// Uniform random pick
    Random,
    /// Weight-proportional random pick
    Weighted,
}

impl StrategyKind {
    /// Build a fresh strategy instance
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
            StrategyKind::Random => Arc::new(RandomStrategy),
            StrategyKind::Weighted => Arc::new(WeightedStrategy),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::RoundRobin => write!(f, "round_robin"),
            StrategyKind::Random => write!(f, "random"),
            StrategyKind::Weighted => write!(f, "weighted"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" | "" => Ok(StrategyKind::RoundRobin),
            "random" => Ok(StrategyKind::Random),
            "weighted" => Ok(StrategyKind::Weighted),
            other => Err(ConfigurationError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Picks one candidate out of a non-empty list.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Index of the chosen candidate, or `None` if nothing is eligible
    fn select(&self, candidates: &[&dyn Selectable]) -> Option<usize>;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

/// Cycles through candidates with a shared atomic counter
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, candidates: &[&dyn Selectable]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(n % candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Uniform random selection
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn select(&self, candidates: &[&dyn Selectable]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Weight-proportional random selection; non-positive weights count as 1
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedStrategy;

fn effective_weight(item: &dyn Selectable) -> u64 {
    item.weight().max(1) as u64
}

impl SelectionStrategy for WeightedStrategy {
    fn select(&self, candidates: &[&dyn Selectable]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates.iter().map(|c| effective_weight(*c)).sum();
        let mut point = rand::thread_rng().gen_range(0..total);
        for (i, candidate) in candidates.iter().enumerate() {
            let w = effective_weight(*candidate);
            if point < w {
                return Some(i);
            }
            point -= w;
        }
        Some(candidates.len() - 1)
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

/// Drops candidates whose last known health is unhealthy, then delegates.
///
/// When none is healthy every candidate stays eligible, so a lone account
/// can recover on the next attempt.
#[derive(Debug)]
pub struct HealthFiltered {
    inner: Arc<dyn SelectionStrategy>,
    health: Arc<AccountHealth>,
}

impl HealthFiltered {
    /// Wrap a strategy with a health filter
    pub fn new(inner: Arc<dyn SelectionStrategy>, health: Arc<AccountHealth>) -> Self {
        Self { inner, health }
    }
}

impl SelectionStrategy for HealthFiltered {
    fn select(&self, candidates: &[&dyn Selectable]) -> Option<usize> {
        let healthy: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| self.health.status(c.name()) != HealthStatus::Unhealthy)
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            return self.inner.select(candidates);
        }
        let filtered: Vec<&dyn Selectable> = healthy.iter().map(|&i| candidates[i]).collect();
        self.inner.select(&filtered).map(|i| healthy[i])
    }

    fn name(&self) -> &'static str {
        "health_filtered"
    }
}
