//! Send metrics.

use super::{ComponentHealth, HealthStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One completed send
#[derive(Debug, Clone, PartialEq)]
pub struct SendRecord {
    /// Provider family
    pub provider_type: String,
    /// Selected account, empty if selection failed
    pub account_name: String,
    /// Message subtype
    pub sub_type: String,
    /// HTTP or SMTP status, 0 if none was observed
    pub status_code: u16,
    /// Duration including middleware waits
    pub duration_ms: u64,
    /// Whether the send succeeded
    pub success: bool,
    /// Error kind for failures
    pub error_kind: Option<&'static str>,
}

/// Receiver of send records.
///
/// Calls are serialized by the sender, so implementations only need to be
/// safe for a single writer at a time.
pub trait MetricsSink: Send + Sync {
    /// Record one send
    fn record(&self, record: &SendRecord);

    /// Optional health report
    fn health(&self) -> Option<ComponentHealth> {
        None
    }
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _record: &SendRecord) {}
}

/// In-memory counters keyed by provider type
#[derive(Debug, Default)]
pub struct MetricsCollector {
    send_counts: RwLock<HashMap<String, AtomicU64>>,
    error_counts: RwLock<HashMap<String, AtomicU64>>,
    error_kinds: RwLock<HashMap<&'static str, AtomicU64>>,
    latencies: RwLock<HashMap<String, LatencyHistogram>>,
    account_counts: RwLock<HashMap<String, AtomicU64>>,
}

fn bump<K>(map: &RwLock<HashMap<K, AtomicU64>>, key: K)
where
    K: std::hash::Hash + Eq,
{
    if let Some(counter) = map.read().get(&key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.write()
        .entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn load<K, Q>(map: &RwLock<HashMap<K, AtomicU64>>, key: &Q) -> u64
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    map.read()
        .get(key)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

impl MetricsCollector {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Total sends for a provider type
    pub fn send_count(&self, provider_type: &str) -> u64 {
        load(&self.send_counts, provider_type)
    }

    /// Failed sends for a provider type
    pub fn error_count(&self, provider_type: &str) -> u64 {
        load(&self.error_counts, provider_type)
    }

    /// Failures of a given error kind across providers
    pub fn error_kind_count(&self, kind: &str) -> u64 {
        load(&self.error_kinds, kind)
    }

    /// Sends handled by an account
    pub fn account_count(&self, account: &str) -> u64 {
        load(&self.account_counts, account)
    }

    /// Error rate for a provider type
    pub fn error_rate(&self, provider_type: &str) -> f64 {
        let sends = self.send_count(provider_type);
        if sends == 0 {
            0.0
        } else {
            self.error_count(provider_type) as f64 / sends as f64
        }
    }

    /// Latency stats for a provider type
    pub fn latency_stats(&self, provider_type: &str) -> Option<LatencyStats> {
        self.latencies.read().get(provider_type).map(|h| h.stats())
    }

    /// Snapshot all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sends = self.send_counts.read();
        let latencies = self.latencies.read();

        let providers = sends
            .iter()
            .map(|(provider, count)| {
                (
                    provider.clone(),
                    ProviderMetrics {
                        send_count: count.load(Ordering::Relaxed),
                        error_count: self.error_count(provider),
                        latency_stats: latencies.get(provider).map(|h| h.stats()),
                    },
                )
            })
            .collect();

        MetricsSnapshot { providers }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.send_counts.write().clear();
        self.error_counts.write().clear();
        self.error_kinds.write().clear();
        self.latencies.write().clear();
        self.account_counts.write().clear();
    }
}

impl MetricsSink for MetricsCollector {
    fn record(&self, record: &SendRecord) {
        bump(&self.send_counts, record.provider_type.clone());
        if !record.account_name.is_empty() {
            bump(&self.account_counts, record.account_name.clone());
        }
        if !record.success {
            bump(&self.error_counts, record.provider_type.clone());
            if let Some(kind) = record.error_kind {
                bump(&self.error_kinds, kind);
            }
        }

        self.latencies
            .write()
            .entry(record.provider_type.clone())
            .or_default()
            .record(record.duration_ms);
    }

    fn health(&self) -> Option<ComponentHealth> {
        let providers: Vec<String> = self.send_counts.read().keys().cloned().collect();
        let degraded: Vec<String> = providers
            .into_iter()
            .filter(|p| sends_are_failing(self, p))
            .collect();
        if degraded.is_empty() {
            Some(ComponentHealth::healthy("metrics"))
        } else {
            Some(ComponentHealth::with_status(
                "metrics",
                HealthStatus::Degraded,
                format!("high error rate: {:?}", degraded),
            ))
        }
    }
}

fn sends_are_failing(metrics: &MetricsCollector, provider: &str) -> bool {
    metrics.send_count(provider) >= 10 && metrics.error_rate(provider) > 0.5
}

/// Latency histogram using buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    /// 0-100ms, 100-500ms, 500ms-1s, 1-5s, 5s+
    buckets: [AtomicU64; 5],
}

impl LatencyHistogram {
    /// Create a new histogram
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    /// Record a latency value
    pub fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.min.fetch_min(ms, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);

        let bucket_idx = match ms {
            0..=100 => 0,
            101..=500 => 1,
            501..=1000 => 2,
            1001..=5000 => 3,
            _ => 4,
        };
        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics
    pub fn stats(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        LatencyStats {
            count,
            sum_ms: sum,
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max.load(Ordering::Relaxed),
            avg_ms: if count > 0 { sum / count } else { 0 },
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics
#[derive(Debug, Clone)]
pub struct LatencyStats {
    /// Sample count
    pub count: u64,
    /// Total in milliseconds
    pub sum_ms: u64,
    /// Minimum latency
    pub min_ms: u64,
    /// Maximum latency
    pub max_ms: u64,
    /// Average latency
    pub avg_ms: u64,
    /// Bucket counts [0-100ms, 100-500ms, 500ms-1s, 1-5s, 5s+]
    pub buckets: [u64; 5],
}

/// Per-provider metrics
#[derive(Debug, Clone)]
pub struct ProviderMetrics {
    /// Sends attempted
    pub send_count: u64,
    /// Sends failed
    pub error_count: u64,
    /// Latency stats
    pub latency_stats: Option<LatencyStats>,
}

/// Complete metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Per-provider metrics
    pub providers: HashMap<String, ProviderMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, success: bool, ms: u64) -> SendRecord {
        SendRecord {
            provider_type: provider.to_string(),
            account_name: "primary".to_string(),
            sub_type: String::new(),
            status_code: if success { 200 } else { 500 },
            duration_ms: ms,
            success,
            error_kind: if success { None } else { Some("http") },
        }
    }

    #[test]
    fn test_metrics_collector() {
        let metrics = MetricsCollector::new();
        metrics.record(&record("sms", true, 50));
        metrics.record(&record("sms", false, 700));

        assert_eq!(metrics.send_count("sms"), 2);
        assert_eq!(metrics.error_count("sms"), 1);
        assert_eq!(metrics.error_kind_count("http"), 1);
        assert_eq!(metrics.account_count("primary"), 2);
        assert_eq!(metrics.error_rate("sms"), 0.5);
        assert_eq!(metrics.send_count("webhook"), 0);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = MetricsCollector::new();
        metrics.record(&record("lark", true, 10));

        let snapshot = metrics.snapshot();
        let lark = &snapshot.providers["lark"];
        assert_eq!(lark.send_count, 1);
        assert_eq!(lark.latency_stats.as_ref().map(|s| s.count), Some(1));

        metrics.reset();
        assert!(metrics.snapshot().providers.is_empty());
    }

    #[test]
    fn test_health_degrades_on_errors() {
        let metrics = MetricsCollector::new();
        for _ in 0..10 {
            metrics.record(&record("sms", false, 10));
        }
        assert_eq!(metrics.health().map(|h| h.status), Some(HealthStatus::Degraded));
    }

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();
        histogram.record(5);
        histogram.record(250);
        histogram.record(6000);

        let stats = histogram.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 5);
        assert_eq!(stats.max_ms, 6000);
        assert_eq!(stats.buckets, [1, 1, 0, 0, 1]);
    }
}
