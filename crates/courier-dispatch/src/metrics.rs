use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::Channel;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

/// Terminal outcome of one processing pass over a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    RateLimited,
}

/// One rate-limit exceedance, kept in a bounded ring per tenant/channel.
#[derive(Debug, Clone, Serialize)]
pub struct ExceedanceRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricsKey {
    tenant_id: String,
    channel: Channel,
}

struct TenantChannelMetrics {
    success: AtomicU64,
    failure: AtomicU64,
    rate_limited: AtomicU64,
    last_exceeded_at: RwLock<Option<DateTime<Utc>>>,
    exceedances: RwLock<VecDeque<ExceedanceRecord>>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl TenantChannelMetrics {
    fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            last_exceeded_at: RwLock::new(None),
            exceedances: RwLock::new(VecDeque::new()),
            last_activity: RwLock::new(Utc::now()),
        }
    }
}

/// Per-tenant delivery counters for one channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantChannelSnapshot {
    pub tenant_id: String,
    pub channel: Channel,
    pub total_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rate_limit_exceeded_count: u64,
    pub success_rate: f64,
    pub last_exceeded_at: Option<DateTime<Utc>>,
    pub recent_exceedances: Vec<ExceedanceRecord>,
}

/// Channel-level rollup across all tenants.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAggregate {
    pub channel: Channel,
    pub total_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rate_limit_exceeded_count: u64,
    pub success_rate: f64,
    /// Tenants ranked by exceedance count, worst first.
    pub tenants_by_exceedance: Vec<(String, u64)>,
}

/// Bounded in-process metrics registry.
///
/// Every dimension is capped: the exceedance ring holds at most
/// `detail_capacity` records per tenant/channel, and tenants idle past
/// the retention horizon are swept. Memory use stays proportional to
/// active tenants regardless of uptime.
pub struct MetricsRegistry {
    detail_capacity: usize,
    entries: DashMap<MetricsKey, Arc<TenantChannelMetrics>>,
}

impl MetricsRegistry {
    pub fn new(detail_capacity: usize) -> Self {
        Self {
            detail_capacity: detail_capacity.max(1),
            entries: DashMap::new(),
        }
    }

    /// Record one job outcome. Also feeds the process-wide metrics
    /// recorder so an exporter can pick the counters up.
    pub fn record(
        &self,
        tenant_id: &str,
        channel: Channel,
        outcome: Outcome,
        detail: Option<&str>,
    ) {
        let entry = self
            .entries
            .entry(MetricsKey {
                tenant_id: tenant_id.to_string(),
                channel,
            })
            .or_insert_with(|| Arc::new(TenantChannelMetrics::new()))
            .clone();

        let now = Utc::now();
        *entry.last_activity.write() = now;

        match outcome {
            Outcome::Success => {
                entry.success.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("courier_jobs_success_total", "channel" => channel.as_str())
                    .increment(1);
            }
            Outcome::Failure => {
                entry.failure.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("courier_jobs_failure_total", "channel" => channel.as_str())
                    .increment(1);
            }
            Outcome::RateLimited => {
                entry.rate_limited.fetch_add(1, Ordering::Relaxed);
                *entry.last_exceeded_at.write() = Some(now);
                let mut ring = entry.exceedances.write();
                if ring.len() >= self.detail_capacity {
                    ring.pop_front();
                }
                ring.push_back(ExceedanceRecord {
                    at: now,
                    message: detail.unwrap_or("rate limit exceeded").to_string(),
                });
                metrics::counter!("courier_jobs_rate_limited_total", "channel" => channel.as_str())
                    .increment(1);
            }
        }
    }

    fn snapshot(&self, key: &MetricsKey, entry: &TenantChannelMetrics) -> TenantChannelSnapshot {
        let success = entry.success.load(Ordering::Relaxed);
        let failure = entry.failure.load(Ordering::Relaxed);
        let rate_limited = entry.rate_limited.load(Ordering::Relaxed);
        let total = success + failure + rate_limited;
        TenantChannelSnapshot {
            tenant_id: key.tenant_id.clone(),
            channel: key.channel,
            total_processed: total,
            success_count: success,
            failure_count: failure,
            rate_limit_exceeded_count: rate_limited,
            success_rate: if total == 0 {
                1.0
            } else {
                success as f64 / total as f64
            },
            last_exceeded_at: *entry.last_exceeded_at.read(),
            recent_exceedances: entry.exceedances.read().iter().cloned().collect(),
        }
    }

    /// All counters for one tenant, one snapshot per active channel.
    pub fn tenant_report(&self, tenant_id: &str) -> Vec<TenantChannelSnapshot> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().tenant_id == tenant_id)
            .map(|e| self.snapshot(e.key(), e.value()))
            .collect();
        out.sort_by_key(|s| s.channel.as_str());
        out
    }

    /// Cross-tenant rollup per channel.
    pub fn report(&self) -> Vec<ChannelAggregate> {
        let mut per_channel: HashMap<Channel, ChannelAggregate> = HashMap::new();
        for entry in self.entries.iter() {
            let snap = self.snapshot(entry.key(), entry.value());
            let agg = per_channel
                .entry(snap.channel)
                .or_insert_with(|| ChannelAggregate {
                    channel: snap.channel,
                    total_processed: 0,
                    success_count: 0,
                    failure_count: 0,
                    rate_limit_exceeded_count: 0,
                    success_rate: 1.0,
                    tenants_by_exceedance: Vec::new(),
                });
            agg.total_processed += snap.total_processed;
            agg.success_count += snap.success_count;
            agg.failure_count += snap.failure_count;
            agg.rate_limit_exceeded_count += snap.rate_limit_exceeded_count;
            if snap.rate_limit_exceeded_count > 0 {
                agg.tenants_by_exceedance
                    .push((snap.tenant_id, snap.rate_limit_exceeded_count));
            }
        }
        let mut out: Vec<_> = per_channel
            .into_values()
            .map(|mut agg| {
                agg.success_rate = if agg.total_processed == 0 {
                    1.0
                } else {
                    agg.success_count as f64 / agg.total_processed as f64
                };
                agg.tenants_by_exceedance.sort_by(|a, b| b.1.cmp(&a.1));
                agg
            })
            .collect();
        out.sort_by_key(|a| a.channel.as_str());
        out
    }

    /// Zero counters and clear exceedance rings. `None` matches everything.
    pub fn reset(&self, tenant_id: Option<&str>, channel: Option<Channel>) -> usize {
        let mut reset_count = 0;
        for entry in self.entries.iter() {
            let key = entry.key();
            if tenant_id.is_some_and(|t| t != key.tenant_id) {
                continue;
            }
            if channel.is_some_and(|c| c != key.channel) {
                continue;
            }
            let m = entry.value();
            m.success.store(0, Ordering::Relaxed);
            m.failure.store(0, Ordering::Relaxed);
            m.rate_limited.store(0, Ordering::Relaxed);
            *m.last_exceeded_at.write() = None;
            m.exceedances.write().clear();
            reset_count += 1;
        }
        reset_count
    }

    /// Evict tenant/channel entries idle past the retention horizon.
    /// Evictions are counted inside the retain pass; `record` inserts
    /// entries concurrently, so two length reads would not agree.
    pub fn sweep(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::hours(24));
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let keep = *entry.last_activity.read() >= cutoff;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            metrics::gauge!("courier_metrics_tracked_tenants").set(self.entries.len() as f64);
        }
        evicted
    }

    pub fn tracked_entries(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_tenant_and_channel() {
        let reg = MetricsRegistry::new(50);
        reg.record("t1", Channel::Sms, Outcome::Success, None);
        reg.record("t1", Channel::Sms, Outcome::Success, None);
        reg.record("t1", Channel::Sms, Outcome::Failure, Some("boom"));
        reg.record("t1", Channel::Email, Outcome::Success, None);
        reg.record("t2", Channel::Sms, Outcome::Success, None);

        let report = reg.tenant_report("t1");
        assert_eq!(report.len(), 2);
        let sms = report.iter().find(|s| s.channel == Channel::Sms).unwrap();
        assert_eq!(sms.total_processed, 3);
        assert_eq!(sms.success_count, 2);
        assert_eq!(sms.failure_count, 1);
        assert!((sms.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn exceedance_ring_is_bounded() {
        let reg = MetricsRegistry::new(5);
        for i in 0..12 {
            reg.record("t1", Channel::Sms, Outcome::RateLimited, Some(&format!("e{}", i)));
        }
        let report = reg.tenant_report("t1");
        let sms = &report[0];
        assert_eq!(sms.rate_limit_exceeded_count, 12);
        assert_eq!(sms.recent_exceedances.len(), 5);
        // Oldest entries were evicted first
        assert_eq!(sms.recent_exceedances[0].message, "e7");
        assert_eq!(sms.recent_exceedances[4].message, "e11");
        assert!(sms.last_exceeded_at.is_some());
    }

    #[test]
    fn report_rolls_up_and_ranks_tenants() {
        let reg = MetricsRegistry::new(50);
        reg.record("t1", Channel::Sms, Outcome::RateLimited, None);
        reg.record("t2", Channel::Sms, Outcome::RateLimited, None);
        reg.record("t2", Channel::Sms, Outcome::RateLimited, None);
        reg.record("t1", Channel::Sms, Outcome::Success, None);

        let report = reg.report();
        let sms = report.iter().find(|a| a.channel == Channel::Sms).unwrap();
        assert_eq!(sms.total_processed, 4);
        assert_eq!(sms.rate_limit_exceeded_count, 3);
        assert_eq!(sms.tenants_by_exceedance[0], ("t2".to_string(), 2));
        assert_eq!(sms.tenants_by_exceedance[1], ("t1".to_string(), 1));
    }

    #[test]
    fn reset_is_scoped() {
        let reg = MetricsRegistry::new(50);
        reg.record("t1", Channel::Sms, Outcome::Success, None);
        reg.record("t1", Channel::Email, Outcome::Success, None);
        reg.record("t2", Channel::Sms, Outcome::Success, None);

        assert_eq!(reg.reset(Some("t1"), Some(Channel::Sms)), 1);
        let t1 = reg.tenant_report("t1");
        let sms = t1.iter().find(|s| s.channel == Channel::Sms).unwrap();
        let email = t1.iter().find(|s| s.channel == Channel::Email).unwrap();
        assert_eq!(sms.success_count, 0);
        assert_eq!(email.success_count, 1);
        assert_eq!(reg.tenant_report("t2")[0].success_count, 1);

        assert_eq!(reg.reset(None, None), 3);
        assert_eq!(reg.tenant_report("t2")[0].success_count, 0);
    }

    #[test]
    fn sweep_count_is_consistent_under_concurrent_records() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let reg = Arc::new(MetricsRegistry::new(50));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let reg = reg.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    reg.record(&format!("t{}", i), Channel::Sms, Outcome::Success, None);
                    i += 1;
                }
            })
        };

        // Every entry is fresh, so each sweep must report zero even as
        // new tenants land mid-pass.
        for _ in 0..500 {
            assert_eq!(reg.sweep(Duration::from_secs(60)), 0);
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn sweep_evicts_only_idle_entries() {
        let reg = MetricsRegistry::new(50);
        reg.record("t1", Channel::Sms, Outcome::Success, None);
        std::thread::sleep(Duration::from_millis(30));
        reg.record("t2", Channel::Sms, Outcome::Success, None);

        let evicted = reg.sweep(Duration::from_millis(20));
        assert_eq!(evicted, 1);
        assert!(reg.tenant_report("t1").is_empty());
        assert_eq!(reg.tenant_report("t2").len(), 1);
    }
}
