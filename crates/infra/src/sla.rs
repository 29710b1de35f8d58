//! SLA breach detection and rolling statistics per job type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use jobforge_core::JobId;
use jobforge_events::QueueEvents;

use crate::keys::KeySpace;
use crate::kv::{KvError, KvStore};

/// Breach records older than this are trimmed.
pub const BREACH_RETENTION_HOURS: i64 = 24;
pub const DEFAULT_DEGRADATION_THRESHOLD_PCT: f64 = 20.0;

#[derive(Debug, thiserror::Error)]
pub enum SlaError {
    #[error(transparent)]
    Store(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaThreshold {
    pub max_duration_ms: u64,
    pub warning_threshold_ms: u64,
}

impl SlaThreshold {
    pub const fn new(max_duration_ms: u64, warning_threshold_ms: u64) -> Self {
        Self {
            max_duration_ms,
            warning_threshold_ms,
        }
    }
}

/// Per-job-type thresholds with a fallback for unconfigured types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlaTable {
    pub fallback: SlaThreshold,
    pub job_types: HashMap<String, SlaThreshold>,
}

impl Default for SlaTable {
    fn default() -> Self {
        let job_types = [
            ("otp.send", SlaThreshold::new(15_000, 12_000)),
            ("email.send", SlaThreshold::new(30_000, 24_000)),
            ("notification.send", SlaThreshold::new(30_000, 24_000)),
            ("ai.content", SlaThreshold::new(300_000, 240_000)),
            ("plugin.hook", SlaThreshold::new(60_000, 48_000)),
            ("workflow.execute", SlaThreshold::new(600_000, 480_000)),
            ("analytics.aggregate", SlaThreshold::new(900_000, 720_000)),
        ]
        .into_iter()
        .map(|(t, s)| (t.to_string(), s))
        .collect();
        Self {
            fallback: SlaThreshold::new(300_000, 240_000),
            job_types,
        }
    }
}

impl SlaTable {
    pub fn threshold(&self, job_type: &str) -> SlaThreshold {
        self.job_types.get(job_type).copied().unwrap_or(self.fallback)
    }

    pub fn with(mut self, job_type: impl Into<String>, threshold: SlaThreshold) -> Self {
        self.job_types.insert(job_type.into(), threshold);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaBreach {
    pub job_id: JobId,
    pub job_type: String,
    pub queue_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub max_duration_ms: u64,
    pub breach_ms: u64,
    pub breach_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaStats {
    pub job_type: String,
    pub hours: u32,
    pub total_jobs: u64,
    pub breaches: u64,
    pub breach_rate_pct: f64,
    pub avg_breach_ms: f64,
    pub max_breach_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaDegradation {
    pub degraded: bool,
    pub breach_rate_pct: f64,
    pub threshold_pct: f64,
    pub stats: SlaStats,
}

pub struct SlaMonitor {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    events: Arc<QueueEvents>,
    table: SlaTable,
}

impl std::fmt::Debug for SlaMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaMonitor")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl SlaMonitor {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace, events: Arc<QueueEvents>, table: SlaTable) -> Self {
        Self {
            kv,
            keys,
            events,
            table,
        }
    }

    pub fn table(&self) -> &SlaTable {
        &self.table
    }

    /// Record one finished run and return the breach if it exceeded its maximum.
    ///
    /// Runs are tracked per job id, so a retried job counts once toward the
    /// totals in [`SlaMonitor::get_sla_stats`].
    pub async fn check_sla(
        &self,
        job_id: JobId,
        job_type: &str,
        queue_name: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<SlaBreach>, SlaError> {
        let threshold = self.table.threshold(job_type);
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let now_ms = finished_at.timestamp_millis() as f64;
        let cutoff_ms = (finished_at - ChronoDuration::hours(BREACH_RETENTION_HOURS)).timestamp_millis() as f64;

        let runs_key = self.keys.sla_runs(job_type);
        self.kv.zadd(&runs_key, now_ms, &job_id.to_string()).await?;
        self.kv.zrem_range_by_score(&runs_key, f64::NEG_INFINITY, cutoff_ms).await?;

        if duration_ms < threshold.max_duration_ms {
            if duration_ms >= threshold.warning_threshold_ms {
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    duration_ms,
                    max_duration_ms = threshold.max_duration_ms,
                    "job approaching SLA limit"
                );
            }
            return Ok(None);
        }

        let breach_ms = duration_ms - threshold.max_duration_ms;
        let breach = SlaBreach {
            job_id,
            job_type: job_type.to_string(),
            queue_name: queue_name.to_string(),
            started_at,
            finished_at,
            duration_ms,
            max_duration_ms: threshold.max_duration_ms,
            breach_ms,
            breach_percentage: if threshold.max_duration_ms == 0 {
                100.0
            } else {
                breach_ms as f64 / threshold.max_duration_ms as f64 * 100.0
            },
        };

        let breaches_key = self.keys.sla_breaches(job_type);
        let encoded = serde_json::to_string(&breach).unwrap_or_default();
        self.kv.zadd(&breaches_key, now_ms, &encoded).await?;
        self.kv
            .zrem_range_by_score(&breaches_key, f64::NEG_INFINITY, cutoff_ms)
            .await?;

        warn!(
            job_id = %job_id,
            job_type = %job_type,
            duration_ms,
            breach_ms,
            "SLA breached"
        );
        self.events
            .sla_breached(job_type, queue_name, job_id, duration_ms, breach_ms);
        Ok(Some(breach))
    }

    /// Breaches recorded in the last `hours`, newest first.
    pub async fn recent_breaches(&self, job_type: &str, hours: u32) -> Result<Vec<SlaBreach>, SlaError> {
        let since = (Utc::now() - ChronoDuration::hours(hours as i64)).timestamp_millis() as f64;
        let members = self
            .kv
            .zrevrange_by_score(&self.keys.sla_breaches(job_type), f64::INFINITY, since, 0, None)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(raw, _)| match serde_json::from_str(&raw) {
                Ok(breach) => Some(breach),
                Err(err) => {
                    debug!(job_type = %job_type, error = %err, "skipping unreadable breach record");
                    None
                }
            })
            .collect())
    }

    pub async fn get_sla_stats(&self, job_type: &str, hours: u32) -> Result<SlaStats, SlaError> {
        let since = (Utc::now() - ChronoDuration::hours(hours as i64)).timestamp_millis() as f64;
        let total_jobs = self
            .kv
            .zcount(&self.keys.sla_runs(job_type), since, f64::INFINITY)
            .await?;
        // The runs set holds one member per job, so breaches are counted per
        // job as well: a job that overran on several attempts keeps only its
        // latest breach here.
        let mut seen = HashSet::new();
        let breaches: Vec<SlaBreach> = self
            .recent_breaches(job_type, hours)
            .await?
            .into_iter()
            .filter(|b| seen.insert(b.job_id))
            .collect();

        let count = breaches.len() as u64;
        let sum: u64 = breaches.iter().map(|b| b.breach_ms).sum();
        // Breaches always come from recorded runs; guard against trimmed run sets.
        let total_jobs = total_jobs.max(count);
        Ok(SlaStats {
            job_type: job_type.to_string(),
            hours,
            total_jobs,
            breaches: count,
            breach_rate_pct: if total_jobs == 0 {
                0.0
            } else {
                count as f64 / total_jobs as f64 * 100.0
            },
            avg_breach_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
            max_breach_ms: breaches.iter().map(|b| b.breach_ms).max().unwrap_or(0),
        })
    }

    pub async fn check_sla_degradation(
        &self,
        job_type: &str,
        hours: u32,
        threshold_pct: f64,
    ) -> Result<SlaDegradation, SlaError> {
        let stats = self.get_sla_stats(job_type, hours).await?;
        let degraded = stats.total_jobs > 0 && stats.breach_rate_pct >= threshold_pct;
        if degraded {
            warn!(
                job_type = %job_type,
                breach_rate_pct = stats.breach_rate_pct,
                threshold_pct,
                "SLA degradation detected"
            );
        }
        Ok(SlaDegradation {
            degraded,
            breach_rate_pct: stats.breach_rate_pct,
            threshold_pct,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use jobforge_events::{InMemoryEventBus, QueueEventType};

    fn monitor() -> (SlaMonitor, Arc<QueueEvents>) {
        let events = Arc::new(QueueEvents::new(Arc::new(InMemoryEventBus::new())));
        let monitor = SlaMonitor::new(
            Arc::new(InMemoryKvStore::new()),
            KeySpace::new("test"),
            events.clone(),
            SlaTable::default(),
        );
        (monitor, events)
    }

    async fn run(monitor: &SlaMonitor, job_type: &str, duration_ms: i64) -> Option<SlaBreach> {
        let finished = Utc::now();
        let started = finished - ChronoDuration::milliseconds(duration_ms);
        monitor
            .check_sla(JobId::new(), job_type, "test:queue:x", started, finished)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn breach_records_overrun() {
        let (monitor, events) = monitor();
        let breach = run(&monitor, "email.send", 45_000).await.unwrap();
        assert_eq!(breach.max_duration_ms, 30_000);
        assert_eq!(breach.breach_ms, 15_000);
        assert_eq!(breach.breach_percentage, 50.0);

        let kinds: Vec<_> = events.recent(None, 10).into_iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, [QueueEventType::SlaBreached]);
    }

    #[tokio::test]
    async fn warning_zone_and_fast_runs_are_not_breaches() {
        let (monitor, _) = monitor();
        assert!(run(&monitor, "email.send", 25_000).await.is_none());
        assert!(run(&monitor, "email.send", 1_000).await.is_none());
        assert!(monitor.recent_breaches("email.send", 24).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_types_use_fallback() {
        let (monitor, _) = monitor();
        assert!(run(&monitor, "custom.job", 299_000).await.is_none());
        assert!(run(&monitor, "custom.job", 300_000).await.is_some());
    }

    #[tokio::test]
    async fn stats_use_true_run_counts() {
        let (monitor, _) = monitor();
        for _ in 0..8 {
            run(&monitor, "otp.send", 1_000).await;
        }
        run(&monitor, "otp.send", 20_000).await;
        run(&monitor, "otp.send", 25_000).await;

        let stats = monitor.get_sla_stats("otp.send", 1).await.unwrap();
        assert_eq!(stats.total_jobs, 10);
        assert_eq!(stats.breaches, 2);
        assert_eq!(stats.breach_rate_pct, 20.0);
        assert_eq!(stats.max_breach_ms, 10_000);
        assert_eq!(stats.avg_breach_ms, 7_500.0);

        let degradation = monitor
            .check_sla_degradation("otp.send", 1, DEFAULT_DEGRADATION_THRESHOLD_PCT)
            .await
            .unwrap();
        assert!(degradation.degraded);

        let calm = monitor.check_sla_degradation("otp.send", 1, 50.0).await.unwrap();
        assert!(!calm.degraded);
    }

    #[tokio::test]
    async fn retried_breaches_count_once_per_job() {
        let (monitor, _) = monitor();
        let job_id = JobId::new();
        let now = Utc::now();
        for (ago_ms, duration_ms) in [(2_000, 20_000), (1_000, 22_000), (0, 18_000)] {
            let finished = now - ChronoDuration::milliseconds(ago_ms);
            let started = finished - ChronoDuration::milliseconds(duration_ms);
            monitor
                .check_sla(job_id, "otp.send", "test:queue:x", started, finished)
                .await
                .unwrap()
                .unwrap();
        }
        run(&monitor, "otp.send", 1_000).await;
        run(&monitor, "otp.send", 2_000).await;

        assert_eq!(monitor.recent_breaches("otp.send", 1).await.unwrap().len(), 3);

        let stats = monitor.get_sla_stats("otp.send", 1).await.unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.breaches, 1);
        assert!((stats.breach_rate_pct - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.max_breach_ms, 3_000);
    }

    #[tokio::test]
    async fn empty_history_is_not_degraded() {
        let (monitor, _) = monitor();
        let d = monitor.check_sla_degradation("ai.content", 24, 20.0).await.unwrap();
        assert!(!d.degraded);
        assert_eq!(d.stats.total_jobs, 0);
    }
}
