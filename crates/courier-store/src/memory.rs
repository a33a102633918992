//! In-memory job store with visibility-timeout claim semantics.
//!
//! Mimics the claim/ack behavior of a broker-backed queue for development
//! and testing: claiming a job stamps a fresh receipt handle and a
//! visibility deadline; a job whose deadline passes without an ack becomes
//! claimable again with its attempt count untouched.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use async_trait::async_trait;
use courier_common::{Job, JobState};

use crate::{ClaimedJob, JobStore, Result, StoreDepth, StoreError};

struct StoredJob {
    job: Job,
    /// Claim token; `None` while the job is pending
    receipt_handle: Option<String>,
    /// When a claimed job becomes visible (reclaimable) again
    visible_at: DateTime<Utc>,
}

pub struct MemoryJobStore {
    name: String,
    visibility_timeout: Duration,
    jobs: Mutex<HashMap<String, StoredJob>>,
    dead: Mutex<Vec<Job>>,
    running: AtomicBool,
}

impl MemoryJobStore {
    pub fn new(name: impl Into<String>, visibility_timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::milliseconds(visibility_timeout_ms as i64),
            jobs: Mutex::new(HashMap::new()),
            dead: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Stopped)
        }
    }

    fn generate_receipt_handle() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Dead jobs retained for inspection
    pub fn dead_jobs(&self) -> Vec<Job> {
        self.dead.lock().clone()
    }

    /// Look up a job by id (pending or in-flight)
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().get(job_id).map(|s| s.job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: Job) -> Result<String> {
        self.check_running()?;
        let mut jobs = self.jobs.lock();

        // Idempotent on job id
        if jobs.contains_key(&job.id) {
            debug!(job_id = %job.id, store = %self.name, "Duplicate job, skipping enqueue");
            return Ok(job.id);
        }

        let id = job.id.clone();
        debug!(
            job_id = %id,
            tenant_id = %job.tenant_id,
            channel = %job.channel(),
            due_at = %job.due_at,
            "Job enqueued"
        );
        jobs.insert(
            id.clone(),
            StoredJob {
                job,
                receipt_handle: None,
                visible_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<ClaimedJob>> {
        self.check_running()?;
        let now = Utc::now();
        let mut jobs = self.jobs.lock();

        // A job is claimable when its due time has passed AND it is either
        // unclaimed or its previous claim's visibility window has expired.
        let mut eligible: Vec<&String> = jobs
            .iter()
            .filter(|(_, s)| s.job.due_at <= now && s.visible_at <= now)
            .map(|(id, _)| id)
            .collect();
        eligible.sort_by(|a, b| {
            let (ja, jb) = (&jobs[*a].job, &jobs[*b].job);
            ja.due_at
                .cmp(&jb.due_at)
                .then_with(|| ja.created_at.cmp(&jb.created_at))
        });

        let ids: Vec<String> = eligible.into_iter().take(limit).cloned().collect();
        let mut claimed = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(stored) = jobs.get_mut(&id) else {
                continue;
            };
            if stored.receipt_handle.is_some() {
                warn!(
                    job_id = %id,
                    store = %self.name,
                    "Reclaiming job whose visibility timeout expired"
                );
            }
            let receipt_handle = Self::generate_receipt_handle();
            stored.receipt_handle = Some(receipt_handle.clone());
            stored.visible_at = now + self.visibility_timeout;
            stored.job.state = JobState::InFlight;
            claimed.push(ClaimedJob {
                job: stored.job.clone(),
                receipt_handle,
            });
        }

        if !claimed.is_empty() {
            debug!(store = %self.name, count = claimed.len(), "Claimed due jobs");
        }
        Ok(claimed)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.check_running()?;
        let mut jobs = self.jobs.lock();

        let id = find_by_receipt(&jobs, receipt_handle)
            .ok_or_else(|| StoreError::NotFound(receipt_handle.to_string()))?;
        jobs.remove(&id);
        debug!(job_id = %id, store = %self.name, "Job acknowledged");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, new_due_at: DateTime<Utc>, error: &str) -> Result<()> {
        self.check_running()?;
        let mut jobs = self.jobs.lock();

        let stored = jobs
            .values_mut()
            .find(|s| s.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| StoreError::NotFound(receipt_handle.to_string()))?;
        stored.job.attempts += 1;
        stored.job.last_error = Some(error.to_string());
        stored.job.due_at = new_due_at;
        // Failed marks a job awaiting a retry; it becomes InFlight again
        // on its next claim.
        stored.job.state = JobState::Failed;
        stored.receipt_handle = None;
        stored.visible_at = Utc::now();
        debug!(
            job_id = %stored.job.id,
            store = %self.name,
            attempts = stored.job.attempts,
            new_due_at = %new_due_at,
            "Job returned to pending for retry"
        );
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, new_due_at: DateTime<Utc>) -> Result<()> {
        self.check_running()?;
        let mut jobs = self.jobs.lock();

        let stored = jobs
            .values_mut()
            .find(|s| s.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| StoreError::NotFound(receipt_handle.to_string()))?;
        stored.job.due_at = new_due_at;
        stored.job.state = JobState::Pending;
        stored.receipt_handle = None;
        stored.visible_at = Utc::now();
        debug!(job_id = %stored.job.id, store = %self.name, new_due_at = %new_due_at, "Job deferred");
        Ok(())
    }

    async fn bury(&self, receipt_handle: &str, error: &str) -> Result<()> {
        self.check_running()?;
        let mut jobs = self.jobs.lock();

        let id = find_by_receipt(&jobs, receipt_handle)
            .ok_or_else(|| StoreError::NotFound(receipt_handle.to_string()))?;
        let mut stored = jobs
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(receipt_handle.to_string()))?;
        // The burying attempt counts; `attempts` reflects attempts made.
        stored.job.attempts += 1;
        stored.job.state = JobState::Dead;
        stored.job.last_error = Some(error.to_string());
        warn!(job_id = %id, store = %self.name, error = %error, "Job buried");
        self.dead.lock().push(stored.job);
        Ok(())
    }

    async fn depth(&self) -> Result<StoreDepth> {
        let now = Utc::now();
        let jobs = self.jobs.lock();
        let mut depth = StoreDepth {
            dead: self.dead.lock().len() as u64,
            ..StoreDepth::default()
        };
        for stored in jobs.values() {
            if stored.receipt_handle.is_some() && stored.visible_at > now {
                depth.in_flight += 1;
            } else {
                depth.pending += 1;
            }
        }
        Ok(depth)
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(store = %self.name, "Memory job store stopped");
    }
}

fn find_by_receipt(jobs: &HashMap<String, StoredJob>, receipt_handle: &str) -> Option<String> {
    jobs.iter()
        .find(|(_, s)| s.receipt_handle.as_deref() == Some(receipt_handle))
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::{JobKind, JobPayload, SmsPayload};
    use std::sync::Arc;

    fn test_job(id: &str, tenant: &str, due_at: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            kind: JobKind::ImmediateSms,
            payload: JobPayload::Sms(SmsPayload {
                phone_number: "+15551234567".to_string(),
                message: "hello".to_string(),
                contact_id: "contact-1".to_string(),
                media_url: None,
                metadata: None,
            }),
            due_at,
            attempts: 0,
            max_attempts: 3,
            state: JobState::Pending,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_claim_ack() {
        let store = MemoryJobStore::new("test", 30_000);

        store.enqueue(test_job("j-1", "t-1", Utc::now())).await.unwrap();

        let claimed = store.claim_due(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, "j-1");
        assert_eq!(claimed[0].job.state, JobState::InFlight);

        // Claimed job is invisible to further claims
        assert!(store.claim_due(10).await.unwrap().is_empty());

        store.ack(&claimed[0].receipt_handle).await.unwrap();
        assert!(store.claim_due(10).await.unwrap().is_empty());
        assert_eq!(store.depth().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_future_jobs_not_claimable() {
        let store = MemoryJobStore::new("test", 30_000);
        store
            .enqueue(test_job("j-1", "t-1", Utc::now() + Duration::seconds(60)))
            .await
            .unwrap();

        assert!(store.claim_due(10).await.unwrap().is_empty());
        assert_eq!(store.depth().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_claims_come_out_in_due_order() {
        let store = MemoryJobStore::new("test", 30_000);
        let now = Utc::now();
        store.enqueue(test_job("late", "t", now - Duration::seconds(1))).await.unwrap();
        store.enqueue(test_job("early", "t", now - Duration::seconds(10))).await.unwrap();
        store.enqueue(test_job("mid", "t", now - Duration::seconds(5))).await.unwrap();

        let claimed = store.claim_due(10).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|c| c.job.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_nack_increments_attempts_and_reschedules() {
        let store = MemoryJobStore::new("test", 30_000);
        store.enqueue(test_job("j-1", "t-1", Utc::now())).await.unwrap();

        let claimed = store.claim_due(1).await.unwrap();
        let new_due = Utc::now() + Duration::seconds(30);
        store
            .nack(&claimed[0].receipt_handle, new_due, "sender timeout")
            .await
            .unwrap();

        let job = store.get("j-1").unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.due_at, new_due);
        assert_eq!(job.last_error.as_deref(), Some("sender timeout"));

        // Not claimable until the new due time
        assert!(store.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_defer_does_not_touch_attempts() {
        let store = MemoryJobStore::new("test", 30_000);
        store.enqueue(test_job("j-1", "t-1", Utc::now())).await.unwrap();

        let claimed = store.claim_due(1).await.unwrap();
        store
            .defer(&claimed[0].receipt_handle, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();

        let job = store.get("j-1").unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_bury_is_terminal() {
        let store = MemoryJobStore::new("test", 30_000);
        store.enqueue(test_job("j-1", "t-1", Utc::now())).await.unwrap();

        let claimed = store.claim_due(1).await.unwrap();
        store.bury(&claimed[0].receipt_handle, "invalid recipient").await.unwrap();

        assert!(store.claim_due(10).await.unwrap().is_empty());
        let dead = store.dead_jobs();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].state, JobState::Dead);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("invalid recipient"));
        assert_eq!(store.depth().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_visibility_timeout_reclaim_keeps_attempts() {
        // 50ms visibility timeout simulates a worker crash before ack
        let store = MemoryJobStore::new("test", 50);
        store.enqueue(test_job("j-1", "t-1", Utc::now())).await.unwrap();

        let first = store.claim_due(1).await.unwrap();
        assert_eq!(first.len(), 1);

        // Before the timeout expires, nothing is claimable
        assert!(store.claim_due(10).await.unwrap().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let second = store.claim_due(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].job.id, "j-1");
        // Crash recovery does not count as an attempt
        assert_eq!(second[0].job.attempts, 0);

        // The original receipt is now stale
        assert!(matches!(
            store.ack(&first[0].receipt_handle).await,
            Err(StoreError::NotFound(_))
        ));
        // The new owner can still ack
        store.ack(&second[0].receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_idempotent() {
        let store = MemoryJobStore::new("test", 30_000);
        let job = test_job("dup", "t-1", Utc::now());
        store.enqueue(job.clone()).await.unwrap();
        store.enqueue(job).await.unwrap();

        assert_eq!(store.claim_due(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let store = Arc::new(MemoryJobStore::new("test", 30_000));
        for i in 0..20 {
            store
                .enqueue(test_job(&format!("j-{}", i), "t-1", Utc::now()))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_due(20).await.unwrap() }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for claim in handle.await.unwrap() {
                assert!(seen.insert(claim.job.id.clone()), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_stopped_store_rejects_operations() {
        let store = MemoryJobStore::new("test", 30_000);
        store.stop().await;
        assert!(matches!(
            store.enqueue(test_job("j", "t", Utc::now())).await,
            Err(StoreError::Stopped)
        ));
        assert!(!store.is_healthy());
    }
}
