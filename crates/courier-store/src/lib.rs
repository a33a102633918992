use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::Job;

pub mod error;
pub mod memory;

pub use error::StoreError;
pub use memory::MemoryJobStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// A job claimed from the store. The receipt handle is the claim token:
/// every acknowledgment path takes it, and it is invalidated when the
/// visibility timeout expires and another worker reclaims the job.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub receipt_handle: String,
}

/// Store depth counters for health reporting
#[derive(Debug, Clone, Default)]
pub struct StoreDepth {
    pub pending: u64,
    pub in_flight: u64,
    pub dead: u64,
}

/// Time-ordered durable storage for pending jobs.
///
/// The production store is an external collaborator; the engine only
/// requires these operations. Claims are visibility-timeout based: a
/// claimed-but-unacknowledged job automatically returns to pending after
/// the timeout, with `attempts` unchanged.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Unique identifier for this store instance
    fn identifier(&self) -> &str;

    /// Enqueue a job in pending state. Idempotent on job id.
    async fn enqueue(&self, job: Job) -> Result<String>;

    /// Atomically claim up to `limit` jobs whose due time has passed, in
    /// non-decreasing due order. No two claimants ever hold the same job.
    async fn claim_due(&self, limit: usize) -> Result<Vec<ClaimedJob>>;

    /// Acknowledge completion; removes the job.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Failure retry: increment `attempts`, record the error, and make the
    /// job claimable again at `new_due_at` (state `Failed` until then).
    async fn nack(&self, receipt_handle: &str, new_due_at: DateTime<Utc>, error: &str) -> Result<()>;

    /// Throttle reschedule: return the job to pending at `new_due_at`
    /// WITHOUT touching `attempts`. Not counted as a failure.
    async fn defer(&self, receipt_handle: &str, new_due_at: DateTime<Utc>) -> Result<()>;

    /// Terminal failure: count the final attempt and mark the job dead.
    /// Dead jobs are retained for inspection but never re-claimed.
    async fn bury(&self, receipt_handle: &str, error: &str) -> Result<()>;

    /// Pending / in-flight / dead counts
    async fn depth(&self) -> Result<StoreDepth>;

    /// Check if the store is reachable and accepting operations
    fn is_healthy(&self) -> bool;

    /// Stop the store; subsequent operations fail with `Stopped`.
    async fn stop(&self);
}
