use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use courier_common::Channel;
use courier_config::ChannelsConfig;
use courier_store::{ClaimedJob, JobStore};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::limiter::SlidingWindowLimiter;
use crate::metrics::{MetricsRegistry, Outcome};
use crate::retry::{RetryAction, RetryPolicy};
use crate::sender::{SendErrorKind, SenderRegistry};

/// Bounded worker pool, one concurrency budget per channel.
///
/// Each submitted batch takes one permit for its channel and processes
/// its jobs in order. Every job leaves a worker through exactly one
/// settlement path: ack on success, defer on throttle, nack with
/// backoff on a retryable failure, bury otherwise.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    senders: SenderRegistry,
    limiter: Arc<SlidingWindowLimiter>,
    registry: Arc<MetricsRegistry>,
    policies: HashMap<Channel, RetryPolicy>,
    semaphores: HashMap<Channel, Arc<Semaphore>>,
    active_batches: Arc<AtomicU32>,
}

impl WorkerPool {
    pub fn new(
        channels: &ChannelsConfig,
        store: Arc<dyn JobStore>,
        senders: SenderRegistry,
        limiter: Arc<SlidingWindowLimiter>,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        let mut policies = HashMap::new();
        let mut semaphores = HashMap::new();
        for channel in Channel::all() {
            let cfg = channels.for_channel(channel);
            policies.insert(channel, RetryPolicy::from_channel_config(cfg));
            semaphores.insert(
                channel,
                Arc::new(Semaphore::new(cfg.worker_concurrency.max(1) as usize)),
            );
        }
        Self {
            store,
            senders,
            limiter,
            registry,
            policies,
            semaphores,
            active_batches: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn active_batches(&self) -> u32 {
        self.active_batches.load(Ordering::Relaxed)
    }

    /// Dispatch a batch onto its own task. The concurrency permit is
    /// awaited inside the task, never by the caller: a saturated channel
    /// must not stall the claim loop or other channels' batches.
    pub fn submit(&self, batch: crate::batch::JobBatch) {
        let Some(semaphore) = self.semaphores.get(&batch.channel).cloned() else {
            return;
        };

        let store = self.store.clone();
        let senders = self.senders.clone();
        let limiter = self.limiter.clone();
        let registry = self.registry.clone();
        let policy = self
            .policies
            .get(&batch.channel)
            .copied()
            .unwrap_or_else(|| RetryPolicy::new(3, std::time::Duration::from_secs(1), std::time::Duration::from_secs(60)));
        let active = self.active_batches.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                // Semaphores are never closed; bail quietly if that changes.
                Err(_) => return,
            };
            active.fetch_add(1, Ordering::Relaxed);
            debug!(
                tenant_id = %batch.tenant_id,
                channel = %batch.channel,
                batch_size = batch.jobs.len(),
                "processing batch"
            );
            for claimed in batch.jobs {
                process_job(&store, &senders, &limiter, &registry, policy, claimed).await;
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Process one claimed job through throttle check, send, and settlement.
async fn process_job(
    store: &Arc<dyn JobStore>,
    senders: &SenderRegistry,
    limiter: &SlidingWindowLimiter,
    registry: &MetricsRegistry,
    policy: RetryPolicy,
    claimed: ClaimedJob,
) {
    let job = &claimed.job;
    let channel = job.channel();
    let rate_limit_key = job.rate_limit_key();

    // Throttle check. A deferred job keeps its attempt count: being
    // throttled is not a failure.
    if !limiter.try_acquire(&job.tenant_id, &rate_limit_key, channel) {
        let retry_at = Utc::now()
            + chrono::Duration::from_std(limiter.window(channel))
                .unwrap_or(chrono::Duration::seconds(1));
        match store.defer(&claimed.receipt_handle, retry_at).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    channel = %channel,
                    retry_at = %retry_at,
                    "rate limit hit, deferring job"
                );
            }
            Err(e) => {
                // The claim may have expired; the job will resurface on
                // its own via the visibility timeout.
                warn!(job_id = %job.id, error = %e, "failed to defer throttled job");
            }
        }
        registry.record(
            &job.tenant_id,
            channel,
            Outcome::RateLimited,
            Some(&format!("tenant window full for key {}", rate_limit_key)),
        );
        return;
    }

    let Some(sender) = senders.get(channel) else {
        error!(job_id = %job.id, channel = %channel, "no sender configured, burying job");
        if let Err(e) = store
            .bury(&claimed.receipt_handle, "no sender configured for channel")
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to bury job");
        }
        registry.record(
            &job.tenant_id,
            channel,
            Outcome::Failure,
            Some("no sender configured"),
        );
        return;
    };

    match sender.send(job).await {
        Ok(receipt) => {
            if let Err(e) = store.ack(&claimed.receipt_handle).await {
                warn!(job_id = %job.id, error = %e, "failed to ack delivered job");
                return;
            }
            debug!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                channel = %channel,
                provider_id = receipt.provider_id.as_deref().unwrap_or("-"),
                "job delivered"
            );
            registry.record(&job.tenant_id, channel, Outcome::Success, None);
        }
        Err(send_error) if send_error.kind == SendErrorKind::RateLimitedByProvider => {
            // Downstream throttled us. Same treatment as the local
            // limiter: reschedule without burning an attempt.
            let retry_at = Utc::now()
                + chrono::Duration::from_std(limiter.window(channel))
                    .unwrap_or(chrono::Duration::seconds(1));
            warn!(
                job_id = %job.id,
                channel = %channel,
                error = %send_error,
                "provider rate limited, deferring job"
            );
            if let Err(e) = store.defer(&claimed.receipt_handle, retry_at).await {
                warn!(job_id = %job.id, error = %e, "failed to defer job");
            }
            registry.record(
                &job.tenant_id,
                channel,
                Outcome::RateLimited,
                Some(&send_error.message),
            );
        }
        Err(send_error) => {
            let attempts_made = job.attempts + 1;
            match policy.next_action(attempts_made, &send_error) {
                RetryAction::Retry(retry_at) => {
                    warn!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        channel = %channel,
                        attempt = attempts_made,
                        max_attempts = policy.max_attempts(),
                        retry_at = %retry_at,
                        error = %send_error,
                        "send failed, scheduling retry"
                    );
                    if let Err(e) = store
                        .nack(&claimed.receipt_handle, retry_at, &send_error.message)
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "failed to nack job");
                    }
                    metrics::counter!("courier_jobs_retried_total", "channel" => channel.as_str())
                        .increment(1);
                }
                RetryAction::Drop => {
                    error!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        channel = %channel,
                        attempts = attempts_made,
                        error = %send_error,
                        "job failed terminally, burying"
                    );
                    if let Err(e) = store
                        .bury(&claimed.receipt_handle, &send_error.message)
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "failed to bury job");
                    }
                    // A job records one failure, at the moment it is dropped.
                    registry.record(
                        &job.tenant_id,
                        channel,
                        Outcome::Failure,
                        Some(&send_error.message),
                    );
                }
            }
        }
    }
}
