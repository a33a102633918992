use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_common::{Channel, Job, JobHandle, JobKind, JobRequest, JobState};
use courier_config::AppConfig;
use courier_store::JobStore;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::BatchAggregator;
use crate::limiter::SlidingWindowLimiter;
use crate::metrics::MetricsRegistry;
use crate::pool::WorkerPool;
use crate::sender::SenderRegistry;
use crate::Result;

/// Back off no further than this when the store is unreachable.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

/// The delivery engine's front door and drain loop.
///
/// `schedule` validates and enqueues; `start` spawns the drain loop
/// that claims due jobs, groups them into batches, and hands them to
/// the worker pool, plus a retention sweep for the limiter and the
/// metrics registry.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    aggregator: BatchAggregator,
    limiter: Arc<SlidingWindowLimiter>,
    registry: Arc<MetricsRegistry>,
    poll_interval: Duration,
    claim_batch_size: usize,
    sweep_interval: Duration,
    retention: Duration,
    max_attempts: [(Channel, u32); 3],
    running: Arc<RwLock<bool>>,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn JobStore>,
        senders: SenderRegistry,
    ) -> Arc<Self> {
        let limiter = Arc::new(SlidingWindowLimiter::from_channels(&config.channels));
        let registry = Arc::new(MetricsRegistry::new(config.metrics.detail_capacity));
        let pool = Arc::new(WorkerPool::new(
            &config.channels,
            store.clone(),
            senders,
            limiter.clone(),
            registry.clone(),
        ));
        let max_attempts = [
            (Channel::Sms, config.channels.sms.max_attempts),
            (Channel::Email, config.channels.email.max_attempts),
            (Channel::AiResponse, config.channels.ai_response.max_attempts),
        ];

        Arc::new(Self {
            store,
            pool,
            aggregator: BatchAggregator::from_channels(&config.channels),
            limiter,
            registry,
            poll_interval: Duration::from_millis(config.dispatcher.poll_interval_ms.max(10)),
            claim_batch_size: config.dispatcher.claim_batch_size.max(1),
            sweep_interval: Duration::from_millis(config.metrics.sweep_interval_ms.max(1000)),
            retention: Duration::from_millis(config.metrics.tenant_retention_ms),
            max_attempts,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Validate a request and enqueue it for delivery at its resolved
    /// due time. Returns a handle the caller can correlate on.
    pub async fn schedule(&self, request: JobRequest) -> Result<JobHandle> {
        request.validate()?;

        let now = Utc::now();
        let due_at = request.resolve_due_at(now);
        let scheduled = request.is_scheduled(now);
        let channel = request.payload.channel();
        let kind = match (channel, scheduled) {
            (Channel::Sms, false) => JobKind::ImmediateSms,
            (Channel::Sms, true) => JobKind::ScheduledSms,
            (Channel::Email, false) => JobKind::ImmediateEmail,
            (Channel::Email, true) => JobKind::ScheduledEmail,
            (Channel::AiResponse, _) => JobKind::AiResponse,
        };
        let max_attempts = self
            .max_attempts
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, n)| *n)
            .unwrap_or(3);

        let job = Job {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            kind,
            payload: request.payload,
            due_at,
            attempts: 0,
            max_attempts,
            state: JobState::Pending,
            created_at: now,
            last_error: None,
        };
        let job_id = self.store.enqueue(job).await?;

        info!(
            job_id = %job_id,
            channel = %channel,
            due_at = %due_at,
            scheduled = scheduled,
            "job scheduled"
        );
        metrics::counter!("courier_jobs_scheduled_total", "channel" => channel.as_str())
            .increment(1);

        Ok(JobHandle { job_id, due_at })
    }

    /// Start the drain loop and the retention sweep. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("dispatcher already running");
                return;
            }
            *running = true;
        }
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            claim_batch_size = self.claim_batch_size,
            "starting dispatcher"
        );

        let drain = self.clone();
        tokio::spawn(async move {
            drain.run_drain_loop().await;
        });

        let sweeper = self.clone();
        tokio::spawn(async move {
            sweeper.run_sweep_loop().await;
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if *running {
            info!("stopping dispatcher");
            *running = false;
        }
    }

    async fn run_drain_loop(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures: u32 = 0;

        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                info!("drain loop stopped");
                break;
            }

            match self.store.claim_due(self.claim_batch_size).await {
                Ok(claimed) => {
                    consecutive_failures = 0;
                    if claimed.is_empty() {
                        continue;
                    }
                    debug!(claimed = claimed.len(), "claimed due jobs");
                    let batches = self.aggregator.group(claimed);
                    for batch in batches {
                        self.pool.submit(batch);
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let backoff = self
                        .poll_interval
                        .saturating_mul(2u32.saturating_pow(consecutive_failures.min(8)))
                        .min(MAX_POLL_BACKOFF);
                    error!(
                        error = %e,
                        consecutive_failures = consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "claim failed, backing off"
                    );
                    metrics::counter!("courier_store_claim_errors_total").increment(1);
                    sleep(backoff).await;
                }
            }
        }
    }

    async fn run_sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }
            let evicted_keys = self.limiter.sweep(self.retention);
            let evicted_entries = self.registry.sweep(self.retention);
            if evicted_keys > 0 || evicted_entries > 0 {
                debug!(
                    limiter_keys = evicted_keys,
                    metrics_entries = evicted_entries,
                    "retention sweep evicted idle tenants"
                );
            }
        }
    }
}
