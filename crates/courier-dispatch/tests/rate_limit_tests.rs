// Tenant-scoped rate limiting through the full engine: bursts are
// split across windows, throttled jobs never count as failures, and
// tenants cannot starve each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_common::{
    AiResponsePayload, Channel, Job, JobPayload, JobRequest, SmsPayload,
};
use courier_config::AppConfig;
use courier_dispatch::{Dispatcher, SendError, SendReceipt, Sender, SenderRegistry};
use courier_store::{JobStore, MemoryJobStore};

struct OkSender;

#[async_trait]
impl Sender for OkSender {
    async fn send(&self, _job: &Job) -> Result<SendReceipt, SendError> {
        Ok(SendReceipt {
            provider_id: None,
            sent_at: Utc::now(),
        })
    }
}

fn sms_request(tenant: &str, contact: &str) -> JobRequest {
    JobRequest {
        tenant_id: tenant.to_string(),
        payload: JobPayload::Sms(SmsPayload {
            phone_number: "+15550100".into(),
            message: "hello".into(),
            contact_id: contact.to_string(),
            media_url: None,
            metadata: None,
        }),
        delay_ms: None,
        due_at: None,
    }
}

fn ai_request(tenant: &str, contact: &str) -> JobRequest {
    JobRequest {
        tenant_id: tenant.to_string(),
        payload: JobPayload::AiResponse(AiResponsePayload {
            contact_id: contact.to_string(),
            message_id: "m1".into(),
            message_text: "what are your hours?".into(),
            callback_url: "http://localhost:9000/ai-response".into(),
        }),
        delay_ms: None,
        due_at: None,
    }
}

fn engine(config: &AppConfig) -> (Arc<Dispatcher>, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new(
        "test-store",
        config.dispatcher.visibility_timeout_ms,
    ));
    let mut senders = SenderRegistry::new();
    senders.register(Channel::Sms, Arc::new(OkSender));
    senders.register(Channel::Email, Arc::new(OkSender));
    senders.register(Channel::AiResponse, Arc::new(OkSender));
    let dispatcher = Dispatcher::new(config, store.clone(), senders);
    (dispatcher, store)
}

async fn wait_for_success(
    dispatcher: &Dispatcher,
    tenant: &str,
    expected: u64,
    timeout: Duration,
) -> bool {
    let registry = dispatcher.metrics();
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let delivered: u64 = registry
            .tenant_report(tenant)
            .iter()
            .map(|s| s.success_count)
            .sum();
        if delivered >= expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn burst_is_split_across_windows() {
    let mut config = AppConfig::default();
    config.dispatcher.poll_interval_ms = 20;
    config.dispatcher.claim_batch_size = 100;
    config.channels.sms.max_per_window = 5;
    config.channels.sms.window_length_ms = 300;
    let (dispatcher, store) = engine(&config);
    dispatcher.start().await;

    let started = tokio::time::Instant::now();
    for i in 0..10 {
        dispatcher
            .schedule(sms_request("t1", &format!("c{}", i)))
            .await
            .unwrap();
    }

    // First window admits 5; the rest must wait out the window.
    assert!(wait_for_success(&dispatcher, "t1", 10, Duration::from_secs(5)).await);
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "second batch ran inside the first window"
    );

    let report = dispatcher.metrics().tenant_report("t1");
    let sms = report
        .iter()
        .find(|s| s.channel == Channel::Sms)
        .unwrap();
    assert_eq!(sms.success_count, 10);
    assert_eq!(sms.failure_count, 0, "throttling must not count as failure");
    assert!(sms.rate_limit_exceeded_count >= 5);
    assert!(sms.last_exceeded_at.is_some());
    assert!(store.dead_jobs().is_empty());

    dispatcher.stop().await;
}

#[tokio::test]
async fn throttled_jobs_keep_their_attempt_budget() {
    let mut config = AppConfig::default();
    config.dispatcher.poll_interval_ms = 20;
    config.channels.sms.max_per_window = 1;
    config.channels.sms.window_length_ms = 150;
    let (dispatcher, store) = engine(&config);
    dispatcher.start().await;

    for i in 0..3 {
        dispatcher
            .schedule(sms_request("t1", &format!("c{}", i)))
            .await
            .unwrap();
    }

    assert!(wait_for_success(&dispatcher, "t1", 3, Duration::from_secs(5)).await);
    // Every job was delivered despite repeated throttling, none died
    assert!(store.dead_jobs().is_empty());
    let depth = store.depth().await.unwrap();
    assert_eq!(depth.pending, 0);
    assert_eq!(depth.in_flight, 0);

    let report = dispatcher.metrics().tenant_report("t1");
    assert_eq!(report[0].failure_count, 0);
    assert!(report[0].rate_limit_exceeded_count >= 2);

    dispatcher.stop().await;
}

#[tokio::test]
async fn tenants_are_throttled_independently() {
    let mut config = AppConfig::default();
    config.dispatcher.poll_interval_ms = 20;
    config.channels.sms.max_per_window = 1;
    config.channels.sms.window_length_ms = 400;
    let (dispatcher, _store) = engine(&config);
    dispatcher.start().await;

    dispatcher.schedule(sms_request("a", "c1")).await.unwrap();
    dispatcher.schedule(sms_request("a", "c2")).await.unwrap();
    dispatcher.schedule(sms_request("b", "c1")).await.unwrap();

    // Tenant B's single job and tenant A's first both go out in the
    // first window even though tenant A is over its own limit.
    assert!(wait_for_success(&dispatcher, "b", 1, Duration::from_millis(400)).await);
    assert!(wait_for_success(&dispatcher, "a", 2, Duration::from_secs(5)).await);

    let registry = dispatcher.metrics();
    let b = registry.tenant_report("b");
    assert_eq!(b[0].rate_limit_exceeded_count, 0);
    let a = registry.tenant_report("a");
    assert!(a[0].rate_limit_exceeded_count >= 1);

    dispatcher.stop().await;
}

#[tokio::test]
async fn ai_replies_are_limited_per_contact() {
    let mut config = AppConfig::default();
    config.dispatcher.poll_interval_ms = 20;
    config.channels.ai_response.max_per_window = 2;
    config.channels.ai_response.window_length_ms = 300;
    let (dispatcher, _store) = engine(&config);
    dispatcher.start().await;

    // Three replies to one contact, two to another, same tenant.
    for _ in 0..3 {
        dispatcher.schedule(ai_request("t1", "alice")).await.unwrap();
    }
    for _ in 0..2 {
        dispatcher.schedule(ai_request("t1", "bob")).await.unwrap();
    }

    assert!(wait_for_success(&dispatcher, "t1", 5, Duration::from_secs(5)).await);

    let report = dispatcher.metrics().tenant_report("t1");
    let ai = report
        .iter()
        .find(|s| s.channel == Channel::AiResponse)
        .unwrap();
    assert_eq!(ai.success_count, 5);
    // Only the third reply to the same contact was throttled
    assert!(ai.rate_limit_exceeded_count >= 1);
    assert!(ai
        .recent_exceedances
        .iter()
        .any(|e| e.message.contains("t1:alice")));
    assert!(!ai.recent_exceedances.iter().any(|e| e.message.contains("t1:bob")));

    dispatcher.stop().await;
}

#[tokio::test]
async fn channels_have_separate_windows() {
    let mut config = AppConfig::default();
    config.dispatcher.poll_interval_ms = 20;
    config.channels.sms.max_per_window = 1;
    config.channels.sms.window_length_ms = 60_000;
    config.channels.email.max_per_window = 100;
    config.channels.email.window_length_ms = 1_000;
    let (dispatcher, _store) = engine(&config);
    dispatcher.start().await;

    dispatcher.schedule(sms_request("t1", "c1")).await.unwrap();
    dispatcher
        .schedule(JobRequest {
            tenant_id: "t1".into(),
            payload: JobPayload::Email(courier_common::EmailPayload {
                to: "a@b.co".into(),
                subject: "hi".into(),
                html: "<p>hi</p>".into(),
                contact_id: "c1".into(),
                metadata: None,
            }),
            delay_ms: None,
            due_at: None,
        })
        .await
        .unwrap();

    // SMS window is saturated after one send; email is unaffected.
    assert!(wait_for_success(&dispatcher, "t1", 2, Duration::from_secs(2)).await);
    let report = dispatcher.metrics().tenant_report("t1");
    for snapshot in &report {
        assert_eq!(snapshot.rate_limit_exceeded_count, 0);
    }

    dispatcher.stop().await;
}
