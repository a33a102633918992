use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Channel, Job, JobPayload};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Outcome of a successful delivery attempt.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Identifier assigned by the downstream provider, when it returns one.
    pub provider_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// How a failed attempt should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The provider itself throttled us (HTTP 429). Defer, don't burn an attempt.
    RateLimitedByProvider,
    /// Likely to succeed on retry: timeouts, connection errors, 5xx.
    Transient,
    /// Will never succeed: bad recipient, rejected payload, 4xx.
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::RateLimitedByProvider,
            message: message.into(),
        }
    }
}

/// A channel's delivery backend. One implementation per downstream
/// provider; workers stay provider-agnostic.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, job: &Job) -> Result<SendReceipt, SendError>;
}

/// Channel-to-sender lookup table, fixed at startup.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Channel, sender: Arc<dyn Sender>) {
        self.senders.insert(channel, sender);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Sender>> {
        self.senders.get(&channel).cloned()
    }
}

/// HTTP delivery backend.
///
/// Posts the job payload as JSON to the configured endpoint (or, for AI
/// replies, to the job's own callback URL) and classifies the response
/// status into the retry taxonomy.
pub struct HttpSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSender {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn target_url<'a>(&'a self, job: &'a Job) -> &'a str {
        match &job.payload {
            JobPayload::AiResponse(p) => &p.callback_url,
            _ => &self.endpoint,
        }
    }

    fn request_body(job: &Job) -> Value {
        match &job.payload {
            JobPayload::Sms(p) => {
                let mut body = json!({
                    "to": p.phone_number,
                    "message": p.message,
                    "contactId": p.contact_id,
                    "workspaceId": job.tenant_id,
                });
                if let Some(url) = &p.media_url {
                    body["mediaUrl"] = json!(url);
                }
                if let Some(meta) = &p.metadata {
                    body["metadata"] = meta.clone();
                }
                body
            }
            JobPayload::Email(p) => {
                let mut body = json!({
                    "to": p.to,
                    "subject": p.subject,
                    "html": p.html,
                    "contactId": p.contact_id,
                    "workspaceId": job.tenant_id,
                });
                if let Some(meta) = &p.metadata {
                    body["metadata"] = meta.clone();
                }
                body
            }
            JobPayload::AiResponse(p) => json!({
                "contactId": p.contact_id,
                "messageId": p.message_id,
                "messageText": p.message_text,
                "workspaceId": job.tenant_id,
            }),
        }
    }

    fn provider_id(body: &Value) -> Option<String> {
        body.get("messageId")
            .or_else(|| body.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, job: &Job) -> Result<SendReceipt, SendError> {
        let url = self.target_url(job);
        let body = Self::request_body(job);

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::transient(format!("request to {} timed out", url))
                } else {
                    SendError::transient(format!("request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let provider_id = response
                .json::<Value>()
                .await
                .ok()
                .as_ref()
                .and_then(Self::provider_id);
            debug!(job_id = %job.id, status = %status, "delivered");
            return Ok(SendReceipt {
                provider_id,
                sent_at: Utc::now(),
            });
        }

        let detail = response.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", url, status, detail);
        if status.as_u16() == 429 {
            Err(SendError::rate_limited(message))
        } else if status.is_client_error() {
            Err(SendError::permanent(message))
        } else {
            Err(SendError::transient(message))
        }
    }
}
