use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Channels
// ============================================================================

/// Delivery channel. Keys rate limiting, batching, worker concurrency,
/// and metrics scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Sms,
    Email,
    AiResponse,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::AiResponse => "ai-response",
        }
    }

    pub fn all() -> [Channel; 3] {
        [Channel::Sms, Channel::Email, Channel::AiResponse]
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Job kind. Scheduled variants only differ from immediate ones in how the
/// due time was resolved at the boundary; workers treat them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ImmediateSms,
    ScheduledSms,
    ImmediateEmail,
    ScheduledEmail,
    AiResponse,
}

impl JobKind {
    pub fn channel(&self) -> Channel {
        match self {
            JobKind::ImmediateSms | JobKind::ScheduledSms => Channel::Sms,
            JobKind::ImmediateEmail | JobKind::ScheduledEmail => Channel::Email,
            JobKind::AiResponse => Channel::AiResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    InFlight,
    Completed,
    Failed,
    Dead,
}

/// SMS/MMS payload. `media_url` turns the message into an MMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsPayload {
    pub phone_number: String,
    pub message: String,
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Payload for AI-generated replies. The responder capability is invoked
/// through `callback_url`; `message_text` is the inbound text to answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponsePayload {
    pub contact_id: String,
    pub message_id: String,
    pub message_text: String,
    pub callback_url: String,
}

/// Kind-specific payload, validated exhaustively at the scheduling boundary
/// so workers never re-check field presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "kebab-case")]
pub enum JobPayload {
    Sms(SmsPayload),
    Email(EmailPayload),
    AiResponse(AiResponsePayload),
}

impl JobPayload {
    pub fn channel(&self) -> Channel {
        match self {
            JobPayload::Sms(_) => Channel::Sms,
            JobPayload::Email(_) => Channel::Email,
            JobPayload::AiResponse(_) => Channel::AiResponse,
        }
    }

    /// Validate required fields for the payload's kind.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobPayload::Sms(p) => {
                require(Channel::Sms, "phoneNumber", &p.phone_number)?;
                require(Channel::Sms, "message", &p.message)?;
                require(Channel::Sms, "contactId", &p.contact_id)?;
            }
            JobPayload::Email(p) => {
                require(Channel::Email, "to", &p.to)?;
                if !p.to.contains('@') {
                    return Err(ValidationError::InvalidField {
                        channel: Channel::Email,
                        field: "to",
                        reason: "not a valid email address".to_string(),
                    });
                }
                require(Channel::Email, "subject", &p.subject)?;
                require(Channel::Email, "html", &p.html)?;
                require(Channel::Email, "contactId", &p.contact_id)?;
            }
            JobPayload::AiResponse(p) => {
                require(Channel::AiResponse, "contactId", &p.contact_id)?;
                require(Channel::AiResponse, "messageId", &p.message_id)?;
                require(Channel::AiResponse, "messageText", &p.message_text)?;
                let parsed = url::Url::parse(&p.callback_url).map_err(|e| {
                    ValidationError::InvalidField {
                        channel: Channel::AiResponse,
                        field: "callbackUrl",
                        reason: e.to_string(),
                    }
                })?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        channel: Channel::AiResponse,
                        field: "callbackUrl",
                        reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Rate-limit key for this payload within a tenant. AI responses are
    /// additionally throttled per contact, so their key includes the
    /// contact id.
    pub fn rate_limit_key(&self, tenant_id: &str) -> String {
        match self {
            JobPayload::AiResponse(p) => format!("{}:{}", tenant_id, p.contact_id),
            _ => tenant_id.to_string(),
        }
    }
}

fn require(channel: Channel, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField { channel, field })
    } else {
        Ok(())
    }
}

/// One unit of outbound work, exclusively owned by the claiming worker
/// while in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub due_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn channel(&self) -> Channel {
        self.payload.channel()
    }

    pub fn rate_limit_key(&self) -> String {
        self.payload.rate_limit_key(&self.tenant_id)
    }
}

// ============================================================================
// Scheduling Entry Contract
// ============================================================================

/// Request accepted from the (out-of-scope) HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub tenant_id: String,
    pub payload: JobPayload,
    /// Relative delay in milliseconds. Negative values clamp to "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
    /// Absolute due time; wins over `delay_ms` when both are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                channel: self.payload.channel(),
                field: "tenantId",
            });
        }
        self.payload.validate()
    }

    /// Resolve the effective due time against `now`. Absolute timestamps
    /// take precedence; anything resolving to the past clamps to `now`.
    pub fn resolve_due_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let due = match (self.due_at, self.delay_ms) {
            (Some(at), _) => at,
            (None, Some(ms)) => now + Duration::milliseconds(ms),
            (None, None) => now,
        };
        due.max(now)
    }

    /// Whether the request resolves to a delayed (scheduled) dispatch.
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        self.resolve_due_at(now) > now
    }
}

/// Handle returned to the scheduling caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub due_at: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{field}' for {channel} job")]
    MissingField {
        channel: Channel,
        field: &'static str,
    },

    #[error("invalid field '{field}' for {channel} job: {reason}")]
    InvalidField {
        channel: Channel,
        field: &'static str,
        reason: String,
    },
}
