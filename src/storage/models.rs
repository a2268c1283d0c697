//! # Persisted Records
//!
//! Structures mapping to the rows the subsystem reads and writes through
//! [`DefenseStore`](super::DefenseStore). Each struct represents one row.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `fraud_logs` | Append-only record of every redemption attempt outcome |
//! | `defense_rules` | Block conditions with confidence scores |
//! | `webhook_event_registrations` | Merchant webhook subscriptions |
//! | `webhook_delivery_logs` | One row per delivery attempt |
//! | `webhook_retry_queue` | Pending redeliveries |
//! | `webhook_failure_logs` | Permanent delivery failures (spike detection input) |
//!
//! ## Mutation Rules
//!
//! Fraud logs are append-only and immutable. Defense rules mutate only via
//! hit-count increments and deactivation — never hard-deleted, so the audit
//! history of why traffic was blocked survives the rule itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a defense rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Source IP address.
    Ip,
    /// Device fingerprint (user-agent derived).
    Fingerprint,
    /// Merchant identifier.
    Merchant,
}

impl RuleType {
    /// Stable name stored in the `rule_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Ip => "ip",
            RuleType::Fingerprint => "fingerprint",
            RuleType::Merchant => "merchant",
        }
    }

    /// Parse a stored column value.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(RuleType::Ip),
            "fingerprint" => Some(RuleType::Fingerprint),
            "merchant" => Some(RuleType::Merchant),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted block condition.
///
/// Created by the learning engine or an operator. `(rule_type, value)` is
/// unique among active rules; an attempt matching any active rule is always
/// blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefenseRule {
    /// Unique rule ID.
    pub id: Uuid,

    /// What this rule matches on.
    pub rule_type: RuleType,

    /// The matched value — an IP, a fingerprint, or a merchant id.
    pub value: String,

    /// Why the rule exists (operator note or learning provenance).
    pub reason: String,

    /// Heuristic certainty this pattern is real fraud, 0–100.
    pub confidence: u8,

    /// Inactive rules are kept for audit but never match.
    pub is_active: bool,

    /// Times this rule has blocked an attempt.
    pub hit_count: i64,

    /// Last time this rule blocked an attempt.
    pub last_triggered: Option<DateTime<Utc>>,

    /// When the rule was created.
    pub created_at: DateTime<Utc>,
}

impl DefenseRule {
    /// Build a new active rule. Confidence is clamped to 100.
    pub fn new(rule_type: RuleType, value: impl Into<String>, reason: impl Into<String>, confidence: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_type,
            value: value.into(),
            reason: reason.into(),
            confidence: confidence.min(100),
            is_active: true,
            hit_count: 0,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }
}

/// One redemption attempt outcome. Append-only, immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudLogEntry {
    /// Unique entry ID.
    pub id: Uuid,

    /// The GAN the attempt targeted.
    pub gan: String,

    /// Source IP.
    pub ip_address: String,

    /// Raw user agent, if supplied.
    pub user_agent: Option<String>,

    /// Merchant performing the redemption, if known.
    pub merchant_id: Option<String>,

    /// Stable reason tag (see [`FraudReason`](crate::models::FraudReason)).
    pub reason: String,

    /// When the attempt was logged.
    pub created_at: DateTime<Utc>,
}

impl FraudLogEntry {
    /// Device fingerprint for this entry — the user-agent string, or
    /// `"unknown"` when absent.
    pub fn fingerprint(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("unknown")
    }
}

/// A merchant's subscription to one event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventRegistration {
    /// Unique registration ID.
    pub id: Uuid,

    /// Owning merchant.
    pub merchant_id: String,

    /// Subscribed event type (wire name, e.g. `giftcard.redeemed`).
    pub event_type: String,

    /// Endpoint URL. Validated at registration time, not delivery time.
    pub url: String,

    /// Per-merchant HMAC secret used to sign payloads.
    pub secret: String,

    /// Disabled registrations are skipped by dispatch.
    pub enabled: bool,
}

/// One delivery attempt. A delivery that retries four times has five rows'
/// worth of history folded into `retry_count` on its single log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryLog {
    /// Unique delivery ID.
    pub id: Uuid,

    /// Target merchant.
    pub merchant_id: String,

    /// The registration this delivery went to.
    pub webhook_event_id: Uuid,

    /// Endpoint URL at dispatch time.
    pub url: String,

    /// Event type (wire name).
    pub event_type: String,

    /// The signed JSON body.
    pub payload: serde_json::Value,

    /// HTTP status of the most recent attempt, if a response was received.
    pub status_code: Option<i32>,

    /// Wall time of the most recent attempt in milliseconds.
    pub response_time_ms: i64,

    /// Whether the delivery has succeeded.
    pub success: bool,

    /// Error description of the most recent failed attempt.
    pub error_message: Option<String>,

    /// Retries performed so far (0 on the first attempt).
    pub retry_count: i32,

    /// When the delivery succeeded, if it did.
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the delivery was first attempted.
    pub created_at: DateTime<Utc>,
}

/// Fields updatable on a delivery log after a retry attempt.
///
/// Everything else on the row is fixed at dispatch time.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLogUpdate {
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<Option<String>>,
    pub retry_count: Option<i32>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A pending redelivery. Created on the first transient failure, deleted on
/// success or exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRetryQueueItem {
    /// Unique queue item ID.
    pub id: Uuid,

    /// The delivery being retried.
    pub delivery_id: Uuid,

    /// Retries performed so far. Never exceeds the configured maximum; the
    /// item is removed and the delivery marked permanently failed first.
    pub retry_count: i32,

    /// Earliest time the scheduler may pick this item up.
    pub next_retry_at: DateTime<Utc>,

    /// Status or error of the last attempt, for operators.
    pub last_status: String,
}

/// A permanent delivery failure. Written only when a delivery is abandoned —
/// terminal HTTP status or retry exhaustion — and consumed by spike
/// detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookFailureLog {
    /// Unique failure ID.
    pub id: Uuid,

    /// The failed delivery.
    pub delivery_id: Uuid,

    /// Merchant whose endpoint failed.
    pub merchant_id: String,

    /// Final HTTP status, if any response was received.
    pub status_code: Option<i32>,

    /// Final error description.
    pub error_message: Option<String>,

    /// Set by an operator once the endpoint is fixed.
    pub resolved: bool,

    /// When the delivery was abandoned.
    pub created_at: DateTime<Utc>,
}
