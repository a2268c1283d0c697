//! # Real-time Alert Channel
//!
//! Publish/subscribe fan-out of fraud and operational alerts to
//! authenticated observers. The channel is transport-independent: the host
//! application bridges receivers onto whatever transport its dashboard uses
//! (WebSocket, SSE, ...). It is **not** a system of record — durable truth
//! stays in the fraud log and the webhook failure log.
//!
//! ## Message Format
//!
//! All messages serialize as JSON:
//!
//! ```json
//! {
//!     "event": "fraud_alert",
//!     "data": {
//!         "id": "550e8400-...",
//!         "severity": "high",
//!         "message": "Repeated redemption attempts from 1.2.3.4",
//!         "metadata": { "attemptCount": 6 }
//!     },
//!     "timestamp": "2026-08-24T12:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::FraudReason;
use crate::webhook::signature::constant_time_eq;

/// Buffered messages per subscriber before lagging receivers drop.
const CHANNEL_CAPACITY: usize = 256;

/// Alert channel errors.
#[derive(Error, Debug)]
pub enum AlertError {
    /// Presented secret did not match.
    #[error("Alert channel authentication failed")]
    Unauthorized,
}

/// Alert severity, highest first in sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// A fraud alert before the channel assigns identity.
#[derive(Debug, Clone)]
pub struct FraudAlertDraft {
    /// The reason tag that triggered the alert.
    pub reason: FraudReason,

    /// Human-readable description.
    pub message: String,

    /// Source IP, if the alert concerns one.
    pub ip_address: Option<String>,

    /// Merchant, if the alert concerns one.
    pub merchant_id: Option<String>,

    /// Attempts observed in the current window.
    pub attempt_count: u32,

    /// Whether this source has alerted before.
    pub is_repeated: bool,

    /// Structured context for the dashboard.
    pub metadata: serde_json::Value,
}

/// A fraud alert as broadcast to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudAlert {
    /// Unique alert ID, assigned at emit time.
    pub id: Uuid,

    /// Reason tag that triggered the alert.
    pub reason: FraudReason,

    /// Classified severity.
    pub severity: AlertSeverity,

    /// Human-readable description.
    pub message: String,

    /// Source IP, if applicable.
    pub ip_address: Option<String>,

    /// Merchant, if applicable.
    pub merchant_id: Option<String>,

    /// Attempts observed in the current window.
    pub attempt_count: u32,

    /// Whether this source has alerted before.
    pub is_repeated: bool,

    /// Structured context.
    pub metadata: serde_json::Value,

    /// When the alert was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Operational status broadcast to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// Unique status ID, assigned at emit time.
    pub id: Uuid,

    /// Component the status concerns (e.g. `webhook_delivery`).
    pub component: String,

    /// Whether the component is healthy.
    pub healthy: bool,

    /// Operational severity of this status change.
    pub severity: AlertSeverity,

    /// Human-readable description.
    pub message: String,

    /// Structured context.
    pub metadata: serde_json::Value,

    /// When the status was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Messages carried on the admin alerts topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AdminAlert {
    /// A fraud-relevant event.
    FraudAlert(FraudAlert),
    /// An operational status change.
    SystemStatus(SystemStatus),
}

/// Classify alert severity.
///
/// | Condition | Severity |
/// |-----------|----------|
/// | repeated source, or ≥5 attempts | high |
/// | reused code / fingerprint violation | high |
/// | per-IP rate limit with ≥3 attempts | medium |
/// | merchant rate limit | medium |
/// | anything else | low |
pub fn classify_severity(reason: FraudReason, attempt_count: u32, is_repeated: bool) -> AlertSeverity {
    if is_repeated || attempt_count >= 5 {
        return AlertSeverity::High;
    }
    match reason {
        FraudReason::ReusedGan
        | FraudReason::AlreadyRedeemed
        | FraudReason::DeviceFingerprintViolation => AlertSeverity::High,
        FraudReason::RateLimitIp if attempt_count >= 3 => AlertSeverity::Medium,
        FraudReason::MerchantRateLimit => AlertSeverity::Medium,
        _ => AlertSeverity::Low,
    }
}

/// The admin alerts topic.
///
/// Cloning is cheap; all clones publish into the same broadcast channel.
/// Observers must present the shared secret to [`subscribe`](Self::subscribe);
/// there is no unauthenticated read path.
#[derive(Clone)]
pub struct AlertChannel {
    sender: broadcast::Sender<AdminAlert>,
    secret: String,
}

impl AlertChannel {
    /// Create a channel gated on `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            secret: secret.into(),
        }
    }

    /// Join the broadcast group.
    ///
    /// The presented secret is compared in constant time. A failed attempt
    /// is logged but deliberately carries no detail about why it failed.
    pub fn subscribe(&self, secret: &str) -> Result<broadcast::Receiver<AdminAlert>, AlertError> {
        if !constant_time_eq(secret.as_bytes(), self.secret.as_bytes()) {
            warn!("Rejected alert channel subscription attempt");
            return Err(AlertError::Unauthorized);
        }
        info!(
            "Alert observer joined (observers: {})",
            self.sender.receiver_count() + 1
        );
        Ok(self.sender.subscribe())
    }

    /// Number of authenticated observers.
    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Assign identity to a fraud alert, classify severity and broadcast it.
    ///
    /// Returns the alert as broadcast. Having zero observers is not an
    /// error — the durable stores remain the system of record.
    pub fn emit_fraud_alert(&self, draft: FraudAlertDraft) -> FraudAlert {
        let alert = FraudAlert {
            id: Uuid::new_v4(),
            severity: classify_severity(draft.reason, draft.attempt_count, draft.is_repeated),
            reason: draft.reason,
            message: draft.message,
            ip_address: draft.ip_address,
            merchant_id: draft.merchant_id,
            attempt_count: draft.attempt_count,
            is_repeated: draft.is_repeated,
            metadata: draft.metadata,
            timestamp: Utc::now(),
        };

        match alert.severity {
            AlertSeverity::High => warn!("FRAUD ALERT [{}]: {}", alert.reason, alert.message),
            _ => info!("FRAUD ALERT [{}]: {}", alert.reason, alert.message),
        }

        let delivered = self.sender.send(AdminAlert::FraudAlert(alert.clone()));
        if delivered.is_err() {
            debug!("No alert observers connected");
        }
        alert
    }

    /// Broadcast an operational status change.
    pub fn emit_system_status(
        &self,
        component: &str,
        healthy: bool,
        severity: AlertSeverity,
        message: &str,
        metadata: serde_json::Value,
    ) -> SystemStatus {
        let status = SystemStatus {
            id: Uuid::new_v4(),
            component: component.to_string(),
            healthy,
            severity,
            message: message.to_string(),
            metadata,
            timestamp: Utc::now(),
        };

        if healthy {
            debug!("STATUS [{}]: {}", component, message);
        } else {
            warn!("STATUS [{}]: {}", component, message);
        }

        let _ = self.sender.send(AdminAlert::SystemStatus(status.clone()));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(reason: FraudReason, attempt_count: u32, is_repeated: bool) -> FraudAlertDraft {
        FraudAlertDraft {
            reason,
            message: "test".to_string(),
            ip_address: Some("1.2.3.4".to_string()),
            merchant_id: None,
            attempt_count,
            is_repeated,
            metadata: json!({}),
        }
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            classify_severity(FraudReason::InvalidCode, 5, false),
            AlertSeverity::High
        );
        assert_eq!(
            classify_severity(FraudReason::InvalidCode, 1, true),
            AlertSeverity::High
        );
        assert_eq!(
            classify_severity(FraudReason::ReusedGan, 1, false),
            AlertSeverity::High
        );
        assert_eq!(
            classify_severity(FraudReason::DeviceFingerprintViolation, 1, false),
            AlertSeverity::High
        );
        assert_eq!(
            classify_severity(FraudReason::RateLimitIp, 3, false),
            AlertSeverity::Medium
        );
        assert_eq!(
            classify_severity(FraudReason::RateLimitIp, 2, false),
            AlertSeverity::Low
        );
        assert_eq!(
            classify_severity(FraudReason::MerchantRateLimit, 1, false),
            AlertSeverity::Medium
        );
        assert_eq!(
            classify_severity(FraudReason::InvalidCode, 1, false),
            AlertSeverity::Low
        );
    }

    #[tokio::test]
    async fn test_subscribe_requires_secret() {
        let channel = AlertChannel::new("s3cret");
        assert!(channel.subscribe("wrong").is_err());
        assert!(channel.subscribe("s3cret").is_ok());
    }

    #[tokio::test]
    async fn test_emit_assigns_identity_and_broadcasts() {
        let channel = AlertChannel::new("s3cret");
        let mut rx = channel.subscribe("s3cret").unwrap();

        let emitted = channel.emit_fraud_alert(draft(FraudReason::ReusedGan, 1, false));
        assert_eq!(emitted.severity, AlertSeverity::High);

        let received = rx.recv().await.unwrap();
        match received {
            AdminAlert::FraudAlert(alert) => {
                assert_eq!(alert.id, emitted.id);
                assert_eq!(alert.severity, AlertSeverity::High);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_observers_is_not_an_error() {
        let channel = AlertChannel::new("s3cret");
        let alert = channel.emit_fraud_alert(draft(FraudReason::RateLimitIp, 4, false));
        assert_eq!(alert.severity, AlertSeverity::Medium);
    }
}
