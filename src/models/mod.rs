//! # Shared Domain Types
//!
//! Types exchanged between the fraud guard, the replay/learning batch
//! engines and the webhook layer. Everything that crosses a service
//! boundary lives here; persisted records live in [`crate::storage::models`].
//!
//! ## Reason Tags
//!
//! Fraud log entries carry a [`FraudReason`] — a closed enum assigned at the
//! moment the log is written. Downstream consumers (threat replay, learning)
//! switch on the enum instead of matching substrings in free text. The tag
//! serializes to a stable snake_case string so stored rows written by older
//! builds still parse (unknown tags fall back to [`FraudReason::Unknown`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::models::{FraudLogEntry, RuleType};

/// Risk level attached to a fraud check outcome.
///
/// Escalates with attempt volume inside the velocity window:
///
/// | Level | Meaning |
/// |-------|---------|
/// | Low | Nothing notable about this attempt |
/// | Medium | Repetition from the same source |
/// | High | At or past a velocity limit, or a rule matched |
/// | Critical | Well past the limit — active attack traffic |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A redemption attempt as seen by the Online Fraud Guard.
///
/// This is the input contract of `check_fraud`; the guard runs before any
/// balance mutation, so nothing here has been validated against the card
/// store yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionAttempt {
    /// Gift Account Number — the redeemable code.
    pub gan: String,

    /// Source IP of the attempt.
    pub ip_address: String,

    /// Raw user agent, if the caller supplied one.
    pub user_agent: Option<String>,

    /// Merchant performing the redemption, if known.
    pub merchant_id: Option<String>,
}

impl RedemptionAttempt {
    /// Device fingerprint used for rule matching.
    ///
    /// The fingerprint is the user-agent string; attempts without one
    /// collapse into `"unknown"`, which the learning engine excludes.
    pub fn fingerprint(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("unknown")
    }
}

/// Outcome of a synchronous fraud check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudCheckResult {
    /// Whether the attempt must be rejected.
    pub is_blocked: bool,

    /// Generic, user-safe rejection message. Never leaks which rule or
    /// counter triggered the block.
    pub reason: Option<String>,

    /// Risk assessment for this attempt.
    pub risk_level: RiskLevel,
}

impl FraudCheckResult {
    /// An allowed attempt at the given risk level.
    pub fn allowed(risk_level: RiskLevel) -> Self {
        Self {
            is_blocked: false,
            reason: None,
            risk_level,
        }
    }

    /// A blocked attempt. The message is intentionally generic.
    pub fn blocked(risk_level: RiskLevel) -> Self {
        Self {
            is_blocked: true,
            reason: Some("This redemption cannot be completed".to_string()),
            risk_level,
        }
    }
}

/// Why a fraud log entry was written.
///
/// Assigned exactly once, at write time, by the component that observed the
/// outcome. Replay classification derives from [`FraudReason::category`],
/// never from text matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudReason {
    /// Per-IP velocity limit exceeded.
    RateLimitIp,
    /// Per-merchant velocity limit exceeded.
    MerchantRateLimit,
    /// Repeated attempts from the same source inside the window.
    MultipleAttempts,
    /// Blocked by a device fingerprint rule.
    DeviceFingerprintViolation,
    /// Merchant-level abuse pattern.
    MerchantAbuse,
    /// The GAN was already redeemed and is being replayed.
    ReusedGan,
    /// Redemption attempted against an already-redeemed card.
    AlreadyRedeemed,
    /// Blocked by an active IP defense rule.
    IpRuleMatch,
    /// Blocked by an active fingerprint defense rule.
    FingerprintRuleMatch,
    /// Blocked by an active merchant defense rule.
    MerchantRuleMatch,
    /// The code did not resolve to any card.
    InvalidCode,
    /// The card exists but is not redeemable.
    InactiveCard,
    /// Storage or downstream failure during the check; attempt was allowed.
    SystemError,
    /// The attempt passed every check.
    Allowed,
    /// A stored tag this build does not recognize.
    Unknown,
}

/// Coarse classification of a reason tag, used by threat replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCategory {
    /// An attack pattern that should be blocked.
    Attack,
    /// Legitimate traffic.
    Legitimate,
    /// Neither — user error, system error, unknown.
    Neutral,
}

impl FraudReason {
    /// Stable tag stored in the fraud log.
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudReason::RateLimitIp => "rate_limit_ip",
            FraudReason::MerchantRateLimit => "merchant_rate_limit",
            FraudReason::MultipleAttempts => "multiple_attempts",
            FraudReason::DeviceFingerprintViolation => "device_fingerprint_violation",
            FraudReason::MerchantAbuse => "merchant_abuse",
            FraudReason::ReusedGan => "reused_gan",
            FraudReason::AlreadyRedeemed => "already_redeemed",
            FraudReason::IpRuleMatch => "ip_rule_match",
            FraudReason::FingerprintRuleMatch => "fingerprint_rule_match",
            FraudReason::MerchantRuleMatch => "merchant_rule_match",
            FraudReason::InvalidCode => "invalid_code",
            FraudReason::InactiveCard => "inactive_card",
            FraudReason::SystemError => "system_error",
            FraudReason::Allowed => "allowed",
            FraudReason::Unknown => "unknown",
        }
    }

    /// Parse a stored tag. Unrecognized tags become [`FraudReason::Unknown`]
    /// rather than an error — old rows must never poison a replay run.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "rate_limit_ip" => FraudReason::RateLimitIp,
            "merchant_rate_limit" => FraudReason::MerchantRateLimit,
            "multiple_attempts" => FraudReason::MultipleAttempts,
            "device_fingerprint_violation" => FraudReason::DeviceFingerprintViolation,
            "merchant_abuse" => FraudReason::MerchantAbuse,
            "reused_gan" => FraudReason::ReusedGan,
            "already_redeemed" => FraudReason::AlreadyRedeemed,
            "ip_rule_match" => FraudReason::IpRuleMatch,
            "fingerprint_rule_match" => FraudReason::FingerprintRuleMatch,
            "merchant_rule_match" => FraudReason::MerchantRuleMatch,
            "invalid_code" => FraudReason::InvalidCode,
            "inactive_card" => FraudReason::InactiveCard,
            "system_error" => FraudReason::SystemError,
            "allowed" => FraudReason::Allowed,
            _ => FraudReason::Unknown,
        }
    }

    /// Coarse classification used by replay.
    pub fn category(&self) -> ReasonCategory {
        match self {
            FraudReason::RateLimitIp
            | FraudReason::MerchantRateLimit
            | FraudReason::MultipleAttempts
            | FraudReason::DeviceFingerprintViolation
            | FraudReason::MerchantAbuse
            | FraudReason::ReusedGan
            | FraudReason::AlreadyRedeemed => ReasonCategory::Attack,
            FraudReason::Allowed => ReasonCategory::Legitimate,
            FraudReason::IpRuleMatch
            | FraudReason::FingerprintRuleMatch
            | FraudReason::MerchantRuleMatch
            | FraudReason::InvalidCode
            | FraudReason::InactiveCard
            | FraudReason::SystemError
            | FraudReason::Unknown => ReasonCategory::Neutral,
        }
    }

    /// Whether this reason marks the entry as suspicious. Rule matches count
    /// here but not in [`ReasonCategory::Attack`]: a rule match means the
    /// system already acted, an attack pattern means it should have.
    pub fn indicates_suspicion(&self) -> bool {
        matches!(
            self,
            FraudReason::IpRuleMatch
                | FraudReason::FingerprintRuleMatch
                | FraudReason::MerchantRuleMatch
        ) || self.category() == ReasonCategory::Attack
    }

    /// Suggested defense rule for this reason, per the replay heuristics.
    ///
    /// | Reason | Rule type | Confidence |
    /// |--------|-----------|------------|
    /// | rate_limit / multiple_attempts | ip | 85 |
    /// | device_fingerprint_violation | fingerprint | 75 |
    /// | merchant_abuse | merchant | 70 |
    /// | reused_gan / already_redeemed | ip | 90 |
    pub fn suggested_rule(&self, entry: &FraudLogEntry) -> Option<SuggestedRule> {
        let (rule_type, value, confidence) = match self {
            FraudReason::RateLimitIp | FraudReason::MultipleAttempts => {
                (RuleType::Ip, entry.ip_address.clone(), 85)
            }
            FraudReason::DeviceFingerprintViolation => {
                (RuleType::Fingerprint, entry.fingerprint().to_string(), 75)
            }
            FraudReason::MerchantAbuse => {
                (RuleType::Merchant, entry.merchant_id.clone()?, 70)
            }
            FraudReason::ReusedGan | FraudReason::AlreadyRedeemed => {
                (RuleType::Ip, entry.ip_address.clone(), 90)
            }
            _ => return None,
        };

        Some(SuggestedRule {
            rule_type,
            value,
            confidence,
            reason: format!("suggested from replay of {}", self.as_str()),
        })
    }
}

impl std::fmt::Display for FraudReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a replayed entry relates to the current ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningOutcome {
    /// Blocked now and the reason marks it suspicious.
    BlockedCorrectly,
    /// Not blocked now but the reason marks it an attack.
    ShouldHaveBlocked,
    /// Blocked now but the stored reason marks it legitimate.
    FalsePositive,
    /// Everything else.
    Ignored,
}

/// A rule the replay engine thinks should exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedRule {
    /// What the rule matches on.
    pub rule_type: RuleType,

    /// The value to match (IP, fingerprint, or merchant id).
    pub value: String,

    /// Heuristic confidence, 0–100.
    pub confidence: u8,

    /// Why this rule was suggested.
    pub reason: String,
}

/// Result of simulating the current ruleset against one log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    /// Would the current ruleset block this attempt?
    pub blocked: bool,

    /// The rule that matched, if any.
    pub matched_rule: Option<Uuid>,

    /// A rule the heuristics would create for this entry.
    pub suggested_rule: Option<SuggestedRule>,
}

/// Per-entry replay report consumed by the learning engine. Transient —
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatReplayReport {
    /// The fraud log entry this report was derived from.
    pub fraud_log_id: Uuid,

    /// The original attempt, as logged.
    pub original_attempt: FraudLogEntry,

    /// Outcome of simulating the current ruleset.
    pub replay_result: ReplayResult,

    /// Classification of the outcome.
    pub learning_outcome: LearningOutcome,
}

/// Summary returned by a replay run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    /// Entries analyzed in this run.
    pub total_analyzed: usize,

    /// Entries blocked now with a suspicious reason.
    pub blocked_correctly: usize,

    /// Entries not blocked now with an attack reason.
    pub should_have_blocked: usize,

    /// Entries blocked now despite a legitimate reason.
    pub false_positives: usize,

    /// Entries matching no category.
    pub ignored: usize,

    /// Distinct rules the heuristics suggested.
    pub new_rules_suggested: usize,

    /// Entries skipped because they could not be analyzed. A non-zero count
    /// with a small `total_analyzed` means the run aborted on a storage error.
    pub unanalyzed: usize,

    /// Per-entry reports, in log order.
    pub reports: Vec<ThreatReplayReport>,
}

/// Summary returned by a learning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningSummary {
    /// Rules created in this run.
    pub rules_created: usize,

    /// Existing rules whose hit count was bumped instead of duplicating.
    pub rules_updated: usize,

    /// Rules deactivated in this run. The learning engine never deactivates
    /// on its own; deactivation is an operator action.
    pub rules_deactivated: usize,

    /// 0–100 effectiveness score for the current ruleset.
    pub learning_effectiveness: f64,

    /// Operator-facing recommendations derived from threshold crossings.
    pub recommendations: Vec<String>,
}

/// Aggregates for the admin read surface.
///
/// Consumed by the (out of scope) dashboard; the shape is fixed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefenseStatistics {
    /// All rules ever created, active or not.
    pub total_rules: usize,

    /// Currently active rules.
    pub active_rules: usize,

    /// Active IP rules.
    pub ip_rules: usize,

    /// Active fingerprint rules.
    pub fingerprint_rules: usize,

    /// Active merchant rules.
    pub merchant_rules: usize,

    /// Rules triggered in the trailing 24 hours.
    pub triggered_last_24h: usize,

    /// Mean confidence across active rules (0 when none).
    pub average_confidence: f64,
}

/// Business events fanned out to merchant webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    /// A gift card was redeemed.
    GiftcardRedeemed,
    /// A gift card was issued.
    GiftcardIssued,
    /// A refund was processed.
    RefundProcessed,
    /// A fraud-relevant event occurred for this merchant.
    FraudAlert,
}

impl WebhookEventType {
    /// Wire name carried in `X-Sizu-Event` and the payload `event` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::GiftcardRedeemed => "giftcard.redeemed",
            WebhookEventType::GiftcardIssued => "giftcard.issued",
            WebhookEventType::RefundProcessed => "refund.processed",
            WebhookEventType::FraudAlert => "fraud.alert",
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_tags_round_trip() {
        let reasons = [
            FraudReason::RateLimitIp,
            FraudReason::MerchantRateLimit,
            FraudReason::MultipleAttempts,
            FraudReason::DeviceFingerprintViolation,
            FraudReason::MerchantAbuse,
            FraudReason::ReusedGan,
            FraudReason::AlreadyRedeemed,
            FraudReason::IpRuleMatch,
            FraudReason::InvalidCode,
            FraudReason::SystemError,
            FraudReason::Allowed,
        ];
        for reason in reasons {
            assert_eq!(FraudReason::from_tag(reason.as_str()), reason);
        }
    }

    #[test]
    fn test_unknown_tag_is_neutral() {
        let reason = FraudReason::from_tag("something_from_the_future");
        assert_eq!(reason, FraudReason::Unknown);
        assert_eq!(reason.category(), ReasonCategory::Neutral);
    }

    #[test]
    fn test_rule_match_is_suspicious_but_not_attack() {
        assert!(FraudReason::IpRuleMatch.indicates_suspicion());
        assert_ne!(FraudReason::IpRuleMatch.category(), ReasonCategory::Attack);
    }

    #[test]
    fn test_blocked_result_is_generic() {
        let result = FraudCheckResult::blocked(RiskLevel::High);
        let reason = result.reason.unwrap();
        assert!(!reason.contains("rule"));
        assert!(!reason.contains("limit"));
    }
}
