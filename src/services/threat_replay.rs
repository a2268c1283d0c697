//! # Threat Replay Engine
//!
//! Offline batch job that re-evaluates past redemption attempts against the
//! *current* ruleset. Pure and read-only: it never mutates rules, never
//! bumps hit counts, never writes logs — it only produces reports for the
//! learning engine.
//!
//! ## Classification
//!
//! | Blocked now? | Stored reason says | Outcome |
//! |--------------|--------------------|---------|
//! | yes | suspicious | `blocked_correctly` |
//! | no | attack pattern | `should_have_blocked` |
//! | yes | legitimate | `false_positive` |
//! | — | anything else | `ignored` |

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::models::{
    FraudReason, LearningOutcome, ReasonCategory, ReplayResult, ReplaySummary, SuggestedRule,
    ThreatReplayReport,
};
use crate::services::ServiceError;
use crate::storage::models::{FraudLogEntry, RuleType};
use crate::storage::{DefenseStore, StorageError};

/// The Threat Replay Engine.
#[derive(Clone)]
pub struct ThreatReplay {
    /// Storage handle, used read-only.
    store: Arc<dyn DefenseStore>,
}

impl ThreatReplay {
    /// Create a new replay engine.
    pub fn new(store: Arc<dyn DefenseStore>) -> Self {
        Self { store }
    }

    /// Replay the most recent `limit` fraud log entries against the current
    /// ruleset.
    ///
    /// Fails only when the log itself cannot be loaded. A storage error
    /// mid-run aborts the remaining entries — they are counted in
    /// [`ReplaySummary::unanalyzed`] and the partial results are returned
    /// rather than thrown away.
    pub async fn run_replay(&self, limit: usize) -> Result<ReplaySummary, ServiceError> {
        let entries = self.store.get_recent_fraud_logs(limit).await?;
        info!("Threat replay starting over {} entries", entries.len());

        let mut summary = ReplaySummary {
            total_analyzed: 0,
            blocked_correctly: 0,
            should_have_blocked: 0,
            false_positives: 0,
            ignored: 0,
            new_rules_suggested: 0,
            unanalyzed: 0,
            reports: Vec::with_capacity(entries.len()),
        };
        let mut suggested_seen: HashSet<(RuleType, String)> = HashSet::new();

        let total = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            let report = match self.replay_entry(&entry).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(
                        "Threat replay aborted at entry {} of {}: {}",
                        index + 1,
                        total,
                        e
                    );
                    summary.unanalyzed = total - index;
                    break;
                }
            };

            summary.total_analyzed += 1;
            match report.learning_outcome {
                LearningOutcome::BlockedCorrectly => summary.blocked_correctly += 1,
                LearningOutcome::ShouldHaveBlocked => summary.should_have_blocked += 1,
                LearningOutcome::FalsePositive => summary.false_positives += 1,
                LearningOutcome::Ignored => summary.ignored += 1,
            }
            if let Some(suggested) = &report.replay_result.suggested_rule {
                if suggested_seen.insert((suggested.rule_type, suggested.value.clone())) {
                    summary.new_rules_suggested += 1;
                }
            }
            summary.reports.push(report);
        }

        info!(
            "Threat replay finished: {} analyzed, {} missed attacks, {} false positives, {} rules suggested",
            summary.total_analyzed,
            summary.should_have_blocked,
            summary.false_positives,
            summary.new_rules_suggested
        );
        Ok(summary)
    }

    /// Simulate one entry against the current ruleset and classify it.
    async fn replay_entry(
        &self,
        entry: &FraudLogEntry,
    ) -> Result<ThreatReplayReport, StorageError> {
        let reason = FraudReason::from_tag(&entry.reason);
        let (blocked, matched_rule) = self.would_block(entry).await?;

        let learning_outcome = match (blocked, reason.category()) {
            _ if blocked && reason.indicates_suspicion() => LearningOutcome::BlockedCorrectly,
            (false, ReasonCategory::Attack) => LearningOutcome::ShouldHaveBlocked,
            (true, ReasonCategory::Legitimate) => LearningOutcome::FalsePositive,
            _ => LearningOutcome::Ignored,
        };

        Ok(ThreatReplayReport {
            fraud_log_id: entry.id,
            original_attempt: entry.clone(),
            replay_result: ReplayResult {
                blocked,
                matched_rule,
                suggested_rule: self.suggest_rule(entry, reason),
            },
            learning_outcome,
        })
    }

    /// Would the current ruleset block this attempt? Same priority order as
    /// the live guard, but without the hit-count side effect.
    async fn would_block(
        &self,
        entry: &FraudLogEntry,
    ) -> Result<(bool, Option<uuid::Uuid>), StorageError> {
        if let Some(rule) = self
            .store
            .get_active_defense_rule(RuleType::Ip, &entry.ip_address)
            .await?
        {
            return Ok((true, Some(rule.id)));
        }
        if let Some(rule) = self
            .store
            .get_active_defense_rule(RuleType::Fingerprint, entry.fingerprint())
            .await?
        {
            return Ok((true, Some(rule.id)));
        }
        if let Some(merchant_id) = entry.merchant_id.as_deref() {
            if let Some(rule) = self
                .store
                .get_active_defense_rule(RuleType::Merchant, merchant_id)
                .await?
            {
                return Ok((true, Some(rule.id)));
            }
        }
        Ok((false, None))
    }

    /// Heuristic rule suggestion, independent of the blocked/allowed
    /// classification.
    fn suggest_rule(&self, entry: &FraudLogEntry, reason: FraudReason) -> Option<SuggestedRule> {
        reason.suggested_rule(entry)
    }
}
