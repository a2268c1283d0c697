//! # Auto-Defense Learning Engine
//!
//! Aggregates threat replay reports by IP, device fingerprint, and merchant,
//! and creates defense rules above threshold. Confidence is a fixed
//! heuristic formula over the observed fraud rate — not a learned model.
//!
//! ## Creation Thresholds
//!
//! | Group | Create when | Confidence |
//! |-------|-------------|------------|
//! | ip | fraud rate > 0.6 OR missed > 2 | min(95, 50 + rate·45) |
//! | fingerprint (≠ "unknown") | fraud rate > 0.7 OR missed > 3 | min(90, 40 + rate·50) |
//! | merchant | fraud rate > 0.8 AND missed > 5 | min(85, 30 + rate·55) |
//!
//! Re-running over an unchanged report set is idempotent: an existing active
//! rule for the same (type, value) gets its hit count bumped instead of a
//! duplicate.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::models::{LearningOutcome, LearningSummary, ThreatReplayReport};
use crate::storage::models::{DefenseRule, RuleType};
use crate::storage::{DefenseStore, StorageError};

/// Attempt counts for one grouped value.
#[derive(Default)]
struct GroupStats {
    attempts: usize,
    missed: usize,
}

impl GroupStats {
    fn fraud_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.missed as f64 / self.attempts as f64
        }
    }
}

/// One grouping pass: which field to group on and when to create a rule.
struct GroupingPass {
    rule_type: RuleType,
    create: fn(&GroupStats) -> bool,
    confidence: fn(f64) -> u8,
}

const PASSES: [GroupingPass; 3] = [
    GroupingPass {
        rule_type: RuleType::Ip,
        create: |s| s.fraud_rate() > 0.6 || s.missed > 2,
        confidence: |rate| (95.0f64).min(50.0 + rate * 45.0).round() as u8,
    },
    GroupingPass {
        rule_type: RuleType::Fingerprint,
        create: |s| s.fraud_rate() > 0.7 || s.missed > 3,
        confidence: |rate| (90.0f64).min(40.0 + rate * 50.0).round() as u8,
    },
    GroupingPass {
        rule_type: RuleType::Merchant,
        create: |s| s.fraud_rate() > 0.8 && s.missed > 5,
        confidence: |rate| (85.0f64).min(30.0 + rate * 55.0).round() as u8,
    },
];

/// The Auto-Defense Learning Engine.
#[derive(Clone)]
pub struct LearningEngine {
    /// Storage handle. The engine only inserts rules and bumps hit counts —
    /// it never deactivates or deletes.
    store: Arc<dyn DefenseStore>,
}

impl LearningEngine {
    /// Create a new learning engine.
    pub fn new(store: Arc<dyn DefenseStore>) -> Self {
        Self { store }
    }

    /// Run the three grouping passes over `reports` and create or update
    /// rules.
    ///
    /// A storage error aborts the remaining passes; the summary reports what
    /// was done up to that point and notes the abort in its recommendations.
    pub async fn learn(&self, reports: &[ThreatReplayReport]) -> LearningSummary {
        info!("Learning run starting over {} reports", reports.len());

        let mut rules_created = 0usize;
        let mut rules_updated = 0usize;
        let mut aborted = false;

        'passes: for pass in &PASSES {
            let groups = group_reports(reports, pass.rule_type);
            for (value, stats) in groups {
                if !(pass.create)(&stats) {
                    continue;
                }
                let confidence = (pass.confidence)(stats.fraud_rate());
                let rule = DefenseRule::new(
                    pass.rule_type,
                    value.clone(),
                    format!(
                        "learned: {}/{} missed attacks",
                        stats.missed, stats.attempts
                    ),
                    confidence,
                );
                match self.create_or_update(rule).await {
                    Ok(created) => {
                        if created {
                            rules_created += 1;
                        } else {
                            rules_updated += 1;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Learning run aborted on {} rule for {:?}: {}",
                            pass.rule_type, value, e
                        );
                        aborted = true;
                        break 'passes;
                    }
                }
            }
        }

        let (blocked_correctly, should_have_blocked, false_positives) = outcome_counts(reports);
        let effectiveness = effectiveness(
            blocked_correctly,
            should_have_blocked,
            false_positives,
            reports.len(),
            rules_created,
        );
        let mut recommendations = recommendations(
            blocked_correctly,
            should_have_blocked,
            false_positives,
            reports.len(),
            rules_created,
        );
        if aborted {
            recommendations
                .push("Learning run aborted on a storage error; results are partial".to_string());
        }

        info!(
            "Learning run finished: {} created, {} updated, effectiveness {:.0}",
            rules_created, rules_updated, effectiveness
        );
        LearningSummary {
            rules_created,
            rules_updated,
            // Deactivation is an operator action; the engine only inserts
            // and increments.
            rules_deactivated: 0,
            learning_effectiveness: effectiveness,
            recommendations,
        }
    }

    /// Create the rule, or bump the existing active rule's hit count when
    /// (type, value) is already covered. Returns whether a rule was created.
    async fn create_or_update(&self, rule: DefenseRule) -> Result<bool, StorageError> {
        match self.store.create_defense_rule(&rule).await {
            Ok(()) => {
                info!(
                    "Created {} rule for {:?} (confidence {})",
                    rule.rule_type, rule.value, rule.confidence
                );
                Ok(true)
            }
            Err(StorageError::RuleConflict { rule_type, value }) => {
                let existing = self
                    .store
                    .get_active_defense_rule(rule_type, &value)
                    .await?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!("active {} rule for {}", rule_type, value))
                    })?;
                self.store.increment_rule_hit_count(existing.id).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Group reports by the field `rule_type` matches on. Fingerprint grouping
/// excludes `"unknown"` — it would aggregate every client that sent no user
/// agent into one meaningless bucket.
fn group_reports(
    reports: &[ThreatReplayReport],
    rule_type: RuleType,
) -> HashMap<String, GroupStats> {
    let mut groups: HashMap<String, GroupStats> = HashMap::new();
    for report in reports {
        let entry = &report.original_attempt;
        let key = match rule_type {
            RuleType::Ip => Some(entry.ip_address.clone()),
            RuleType::Fingerprint => {
                let fingerprint = entry.fingerprint();
                (fingerprint != "unknown").then(|| fingerprint.to_string())
            }
            RuleType::Merchant => entry.merchant_id.clone(),
        };
        let Some(key) = key else { continue };
        let stats = groups.entry(key).or_default();
        stats.attempts += 1;
        if report.learning_outcome == LearningOutcome::ShouldHaveBlocked {
            stats.missed += 1;
        }
    }
    groups
}

fn outcome_counts(reports: &[ThreatReplayReport]) -> (usize, usize, usize) {
    let mut blocked_correctly = 0;
    let mut should_have_blocked = 0;
    let mut false_positives = 0;
    for report in reports {
        match report.learning_outcome {
            LearningOutcome::BlockedCorrectly => blocked_correctly += 1,
            LearningOutcome::ShouldHaveBlocked => should_have_blocked += 1,
            LearningOutcome::FalsePositive => false_positives += 1,
            LearningOutcome::Ignored => {}
        }
    }
    (blocked_correctly, should_have_blocked, false_positives)
}

/// `clamp(detection_rate·80 − false_positive_rate·30 + bonus, 0, 100)`.
///
/// Detection rate is over classified attacks only; false positive rate is
/// over the whole report set. Bonus of 10 when the run both found misses and
/// created rules to cover them.
fn effectiveness(
    blocked_correctly: usize,
    should_have_blocked: usize,
    false_positives: usize,
    total: usize,
    rules_created: usize,
) -> f64 {
    let attacks = blocked_correctly + should_have_blocked;
    let detection_rate = if attacks == 0 {
        0.0
    } else {
        blocked_correctly as f64 / attacks as f64
    };
    let false_positive_rate = if total == 0 {
        0.0
    } else {
        false_positives as f64 / total as f64
    };
    let bonus = if rules_created > 0 && should_have_blocked > 0 {
        10.0
    } else {
        0.0
    };
    (detection_rate * 80.0 - false_positive_rate * 30.0 + bonus).clamp(0.0, 100.0)
}

fn recommendations(
    blocked_correctly: usize,
    should_have_blocked: usize,
    false_positives: usize,
    total: usize,
    rules_created: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    let attacks = blocked_correctly + should_have_blocked;
    if attacks > 0 && should_have_blocked as f64 / attacks as f64 > 0.5 {
        out.push(format!(
            "More than half of attack attempts ({} of {}) were not blocked; consider lowering creation thresholds",
            should_have_blocked, attacks
        ));
    }
    if total > 0 && false_positives as f64 / total as f64 > 0.1 {
        out.push(format!(
            "{} of {} replayed attempts were false positives; review low-confidence rules for deactivation",
            false_positives, total
        ));
    }
    if rules_created == 0 && should_have_blocked > 0 {
        out.push(format!(
            "{} missed attacks produced no new rules; the patterns are below every grouping threshold",
            should_have_blocked
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::models::{ReplayResult, ThreatReplayReport};
    use crate::storage::memory::MemoryStore;
    use crate::storage::models::FraudLogEntry;

    fn report(ip: &str, merchant: Option<&str>, outcome: LearningOutcome) -> ThreatReplayReport {
        let entry = FraudLogEntry {
            id: Uuid::new_v4(),
            gan: "GC123".to_string(),
            ip_address: ip.to_string(),
            user_agent: None,
            merchant_id: merchant.map(str::to_string),
            reason: "rate_limit_ip".to_string(),
            created_at: Utc::now(),
        };
        ThreatReplayReport {
            fraud_log_id: entry.id,
            original_attempt: entry,
            replay_result: ReplayResult {
                blocked: false,
                matched_rule: None,
                suggested_rule: None,
            },
            learning_outcome: outcome,
        }
    }

    fn reports_with_fingerprint(
        fingerprint: Option<&str>,
        missed: usize,
        clean: usize,
    ) -> Vec<ThreatReplayReport> {
        let mut out = Vec::new();
        for i in 0..missed + clean {
            let outcome = if i < missed {
                LearningOutcome::ShouldHaveBlocked
            } else {
                LearningOutcome::Ignored
            };
            let mut r = report(&format!("10.0.0.{}", i), None, outcome);
            r.original_attempt.user_agent = fingerprint.map(str::to_string);
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_seven_of_ten_misses_creates_ip_rule_at_82() {
        let store = MemoryStore::new();
        let engine = LearningEngine::new(Arc::new(store.clone()));

        let mut reports = Vec::new();
        for _ in 0..7 {
            reports.push(report("1.2.3.4", None, LearningOutcome::ShouldHaveBlocked));
        }
        for _ in 0..3 {
            reports.push(report("1.2.3.4", None, LearningOutcome::Ignored));
        }

        let summary = engine.learn(&reports).await;
        assert_eq!(summary.rules_created, 1);

        let rules = store.list_defense_rules().await.unwrap();
        assert_eq!(rules[0].rule_type, RuleType::Ip);
        assert_eq!(rules[0].value, "1.2.3.4");
        // min(95, 50 + 0.7 * 45) = 81.5 → 82
        assert_eq!(rules[0].confidence, 82);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let store = MemoryStore::new();
        let engine = LearningEngine::new(Arc::new(store.clone()));

        let reports: Vec<_> = (0..4)
            .map(|_| report("1.2.3.4", None, LearningOutcome::ShouldHaveBlocked))
            .collect();

        let first = engine.learn(&reports).await;
        assert_eq!(first.rules_created, 1);
        assert_eq!(first.rules_updated, 0);

        let second = engine.learn(&reports).await;
        assert_eq!(second.rules_created, 0);
        assert_eq!(second.rules_updated, 1);

        assert_eq!(store.list_defense_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_creates_nothing() {
        let store = MemoryStore::new();
        let engine = LearningEngine::new(Arc::new(store.clone()));

        // 2 missed of 5 attempts: rate 0.4, count 2 — below both triggers.
        let mut reports = Vec::new();
        for _ in 0..2 {
            reports.push(report("1.2.3.4", None, LearningOutcome::ShouldHaveBlocked));
        }
        for _ in 0..3 {
            reports.push(report("1.2.3.4", None, LearningOutcome::Ignored));
        }

        let summary = engine.learn(&reports).await;
        assert_eq!(summary.rules_created, 0);
        assert!(store.list_defense_rules().await.unwrap().is_empty());
        // Misses with no new rules must surface as a recommendation.
        assert!(summary
            .recommendations
            .iter()
            .any(|r| r.contains("no new rules")));
    }

    #[tokio::test]
    async fn test_unknown_fingerprint_is_excluded() {
        let store = MemoryStore::new();
        let engine = LearningEngine::new(Arc::new(store.clone()));

        // Each from a distinct IP so the ip pass stays quiet; all with no
        // user agent, which collapses to the excluded "unknown" bucket.
        let reports = reports_with_fingerprint(None, 5, 0);
        engine.learn(&reports).await;

        let rules = store.list_defense_rules().await.unwrap();
        assert!(rules.iter().all(|r| r.rule_type != RuleType::Fingerprint));
    }

    #[tokio::test]
    async fn test_shared_fingerprint_above_threshold_creates_rule() {
        let store = MemoryStore::new();
        let engine = LearningEngine::new(Arc::new(store.clone()));

        let reports = reports_with_fingerprint(Some("BadBot/1.0"), 5, 0);
        let summary = engine.learn(&reports).await;
        assert!(summary.rules_created >= 1);

        let rules = store.list_defense_rules().await.unwrap();
        let fp_rule = rules
            .iter()
            .find(|r| r.rule_type == RuleType::Fingerprint)
            .unwrap();
        assert_eq!(fp_rule.value, "BadBot/1.0");
        // rate 1.0 → min(90, 40 + 50) = 90
        assert_eq!(fp_rule.confidence, 90);
    }

    #[tokio::test]
    async fn test_merchant_pass_needs_rate_and_volume() {
        let store = MemoryStore::new();
        let engine = LearningEngine::new(Arc::new(store.clone()));

        // 5 misses of 5: rate 1.0 but count 5 — AND threshold not met.
        let reports: Vec<_> = (0..5)
            .map(|i| {
                report(
                    &format!("10.0.0.{}", i),
                    Some("m-bad"),
                    LearningOutcome::ShouldHaveBlocked,
                )
            })
            .collect();
        engine.learn(&reports).await;
        assert!(store
            .list_defense_rules()
            .await
            .unwrap()
            .iter()
            .all(|r| r.rule_type != RuleType::Merchant));

        // 6 misses of 6 crosses both.
        let reports: Vec<_> = (0..6)
            .map(|i| {
                report(
                    &format!("10.0.1.{}", i),
                    Some("m-bad"),
                    LearningOutcome::ShouldHaveBlocked,
                )
            })
            .collect();
        engine.learn(&reports).await;
        let rules = store.list_defense_rules().await.unwrap();
        let merchant_rule = rules
            .iter()
            .find(|r| r.rule_type == RuleType::Merchant)
            .unwrap();
        assert_eq!(merchant_rule.value, "m-bad");
        // rate 1.0 → min(85, 30 + 55) = 85
        assert_eq!(merchant_rule.confidence, 85);
    }

    #[tokio::test]
    async fn test_effectiveness_formula() {
        // 8 blocked correctly, 2 missed, 0 false positives, rules created:
        // 0.8*80 - 0 + 10 = 74
        assert_eq!(effectiveness(8, 2, 0, 10, 1), 74.0);
        // No attacks at all: 0
        assert_eq!(effectiveness(0, 0, 0, 5, 0), 0.0);
        // Perfect detection, no misses → no bonus: 80
        assert_eq!(effectiveness(10, 0, 0, 10, 0), 80.0);
    }
}
