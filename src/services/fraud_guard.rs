//! # Online Fraud Guard
//!
//! The synchronous check every redemption passes through before any balance
//! mutation. Latency-critical: the rule path is three indexed lookups at
//! most, the velocity path is an in-memory counter — never a history scan.
//!
//! ## Decision Order
//!
//! ```text
//! check_fraud(attempt)
//!         │
//!         ├── 1. active rule, ip          ── match → block (ip_rule_match)
//!         ├── 2. active rule, fingerprint ── match → block (fingerprint_rule_match)
//!         ├── 3. active rule, merchant    ── match → block (merchant_rule_match)
//!         ├── 4. per-ip velocity          ── over limit → block (rate_limit_ip)
//!         ├── 5. per-merchant velocity    ── over limit → block (merchant_rate_limit)
//!         └── 6. allow
//! ```
//!
//! Every outcome — block or allow — appends a fraud log entry. The log is
//! the input to threat replay, so a missing entry is a blind spot in the
//! learning loop.
//!
//! ## Failure Policy
//!
//! A storage error during the check defaults to **allow**, logged as
//! `system_error`. Availability over false positives: refusing every
//! redemption because the rule store is down is the worse failure mode on a
//! payment-adjacent path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::alerts::{AlertChannel, FraudAlertDraft};
use crate::config::DefenseConfig;
use crate::models::{DefenseStatistics, FraudCheckResult, FraudReason, RedemptionAttempt, RiskLevel};
use crate::services::ServiceError;
use crate::storage::models::{DefenseRule, FraudLogEntry, RuleType};
use crate::storage::DefenseStore;

/// Sliding-window attempt counters, keyed by source.
///
/// Held behind a plain mutex: the critical section is a prune plus a push,
/// and it is never held across an await point. Attack traffic rotates
/// sources, so the map is swept at most once per window — keys whose every
/// timestamp has aged out are evicted, keeping the map proportional to
/// sources active in the current window rather than all sources ever seen.
struct VelocityTracker {
    window: Duration,
    state: Mutex<VelocityState>,
}

struct VelocityState {
    hits: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl VelocityTracker {
    fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(VelocityState {
                hits: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Record one attempt for `key` and return the attempt count inside the
    /// window, including this one.
    fn record(&self, key: &str) -> u32 {
        let now = Instant::now();
        let window = self.window;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now.duration_since(state.last_sweep) >= window {
            state.hits.retain(|_, entries| {
                while entries
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    entries.pop_front();
                }
                !entries.is_empty()
            });
            state.last_sweep = now;
        }

        let entries = state.hits.entry(key.to_string()).or_default();
        while entries
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            entries.pop_front();
        }
        entries.push_back(now);
        entries.len() as u32
    }

    /// Attempt count for `key` inside the window, without recording one.
    fn count(&self, key: &str) -> u32 {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .hits
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|t| now.duration_since(**t) <= self.window)
                    .count() as u32
            })
            .unwrap_or(0)
    }
}

/// Remembers which sources alerted recently, for the `is_repeated` flag.
///
/// Windowed like the velocity counters and swept on the same cadence, so it
/// never accumulates every IP that ever triggered an alert.
struct RepeatTracker {
    window: Duration,
    state: Mutex<RepeatState>,
}

struct RepeatState {
    last_alert: HashMap<String, Instant>,
    last_sweep: Instant,
}

impl RepeatTracker {
    fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(RepeatState {
                last_alert: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Mark `key` as having alerted now; returns whether it had already
    /// alerted inside the window.
    fn check_and_mark(&self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now.duration_since(state.last_sweep) >= window {
            state
                .last_alert
                .retain(|_, t| now.duration_since(*t) <= window);
            state.last_sweep = now;
        }

        state
            .last_alert
            .insert(key.to_string(), now)
            .is_some_and(|previous| now.duration_since(previous) <= window)
    }
}

/// The Online Fraud Guard.
///
/// Cloning is cheap; all clones share counters, storage and the alert
/// channel.
///
/// ## Usage
///
/// ```rust,ignore
/// let guard = FraudGuard::new(store, alerts, config);
///
/// let result = guard.check_fraud(&attempt).await;
/// if result.is_blocked {
///     return reject(result.reason);
/// }
/// // ... proceed with redemption; report the outcome afterwards:
/// guard.record_outcome(&attempt, FraudReason::ReusedGan).await;
/// ```
#[derive(Clone)]
pub struct FraudGuard {
    /// Storage handle for rules and the fraud log.
    store: Arc<dyn DefenseStore>,

    /// Channel for fraud alerts raised on blocks.
    alerts: AlertChannel,

    /// Subsystem configuration.
    config: DefenseConfig,

    /// Per-IP attempt counter.
    ip_velocity: Arc<VelocityTracker>,

    /// Per-merchant attempt counter.
    merchant_velocity: Arc<VelocityTracker>,

    /// IPs that alerted inside the current window, for repeat detection.
    alerted_sources: Arc<RepeatTracker>,
}

impl FraudGuard {
    /// Create a new guard.
    pub fn new(store: Arc<dyn DefenseStore>, alerts: AlertChannel, config: DefenseConfig) -> Self {
        let window = Duration::from_secs(config.velocity_window_secs);
        Self {
            store,
            alerts,
            config,
            ip_velocity: Arc::new(VelocityTracker::new(window)),
            merchant_velocity: Arc::new(VelocityTracker::new(window)),
            alerted_sources: Arc::new(RepeatTracker::new(window)),
        }
    }

    /// Synchronous fraud check, run before any balance mutation.
    ///
    /// Never returns an error: a storage failure degrades to allow and is
    /// logged as `system_error` for later replay.
    pub async fn check_fraud(&self, attempt: &RedemptionAttempt) -> FraudCheckResult {
        match self.evaluate(attempt).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "Fraud check degraded to allow for GAN {} from {}: {}",
                    attempt.gan, attempt.ip_address, e
                );
                self.append_log(attempt, FraudReason::SystemError).await;
                FraudCheckResult::allowed(RiskLevel::Low)
            }
        }
    }

    /// The fallible core of [`check_fraud`](Self::check_fraud).
    async fn evaluate(
        &self,
        attempt: &RedemptionAttempt,
    ) -> Result<FraudCheckResult, ServiceError> {
        // Velocity is recorded up front so rule-blocked attempts still count
        // toward the window.
        let ip_count = self.ip_velocity.record(&attempt.ip_address);
        let merchant_count = attempt
            .merchant_id
            .as_deref()
            .map(|m| self.merchant_velocity.record(m));

        // Rule checks in fixed priority order; first match blocks.
        let rule_probes = [
            (RuleType::Ip, attempt.ip_address.as_str(), FraudReason::IpRuleMatch),
            (RuleType::Fingerprint, attempt.fingerprint(), FraudReason::FingerprintRuleMatch),
        ];
        for (rule_type, value, reason) in rule_probes {
            if let Some(rule) = self.store.get_active_defense_rule(rule_type, value).await? {
                return Ok(self.block_on_rule(attempt, &rule, reason, ip_count).await?);
            }
        }
        if let Some(merchant_id) = attempt.merchant_id.as_deref() {
            if let Some(rule) = self
                .store
                .get_active_defense_rule(RuleType::Merchant, merchant_id)
                .await?
            {
                return Ok(self
                    .block_on_rule(attempt, &rule, FraudReason::MerchantRuleMatch, ip_count)
                    .await?);
            }
        }

        // Velocity limits block even without a persisted rule.
        if ip_count > self.config.ip_attempt_limit {
            return Ok(self
                .block_on_velocity(attempt, FraudReason::RateLimitIp, ip_count)
                .await?);
        }
        if let Some(count) = merchant_count {
            if count > self.config.merchant_attempt_limit {
                return Ok(self
                    .block_on_velocity(attempt, FraudReason::MerchantRateLimit, count)
                    .await?);
            }
        }

        let risk = self.risk_for_count(ip_count);
        self.store
            .create_fraud_log_entry(&self.log_entry(attempt, FraudReason::Allowed))
            .await?;
        Ok(FraudCheckResult::allowed(risk))
    }

    /// Block because an active rule matched: bump its counters, log, alert.
    async fn block_on_rule(
        &self,
        attempt: &RedemptionAttempt,
        rule: &DefenseRule,
        reason: FraudReason,
        ip_count: u32,
    ) -> Result<FraudCheckResult, ServiceError> {
        self.store.increment_rule_hit_count(rule.id).await?;
        self.store
            .create_fraud_log_entry(&self.log_entry(attempt, reason))
            .await?;

        debug!(
            "Blocked {} from {} ({} rule on {:?})",
            attempt.gan, attempt.ip_address, rule.rule_type, rule.value
        );
        self.raise_alert(attempt, reason, ip_count);
        Ok(FraudCheckResult::blocked(RiskLevel::High))
    }

    /// Block on a velocity limit with no persisted rule behind it.
    async fn block_on_velocity(
        &self,
        attempt: &RedemptionAttempt,
        reason: FraudReason,
        count: u32,
    ) -> Result<FraudCheckResult, ServiceError> {
        self.store
            .create_fraud_log_entry(&self.log_entry(attempt, reason))
            .await?;

        warn!(
            "Velocity block ({}) for {} from {}: {} attempts in window",
            reason, attempt.gan, attempt.ip_address, count
        );
        self.raise_alert(attempt, reason, count);
        Ok(FraudCheckResult::blocked(self.risk_for_count(count)))
    }

    /// Record an outcome observed after the guard allowed the attempt —
    /// invalid codes, reused GANs, downstream failures. These entries are
    /// what replay mines for missed attacks.
    pub async fn record_outcome(&self, attempt: &RedemptionAttempt, reason: FraudReason) {
        self.append_log(attempt, reason).await;
        if matches!(reason, FraudReason::ReusedGan | FraudReason::AlreadyRedeemed) {
            // The attempt was already counted by check_fraud; read the
            // window without recording it twice.
            let count = self.ip_velocity.count(&attempt.ip_address);
            self.raise_alert(attempt, reason, count);
        }
    }

    /// Admin read surface: rule aggregates.
    pub async fn get_defense_statistics(&self) -> Result<DefenseStatistics, ServiceError> {
        let rules = self.store.list_defense_rules().await?;
        let active: Vec<_> = rules.iter().filter(|r| r.is_active).collect();
        let day_ago = Utc::now() - ChronoDuration::hours(24);

        let count_type =
            |t: RuleType| active.iter().filter(|r| r.rule_type == t).count();
        let average_confidence = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|r| r.confidence as f64).sum::<f64>() / active.len() as f64
        };

        Ok(DefenseStatistics {
            total_rules: rules.len(),
            active_rules: active.len(),
            ip_rules: count_type(RuleType::Ip),
            fingerprint_rules: count_type(RuleType::Fingerprint),
            merchant_rules: count_type(RuleType::Merchant),
            triggered_last_24h: rules
                .iter()
                .filter(|r| r.last_triggered.is_some_and(|t| t > day_ago))
                .count(),
            average_confidence,
        })
    }

    /// Risk escalates with attempt volume inside the window.
    fn risk_for_count(&self, count: u32) -> RiskLevel {
        let limit = self.config.ip_attempt_limit;
        if count >= limit * 2 {
            RiskLevel::Critical
        } else if count >= limit {
            RiskLevel::High
        } else if count > 1 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn log_entry(&self, attempt: &RedemptionAttempt, reason: FraudReason) -> FraudLogEntry {
        FraudLogEntry {
            id: Uuid::new_v4(),
            gan: attempt.gan.clone(),
            ip_address: attempt.ip_address.clone(),
            user_agent: attempt.user_agent.clone(),
            merchant_id: attempt.merchant_id.clone(),
            reason: reason.as_str().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Best-effort log append for paths that must not fail the caller.
    async fn append_log(&self, attempt: &RedemptionAttempt, reason: FraudReason) {
        let entry = self.log_entry(attempt, reason);
        if let Err(e) = self.store.create_fraud_log_entry(&entry).await {
            error!("Failed to append fraud log ({}): {}", reason, e);
        }
    }

    fn raise_alert(&self, attempt: &RedemptionAttempt, reason: FraudReason, attempt_count: u32) {
        let is_repeated = self.alerted_sources.check_and_mark(&attempt.ip_address);
        self.alerts.emit_fraud_alert(FraudAlertDraft {
            reason,
            message: format!("{} from {}", reason, attempt.ip_address),
            ip_address: Some(attempt.ip_address.clone()),
            merchant_id: attempt.merchant_id.clone(),
            attempt_count,
            is_repeated,
            metadata: json!({
                "gan": attempt.gan,
                "attemptCount": attempt_count,
            }),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn attempt(ip: &str) -> RedemptionAttempt {
        RedemptionAttempt {
            gan: "GC123".to_string(),
            ip_address: ip.to_string(),
            user_agent: Some("Mozilla/5.0".to_string()),
            merchant_id: Some("m-1".to_string()),
        }
    }

    fn guard_with(store: MemoryStore) -> FraudGuard {
        crate::test_support::init_tracing();
        FraudGuard::new(
            Arc::new(store),
            AlertChannel::new("test-secret"),
            DefenseConfig::for_tests(),
        )
    }

    #[tokio::test]
    async fn test_clean_attempt_is_allowed_and_logged() {
        let store = MemoryStore::new();
        let guard = guard_with(store.clone());

        let result = guard.check_fraud(&attempt("1.2.3.4")).await;
        assert!(!result.is_blocked);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(store.fraud_log_count().await, 1);

        let logs = store.get_recent_fraud_logs(10).await.unwrap();
        assert_eq!(logs[0].reason, "allowed");
    }

    #[tokio::test]
    async fn test_active_ip_rule_always_blocks() {
        let store = MemoryStore::new();
        store
            .create_defense_rule(&DefenseRule::new(RuleType::Ip, "9.9.9.9", "test", 90))
            .await
            .unwrap();
        let guard = guard_with(store.clone());

        let result = guard.check_fraud(&attempt("9.9.9.9")).await;
        assert!(result.is_blocked);
        assert_eq!(result.risk_level, RiskLevel::High);
        // The rejection must stay generic.
        assert!(!result.reason.unwrap().contains("rule"));

        let rules = store.list_defense_rules().await.unwrap();
        assert_eq!(rules[0].hit_count, 1);
        assert!(rules[0].last_triggered.is_some());

        let logs = store.get_recent_fraud_logs(10).await.unwrap();
        assert_eq!(logs[0].reason, "ip_rule_match");
    }

    #[tokio::test]
    async fn test_ip_rule_takes_priority_over_fingerprint_rule() {
        let store = MemoryStore::new();
        store
            .create_defense_rule(&DefenseRule::new(RuleType::Ip, "9.9.9.9", "test", 90))
            .await
            .unwrap();
        store
            .create_defense_rule(&DefenseRule::new(
                RuleType::Fingerprint,
                "Mozilla/5.0",
                "test",
                75,
            ))
            .await
            .unwrap();
        let guard = guard_with(store.clone());

        guard.check_fraud(&attempt("9.9.9.9")).await;
        let logs = store.get_recent_fraud_logs(10).await.unwrap();
        assert_eq!(logs[0].reason, "ip_rule_match");
    }

    #[tokio::test]
    async fn test_velocity_limit_blocks_without_a_rule() {
        let store = MemoryStore::new();
        let guard = guard_with(store.clone());

        // Limit is 5 per window; the 6th attempt crosses it.
        for _ in 0..5 {
            let result = guard.check_fraud(&attempt("8.8.8.8")).await;
            assert!(!result.is_blocked);
        }
        let result = guard.check_fraud(&attempt("8.8.8.8")).await;
        assert!(result.is_blocked);

        let logs = store.get_recent_fraud_logs(10).await.unwrap();
        assert_eq!(logs[0].reason, "rate_limit_ip");
    }

    #[tokio::test]
    async fn test_risk_escalates_with_attempt_volume() {
        let store = MemoryStore::new();
        let guard = guard_with(store);

        assert_eq!(
            guard.check_fraud(&attempt("7.7.7.7")).await.risk_level,
            RiskLevel::Low
        );
        assert_eq!(
            guard.check_fraud(&attempt("7.7.7.7")).await.risk_level,
            RiskLevel::Medium
        );
    }

    #[tokio::test]
    async fn test_block_emits_alert_with_repeat_flag() {
        let store = MemoryStore::new();
        store
            .create_defense_rule(&DefenseRule::new(RuleType::Ip, "9.9.9.9", "test", 90))
            .await
            .unwrap();
        let alerts = AlertChannel::new("test-secret");
        let mut rx = alerts.subscribe("test-secret").unwrap();
        let guard = FraudGuard::new(Arc::new(store), alerts, DefenseConfig::for_tests());

        guard.check_fraud(&attempt("9.9.9.9")).await;
        guard.check_fraud(&attempt("9.9.9.9")).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (
                crate::alerts::AdminAlert::FraudAlert(a),
                crate::alerts::AdminAlert::FraudAlert(b),
            ) => {
                assert!(!a.is_repeated);
                assert!(b.is_repeated);
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[test]
    fn test_velocity_tracker_evicts_stale_keys() {
        let tracker = VelocityTracker::new(Duration::from_millis(1));
        for i in 0..1000 {
            tracker.record(&format!("10.0.{}.{}", i / 256, i % 256));
        }
        std::thread::sleep(Duration::from_millis(10));

        // The sweep on the next record drops every aged-out source.
        tracker.record("fresh");
        let state = tracker.state.lock().unwrap();
        assert_eq!(state.hits.len(), 1);
        assert!(state.hits.contains_key("fresh"));
    }

    #[test]
    fn test_repeat_tracker_forgets_outside_window() {
        let tracker = RepeatTracker::new(Duration::from_millis(1));
        assert!(!tracker.check_and_mark("1.2.3.4"));
        assert!(tracker.check_and_mark("1.2.3.4"));

        std::thread::sleep(Duration::from_millis(10));
        // Alert aged out: no longer a repeat, and the sweep dropped it.
        assert!(!tracker.check_and_mark("1.2.3.4"));
        assert_eq!(tracker.state.lock().unwrap().last_alert.len(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_does_not_consume_velocity_budget() {
        let store = MemoryStore::new();
        let guard = guard_with(store.clone());

        // 4 checks put the IP one attempt below the limit of 5.
        for _ in 0..4 {
            assert!(!guard.check_fraud(&attempt("8.8.8.8")).await.is_blocked);
        }
        guard
            .record_outcome(&attempt("8.8.8.8"), FraudReason::ReusedGan)
            .await;

        // Reporting the outcome must not count as a fifth attempt.
        let result = guard.check_fraud(&attempt("8.8.8.8")).await;
        assert!(!result.is_blocked);
    }

    #[tokio::test]
    async fn test_record_outcome_appends_log() {
        let store = MemoryStore::new();
        let guard = guard_with(store.clone());

        guard
            .record_outcome(&attempt("1.2.3.4"), FraudReason::ReusedGan)
            .await;

        let logs = store.get_recent_fraud_logs(10).await.unwrap();
        assert_eq!(logs[0].reason, "reused_gan");
    }

    #[tokio::test]
    async fn test_statistics_aggregate_rules() {
        let store = MemoryStore::new();
        store
            .create_defense_rule(&DefenseRule::new(RuleType::Ip, "1.1.1.1", "test", 80))
            .await
            .unwrap();
        store
            .create_defense_rule(&DefenseRule::new(RuleType::Merchant, "m-1", "test", 60))
            .await
            .unwrap();
        let inactive = DefenseRule::new(RuleType::Ip, "2.2.2.2", "test", 50);
        store.create_defense_rule(&inactive).await.unwrap();
        store.deactivate_defense_rule(inactive.id).await.unwrap();

        let guard = guard_with(store);
        let stats = guard.get_defense_statistics().await.unwrap();
        assert_eq!(stats.total_rules, 3);
        assert_eq!(stats.active_rules, 2);
        assert_eq!(stats.ip_rules, 1);
        assert_eq!(stats.merchant_rules, 1);
        assert_eq!(stats.average_confidence, 70.0);
    }
}
