//! # In-Memory Store
//!
//! A [`DefenseStore`] backed by process memory. Used as the test double for
//! every service in this crate and suitable for embedding the subsystem
//! without a database (single-process deployments, demos).
//!
//! Honours the same invariants as the Postgres backend: append-only fraud
//! log, `(type, value)` uniqueness among active rules, atomic hit-count
//! increments (under the table lock).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    DefenseRule, DeliveryLogUpdate, FraudLogEntry, RuleType, WebhookDeliveryLog,
    WebhookEventRegistration, WebhookFailureLog, WebhookRetryQueueItem,
};
use super::{DefenseStore, StorageError};

#[derive(Default)]
struct Tables {
    rules: Vec<DefenseRule>,
    fraud_logs: Vec<FraudLogEntry>,
    registrations: Vec<WebhookEventRegistration>,
    delivery_logs: HashMap<Uuid, WebhookDeliveryLog>,
    retry_queue: Vec<WebhookRetryQueueItem>,
    failure_logs: Vec<WebhookFailureLog>,
}

/// In-process implementation of [`DefenseStore`].
///
/// Cloning is cheap; all clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fraud log entries. Test helper.
    pub async fn fraud_log_count(&self) -> usize {
        self.tables.lock().await.fraud_logs.len()
    }

    /// Number of items currently queued for retry. Test helper.
    pub async fn retry_queue_len(&self) -> usize {
        self.tables.lock().await.retry_queue.len()
    }

    /// Pull every queued retry's `next_retry_at` into the past so the next
    /// scheduler tick picks it up. Test helper — lets tests step through
    /// backoff sequences without sleeping.
    pub async fn make_retries_ready(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        let mut tables = self.tables.lock().await;
        for item in &mut tables.retry_queue {
            item.next_retry_at = past;
        }
    }
}

#[async_trait]
impl DefenseStore for MemoryStore {
    async fn get_active_defense_rule(
        &self,
        rule_type: RuleType,
        value: &str,
    ) -> Result<Option<DefenseRule>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rules
            .iter()
            .find(|r| r.is_active && r.rule_type == rule_type && r.value == value)
            .cloned())
    }

    async fn create_defense_rule(&self, rule: &DefenseRule) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let duplicate = tables
            .rules
            .iter()
            .any(|r| r.is_active && r.rule_type == rule.rule_type && r.value == rule.value);
        if duplicate {
            return Err(StorageError::RuleConflict {
                rule_type: rule.rule_type,
                value: rule.value.clone(),
            });
        }
        tables.rules.push(rule.clone());
        Ok(())
    }

    async fn increment_rule_hit_count(&self, id: Uuid) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let rule = tables
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("defense rule {}", id)))?;
        rule.hit_count += 1;
        rule.last_triggered = Some(Utc::now());
        Ok(())
    }

    async fn deactivate_defense_rule(&self, id: Uuid) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let rule = tables
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("defense rule {}", id)))?;
        rule.is_active = false;
        Ok(())
    }

    async fn list_defense_rules(&self) -> Result<Vec<DefenseRule>, StorageError> {
        let tables = self.tables.lock().await;
        let mut rules = tables.rules.clone();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    async fn create_fraud_log_entry(&self, entry: &FraudLogEntry) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.fraud_logs.push(entry.clone());
        Ok(())
    }

    async fn get_recent_fraud_logs(
        &self,
        limit: usize,
    ) -> Result<Vec<FraudLogEntry>, StorageError> {
        let tables = self.tables.lock().await;
        let mut logs = tables.fraud_logs.clone();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn get_webhook_event_registrations(
        &self,
        merchant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookEventRegistration>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .registrations
            .iter()
            .filter(|r| r.enabled && r.merchant_id == merchant_id && r.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn create_webhook_event_registration(
        &self,
        registration: &WebhookEventRegistration,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.registrations.push(registration.clone());
        Ok(())
    }

    async fn create_webhook_delivery_log(
        &self,
        log: &WebhookDeliveryLog,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.delivery_logs.insert(log.id, log.clone());
        Ok(())
    }

    async fn get_webhook_delivery_log_by_id(
        &self,
        id: Uuid,
    ) -> Result<WebhookDeliveryLog, StorageError> {
        let tables = self.tables.lock().await;
        tables
            .delivery_logs
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("delivery log {}", id)))
    }

    async fn update_webhook_delivery_log(
        &self,
        id: Uuid,
        update: &DeliveryLogUpdate,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let log = tables
            .delivery_logs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("delivery log {}", id)))?;
        if let Some(status_code) = update.status_code {
            log.status_code = Some(status_code);
        }
        if let Some(response_time_ms) = update.response_time_ms {
            log.response_time_ms = response_time_ms;
        }
        if let Some(success) = update.success {
            log.success = success;
        }
        if let Some(ref error_message) = update.error_message {
            log.error_message = error_message.clone();
        }
        if let Some(retry_count) = update.retry_count {
            log.retry_count = retry_count;
        }
        if let Some(delivered_at) = update.delivered_at {
            log.delivered_at = Some(delivered_at);
        }
        Ok(())
    }

    async fn list_webhook_delivery_logs(
        &self,
        merchant_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>, StorageError> {
        let tables = self.tables.lock().await;
        let mut logs: Vec<WebhookDeliveryLog> = tables
            .delivery_logs
            .values()
            .filter(|l| merchant_id.map_or(true, |m| l.merchant_id == m))
            .filter(|l| since.map_or(true, |s| l.created_at >= s))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn create_webhook_retry(
        &self,
        item: &WebhookRetryQueueItem,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.retry_queue.push(item.clone());
        Ok(())
    }

    async fn get_ready_webhook_retries(
        &self,
    ) -> Result<Vec<WebhookRetryQueueItem>, StorageError> {
        let now = Utc::now();
        let tables = self.tables.lock().await;
        let mut ready: Vec<WebhookRetryQueueItem> = tables
            .retry_queue
            .iter()
            .filter(|item| item.next_retry_at <= now)
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        Ok(ready)
    }

    async fn delete_webhook_retry(&self, id: Uuid) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.retry_queue.retain(|item| item.id != id);
        Ok(())
    }

    async fn create_webhook_failure_log(
        &self,
        log: &WebhookFailureLog,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.failure_logs.push(log.clone());
        Ok(())
    }

    async fn get_webhook_failures_since(
        &self,
        merchant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WebhookFailureLog>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .failure_logs
            .iter()
            .filter(|f| f.merchant_id == merchant_id && f.created_at >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_active_rule_uniqueness() {
        let store = MemoryStore::new();
        let rule = DefenseRule::new(RuleType::Ip, "1.2.3.4", "manual block", 90);
        store.create_defense_rule(&rule).await.unwrap();

        let dup = DefenseRule::new(RuleType::Ip, "1.2.3.4", "again", 80);
        let err = store.create_defense_rule(&dup).await.unwrap_err();
        assert!(matches!(err, StorageError::RuleConflict { .. }));

        // Deactivating the first frees up the (type, value) slot.
        store.deactivate_defense_rule(rule.id).await.unwrap();
        store.create_defense_rule(&dup).await.unwrap();
    }

    #[tokio::test]
    async fn test_hit_count_increment_stamps_last_triggered() {
        let store = MemoryStore::new();
        let rule = DefenseRule::new(RuleType::Merchant, "m-1", "test", 70);
        store.create_defense_rule(&rule).await.unwrap();

        store.increment_rule_hit_count(rule.id).await.unwrap();
        store.increment_rule_hit_count(rule.id).await.unwrap();

        let rules = store.list_defense_rules().await.unwrap();
        assert_eq!(rules[0].hit_count, 2);
        assert!(rules[0].last_triggered.is_some());
    }

    #[tokio::test]
    async fn test_ready_retries_exclude_future_items() {
        let store = MemoryStore::new();
        let ready = WebhookRetryQueueItem {
            id: Uuid::new_v4(),
            delivery_id: Uuid::new_v4(),
            retry_count: 1,
            next_retry_at: Utc::now() - chrono::Duration::seconds(5),
            last_status: "HTTP 500".to_string(),
        };
        let future = WebhookRetryQueueItem {
            id: Uuid::new_v4(),
            delivery_id: Uuid::new_v4(),
            retry_count: 1,
            next_retry_at: Utc::now() + chrono::Duration::seconds(3600),
            last_status: "timeout".to_string(),
        };
        store.create_webhook_retry(&ready).await.unwrap();
        store.create_webhook_retry(&future).await.unwrap();

        let due = store.get_ready_webhook_retries().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ready.id);
    }
}
