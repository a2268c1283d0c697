//! # Storage Interface
//!
//! The persistence engine is an external collaborator; this module defines
//! the seam the subsystem consumes it through. Two implementations ship:
//!
//! - [`PostgresStore`](postgres::PostgresStore) — deadpool-postgres, the
//!   production backend
//! - [`MemoryStore`](memory::MemoryStore) — in-process, used as the test
//!   double and for embedding
//!
//! ## Contract Notes
//!
//! - Fraud logs are append-only; there is no update or delete operation.
//! - `(rule_type, value)` is unique among **active** rules. Creating a
//!   duplicate active rule returns [`StorageError::RuleConflict`]; callers
//!   treat that as "increment the existing rule instead".
//! - Hit-count increments must be atomic per rule under concurrent guard
//!   evaluations.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use models::{
    DefenseRule, DeliveryLogUpdate, FraudLogEntry, RuleType, WebhookDeliveryLog,
    WebhookEventRegistration, WebhookFailureLog, WebhookRetryQueueItem,
};

/// Storage-layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Could not reach the backend.
    #[error("Storage connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// An active rule already exists for this (type, value).
    #[error("Active rule already exists for {rule_type} {value}")]
    RuleConflict { rule_type: RuleType, value: String },

    /// Invalid configuration.
    #[error("Invalid storage configuration: {0}")]
    ConfigError(String),
}

/// The storage seam every component holds a handle to.
///
/// All operations are async; implementations must be `Send + Sync` so
/// handles can be shared across the guard's request path, the batch engines
/// and the retry scheduler.
#[async_trait]
pub trait DefenseStore: Send + Sync {
    // ==========================================
    // DEFENSE RULES
    // ==========================================

    /// Look up the active rule for `(rule_type, value)`, if one exists.
    /// This is the guard's hot-path lookup and must be O(1)-ish — an index
    /// probe, never a scan.
    async fn get_active_defense_rule(
        &self,
        rule_type: RuleType,
        value: &str,
    ) -> Result<Option<DefenseRule>, StorageError>;

    /// Persist a new rule. Fails with [`StorageError::RuleConflict`] if an
    /// active rule for the same (type, value) exists.
    async fn create_defense_rule(&self, rule: &DefenseRule) -> Result<(), StorageError>;

    /// Atomically bump a rule's hit count and stamp `last_triggered`.
    async fn increment_rule_hit_count(&self, id: Uuid) -> Result<(), StorageError>;

    /// Deactivate a rule. The row is kept for audit.
    async fn deactivate_defense_rule(&self, id: Uuid) -> Result<(), StorageError>;

    /// All rules, active and inactive, newest first.
    async fn list_defense_rules(&self) -> Result<Vec<DefenseRule>, StorageError>;

    // ==========================================
    // FRAUD LOG
    // ==========================================

    /// Append a fraud log entry.
    async fn create_fraud_log_entry(&self, entry: &FraudLogEntry) -> Result<(), StorageError>;

    /// The most recent `limit` fraud log entries, newest first.
    async fn get_recent_fraud_logs(&self, limit: usize) -> Result<Vec<FraudLogEntry>, StorageError>;

    // ==========================================
    // WEBHOOK REGISTRATIONS
    // ==========================================

    /// Enabled registrations for `(merchant_id, event_type)`.
    async fn get_webhook_event_registrations(
        &self,
        merchant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookEventRegistration>, StorageError>;

    /// Persist a registration. URL validity is the caller's responsibility
    /// (checked at registration time, before this call).
    async fn create_webhook_event_registration(
        &self,
        registration: &WebhookEventRegistration,
    ) -> Result<(), StorageError>;

    // ==========================================
    // DELIVERY LOGS
    // ==========================================

    /// Append a delivery log row.
    async fn create_webhook_delivery_log(
        &self,
        log: &WebhookDeliveryLog,
    ) -> Result<(), StorageError>;

    /// Fetch a delivery log by ID.
    async fn get_webhook_delivery_log_by_id(
        &self,
        id: Uuid,
    ) -> Result<WebhookDeliveryLog, StorageError>;

    /// Update mutable fields on a delivery log after a retry attempt.
    async fn update_webhook_delivery_log(
        &self,
        id: Uuid,
        update: &DeliveryLogUpdate,
    ) -> Result<(), StorageError>;

    /// Delivery logs for the admin read surface, newest first, optionally
    /// filtered by merchant and lower time bound.
    async fn list_webhook_delivery_logs(
        &self,
        merchant_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>, StorageError>;

    // ==========================================
    // RETRY QUEUE
    // ==========================================

    /// Enqueue a redelivery.
    async fn create_webhook_retry(&self, item: &WebhookRetryQueueItem) -> Result<(), StorageError>;

    /// Items whose `next_retry_at` has elapsed, oldest first.
    async fn get_ready_webhook_retries(&self) -> Result<Vec<WebhookRetryQueueItem>, StorageError>;

    /// Remove a queue item (delivery succeeded or was abandoned).
    async fn delete_webhook_retry(&self, id: Uuid) -> Result<(), StorageError>;

    // ==========================================
    // FAILURE LOG
    // ==========================================

    /// Record a permanent delivery failure.
    async fn create_webhook_failure_log(&self, log: &WebhookFailureLog) -> Result<(), StorageError>;

    /// Permanent failures for one merchant since `since`. Feeds spike
    /// detection.
    async fn get_webhook_failures_since(
        &self,
        merchant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WebhookFailureLog>, StorageError>;
}
