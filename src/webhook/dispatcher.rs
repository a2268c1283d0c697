//! # Webhook Dispatcher
//!
//! Fans business events out to merchant endpoints. Dispatch is
//! fire-and-forget relative to the triggering operation: the redemption
//! that produced an event never waits on, and never fails because of, a
//! merchant's endpoint.
//!
//! ## Isolation Guarantees
//!
//! - N registrations for one event become N independently timed tasks;
//!   a slow endpoint cannot delay delivery to its siblings.
//! - Tasks settle individually — one endpoint's failure never aborts the
//!   rest of the fan-out.
//! - A storage error while logging one delivery is logged and contained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertChannel, AlertSeverity};
use crate::config::DefenseConfig;
use crate::models::WebhookEventType;
use crate::storage::models::{
    DeliveryLogUpdate, WebhookDeliveryLog, WebhookEventRegistration, WebhookFailureLog,
    WebhookRetryQueueItem,
};
use crate::storage::DefenseStore;
use crate::webhook::signature::sign_payload;
use crate::webhook::transport::{DeliveryRequest, TransportError, WebhookTransport};
use crate::webhook::DeliveryError;

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptOutcome {
    /// 2xx response.
    Success,
    /// Retryable: 5xx, 408, 429, timeout, network error.
    Transient,
    /// Any other 4xx — the endpoint will keep rejecting this.
    Terminal,
}

/// Result of one wire attempt, before bookkeeping.
#[derive(Debug, Clone)]
struct AttemptResult {
    outcome: AttemptOutcome,
    status_code: Option<i32>,
    response_time_ms: i64,
    error_message: Option<String>,
}

/// Classify an HTTP status code.
///
/// 408 (request timeout) and 429 (too many requests) are the only 4xx
/// statuses worth retrying; the rest mean the request itself is bad.
fn classify_status(status: u16) -> AttemptOutcome {
    match status {
        200..=299 => AttemptOutcome::Success,
        408 | 429 => AttemptOutcome::Transient,
        400..=499 => AttemptOutcome::Terminal,
        _ => AttemptOutcome::Transient,
    }
}

/// Delay before retry number `retry_number` (1-based): `3^(n-1)` seconds
/// with ±25% jitter, so retries land around 1s, 3s, 9s, 27s, 81s.
pub(crate) fn backoff_delay(retry_number: u32) -> Duration {
    let base_secs = 3u64.pow(retry_number.saturating_sub(1)) as f64;
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base_secs * jitter * 1000.0) as u64)
}

/// The webhook delivery service.
///
/// Cloning is cheap; all clones share the store, transport and alert
/// channel handles.
#[derive(Clone)]
pub struct WebhookDispatcher {
    /// Storage handle for registrations, logs and the retry queue.
    store: Arc<dyn DefenseStore>,

    /// Wire transport. Tests inject a scripted mock.
    transport: Arc<dyn WebhookTransport>,

    /// Channel for failure spike alerts.
    alerts: AlertChannel,

    /// Subsystem configuration.
    config: DefenseConfig,
}

impl WebhookDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<dyn DefenseStore>,
        transport: Arc<dyn WebhookTransport>,
        alerts: AlertChannel,
        config: DefenseConfig,
    ) -> Self {
        Self {
            store,
            transport,
            alerts,
            config,
        }
    }

    /// Register a merchant endpoint for an event type.
    ///
    /// The URL is validated here, synchronously — a malformed URL is a
    /// registration-time error, never a delivery-time surprise.
    pub async fn register_webhook(
        &self,
        merchant_id: &str,
        event_type: WebhookEventType,
        url: &str,
        secret: &str,
    ) -> Result<WebhookEventRegistration, DeliveryError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| DeliveryError::Validation(format!("invalid webhook URL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(DeliveryError::Validation(format!(
                "unsupported webhook URL scheme: {}",
                parsed.scheme()
            )));
        }
        if secret.is_empty() {
            return Err(DeliveryError::Validation(
                "webhook secret must not be empty".to_string(),
            ));
        }

        let registration = WebhookEventRegistration {
            id: Uuid::new_v4(),
            merchant_id: merchant_id.to_string(),
            event_type: event_type.as_str().to_string(),
            url: url.to_string(),
            secret: secret.to_string(),
            enabled: true,
        };
        self.store
            .create_webhook_event_registration(&registration)
            .await?;

        info!(
            "Registered webhook for merchant {} on {}",
            merchant_id, event_type
        );
        Ok(registration)
    }

    /// Fan an event out to every enabled registration, fire-and-forget.
    ///
    /// Returns immediately; delivery happens on a background task. Use
    /// [`dispatch_event`](Self::dispatch_event) when the caller needs to
    /// observe the fan-out (tests, batch jobs).
    pub fn dispatch(&self, merchant_id: &str, event_type: WebhookEventType, data: serde_json::Value) {
        let dispatcher = self.clone();
        let merchant_id = merchant_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch_event(&merchant_id, event_type, data).await {
                error!(
                    "Webhook dispatch failed for merchant {} event {}: {}",
                    merchant_id, event_type, e
                );
            }
        });
    }

    /// Awaitable fan-out. Settles every endpoint before returning; a single
    /// endpoint's failure never fails the call — it is recorded in that
    /// delivery's log instead.
    ///
    /// Returns the delivery IDs created, one per registration.
    pub async fn dispatch_event(
        &self,
        merchant_id: &str,
        event_type: WebhookEventType,
        data: serde_json::Value,
    ) -> Result<Vec<Uuid>, DeliveryError> {
        let registrations = self
            .store
            .get_webhook_event_registrations(merchant_id, event_type.as_str())
            .await?;

        if registrations.is_empty() {
            debug!(
                "No webhook registrations for merchant {} event {}",
                merchant_id, event_type
            );
            return Ok(Vec::new());
        }

        debug!(
            "Dispatching {} to {} endpoint(s) for merchant {}",
            event_type,
            registrations.len(),
            merchant_id
        );

        // One task per registration; join_all settles every one of them.
        let tasks: Vec<_> = registrations
            .into_iter()
            .map(|registration| {
                let dispatcher = self.clone();
                let data = data.clone();
                tokio::spawn(async move {
                    dispatcher.deliver_new(registration, event_type, data).await
                })
            })
            .collect();

        let mut delivery_ids = Vec::new();
        for settled in futures::future::join_all(tasks).await {
            match settled {
                Ok(Ok(id)) => delivery_ids.push(id),
                Ok(Err(e)) => warn!("Webhook delivery bookkeeping failed: {}", e),
                Err(e) => error!("Webhook delivery task panicked: {}", e),
            }
        }
        Ok(delivery_ids)
    }

    /// First attempt for one registration: attempt, log, and route the
    /// outcome (retry queue or failure log).
    async fn deliver_new(
        &self,
        registration: WebhookEventRegistration,
        event_type: WebhookEventType,
        data: serde_json::Value,
    ) -> Result<Uuid, DeliveryError> {
        let payload = json!({
            "event": event_type.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });

        let attempt = self
            .attempt(&registration.url, &registration.secret, event_type.as_str(), &payload)
            .await;

        let delivery_id = Uuid::new_v4();
        let log = WebhookDeliveryLog {
            id: delivery_id,
            merchant_id: registration.merchant_id.clone(),
            webhook_event_id: registration.id,
            url: registration.url.clone(),
            event_type: event_type.as_str().to_string(),
            payload,
            status_code: attempt.status_code,
            response_time_ms: attempt.response_time_ms,
            success: attempt.outcome == AttemptOutcome::Success,
            error_message: attempt.error_message.clone(),
            retry_count: 0,
            delivered_at: (attempt.outcome == AttemptOutcome::Success).then(Utc::now),
            created_at: Utc::now(),
        };
        self.store.create_webhook_delivery_log(&log).await?;

        match attempt.outcome {
            AttemptOutcome::Success => {
                debug!(
                    "Delivered {} to {} in {}ms",
                    event_type, registration.url, attempt.response_time_ms
                );
            }
            AttemptOutcome::Transient => {
                self.schedule_retry(delivery_id, 0, &attempt).await?;
            }
            AttemptOutcome::Terminal => {
                self.mark_permanent_failure(&log, &attempt).await?;
            }
        }
        Ok(delivery_id)
    }

    /// Process one ready retry queue item. Called by the scheduler, which
    /// guarantees retries for a single delivery are strictly sequential.
    pub(crate) async fn process_retry(
        &self,
        item: WebhookRetryQueueItem,
    ) -> Result<(), DeliveryError> {
        // Remove the item up front so a crash mid-attempt can never leave
        // two schedulers racing on the same delivery.
        self.store.delete_webhook_retry(item.id).await?;

        let log = self
            .store
            .get_webhook_delivery_log_by_id(item.delivery_id)
            .await?;

        // The secret lives on the registration; a registration that has
        // been removed or disabled since dispatch ends the delivery.
        let registration = self
            .store
            .get_webhook_event_registrations(&log.merchant_id, &log.event_type)
            .await?
            .into_iter()
            .find(|r| r.id == log.webhook_event_id);

        let Some(registration) = registration else {
            warn!(
                "Registration {} gone; abandoning delivery {}",
                log.webhook_event_id, log.id
            );
            let attempt = AttemptResult {
                outcome: AttemptOutcome::Terminal,
                status_code: None,
                response_time_ms: 0,
                error_message: Some("webhook registration removed or disabled".to_string()),
            };
            self.finish_attempt(&log, item.retry_count, attempt).await?;
            return Ok(());
        };

        let attempt = self
            .attempt(&log.url, &registration.secret, &log.event_type, &log.payload)
            .await;

        self.finish_attempt(&log, item.retry_count, attempt).await
    }

    /// Record the outcome of retry number `retry_number` and route it.
    async fn finish_attempt(
        &self,
        log: &WebhookDeliveryLog,
        retry_number: i32,
        attempt: AttemptResult,
    ) -> Result<(), DeliveryError> {
        let success = attempt.outcome == AttemptOutcome::Success;
        let update = DeliveryLogUpdate {
            status_code: attempt.status_code,
            response_time_ms: Some(attempt.response_time_ms),
            success: Some(success),
            error_message: Some(attempt.error_message.clone()),
            retry_count: Some(retry_number),
            delivered_at: success.then(Utc::now),
        };
        self.store.update_webhook_delivery_log(log.id, &update).await?;

        match attempt.outcome {
            AttemptOutcome::Success => {
                info!(
                    "Delivery {} succeeded on retry {} ({}ms)",
                    log.id, retry_number, attempt.response_time_ms
                );
                Ok(())
            }
            AttemptOutcome::Transient => {
                self.schedule_retry(log.id, retry_number, &attempt).await
            }
            AttemptOutcome::Terminal => {
                let mut updated = log.clone();
                updated.retry_count = retry_number;
                updated.status_code = attempt.status_code;
                self.mark_permanent_failure(&updated, &attempt).await
            }
        }
    }

    /// Enqueue the next retry, or abandon the delivery when the attempt
    /// budget is spent. `retries_so_far` counts retries already performed.
    async fn schedule_retry(
        &self,
        delivery_id: Uuid,
        retries_so_far: i32,
        attempt: &AttemptResult,
    ) -> Result<(), DeliveryError> {
        // Total attempts = 1 + retries. The (max_retries)th attempt is the
        // last; failing it exhausts the delivery.
        let attempts_made = retries_so_far + 1;
        if attempts_made >= self.config.webhook_max_retries as i32 {
            let log = self.store.get_webhook_delivery_log_by_id(delivery_id).await?;
            warn!(
                "Delivery {} exhausted after {} attempts",
                delivery_id, attempts_made
            );
            return self.mark_permanent_failure(&log, attempt).await;
        }

        let next_retry_number = attempts_made; // 1-based number of the upcoming retry
        let delay = backoff_delay(next_retry_number as u32);
        let item = WebhookRetryQueueItem {
            id: Uuid::new_v4(),
            delivery_id,
            retry_count: next_retry_number,
            next_retry_at: Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
            last_status: attempt
                .status_code
                .map(|s| format!("HTTP {}", s))
                .or_else(|| attempt.error_message.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        self.store.create_webhook_retry(&item).await?;

        debug!(
            "Scheduled retry {} for delivery {} in {:?}",
            next_retry_number, delivery_id, delay
        );
        Ok(())
    }

    /// Abandon a delivery: mark the log failed, write a failure log row and
    /// run spike detection for the merchant.
    async fn mark_permanent_failure(
        &self,
        log: &WebhookDeliveryLog,
        attempt: &AttemptResult,
    ) -> Result<(), DeliveryError> {
        let update = DeliveryLogUpdate {
            status_code: attempt.status_code,
            success: Some(false),
            error_message: Some(attempt.error_message.clone()),
            ..Default::default()
        };
        self.store.update_webhook_delivery_log(log.id, &update).await?;

        let failure = WebhookFailureLog {
            id: Uuid::new_v4(),
            delivery_id: log.id,
            merchant_id: log.merchant_id.clone(),
            status_code: attempt.status_code,
            error_message: attempt.error_message.clone(),
            resolved: false,
            created_at: Utc::now(),
        };
        self.store.create_webhook_failure_log(&failure).await?;

        warn!(
            "Delivery {} permanently failed for merchant {} (status: {:?})",
            log.id, log.merchant_id, attempt.status_code
        );

        self.check_failure_spike(&log.merchant_id).await
    }

    /// Count permanent failures for this merchant in the trailing window
    /// and raise a high-severity alert at the threshold.
    async fn check_failure_spike(&self, merchant_id: &str) -> Result<(), DeliveryError> {
        let since =
            Utc::now() - chrono::Duration::seconds(self.config.failure_spike_window_secs as i64);
        let failures = self
            .store
            .get_webhook_failures_since(merchant_id, since)
            .await?;

        if failures.len() >= self.config.failure_spike_threshold {
            self.alerts.emit_system_status(
                "webhook_delivery",
                false,
                AlertSeverity::High,
                &format!(
                    "Webhook failure spike for merchant {}: {} permanent failures in the last {}s",
                    merchant_id,
                    failures.len(),
                    self.config.failure_spike_window_secs
                ),
                json!({
                    "merchantId": merchant_id,
                    "failureCount": failures.len(),
                    "windowSecs": self.config.failure_spike_window_secs,
                }),
            );
        }
        Ok(())
    }

    /// One wire attempt: serialize, sign (fresh signature every time), POST
    /// with the hard timeout, measure, classify.
    async fn attempt(
        &self,
        url: &str,
        secret: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> AttemptResult {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                // Payloads are built from already-serialized values, so this
                // is unreachable in practice; classify it terminal if not.
                return AttemptResult {
                    outcome: AttemptOutcome::Terminal,
                    status_code: None,
                    response_time_ms: 0,
                    error_message: Some(format!("payload serialization failed: {}", e)),
                };
            }
        };

        let request = DeliveryRequest {
            url: url.to_string(),
            signature: sign_payload(&body, secret),
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            body,
        };

        let started = Instant::now();
        let result = self.transport.deliver(&request).await;
        let response_time_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(response) => AttemptResult {
                outcome: classify_status(response.status),
                status_code: Some(response.status as i32),
                response_time_ms,
                error_message: (!(200..300).contains(&response.status))
                    .then(|| format!("endpoint returned HTTP {}", response.status)),
            },
            Err(TransportError::Timeout) => AttemptResult {
                outcome: AttemptOutcome::Transient,
                status_code: None,
                response_time_ms,
                error_message: Some("delivery timed out".to_string()),
            },
            Err(TransportError::Network(message)) => AttemptResult {
                outcome: AttemptOutcome::Transient,
                status_code: None,
                response_time_ms,
                error_message: Some(message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::webhook::transport::mock::MockTransport;

    fn setup() -> (WebhookDispatcher, MemoryStore, MockTransport, AlertChannel) {
        crate::test_support::init_tracing();
        let store = MemoryStore::new();
        let transport = MockTransport::new();
        let alerts = AlertChannel::new("test-secret");
        let dispatcher = WebhookDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            alerts.clone(),
            DefenseConfig::for_tests(),
        );
        (dispatcher, store, transport, alerts)
    }

    async fn register(dispatcher: &WebhookDispatcher, merchant: &str) -> WebhookEventRegistration {
        dispatcher
            .register_webhook(
                merchant,
                WebhookEventType::GiftcardRedeemed,
                "https://merchant.example/hooks",
                "hook-secret",
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(200), AttemptOutcome::Success);
        assert_eq!(classify_status(204), AttemptOutcome::Success);
        assert_eq!(classify_status(408), AttemptOutcome::Transient);
        assert_eq!(classify_status(429), AttemptOutcome::Transient);
        assert_eq!(classify_status(500), AttemptOutcome::Transient);
        assert_eq!(classify_status(503), AttemptOutcome::Transient);
        assert_eq!(classify_status(400), AttemptOutcome::Terminal);
        assert_eq!(classify_status(404), AttemptOutcome::Terminal);
        assert_eq!(classify_status(410), AttemptOutcome::Terminal);
    }

    #[test]
    fn test_backoff_grows_exponentially_with_jitter() {
        for (retry, base_ms) in [(1u32, 1000u64), (2, 3000), (3, 9000), (4, 27000), (5, 81000)] {
            let delay = backoff_delay(retry).as_millis() as u64;
            assert!(delay >= base_ms * 3 / 4, "retry {}: {}ms too short", retry, delay);
            assert!(delay <= base_ms * 5 / 4, "retry {}: {}ms too long", retry, delay);
        }
    }

    #[test]
    fn test_invalid_registration_url_rejected() {
        let (dispatcher, _, _, _) = setup();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = rt
            .block_on(dispatcher.register_webhook(
                "m-1",
                WebhookEventType::GiftcardRedeemed,
                "not a url",
                "s",
            ))
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));

        let err = rt
            .block_on(dispatcher.register_webhook(
                "m-1",
                WebhookEventType::GiftcardRedeemed,
                "ftp://merchant.example/hooks",
                "s",
            ))
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_successful_dispatch_logs_delivery() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;
        transport.push_status(200).await;

        let ids = dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({"gan": "GC123"}))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let log = store.get_webhook_delivery_log_by_id(ids[0]).await.unwrap();
        assert!(log.success);
        assert_eq!(log.status_code, Some(200));
        assert_eq!(log.retry_count, 0);
        assert!(log.delivered_at.is_some());
        assert_eq!(store.retry_queue_len().await, 0);

        // Wire format checks: signed body, event header, envelope shape.
        let requests = transport.requests().await;
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.event_type, "giftcard.redeemed");
        assert!(crate::webhook::signature::verify_signature(
            &request.body,
            "hook-secret",
            &request.signature,
        ));
        let envelope: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(envelope["event"], "giftcard.redeemed");
        assert_eq!(envelope["data"]["gan"], "GC123");
        assert!(envelope["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_transient_failure_enqueues_retry() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;
        transport.push_status(500).await;

        let ids = dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({}))
            .await
            .unwrap();

        let log = store.get_webhook_delivery_log_by_id(ids[0]).await.unwrap();
        assert!(!log.success);
        assert_eq!(log.status_code, Some(500));
        assert_eq!(store.retry_queue_len().await, 1);

        let ready_later = store.get_ready_webhook_retries().await.unwrap();
        // Backoff pushes next_retry_at into the future; nothing is ready yet.
        assert!(ready_later.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_404_fails_immediately_without_retry() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;
        transport.push_status(404).await;

        let ids = dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({}))
            .await
            .unwrap();

        let log = store.get_webhook_delivery_log_by_id(ids[0]).await.unwrap();
        assert!(!log.success);
        assert_eq!(log.status_code, Some(404));
        assert_eq!(store.retry_queue_len().await, 0);

        let failures = store
            .get_webhook_failures_since("m-1", Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status_code, Some(404));
    }

    #[tokio::test]
    async fn test_fan_out_isolates_endpoint_failures() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;
        register(&dispatcher, "m-1").await;
        transport.push_status(500).await;
        transport.push_status(200).await;

        let ids = dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({}))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let mut successes = 0;
        for id in &ids {
            if store.get_webhook_delivery_log_by_id(*id).await.unwrap().success {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_signature_recomputed_per_attempt() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;
        transport.push_status(500).await;
        transport.push_status(200).await;

        dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({"n": 1}))
            .await
            .unwrap();

        store.make_retries_ready().await;
        let item = store.get_ready_webhook_retries().await.unwrap().remove(0);
        dispatcher.process_retry(item).await.unwrap();

        let requests = transport.requests().await;
        assert_eq!(requests.len(), 2);
        // Same payload, fresh signature computation each attempt; both must
        // verify independently.
        for request in &requests {
            assert!(crate::webhook::signature::verify_signature(
                &request.body,
                "hook-secret",
                &request.signature,
            ));
        }
    }

    #[tokio::test]
    async fn test_four_failures_then_success_on_final_attempt() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;

        transport.push_status(500).await;
        let ids = dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({}))
            .await
            .unwrap();

        // Retries 1-3 keep failing, retry 4 (attempt 5) succeeds.
        for status in [500, 500, 500, 200] {
            transport.push_status(status).await;
            store.make_retries_ready().await;
            let item = store.get_ready_webhook_retries().await.unwrap().remove(0);
            dispatcher.process_retry(item).await.unwrap();
        }

        let log = store.get_webhook_delivery_log_by_id(ids[0]).await.unwrap();
        assert!(log.success);
        assert_eq!(log.retry_count, 4);
        assert!(log.delivered_at.is_some());
        assert_eq!(store.retry_queue_len().await, 0);
        assert_eq!(transport.requests().await.len(), 5);
    }

    #[tokio::test]
    async fn test_exhausting_retries_marks_permanent_failure() {
        let (dispatcher, store, transport, _) = setup();
        register(&dispatcher, "m-1").await;

        transport.push_status(503).await;
        let ids = dispatcher
            .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({}))
            .await
            .unwrap();

        // Four more transient failures exhaust the 5-attempt budget.
        for _ in 0..4 {
            transport.push_error(TransportError::Timeout).await;
            store.make_retries_ready().await;
            let item = store.get_ready_webhook_retries().await.unwrap().remove(0);
            dispatcher.process_retry(item).await.unwrap();
        }

        let log = store.get_webhook_delivery_log_by_id(ids[0]).await.unwrap();
        assert!(!log.success);
        assert_eq!(log.retry_count, 4);
        assert!(log.delivered_at.is_none());
        assert_eq!(store.retry_queue_len().await, 0);

        let failures = store
            .get_webhook_failures_since("m-1", Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn test_three_permanent_failures_raise_spike_alert() {
        let (dispatcher, _, transport, alerts) = setup();
        let mut rx = alerts.subscribe("test-secret").unwrap();
        register(&dispatcher, "m-1").await;

        for _ in 0..3 {
            transport.push_status(404).await;
            dispatcher
                .dispatch_event("m-1", WebhookEventType::GiftcardRedeemed, json!({}))
                .await
                .unwrap();
        }

        let alert = rx.recv().await.unwrap();
        match alert {
            crate::alerts::AdminAlert::SystemStatus(status) => {
                assert_eq!(status.severity, AlertSeverity::High);
                assert!(!status.healthy);
                assert_eq!(status.metadata["failureCount"], 3);
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        // Only the third failure crossed the threshold.
        assert!(rx.try_recv().is_err());
    }
}
