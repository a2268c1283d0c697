//! # Sizu Defense
//!
//! Real-time fraud detection and auto-defense for gift-card redemption,
//! plus the signed webhook layer that keeps merchants informed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DEFENSE STACK                             │
//! │                                                                  │
//! │  redemption path                batch path                       │
//! │  ┌──────────────┐   fraud log   ┌──────────────┐                │
//! │  │  FraudGuard  │──────────────▶│ ThreatReplay │                │
//! │  └──────┬───────┘               └──────┬───────┘                │
//! │         │ alerts                       │ reports                 │
//! │         ▼                              ▼                         │
//! │  ┌──────────────┐               ┌──────────────┐                │
//! │  │ AlertChannel │◀──────────────│LearningEngine│──▶ rules       │
//! │  └──────────────┘  spike alerts └──────────────┘                │
//! │         ▲                                                        │
//! │  ┌──────┴─────────────────────────────────────┐                 │
//! │  │ WebhookDispatcher + RetryScheduler          │                 │
//! │  └─────────────────────────────────────────────┘                 │
//! │                          │                                       │
//! │                  DefenseStore (Postgres / Memory)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The HTTP route layer, the persistence engine, and the dashboard are
//! external collaborators. This crate exposes services to the route layer
//! and consumes persistence through the [`storage::DefenseStore`] trait.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sizu_defense::{DefenseConfig, DefenseStack};
//! use sizu_defense::storage::postgres::PostgresStore;
//! use std::sync::Arc;
//!
//! let config = DefenseConfig::from_env()?;
//! let store = Arc::new(PostgresStore::connect(&database_url).await?);
//! let stack = DefenseStack::new(store, config)?;
//!
//! // route layer:
//! let result = stack.guard.check_fraud(&attempt).await;
//!
//! // background:
//! let retry_handle = stack.spawn_retry_scheduler();
//! ```

pub mod alerts;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Once;

    /// Install a tracing subscriber once per test binary, so failing tests
    /// show service logs and `RUST_LOG` filters apply.
    pub(crate) fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .init();
        });
    }
}

use std::sync::Arc;
use std::time::Duration;

use alerts::AlertChannel;
pub use config::DefenseConfig;
use services::{FraudGuard, LearningEngine, ThreatReplay};
use storage::DefenseStore;
use webhook::transport::{HttpTransport, TransportError, WebhookTransport};
use webhook::{RetryScheduler, RetrySchedulerHandle, WebhookDispatcher};

/// The composed subsystem: every service, sharing one store, one alert
/// channel and one configuration. Built once at startup and passed to the
/// route layer by handle.
#[derive(Clone)]
pub struct DefenseStack {
    /// Synchronous per-attempt fraud checks.
    pub guard: FraudGuard,

    /// Offline replay of past attempts against the current ruleset.
    pub replay: ThreatReplay,

    /// Rule creation from replay reports.
    pub learning: LearningEngine,

    /// Outbound webhook delivery.
    pub webhooks: WebhookDispatcher,

    /// Broadcast channel for fraud and operational alerts.
    pub alerts: AlertChannel,

    store: Arc<dyn DefenseStore>,
    config: DefenseConfig,
}

impl DefenseStack {
    /// Compose the stack over a store, with the reqwest-backed transport.
    pub fn new(store: Arc<dyn DefenseStore>, config: DefenseConfig) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(
            config.webhook_timeout_secs,
        ))?);
        Ok(Self::with_transport(store, transport, config))
    }

    /// Compose the stack with an injected transport. Tests use this to wire
    /// in a scripted double.
    pub fn with_transport(
        store: Arc<dyn DefenseStore>,
        transport: Arc<dyn WebhookTransport>,
        config: DefenseConfig,
    ) -> Self {
        let alerts = AlertChannel::new(config.alert_channel_secret.clone());
        let guard = FraudGuard::new(store.clone(), alerts.clone(), config.clone());
        let replay = ThreatReplay::new(store.clone());
        let learning = LearningEngine::new(store.clone());
        let webhooks =
            WebhookDispatcher::new(store.clone(), transport, alerts.clone(), config.clone());

        Self {
            guard,
            replay,
            learning,
            webhooks,
            alerts,
            store,
            config,
        }
    }

    /// Start the webhook retry scheduler in the background.
    pub fn spawn_retry_scheduler(&self) -> RetrySchedulerHandle {
        RetryScheduler::new(
            self.store.clone(),
            self.webhooks.clone(),
            self.config.clone(),
        )
        .spawn()
    }
}
