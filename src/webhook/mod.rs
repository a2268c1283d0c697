//! # Webhook Delivery Subsystem
//!
//! Signs and delivers business events to merchant-registered endpoints,
//! retries transient failures with exponential backoff, and records every
//! attempt for the admin surface.
//!
//! ## Delivery Flow
//!
//! ```text
//! dispatch(merchant, event, data)
//!              │
//!              ├── load enabled registrations for (merchant, event)
//!              │
//!              └── one independent task per registration:
//!                     sign payload → POST (10s timeout) → log attempt
//!                             │
//!                    ┌────────┴─────────┐
//!                 success          failure
//!                    │                  │
//!              delivered_at    transient? → retry queue (backoff)
//!                                terminal? → failure log + spike check
//! ```
//!
//! ## Retry Policy
//!
//! Up to 5 total attempts. Backoff before retry *n* is `3^(n-1)` seconds
//! with ±25% jitter (~1s, 3s, 9s, 27s, 81s). HTTP 5xx, 408, 429, timeouts
//! and network errors retry; any other 4xx is terminal on first sight.

pub mod dispatcher;
pub mod retry;
pub mod signature;
pub mod transport;

use thiserror::Error;

use crate::storage::StorageError;

pub use dispatcher::WebhookDispatcher;
pub use retry::{RetryScheduler, RetrySchedulerHandle};
pub use transport::{HttpTransport, WebhookTransport};

/// Errors the delivery layer surfaces to its callers.
///
/// Per-attempt failures never appear here: transient and terminal outcomes
/// are routed internally (retry queue, failure log) and recorded on the
/// delivery log, because a merchant endpoint failing is bookkeeping for the
/// dispatcher, not an error for the business operation that emitted the
/// event.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Malformed input, rejected before any side effect.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
