//! # Services Module
//!
//! The core fraud-defense services. Each service holds injected storage and
//! alert handles; nothing here owns global state.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `FraudGuard` | Synchronous per-attempt block/allow decisions |
//! | `ThreatReplay` | Offline re-evaluation of past attempts against current rules |
//! | `LearningEngine` | Pattern aggregation and defense rule creation |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  redemption path (latency-critical)                              │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                     FraudGuard                            │   │
//! │  │  • check_fraud()  • record_outcome()                      │   │
//! │  │  • get_defense_statistics()                               │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │ writes fraud log                  │
//! │                              ▼                                   │
//! │  batch path (operator triggered)                                 │
//! │  ┌────────────────────┐         ┌────────────────────┐          │
//! │  │    ThreatReplay    │ reports │   LearningEngine   │          │
//! │  │                    │────────▶│                    │          │
//! │  │  run_replay(limit) │         │  learn(reports)    │          │
//! │  └────────────────────┘         └────────────────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod fraud_guard;
pub mod learning;
pub mod threat_replay;

pub use fraud_guard::FraudGuard;
pub use learning::LearningEngine;
pub use threat_replay::ThreatReplay;

use thiserror::Error;

use crate::storage::StorageError;

/// Service-layer errors.
///
/// The fraud guard never surfaces these to the redemption path (storage
/// failure there degrades to allow); batch jobs propagate them when a run
/// cannot even start.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
