//! # Delivery Transport
//!
//! The seam between delivery bookkeeping and the wire. The dispatcher and
//! retry scheduler talk to a [`WebhookTransport`]; production wires in the
//! reqwest-backed [`HttpTransport`], tests wire in a scripted mock.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors a transport can produce. Anything that gets an HTTP status back
/// is a *response*, not a transport error — classification of statuses is
/// the dispatcher's job.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The attempt exceeded its timeout.
    #[error("Delivery timed out")]
    Timeout,

    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("Network error: {0}")]
    Network(String),
}

/// One outbound delivery attempt, fully assembled: signed body and headers.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Target endpoint.
    pub url: String,

    /// Serialized JSON body.
    pub body: Vec<u8>,

    /// `X-Sizu-Signature` value, recomputed for this attempt.
    pub signature: String,

    /// `X-Sizu-Timestamp` value (ISO-8601).
    pub timestamp: String,

    /// `X-Sizu-Event` value.
    pub event_type: String,
}

/// Response observed from the endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status: u16,
}

/// Sends one assembled delivery attempt to an endpoint.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Perform the HTTP POST. Must respect the transport's configured
    /// timeout and be cancellable at it.
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, TransportError>;
}

/// Production transport over reqwest.
///
/// The timeout is baked into the client, so every attempt carries the hard
/// per-attempt cap from configuration.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the given per-attempt timeout.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, TransportError> {
        debug!("POST {} ({})", request.url, request.event_type);

        let response = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .header("X-Sizu-Signature", &request.signature)
            .header("X-Sizu-Timestamp", &request.timestamp)
            .header("X-Sizu-Event", &request.event_type)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        Ok(DeliveryResponse {
            status: response.status().as_u16(),
        })
    }
}
