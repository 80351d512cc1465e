//! Transport abstraction for the fleet API.
//!
//! Every call is a single bounded-timeout request translated into a
//! classified [`TransportError`]. Retries belong to the caller; the
//! transport never retries on its own.
//!
//! - `status()` checks server health before enrollment
//! - `enroll()` exchanges an enrollment token for a device identity
//! - `ingest()` delivers one ordered batch of records
//! - `heartbeat()` checks in and receives server actions
//! - `ack_actions()` confirms receipt of those actions

mod http;
mod mock;

pub use http::HttpTransport;
pub use mock::{MockCall, MockTransport};

use crate::error::ErrorClass;
use crate::store::TelemetryRecord;
use crate::types::{
    AckRequest, AckResponse, AgentMetadata, EnrollResponse, HeartbeatRequest, HeartbeatResponse, IngestResponse,
    ServerStatus,
};
use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection refused, reset, DNS failure.
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// Credentials rejected (401/403).
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Record content rejected as malformed (400, 413, 422).
    #[error("request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    /// Any other 4xx: wrong endpoint, method or proxy in the way.
    /// Says nothing about the records, so they stay queued.
    #[error("unexpected response ({status}): {message}")]
    UnexpectedStatus { status: u16, message: String },

    /// Rate limited (429), with the server's retry hint in seconds.
    #[error("rate limited")]
    RateLimited(Option<u64>),

    /// Server-side failure (5xx).
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Classify for retry handling
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Network(_)
            | TransportError::Timeout
            | TransportError::RateLimited(_)
            | TransportError::Server { .. }
            | TransportError::UnexpectedStatus { .. }
            | TransportError::Decode(_) => ErrorClass::Transient,
            TransportError::Auth { .. } => ErrorClass::AuthFailure,
            TransportError::Validation { .. } => ErrorClass::Validation,
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Auth { status, .. }
            | TransportError::Validation { status, .. }
            | TransportError::UnexpectedStatus { status, .. }
            | TransportError::Server { status, .. } => Some(*status),
            TransportError::RateLimited(_) => Some(429),
            _ => None,
        }
    }

    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        TransportError::Auth {
            status,
            message: message.into(),
        }
    }

    pub fn validation(status: u16, message: impl Into<String>) -> Self {
        TransportError::Validation {
            status,
            message: message.into(),
        }
    }

    pub fn unexpected(status: u16, message: impl Into<String>) -> Self {
        TransportError::UnexpectedStatus {
            status,
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        TransportError::Server {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Remote fleet API.
///
/// Implementations must be substitutable without touching engine logic;
/// [`MockTransport`] is the test double.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Query server health.
    async fn status(&self) -> Result<ServerStatus, TransportError>;

    /// Enroll this device with a one-time token.
    async fn enroll(
        &self,
        token: &str,
        metadata: &AgentMetadata,
    ) -> Result<EnrollResponse, TransportError>;

    /// Deliver one ordered batch.
    ///
    /// `batch_id` lets the server de-duplicate redelivered batches.
    async fn ingest(
        &self,
        device_id: &str,
        api_key: &str,
        batch_id: &str,
        records: &[TelemetryRecord],
    ) -> Result<IngestResponse, TransportError>;

    /// Check in with the server.
    async fn heartbeat(
        &self,
        device_id: &str,
        api_key: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError>;

    /// Acknowledge actions received in a check-in.
    async fn ack_actions(
        &self,
        device_id: &str,
        api_key: &str,
        request: &AckRequest,
    ) -> Result<AckResponse, TransportError>;
}
