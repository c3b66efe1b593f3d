//! Error taxonomy for the detection-to-alert pipeline.
//!
//! None of these are fatal to the process. Recognition failures degrade to an empty
//! detection set, missing locations degrade to an alert without coordinates, and
//! transport errors are retried until the attempt budget is spent.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("recognition failed on frame {frame_seq}: {reason}")]
    RecognitionFailure { frame_seq: u64, reason: String },

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("delivery failed for alert {alert_id} after {attempts} attempts: {last_error}")]
    DeliveryFailed {
        alert_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("alert {0} not found")]
    UnknownAlert(String),

    #[error("alert {alert_id} cannot be re-sent from status {status}")]
    NotResendable { alert_id: String, status: String },

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Ledger(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Ledger(format!("record encoding: {}", err))
    }
}

/// Why a single delivery attempt failed. Every variant is retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("rejected by endpoint: {description}")]
    Rejected { description: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport not configured: {0}")]
    NotConfigured(&'static str),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
