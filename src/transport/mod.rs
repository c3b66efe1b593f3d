//! Messaging transport.
//!
//! The dispatcher hands a formatted `AlertMessage` to an `AlertTransport`; one `send`
//! call is one delivery attempt. Retry and backoff live in the dispatcher.

mod telegram;

pub use telegram::{TelegramConfig, TelegramTransport, DEFAULT_TELEGRAM_API_BASE};

use crate::dispatch::AlertMessage;
use crate::error::TransportError;

/// Proof of delivery returned by the remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

pub trait AlertTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make one delivery attempt.
    fn send(&self, message: &AlertMessage) -> Result<DeliveryReceipt, TransportError>;
}
