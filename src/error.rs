use thiserror::Error;

use crate::models::{event::PaymentProvider, outcome::DeliveryStatus};

/// Failure reported by a broker message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload can never be processed; retrying would not help.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Failure of a single dispatch attempt inside a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Sms sender is not configured for payment provider: {0}")]
    UnconfiguredProvider(PaymentProvider),

    #[error("no sms template for {event_type} via {provider}")]
    MissingTemplate {
        event_type: String,
        provider: String,
    },

    #[error("delivery to {target} ended as {status:?} (http {http_status})")]
    Undelivered {
        target: String,
        status: DeliveryStatus,
        http_status: u16,
    },
}
