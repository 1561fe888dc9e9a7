//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Relay message could not be parsed
    #[error("Message error: {0}")]
    Message(#[from] crate::message::MessageError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Relay is not part of the pool
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Every targeted relay refused or failed the write
    #[error("Event publish failed for {event_id}: {}", format_reasons(.reasons))]
    PublishFailed {
        event_id: String,
        reasons: Vec<(String, String)>,
    },

    /// Pool has been closed
    #[error("Relay pool is closed")]
    PoolClosed,
}

fn format_reasons(reasons: &[(String, String)]) -> String {
    if reasons.is_empty() {
        return "no relays targeted".to_string();
    }
    reasons
        .iter()
        .map(|(url, reason)| format!("{url}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
