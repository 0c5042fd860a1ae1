//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Required startup option missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend refused to register a connection.
    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Inbound payload is not valid JSON.
    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Broker could not deliver a publish or forward.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Malformed MQTT frame on the embedded broker.
    #[error("MQTT protocol error: {0}")]
    Protocol(String),

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
