use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while bridging calls over the broker.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No reply bearing the pending correlation id arrived before the deadline.
    #[error("rpc call to '{routing_key}' timed out after {elapsed:?}")]
    Timeout {
        /// Routing key the request was published to.
        routing_key: String,
        /// Wall-clock time spent waiting.
        elapsed: Duration,
    },

    /// The broker could not be reached, or the connection was lost.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A broker operation failed on an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization of an outgoing payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A request payload is not a JSON object or array.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A reply body could not be decoded into the expected shape.
    #[error("failed to decode reply: {0}")]
    Decode(String),

    /// The remote processor answered with an `{"error": ...}` body.
    #[error("remote service returned an error: {0}")]
    Remote(serde_json::Value),

    /// A lookup returned no record for the requested id.
    #[error("{0} not found")]
    NotFound(String),

    /// A configuration value could not be interpreted.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpcError {
    /// Whether retrying the same operation later could succeed.
    ///
    /// Only connection failures qualify; the supervisor uses this to decide
    /// whether a consumer start is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Connection(_))
    }

    /// HTTP status an outer request handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::Timeout { .. } | RpcError::Connection(_) => 503,
            RpcError::Decode(_) | RpcError::Remote(_) => 502,
            RpcError::NotFound(_) => 404,
            RpcError::InvalidPayload(_) => 400,
            _ => 500,
        }
    }
}

/// Result type alias for broker RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
