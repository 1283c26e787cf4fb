//! Error taxonomy for the channel layer.

/// Result type for channel layer operations.
pub type Result<T> = std::result::Result<T, LayerError>;

/// Errors that can occur during channel layer operations.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// Transport unreachable or lost. Not retried internally; rebuild the layer.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Destination queue was at its length limit when the message was published.
    #[error("Channel '{channel}' is full (capacity {capacity})")]
    CapacityExceeded { channel: String, capacity: u32 },

    #[error("Failed to decode message from '{channel}': {message}")]
    Decode { channel: String, message: String },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// Malformed connection URL or option value.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    /// Broker refused an operation on a live connection.
    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Management API error: {0}")]
    Management(String),
}

impl LayerError {
    /// True when the underlying connection is gone and the layer must be rebuilt.
    pub fn is_connection(&self) -> bool {
        matches!(self, LayerError::Connection(_))
    }

    /// True when the destination channel rejected the message for being full.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, LayerError::CapacityExceeded { .. })
    }
}

impl From<::config::ConfigError> for LayerError {
    fn from(err: ::config::ConfigError) -> Self {
        LayerError::Configuration(err.to_string())
    }
}

impl From<reqwest::Error> for LayerError {
    fn from(err: reqwest::Error) -> Self {
        LayerError::Management(err.to_string())
    }
}
