use thiserror::Error;

/// Main error type for the lifecycle engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Exchange-reported errors, classified by the adapter
    #[error("Transient exchange error: {0}")]
    TransientExchange(String),

    #[error("Authentication error on connection {connection_id}: {reason}")]
    Authentication {
        connection_id: String,
        reason: String,
    },

    #[error("Business rule violation (status {status_code}): {reason}")]
    BusinessRule { status_code: u16, reason: String },

    // Coordination errors
    #[error("Lock acquisition timed out for {resource}")]
    LockAcquisitionTimeout { resource: String },

    // Lifecycle errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position already closed: {0}")]
    PositionClosed(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    #[error("Invalid message payload: {0}")]
    InvalidMessage(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Errors that mean "try the same message again later".
    ///
    /// The worker requeues the inbound message instead of acking it; nothing
    /// is surfaced to the user.
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientExchange(_)
                | EngineError::LockAcquisitionTimeout { .. }
                | EngineError::Store(_)
        )
    }
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeueable_classification() {
        assert!(EngineError::TransientExchange("rate limited".into()).is_requeueable());
        assert!(EngineError::LockAcquisitionTimeout {
            resource: "positions:abc".into()
        }
        .is_requeueable());

        assert!(!EngineError::BusinessRule {
            status_code: 961,
            reason: "insufficient funds".into()
        }
        .is_requeueable());
        assert!(!EngineError::PositionClosed("abc".into()).is_requeueable());
    }
}
