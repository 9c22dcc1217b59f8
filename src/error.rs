use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum SwitchboardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Capacity errors
    #[error("Command queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Buffer is full (capacity {capacity})")]
    BufferFull { capacity: usize },

    // Execution errors
    #[error("Execution timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Handler error: {0}")]
    Handler(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // State machine errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SwitchboardError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for SwitchboardError
pub type Result<T> = std::result::Result<T, SwitchboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = SwitchboardError::not_found("toggle", "missing");
        assert_eq!(err.to_string(), "toggle not found: missing");
    }

    #[test]
    fn test_capacity_messages() {
        assert_eq!(
            SwitchboardError::QueueFull { capacity: 100 }.to_string(),
            "Command queue is full (capacity 100)"
        );
        assert_eq!(
            SwitchboardError::BufferFull { capacity: 10 }.to_string(),
            "Buffer is full (capacity 10)"
        );
    }
}
