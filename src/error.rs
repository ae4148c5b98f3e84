//! Error handling module for dashverify
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Library code returns these; the binary wraps them in `anyhow` for context.

use thiserror::Error;

/// Main error type for dashverify
#[derive(Error, Debug)]
pub enum DashverifyError {
    /// IO errors (file operations, process spawning, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manifest option validation errors
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Convergence engine errors (spawn failure, fatal exit)
    #[error("Convergence engine error: {0}")]
    Engine(String),

    /// The harness received a terminating signal during an engine run
    #[error("Interrupted by signal {0}")]
    Interrupted(i32),

    /// Line protocol validation errors
    #[error("Line protocol error: {0}")]
    LineProtocol(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for dashverify operations
pub type Result<T> = std::result::Result<T, DashverifyError>;

// Convenient error constructors
impl DashverifyError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a convergence engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a line protocol error
    pub fn line_protocol(msg: impl Into<String>) -> Self {
        Self::LineProtocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DashverifyError::config("port must be non-zero");
        assert_eq!(err.to_string(), "Configuration error: port must be non-zero");

        let err = DashverifyError::engine("apply #1 exited fatally");
        assert_eq!(
            err.to_string(),
            "Convergence engine error: apply #1 exited fatally"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "puppet not found");
        let err: DashverifyError = io_err.into();
        assert!(matches!(err, DashverifyError::Io(_)));
    }

    #[test]
    fn test_error_constructors() {
        let err = DashverifyError::manifest("empty database list");
        assert!(matches!(err, DashverifyError::Manifest(_)));

        let err = DashverifyError::line_protocol("no fields");
        assert!(matches!(err, DashverifyError::LineProtocol(_)));
    }
}
