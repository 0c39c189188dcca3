//! Error types for the Gatekeeper admission controller.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// Admission checks never surface these; they only come out of setup paths
/// such as configuration loading and backend construction. Store failures
/// during a check are `BackendError`s and end in a fallback instead.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
