//! Error types for the Pacer scheduler.

use thiserror::Error;

/// Main error type for Pacer operations.
///
/// Errors produced by submitted tasks are never wrapped in this type; they are
/// handed back to the caller as-is.
#[derive(Error, Debug)]
pub enum PacerError {
    /// Exactly one half of the interval ceiling was configured.
    #[error(
        "When setting either max_calls_per_interval or interval_length_ms to a valid finite number bigger than 0, the other must be set as well."
    )]
    UnpairedIntervalLimit,

    /// The semaphore engine has no pause primitive.
    #[error(
        "The semaphore engine can't be paused and thus can't be initialized with start_paused or pause_during_delay."
    )]
    PauseUnsupported,

    /// Configuration parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration loading errors
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    /// Lookup of a limiter profile that is not configured
    #[error("Unknown limiter profile: {0}")]
    UnknownProfile(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PacerError {
    /// Whether this error was raised while loading configuration or validating
    /// limiter options, as opposed to an I/O failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PacerError::UnpairedIntervalLimit
                | PacerError::PauseUnsupported
                | PacerError::Config(_)
                | PacerError::Load(_)
                | PacerError::UnknownProfile(_)
        )
    }
}

/// Result type alias for Pacer operations.
pub type Result<T> = std::result::Result<T, PacerError>;
