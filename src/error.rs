//! Unified error handling for the segment tracker.
//!
//! Only collaborator failures and bad input are errors. A missing trace, a
//! tick with no crossing, or an abandoned attempt are ordinary tracker states
//! and never surface here.

use thiserror::Error;

/// Unified error type for segment tracker operations.
///
/// `Clone` so a single failed cache creation can be handed to every caller
/// waiting on the same key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// The segment source failed to deliver segments or a reference trace
    #[error("Segment source error: {message}")]
    Source { message: String },

    /// A collaborator gave up on a fetch (timeout, shutdown)
    #[error("Fetch cancelled: {message}")]
    Cancelled { message: String },

    /// Raw GPS input outside the valid latitude/longitude range
    #[error("Invalid coordinates: {message}")]
    InvalidCoordinates { message: String },

    /// Configuration could not be parsed or is out of range
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TrackerError {
    /// Convenience constructor for collaborator failures.
    pub fn source(message: impl Into<String>) -> Self {
        TrackerError::Source {
            message: message.into(),
        }
    }

    /// Whether the error means "no data this time" rather than a failure the
    /// caller needs to see.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TrackerError::Cancelled { .. })
    }
}

/// Result type alias for segment tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
