//! Error types for trigger rules and router configuration

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Device name pattern is not a valid regular expression
    #[error("invalid device pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Trigger URL could not be parsed
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Note payload could not be decoded
    #[error("payload decode error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Raw MIDI bytes did not describe a note event
    #[error("not a note message: {0:02x?}")]
    NotANote(Vec<u8>),
}
