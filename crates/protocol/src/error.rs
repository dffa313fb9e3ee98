//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from postcard
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Incompatible protocol version detected
    #[error(
        "Incompatible protocol version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
