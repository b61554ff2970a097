//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding or encoding requests
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Offset into the input buffer points outside of it
    #[error("Offset {offset} outside of {len} byte buffer")]
    InvalidOffset { offset: usize, len: usize },

    /// Malformed descriptor data
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Registry value name is not valid UTF-16
    #[error("Invalid value name")]
    InvalidName,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferTooSmall {
            needed: 24,
            available: 8,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("needed 24"));
        assert!(msg.contains("got 8"));
    }

    #[test]
    fn test_offset_display() {
        let msg = ProtocolError::InvalidOffset { offset: 40, len: 24 }.to_string();
        assert!(msg.contains("Offset 40"));
    }
}
