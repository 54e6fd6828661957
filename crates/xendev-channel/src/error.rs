//! Error types for channel operations.

use thiserror::Error;
use xendev_error::CommonError;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur on an inter-domain channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Shared error cases.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// The outbound ring has no free slot.
    #[error("channel not ready for writing")]
    NotReady,

    /// Payload does not fit in one message.
    #[error("payload too large: {size} bytes, at most {max} allowed")]
    PayloadTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_too_large_message() {
        let err = ChannelError::PayloadTooLarge { size: 61, max: 60 };
        let msg = err.to_string();
        assert!(msg.contains("61"));
        assert!(msg.contains("60"));
    }

    #[test]
    fn test_closed_message() {
        assert_eq!(ChannelError::Closed.to_string(), "channel closed");
    }
}
