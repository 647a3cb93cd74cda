//! Protocol error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unexpected frame '{got}' while {expecting}")]
    UnexpectedFrame {
        got: &'static str,
        expecting: &'static str,
    },
}
