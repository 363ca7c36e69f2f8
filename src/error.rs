//! Top-level error type
//!
//! Each layer keeps its own `thiserror` enum; [`BridgeError`] collects them
//! for callers that drive the whole bridge.

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::handler::HandlerError;
use crate::protocol::TopicError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// True when retrying later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Transport(e) => e.is_retryable(),
            BridgeError::Client(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
