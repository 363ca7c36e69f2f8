//! Connection supervision, outbound queueing and dispatch
//!
//! # Architecture
//!
//! - [`connection`] - connection state, lifecycle events, settings
//! - [`health_monitor`] - pure reconnect decisions and health metrics
//! - [`queue`] - bounded FIFO of outbound messages with leases
//! - [`dispatcher`] - drains the queue into the transport, one per epoch
//! - [`supervisor`] - the [`Client`] tying it together

pub mod connection;
pub mod dispatcher;
pub mod health_monitor;
pub mod queue;
pub mod supervisor;

pub use connection::{ClientConfig, ClientEvent, CloseReason, ConnectionState};
pub use health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use queue::{DeliveryQueue, QueueLease};
pub use supervisor::Client;

use crate::protocol::{Message, MessageKind, TopicError};
use crate::transport::TransportError;
use thiserror::Error;

/// Client operation failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),
    #[error("Delivery queue is full")]
    QueueFull(Box<Message>),
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Transport did not accept {kind} on {topic}")]
    NotAccepted { kind: MessageKind, topic: String },
    #[error("Connection refused: {reason}")]
    Refused { reason: CloseReason },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Client has been shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether the message behind this error can be retried later
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::NotConnected | ClientError::NotAccepted { .. } => true,
            ClientError::Transport(error) => error.is_retryable(),
            _ => false,
        }
    }
}
