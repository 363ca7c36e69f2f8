//! Handlers: the units of host-side behaviour bridged to the broker
//!
//! A [`Handler`] reacts to inbound messages and publishes through its
//! [`HandlerContext`]. Each handler runs inside a [`HandlerHost`] that owns
//! its inbox and worker task and isolates panics. [`HandlerManager`] loads,
//! starts and disposes the configured set.

pub mod builtin;
pub mod context;
pub mod host;
pub mod manager;

pub use context::HandlerContext;
pub use host::{HandlerHost, HostState};
pub use manager::{HandlerManager, LoadReport};

use crate::client::ClientError;
use crate::protocol::Message;
use async_trait::async_trait;
use thiserror::Error;

/// Handler lifecycle failures
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler {0} is not compatible with this host")]
    Incompatible(String),
    #[error("Handler initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),
    #[error("Invalid handler configuration: {0}")]
    InvalidConfig(String),
    #[error("Handler {0} panicked")]
    Panicked(String),
    #[error("Handler {0} is already loaded")]
    Duplicate(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Behaviour plugged into the bridge
///
/// Callbacks for one handler never run concurrently with each other, except
/// `server_state_changed`, which may arrive while a message is processed.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Unique name; used as the routing identity
    fn identifier(&self) -> &str;

    /// Whether the handler can run on this host
    fn is_compatible(&self) -> bool {
        true
    }

    /// Set up subscriptions and background work
    async fn initialize(&self, ctx: &HandlerContext) -> Result<(), HandlerError>;

    /// Handle one inbound message routed to this handler
    async fn process_message(&self, ctx: &HandlerContext, message: Message);

    /// The broker became reachable (`true`) or unreachable (`false`)
    async fn server_state_changed(&self, _ctx: &HandlerContext, _connected: bool) {}

    /// Release resources; called once
    async fn uninitialize(&self) {}
}
