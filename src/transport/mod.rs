//! Transport layer between the delivery engine and the broker
//!
//! The engine never speaks MQTT itself. It drives a [`Transport`], which
//! performs connect/publish/subscribe/unsubscribe and reports inbound traffic
//! and connection loss through a channel of [`TransportEvent`]s.

use crate::protocol::Message;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, QoS};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Username/password pair presented at connect time
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Message the broker publishes for us if we vanish
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything the transport needs to open a session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub will: Option<WillMessage>,
}

/// Events raised by the transport outside of any request
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A publish arrived on a subscribed topic
    MessageReceived(Message),
    /// The session ended without being asked to
    ConnectionLost(String),
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request could not be queued")]
    RequestFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Request was sent but its {0} was never reported")]
    Unconfirmed(&'static str),
}

impl TransportError {
    /// Whether repeating the request cannot put a second copy on the wire
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected
                | TransportError::ConnectionFailed(_)
                | TransportError::Timeout(_)
                | TransportError::RequestFailed(_)
        )
    }
}

/// Broker connection primitive
///
/// Request methods return the packet id the transport assigned, or 0 when the
/// request never left the transport. A request that was handed to the session
/// but whose packet id never showed up fails with
/// [`TransportError::Unconfirmed`]; sending it again could duplicate it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a session; refusals come back as a non-success return code
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectReturnCode, TransportError>;

    /// Close the session gracefully
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<u16, TransportError>;

    async fn subscribe(&self, topics: &[String], qos: &[QoS]) -> Result<u16, TransportError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<u16, TransportError>;

    /// Check if the session is currently up
    fn is_connected(&self) -> bool;

    /// Where inbound messages and connection loss are reported
    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::NotConnected,
            TransportError::ConnectionFailed("refused".to_string()),
            TransportError::Timeout("ConnAck"),
            TransportError::InvalidBrokerUrl("nope".to_string()),
            TransportError::InvalidRequest("no topics".to_string()),
            TransportError::RequestFailed("closed".to_string().into()),
            TransportError::Unconfirmed("packet id"),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_unconfirmed_requests_are_not_retryable() {
        assert!(TransportError::NotConnected.is_retryable());
        assert!(TransportError::RequestFailed("closed".to_string().into()).is_retryable());
        assert!(!TransportError::Unconfirmed("packet id").is_retryable());
        assert!(!TransportError::InvalidRequest("no topics".to_string()).is_retryable());
    }
}
