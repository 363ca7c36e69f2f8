//! Connection state, lifecycle events and client settings

use crate::config::{BridgeConfig, WillSection};
use crate::protocol::{resolve_topic, Message, DELIVERY_QOS};
use crate::transport::{ConnectOptions, Credentials, TransportError, WillMessage};
use rumqttc::ConnectReturnCode;
use std::fmt;
use std::time::Duration;

/// Close code reported when the client disconnects on request
pub const CLOSE_CODE_SHUTDOWN: u8 = 98;
/// Close code reported when the broker connection drops
pub const CLOSE_CODE_CONNECTION_LOST: u8 = 99;
/// Close code for failures that carry no broker return code
pub const CLOSE_CODE_UNKNOWN: u8 = 255;

/// Supervisor connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; reached only through an explicit disconnect
    Shutdown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Why a session ended or never started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdentifierRejected,
    NotAuthorized,
    ProtocolVersionMismatch,
    ServerUnavailable,
    BadCredentials,
    Unknown,
    ConnectionLost,
    Shutdown,
}

impl CloseReason {
    /// Numeric code carried by `ClientEvent::Closed`
    pub fn code(&self) -> u8 {
        match self {
            CloseReason::ProtocolVersionMismatch => 1,
            CloseReason::IdentifierRejected => 2,
            CloseReason::ServerUnavailable => 3,
            CloseReason::BadCredentials => 4,
            CloseReason::NotAuthorized => 5,
            CloseReason::Unknown => CLOSE_CODE_UNKNOWN,
            CloseReason::ConnectionLost => CLOSE_CODE_CONNECTION_LOST,
            CloseReason::Shutdown => CLOSE_CODE_SHUTDOWN,
        }
    }

    /// Reason for a connect attempt that produced no return code
    pub fn from_transport_error(error: &TransportError) -> Self {
        match error {
            TransportError::ConnectionFailed(_) | TransportError::NotConnected => {
                CloseReason::ServerUnavailable
            }
            _ => CloseReason::Unknown,
        }
    }
}

impl From<ConnectReturnCode> for CloseReason {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::RefusedProtocolVersion => CloseReason::ProtocolVersionMismatch,
            ConnectReturnCode::BadClientId => CloseReason::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => CloseReason::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => CloseReason::BadCredentials,
            ConnectReturnCode::NotAuthorized => CloseReason::NotAuthorized,
            ConnectReturnCode::Success => CloseReason::Unknown,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::IdentifierRejected => "Ident rejected by server",
            CloseReason::NotAuthorized => "User not authorized",
            CloseReason::ProtocolVersionMismatch => "Protocol version mismatch",
            CloseReason::ServerUnavailable => "Server unavailable",
            CloseReason::BadCredentials => "User/Pass error",
            CloseReason::Unknown => "Unknown error",
            CloseReason::ConnectionLost => "Connection closed",
            CloseReason::Shutdown => "MQTT disconnect",
        };
        f.write_str(text)
    }
}

/// Lifecycle and delivery notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Reconnecting,
    Closed { reason: CloseReason, code: u8 },
    Published(Message),
    Subscribed(Message),
    Unsubscribed(Message),
    /// A queued message was given up on and removed from the queue
    DeliveryFailed(Message),
}

impl ClientEvent {
    pub fn closed(reason: CloseReason) -> Self {
        ClientEvent::Closed {
            reason,
            code: reason.code(),
        }
    }
}

/// Settings the supervisor needs, resolved from [`BridgeConfig`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub device_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub queue_capacity: usize,
    pub resubscribe_on_reconnect: bool,
    pub will: WillSection,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_bridge_config(&BridgeConfig::default())
    }
}

impl ClientConfig {
    pub fn from_bridge_config(config: &BridgeConfig) -> Self {
        Self {
            device_id: config.device.id.clone(),
            credentials: config.mqtt.credentials(),
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            auto_reconnect: config.mqtt.auto_reconnect,
            reconnect_interval: Duration::from_millis(config.mqtt.reconnect_interval_ms),
            queue_capacity: config.mqtt.queue_capacity,
            resubscribe_on_reconnect: config.mqtt.resubscribe_on_reconnect,
            will: config.mqtt.will.clone(),
        }
    }

    /// Device-prefixed status topic
    pub fn will_topic(&self) -> String {
        resolve_topic(&self.device_id, &self.will.topic, true)
    }

    /// Status message carrying `payload` on the will topic
    pub fn status_message(&self, payload: &str) -> Message {
        Message::publish(&self.will.topic, payload)
            .with_device_prefix(true)
            .retain(self.will.retain)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let will = self.will.enabled.then(|| WillMessage {
            topic: self.will_topic(),
            payload: self.will.offline_message.clone(),
            qos: DELIVERY_QOS,
            retain: self.will.retain,
        });

        ConnectOptions {
            client_id: self.device_id.clone(),
            credentials: self.credentials.clone(),
            keep_alive: self.keep_alive,
            clean_session: true,
            will,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_mapping() {
        let cases = [
            (ConnectReturnCode::BadClientId, CloseReason::IdentifierRejected, 2),
            (ConnectReturnCode::NotAuthorized, CloseReason::NotAuthorized, 5),
            (
                ConnectReturnCode::RefusedProtocolVersion,
                CloseReason::ProtocolVersionMismatch,
                1,
            ),
            (ConnectReturnCode::ServiceUnavailable, CloseReason::ServerUnavailable, 3),
            (ConnectReturnCode::BadUserNamePassword, CloseReason::BadCredentials, 4),
        ];

        for (code, reason, number) in cases {
            assert_eq!(CloseReason::from(code), reason);
            assert_eq!(reason.code(), number);
        }
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::Shutdown.code(), 98);
        assert_eq!(CloseReason::ConnectionLost.code(), 99);
        assert_eq!(
            ClientEvent::closed(CloseReason::ConnectionLost),
            ClientEvent::Closed {
                reason: CloseReason::ConnectionLost,
                code: 99
            }
        );
    }

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            CloseReason::from_transport_error(&TransportError::ConnectionFailed("io".into())),
            CloseReason::ServerUnavailable
        );
        assert_eq!(
            CloseReason::from_transport_error(&TransportError::Timeout("ConnAck")),
            CloseReason::Unknown
        );
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(CloseReason::IdentifierRejected.to_string(), "Ident rejected by server");
        assert_eq!(CloseReason::BadCredentials.to_string(), "User/Pass error");
    }

    #[test]
    fn test_connect_options_carry_will() {
        let config = ClientConfig::default();
        let options = config.connect_options();

        assert_eq!(options.client_id, "PC2MQTT");
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        let will = options.will.unwrap();
        assert_eq!(will.topic, "PC2MQTT/status");
        assert_eq!(will.payload, "Offline");
        assert!(will.retain);
    }

    #[test]
    fn test_will_disabled() {
        let mut config = ClientConfig::default();
        config.will.enabled = false;
        assert!(config.connect_options().will.is_none());
    }
}
