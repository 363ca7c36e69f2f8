//! Outbound and inbound message model
//!
//! A [`Message`] is built by a caller, handed to the delivery queue (or sent
//! straight away), and mutated exactly once more by the dispatcher when the
//! transport accepts it: the device prefix is resolved and the packet id is
//! recorded.

use super::topics::{
    is_concrete_topic, normalize_topic, resolve_topic, validate_pattern, TopicError,
    MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD,
};
use bytes::Bytes;
use rumqttc::QoS;
use std::borrow::Cow;
use std::fmt;

/// QoS used for all traffic: exactly-once
pub const DELIVERY_QOS: QoS = QoS::ExactlyOnce;

/// Operation a message asks the transport to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Publish => "publish",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// Message body, either text or raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Bytes that go on the wire
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Text(text) => Bytes::from(text.clone().into_bytes()),
            Payload::Binary(bytes) => bytes.clone(),
        }
    }

    /// Text view; binary payloads are decoded lossily
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(text) => Cow::Borrowed(text),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

/// A publish, subscribe or unsubscribe request, or an inbound publish
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    topic: String,
    payload: Payload,
    kind: MessageKind,
    retain: bool,
    prepend_device_id: bool,
    message_id: u16,
    origin: Option<String>,
    resolved_topic: Option<String>,
}

impl Message {
    fn new(kind: MessageKind, topic: &str, payload: Payload) -> Self {
        Self {
            topic: normalize_topic(topic),
            payload,
            kind,
            retain: false,
            prepend_device_id: false,
            message_id: 0,
            origin: None,
            resolved_topic: None,
        }
    }

    /// Publish `payload` on `topic`
    pub fn publish(topic: impl AsRef<str>, payload: impl Into<Payload>) -> Self {
        Self::new(MessageKind::Publish, topic.as_ref(), payload.into())
    }

    /// Subscribe to a topic pattern
    pub fn subscribe(pattern: impl AsRef<str>) -> Self {
        Self::new(MessageKind::Subscribe, pattern.as_ref(), Payload::default())
    }

    /// Unsubscribe from a topic pattern
    pub fn unsubscribe(pattern: impl AsRef<str>) -> Self {
        Self::new(MessageKind::Unsubscribe, pattern.as_ref(), Payload::default())
    }

    /// Message received from the broker; its topic is already final
    pub fn inbound(topic: impl AsRef<str>, payload: Bytes, retain: bool) -> Self {
        let mut message = Self::new(MessageKind::Publish, topic.as_ref(), Payload::Binary(payload));
        message.retain = retain;
        message.resolved_topic = Some(message.topic.clone());
        message
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Place the topic under the device identifier when it is transmitted
    pub fn with_device_prefix(mut self, prepend: bool) -> Self {
        self.prepend_device_id = prepend;
        self
    }

    /// Tag the message with the handler it was issued for
    pub fn from_handler(mut self, handler_id: impl Into<String>) -> Self {
        self.origin = Some(handler_id.into());
        self
    }

    /// Append one or more segments to the topic
    pub fn append_topic(mut self, segments: impl AsRef<str>) -> Self {
        self.topic = normalize_topic(&format!("{}/{}", self.topic, segments.as_ref()));
        self
    }

    pub fn single_level_wildcard(self) -> Self {
        self.append_topic(SINGLE_LEVEL_WILDCARD)
    }

    pub fn multi_level_wildcard(self) -> Self {
        self.append_topic(MULTI_LEVEL_WILDCARD)
    }

    /// Topic as given by the caller (normalized, without device prefix)
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic as transmitted, once resolved; the raw topic before that
    pub fn resolved_topic(&self) -> &str {
        self.resolved_topic.as_deref().unwrap_or(&self.topic)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_topic.is_some()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn qos(&self) -> QoS {
        DELIVERY_QOS
    }

    pub fn is_retained(&self) -> bool {
        self.retain
    }

    pub fn prepends_device_id(&self) -> bool {
        self.prepend_device_id
    }

    /// Packet id assigned by the transport; 0 until accepted
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn is_accepted(&self) -> bool {
        self.message_id > 0
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Reject messages the transport could never accept
    pub fn validate(&self) -> Result<(), TopicError> {
        if self.topic.is_empty() && !self.prepend_device_id {
            return Err(TopicError::EmptyTopic);
        }
        match self.kind {
            MessageKind::Publish if !is_concrete_topic(&self.topic) => {
                Err(TopicError::InvalidWildcard(self.topic.clone()))
            }
            MessageKind::Publish => Ok(()),
            MessageKind::Subscribe | MessageKind::Unsubscribe => {
                if self.topic.is_empty() {
                    Ok(())
                } else {
                    validate_pattern(&self.topic)
                }
            }
        }
    }

    /// Apply the device prefix; later calls keep the first resolution
    pub(crate) fn resolve(&mut self, device_id: &str) -> &str {
        if self.resolved_topic.is_none() {
            self.resolved_topic = Some(resolve_topic(device_id, &self.topic, self.prepend_device_id));
        }
        self.resolved_topic()
    }

    pub(crate) fn assign_id(&mut self, message_id: u16) {
        self.message_id = message_id;
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} bytes)",
            self.kind,
            self.resolved_topic(),
            self.payload.len()
        )
    }
}
