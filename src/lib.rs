//! PC2MQTT - host-to-broker bridge
//!
//! Bridges local host state to an MQTT broker. Handlers publish and subscribe
//! through a supervised client that queues outbound messages, drains them in
//! order while connected, and routes inbound messages back to the handlers
//! whose topic patterns match.
//!
//! # Overview
//!
//! - [`protocol`]: message model and topic rules
//! - [`transport`]: the broker seam and its `rumqttc` implementation
//! - [`client`]: connection supervisor, delivery queue and dispatcher
//! - [`routing`]: topic-pattern routing with an overflow buffer
//! - [`handler`]: handler trait, per-handler hosts and the built-ins
//! - [`bridge`]: wires everything together
//!
//! # Quick Start
//!
//! ```rust
//! use pc2mqtt::protocol::{topic_matches, Message};
//!
//! let message = Message::publish("/status/cpu/", "42").with_device_prefix(true);
//! assert_eq!(message.topic(), "status/cpu");
//!
//! assert!(topic_matches("cmd/+", "cmd/reset"));
//! assert!(!topic_matches("cmd/+", "other/topic"));
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use client::{Client, ClientConfig, ClientError, ClientEvent, CloseReason, ConnectionState};
pub use config::*;
pub use error::{BridgeError, BridgeResult};
pub use handler::{Handler, HandlerContext, HandlerError, HandlerManager, LoadReport};
pub use protocol::*;
pub use routing::TopicRouter;
pub use transport::mqtt::MqttTransport;
pub use transport::{Transport, TransportError, TransportEvent};
