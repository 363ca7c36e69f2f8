//! `rumqttc` implementation of the [`Transport`](crate::transport::Transport) trait
//!
//! # Architecture
//!
//! - [`connection`] - broker address parsing and `MqttOptions` construction
//! - [`message_handler`] - pure routing of event-loop events
//! - [`client`] - the transport itself: session ownership, event-loop polling
//!   and packet-id correlation
//!
//! # Usage
//!
//! ```rust,no_run
//! use pc2mqtt::client::ClientConfig;
//! use pc2mqtt::config::MqttSection;
//! use pc2mqtt::transport::mqtt::MqttTransport;
//! use pc2mqtt::transport::Transport;
//! use rumqttc::QoS;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     ..MqttSection::default()
//! };
//!
//! let transport = MqttTransport::new(&config)?;
//! transport.connect(&ClientConfig::default().connect_options()).await?;
//! let pkid = transport
//!     .publish("PC2MQTT/status", "Online".into(), QoS::ExactlyOnce, true)
//!     .await?;
//! assert!(pkid > 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, BrokerAddress};
pub use message_handler::{EventRoute, MessageHandler};
