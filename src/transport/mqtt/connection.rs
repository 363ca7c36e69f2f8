//! Broker address parsing and `MqttOptions` construction
//!
//! Pure functions only; nothing here touches the network.

use crate::transport::{ConnectOptions, TransportError};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::{LastWill, MqttOptions};
use url::Url;

/// Largest packet accepted or produced, in bytes
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Where the broker lives and whether to wrap the socket in TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(broker_url)
            .map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(TransportError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Build the options for one connection attempt
pub fn configure_mqtt_options(address: &BrokerAddress, options: &ConnectOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        options.client_id.clone(),
        address.host.clone(),
        address.port,
    );

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(will) = &options.will {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone().into_bytes(),
            will.qos,
            will.retain,
        ));
    }

    mqtt_options
}
