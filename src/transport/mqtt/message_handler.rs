//! Pure routing of `rumqttc` event-loop events
//!
//! The poller in [`super::client`] performs the I/O; this module only decides
//! what each event means for the transport.

use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};

/// Pure routing decisions for event-loop events
pub struct MessageHandler;

impl MessageHandler {
    /// Classify one event from the event loop
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged(connack.code),
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) | Outgoing::Subscribe(pkid) | Outgoing::Unsubscribe(pkid) => {
                    EventRoute::PacketSubmitted(*pkid)
                }
                Outgoing::Disconnect => EventRoute::ClientDisconnecting,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Whether a ConnAck code means the session is open
    pub fn is_accepted(code: ConnectReturnCode) -> bool {
        code == ConnectReturnCode::Success
    }
}

/// Routing decisions for event-loop events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker answered the connect request
    ConnectionAcknowledged(ConnectReturnCode),
    /// Publish arrived on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// A publish, subscribe or unsubscribe left with this packet id
    PacketSubmitted(u16),
    /// Our own DISCONNECT was written
    ClientDisconnecting,
    /// PingResp, acks and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged(ConnectReturnCode::Success)
        );

        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged(ConnectReturnCode::NotAuthorized)
        );
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::new("cmd/reset", QoS::ExactlyOnce, "now");
        publish.retain = true;
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "cmd/reset");
                assert_eq!(payload, Bytes::from_static(b"now"));
                assert!(retain);
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_outgoing_packet_ids() {
        for outgoing in [
            Outgoing::Publish(7),
            Outgoing::Subscribe(7),
            Outgoing::Unsubscribe(7),
        ] {
            assert_eq!(
                MessageHandler::route_mqtt_event(&Event::Outgoing(outgoing)),
                EventRoute::PacketSubmitted(7)
            );
        }

        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::ClientDisconnecting
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PubRel(3))),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_disconnect_and_infrastructure() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_is_accepted() {
        assert!(MessageHandler::is_accepted(ConnectReturnCode::Success));
        assert!(!MessageHandler::is_accepted(ConnectReturnCode::BadClientId));
    }
}
