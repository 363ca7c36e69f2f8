//! Client event loop: keeps handlers informed of broker reachability

use crate::client::ClientEvent;
use crate::handler::HandlerManager;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// What a client event means for the handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStateChange {
    Up,
    Down,
    Unchanged,
}

impl ServerStateChange {
    pub fn from_event(event: &ClientEvent) -> Self {
        match event {
            ClientEvent::Connected => ServerStateChange::Up,
            ClientEvent::Closed { .. } => ServerStateChange::Down,
            _ => ServerStateChange::Unchanged,
        }
    }
}

/// Consume client events until the channel closes
pub async fn run_event_loop(
    mut events: broadcast::Receiver<ClientEvent>,
    handlers: Arc<HandlerManager>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Client event listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        log_event(&event);
        match ServerStateChange::from_event(&event) {
            ServerStateChange::Up => handlers.notify_server_state(true).await,
            ServerStateChange::Down => handlers.notify_server_state(false).await,
            ServerStateChange::Unchanged => {}
        }
    }
    debug!("Client event loop finished");
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => info!("Broker connection established"),
        ClientEvent::Reconnecting => info!("Reconnecting to broker"),
        ClientEvent::Closed { reason, code } => {
            info!(reason = %reason, code, "Broker connection closed")
        }
        ClientEvent::Published(message)
        | ClientEvent::Subscribed(message)
        | ClientEvent::Unsubscribed(message) => debug!(
            kind = %message.kind(),
            message_id = message.message_id(),
            topic = %message.resolved_topic(),
            "Broker accepted message"
        ),
        ClientEvent::DeliveryFailed(message) => warn!(
            kind = %message.kind(),
            topic = %message.resolved_topic(),
            "Message dropped from the delivery queue"
        ),
    }
}
