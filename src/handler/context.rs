//! Publish/subscribe facade handed to handlers

use crate::client::{Client, ClientError};
use crate::protocol::Message;
use std::sync::Arc;
use tracing::warn;

/// A handler's view of the client
///
/// Every message sent through the context is tagged with the handler's id,
/// so accepted subscriptions route back to this handler.
#[derive(Clone)]
pub struct HandlerContext {
    handler_id: String,
    client: Arc<Client>,
}

impl HandlerContext {
    pub fn new(handler_id: impl Into<String>, client: Arc<Client>) -> Self {
        Self {
            handler_id: handler_id.into(),
            client,
        }
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn device_id(&self) -> &str {
        self.client.device_id()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Send now; false when the transport did not accept it
    pub async fn publish(&self, message: Message) -> bool {
        self.send(message.from_handler(self.handler_id.clone())).await
    }

    /// Queue for delivery, waiting while the queue is full
    pub async fn queue_publish(&self, message: Message) -> Result<(), ClientError> {
        self.client
            .enqueue(message.from_handler(self.handler_id.clone()))
            .await
    }

    /// Subscribe now and route matches to this handler
    pub async fn subscribe(&self, pattern: &str, prepend_device_id: bool) -> bool {
        self.send(self.subscription(pattern, prepend_device_id)).await
    }

    /// Queue a subscription; the route is added once the broker accepts it
    pub async fn queue_subscribe(
        &self,
        pattern: &str,
        prepend_device_id: bool,
    ) -> Result<(), ClientError> {
        self.client
            .enqueue(self.subscription(pattern, prepend_device_id))
            .await
    }

    /// Unsubscribe now and drop the route
    pub async fn unsubscribe(&self, pattern: &str, prepend_device_id: bool) -> bool {
        let message = Message::unsubscribe(pattern)
            .with_device_prefix(prepend_device_id)
            .from_handler(self.handler_id.clone());
        self.send(message).await
    }

    fn subscription(&self, pattern: &str, prepend_device_id: bool) -> Message {
        Message::subscribe(pattern)
            .with_device_prefix(prepend_device_id)
            .from_handler(self.handler_id.clone())
    }

    async fn send(&self, message: Message) -> bool {
        let kind = message.kind();
        match self.client.send_now(message).await {
            Ok(_) => true,
            Err(e) => {
                warn!(handler = %self.handler_id, %kind, error = %e, "Send failed");
                false
            }
        }
    }
}
