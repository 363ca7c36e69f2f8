//! Submission of messages to the transport
//!
//! One [`Dispatcher`] value lives for the whole client; its [`run`] loop is
//! spawned once per connection epoch and stops when the epoch token is
//! cancelled.
//!
//! [`run`]: Dispatcher::run

use super::connection::ClientEvent;
use super::queue::{DeliveryQueue, QueueLease};
use super::ClientError;
use crate::protocol::{Message, MessageKind, DELIVERY_QOS};
use crate::routing::{RouteMeta, TopicRouter};
use crate::transport::Transport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Wait between checks while the transport is down or after a failed submission
pub const IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// Consecutive 0-id answers after which a queued message is dropped
pub const MAX_UNACCEPTED_ATTEMPTS: u32 = 20;

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    queue: Arc<DeliveryQueue>,
    router: Arc<TopicRouter>,
    events: broadcast::Sender<ClientEvent>,
    device_id: String,
    active: AtomicUsize,
}

/// Keeps the running-loop count right however the loop ends
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<DeliveryQueue>,
        router: Arc<TopicRouter>,
        events: broadcast::Sender<ClientEvent>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            queue,
            router,
            events,
            device_id: device_id.into(),
            active: AtomicUsize::new(0),
        }
    }

    /// Number of `run` loops currently alive
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Perform the transport operation a message asks for
    ///
    /// On acceptance the message gets its packet id, the matching event is
    /// emitted and, for subscriptions issued by a handler, the route is
    /// registered (or removed).
    pub async fn submit(&self, mut message: Message) -> Result<Message, ClientError> {
        message.validate()?;
        let topic = message.resolve(&self.device_id).to_string();
        let kind = message.kind();

        let id = match kind {
            MessageKind::Publish => {
                self.transport
                    .publish(
                        &topic,
                        message.payload().to_bytes(),
                        DELIVERY_QOS,
                        message.is_retained(),
                    )
                    .await?
            }
            MessageKind::Subscribe => {
                self.transport
                    .subscribe(std::slice::from_ref(&topic), &[DELIVERY_QOS])
                    .await?
            }
            MessageKind::Unsubscribe => {
                self.transport
                    .unsubscribe(std::slice::from_ref(&topic))
                    .await?
            }
        };

        if id == 0 {
            return Err(ClientError::NotAccepted { kind, topic });
        }
        message.assign_id(id);
        trace!(message_id = id, "{}", message);

        let event = match kind {
            MessageKind::Publish => ClientEvent::Published(message.clone()),
            MessageKind::Subscribe => {
                if let Some(origin) = message.origin() {
                    let meta = RouteMeta {
                        prepend_device_id: message.prepends_device_id(),
                    };
                    self.router.register(&topic, origin, meta).await?;
                }
                ClientEvent::Subscribed(message.clone())
            }
            MessageKind::Unsubscribe => {
                if let Some(origin) = message.origin() {
                    self.router.unregister(&topic, origin).await;
                }
                ClientEvent::Unsubscribed(message.clone())
            }
        };
        let _ = self.events.send(event);

        Ok(message)
    }

    /// Drain the queue while connected until `cancel` fires
    ///
    /// Waiting (idle or for the next message) is raced against the token; a
    /// submission in progress is not.
    pub async fn run(&self, cancel: CancellationToken, epoch: u64) {
        let _guard = ActiveGuard::enter(&self.active);
        debug!(epoch, "Dispatcher started");
        // A refused message returns to the head, so the next lease holds it again
        let mut unaccepted = 0u32;

        while !cancel.is_cancelled() {
            if !self.transport.is_connected() {
                if !idle(&cancel).await {
                    break;
                }
                continue;
            }

            let lease = tokio::select! {
                _ = cancel.cancelled() => break,
                lease = self.queue.dequeue() => lease,
            };

            match self.submit(lease.message().clone()).await {
                Ok(_) => {
                    unaccepted = 0;
                    lease.commit();
                }
                Err(ClientError::NotAccepted { .. })
                    if unaccepted + 1 >= MAX_UNACCEPTED_ATTEMPTS =>
                {
                    unaccepted = 0;
                    warn!(
                        attempts = MAX_UNACCEPTED_ATTEMPTS,
                        "Transport keeps refusing message, dropping it"
                    );
                    self.give_up(lease);
                }
                Err(error) if error.is_retryable() => {
                    if matches!(error, ClientError::NotAccepted { .. }) {
                        unaccepted += 1;
                    }
                    debug!(error = %error, "Submission failed, message returned to queue");
                    drop(lease);
                    if !idle(&cancel).await {
                        break;
                    }
                }
                Err(error) => {
                    unaccepted = 0;
                    warn!(error = %error, "Dropping undeliverable message");
                    self.give_up(lease);
                }
            }
        }

        debug!(epoch, "Dispatcher stopped");
    }

    /// Remove a leased message for good and report it
    fn give_up(&self, lease: QueueLease<'_>) {
        if let Some(message) = lease.commit() {
            let _ = self.events.send(ClientEvent::DeliveryFailed(message));
        }
    }
}

/// Sleep one idle interval; false when cancelled first
async fn idle(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(IDLE_INTERVAL) => true,
    }
}
