//! Connection supervisor
//!
//! [`Client`] owns the transport, the delivery queue and the per-epoch
//! dispatcher. A connection epoch starts with each successful connect; the
//! previous epoch's dispatcher is cancelled and awaited before a new attempt,
//! so at most one dispatcher ever drains the queue.

use super::connection::{ClientConfig, ClientEvent, CloseReason, ConnectionState};
use super::dispatcher::{Dispatcher, IDLE_INTERVAL};
use super::health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::queue::DeliveryQueue;
use super::ClientError;
use crate::mqtt_span;
use crate::protocol::{Message, DELIVERY_QOS};
use crate::routing::TopicRouter;
use crate::transport::{Transport, TransportEvent};
use rumqttc::ConnectReturnCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Pause between closing a live session and opening the next
const SETTLE_DELAY: Duration = Duration::from_millis(10);

const EVENT_CHANNEL_CAPACITY: usize = 256;
const TRANSPORT_CHANNEL_CAPACITY: usize = 256;

struct Epoch {
    number: u64,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

/// Connection supervisor and outbound entry point
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    queue: Arc<DeliveryQueue>,
    router: Arc<TopicRouter>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    epoch: Mutex<Epoch>,
    shutdown: CancellationToken,
    timer_started: AtomicBool,
    reconnect_count: AtomicU32,
    connected_at: StdMutex<Option<Instant>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client around `transport`
    ///
    /// Must be called from within a Tokio runtime: the inbound pump task is
    /// spawned here.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        router: Arc<TopicRouter>,
    ) -> Arc<Self> {
        let queue = Arc::new(DeliveryQueue::new(config.queue_capacity));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            queue.clone(),
            router.clone(),
            events.clone(),
            config.device_id.clone(),
        ));

        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        transport.set_event_sender(transport_tx);

        let client = Arc::new(Self {
            config,
            transport,
            queue,
            router,
            dispatcher,
            state,
            events,
            epoch: Mutex::new(Epoch {
                number: 0,
                cancel: CancellationToken::new(),
                dispatcher: None,
            }),
            shutdown: CancellationToken::new(),
            timer_started: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
            connected_at: StdMutex::new(None),
            pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(run_inbound_pump(Arc::downgrade(&client), transport_rx));
        *lock(&client.pump) = Some(pump);
        client
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_submit(self.state()) && self.transport.is_connected()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receive lifecycle and delivery events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Dispatcher loops currently running (0 or 1)
    pub fn dispatcher_count(&self) -> usize {
        self.dispatcher.active_count()
    }

    /// Number of the current connection epoch; 0 before the first connect
    pub async fn epoch(&self) -> u64 {
        self.epoch.lock().await.number
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let connected_at = if self.is_connected() {
            *lock(&self.connected_at)
        } else {
            None
        };
        HealthMonitor::calculate_health_metrics(
            connected_at,
            self.reconnect_count.load(Ordering::SeqCst),
            self.queue.len(),
            self.queue.capacity(),
        )
    }

    /// Open a new connection epoch
    ///
    /// Any previous epoch is retired first. On refusal a `Closed` event is
    /// emitted and an error returned; retrying is left to the reconnect timer.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        self.start_reconnect_timer();

        let mut epoch = self.epoch.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        retire(&mut epoch).await;

        let span = mqtt_span!(
            operation = "connect",
            device_id = %self.config.device_id,
            epoch = epoch.number + 1
        );
        async {
            if self.transport.is_connected() {
                if let Err(e) = self.transport.disconnect().await {
                    debug!(error = %e, "Disconnect before reconnect failed");
                }
                tokio::time::sleep(SETTLE_DELAY).await;
            }

            self.set_state(ConnectionState::Connecting);
            let options = self.config.connect_options();
            let reason = match self.transport.connect(&options).await {
                Ok(ConnectReturnCode::Success) => None,
                Ok(code) => Some(CloseReason::from(code)),
                Err(e) => {
                    warn!(error = %e, "Connect attempt failed");
                    Some(CloseReason::from_transport_error(&e))
                }
            };
            if let Some(reason) = reason {
                warn!(reason = %reason, code = reason.code(), "Connection refused");
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::closed(reason));
                return Err(ClientError::Refused { reason });
            }

            epoch.number += 1;
            if epoch.number > 1 {
                self.reconnect_count.fetch_add(1, Ordering::SeqCst);
            }
            *lock(&self.connected_at) = Some(Instant::now());

            if self.config.will.enabled {
                self.publish_status(&self.config.will.online_message).await;
            }

            self.set_state(ConnectionState::Connected);
            self.emit(ClientEvent::Connected);

            if epoch.number > 1 && self.config.resubscribe_on_reconnect {
                self.resubscribe().await;
            }

            epoch.cancel = self.shutdown.child_token();
            let dispatcher = self.dispatcher.clone();
            let cancel = epoch.cancel.clone();
            let number = epoch.number;
            epoch.dispatcher = Some(tokio::spawn(async move {
                dispatcher.run(cancel, number).await;
            }));

            info!("Connected to broker");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Close the connection for good
    ///
    /// Stops the reconnect timer, retires the dispatcher, publishes the
    /// offline status and closes the transport. Later calls do nothing.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let mut epoch = self.epoch.lock().await;
        retire(&mut epoch).await;
        self.queue.close();

        if self.transport.is_connected() && self.config.will.enabled {
            self.publish_status(&self.config.will.offline_message).await;
        }
        let result = self.transport.disconnect().await;

        *lock(&self.connected_at) = None;
        self.set_state(ConnectionState::Shutdown);
        self.emit(ClientEvent::closed(CloseReason::Shutdown));
        info!(pending = self.queue.len(), "Client shut down");

        result.map_err(ClientError::from)
    }

    /// Queue a message, waiting while the queue is full
    pub async fn enqueue(&self, message: Message) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        message.validate()?;
        self.queue.enqueue(message).await
    }

    /// Queue a message, failing with `QueueFull` instead of waiting
    pub fn try_enqueue(&self, message: Message) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        message.validate()?;
        self.queue.try_enqueue(message)
    }

    /// Perform a message's operation now, bypassing the queue
    pub async fn send_now(&self, message: Message) -> Result<Message, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if !self.transport.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.dispatcher.submit(message).await
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            HealthMonitor::log_state_transition(previous, next);
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Status payload straight to the transport, no event
    async fn publish_status(&self, payload: &str) {
        let mut message = self.config.status_message(payload);
        let topic = message.resolve(&self.config.device_id).to_string();
        match self
            .transport
            .publish(
                &topic,
                message.payload().to_bytes(),
                DELIVERY_QOS,
                message.is_retained(),
            )
            .await
        {
            Ok(0) => warn!(topic = %topic, "Status message not accepted"),
            Ok(_) => debug!(topic = %topic, payload, "Status published"),
            Err(e) => warn!(topic = %topic, error = %e, "Failed to publish status"),
        }
    }

    async fn resubscribe(&self) {
        let patterns = self.router.patterns().await;
        for pattern in &patterns {
            match self
                .transport
                .subscribe(std::slice::from_ref(pattern), &[DELIVERY_QOS])
                .await
            {
                Ok(id) if id > 0 => trace!(pattern = %pattern, "Re-subscribed"),
                Ok(_) => warn!(pattern = %pattern, "Re-subscription not accepted"),
                Err(e) => warn!(pattern = %pattern, error = %e, "Re-subscription failed"),
            }
        }
        if !patterns.is_empty() {
            info!(count = patterns.len(), "Restored subscriptions");
        }
    }

    fn start_reconnect_timer(self: &Arc<Self>) {
        if !self.config.auto_reconnect || self.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.reconnect_interval.max(IDLE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(client) = weak.upgrade() else {
                    break;
                };
                client.on_reconnect_tick().await;
            }
            debug!("Reconnect timer stopped");
        });
    }

    async fn on_reconnect_tick(self: &Arc<Self>) {
        match HealthMonitor::should_attempt_reconnection(self.state()) {
            ReconnectionDecision::Proceed => {
                self.set_state(ConnectionState::Reconnecting);
                self.emit(ClientEvent::Reconnecting);
                if let Err(e) = self.connect().await {
                    debug!(error = %e, "Reconnect attempt failed");
                }
            }
            ReconnectionDecision::SkipConnected | ReconnectionDecision::SkipAttemptInFlight => {}
            ReconnectionDecision::AbortShutdownRequested => {}
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived(message) => {
                let delivered = self.router.dispatch(message).await;
                trace!(delivered, "Inbound message routed");
            }
            TransportEvent::ConnectionLost(cause) => {
                if self.state() == ConnectionState::Shutdown {
                    return;
                }
                warn!(cause = %cause, "Broker connection lost");
                *lock(&self.connected_at) = None;
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::closed(CloseReason::ConnectionLost));
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

/// Cancel the epoch's dispatcher and wait for it to finish
async fn retire(epoch: &mut Epoch) {
    epoch.cancel.cancel();
    if let Some(handle) = epoch.dispatcher.take() {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(epoch = epoch.number, "Dispatcher panicked");
            }
        }
    }
}

async fn run_inbound_pump(client: Weak<Client>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        client.handle_transport_event(event).await;
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, TransportOperation};

    fn test_config() -> ClientConfig {
        ClientConfig {
            device_id: "dev".to_string(),
            reconnect_interval: Duration::from_millis(30),
            queue_capacity: 8,
            ..ClientConfig::default()
        }
    }

    fn client_with(transport: Arc<MockTransport>, config: ClientConfig) -> Arc<Client> {
        Client::new(config, transport, Arc::new(TopicRouter::default()))
    }

    #[tokio::test]
    async fn test_connect_publishes_online_and_starts_dispatcher() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport.clone(), test_config());
        let mut events = client.subscribe_events();

        client.connect().await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);
        let published = transport.published();
        assert_eq!(published[0].0, "dev/status");
        assert_eq!(&published[0].1[..], b"Online");

        let will = transport.last_connect_options().unwrap().will.unwrap();
        assert_eq!(will.topic, "dev/status");
        assert_eq!(will.payload, "Offline");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.dispatcher_count(), 1);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect_emits_closed() {
        let transport = Arc::new(MockTransport::new());
        transport.set_connect_code(ConnectReturnCode::BadUserNamePassword);
        let mut config = test_config();
        config.auto_reconnect = false;
        let client = client_with(transport, config);
        let mut events = client.subscribe_events();

        let result = client.connect().await;
        assert!(matches!(
            result,
            Err(ClientError::Refused {
                reason: CloseReason::BadCredentials
            })
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Closed {
                reason: CloseReason::BadCredentials,
                code: 4
            }
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.dispatcher_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_one_dispatcher() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport.clone(), test_config());

        for _ in 0..3 {
            client.connect().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(client.dispatcher_count(), 1);
        assert_eq!(client.epoch().await, 3);
        assert_eq!(transport.connect_count(), 3);
        // Each reconnect on a live session disconnects first
        assert_eq!(
            transport
                .operations()
                .iter()
                .filter(|op| matches!(op, TransportOperation::Disconnect))
                .count(),
            2
        );
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport.clone(), test_config());
        client.connect().await.unwrap();
        let mut events = client.subscribe_events();

        client.disconnect().await.unwrap();

        assert_eq!(client.state(), ConnectionState::Shutdown);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Closed {
                reason: CloseReason::Shutdown,
                code: 98
            }
        );
        let last = transport.published().pop().unwrap();
        assert_eq!(&last.1[..], b"Offline");

        assert!(matches!(client.connect().await, Err(ClientError::Shutdown)));
        assert!(matches!(
            client.enqueue(Message::publish("a", "1")).await,
            Err(ClientError::Shutdown)
        ));
        assert!(client.disconnect().await.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.dispatcher_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_then_timer_reconnects() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport.clone(), test_config());
        client.connect().await.unwrap();
        let mut events = client.subscribe_events();

        transport.drop_connection("network down").await;

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Closed {
                reason: CloseReason::ConnectionLost,
                code: 99
            }
        );
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Reconnecting);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);
        assert_eq!(client.health_metrics().reconnect_count, 1);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_now_requires_connection() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport, test_config());

        assert!(matches!(
            client.send_now(Message::publish("a", "1")).await,
            Err(ClientError::NotConnected)
        ));
        client.connect().await.unwrap();
        let sent = client.send_now(Message::publish("a", "1")).await.unwrap();
        assert!(sent.is_accepted());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_validates_topic() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport, test_config());
        assert!(matches!(
            client.enqueue(Message::publish("", "1")).await,
            Err(ClientError::Topic(_))
        ));
        assert!(matches!(
            client.try_enqueue(Message::publish("a/+", "1")),
            Err(ClientError::Topic(_))
        ));
    }

    #[tokio::test]
    async fn test_health_metrics() {
        let transport = Arc::new(MockTransport::new());
        let client = client_with(transport, test_config());
        assert!(!client.health_metrics().is_healthy);

        client.connect().await.unwrap();
        let metrics = client.health_metrics();
        assert!(metrics.is_healthy);
        assert!(metrics.uptime.is_some());
        assert_eq!(metrics.reconnect_count, 0);
        client.disconnect().await.unwrap();
    }
}
