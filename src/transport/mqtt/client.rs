//! Impure I/O for the `rumqttc` transport
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and spawns a
//! poller task that owns the event loop. rumqttc does not hand packet ids back
//! to callers, so every request pushes a waiter onto [`PendingAcks`] while the
//! session lock is held and the poller resolves waiters, in order, from the
//! outgoing Publish/Subscribe/Unsubscribe events.

use super::connection::{configure_mqtt_options, BrokerAddress};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::protocol::Message;
use crate::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, EventLoop, QoS, SubscribeFilter};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Requests buffered between callers and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long a request waits for its packet id
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `disconnect` lets the poller flush the DISCONNECT packet
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

type EventSender = Arc<StdRwLock<Option<mpsc::Sender<TransportEvent>>>>;

#[derive(Debug, Default)]
struct SessionFlags {
    connected: AtomicBool,
    closing: AtomicBool,
}

struct Session {
    client: AsyncClient,
    poller: JoinHandle<()>,
    flags: Arc<SessionFlags>,
}

/// Owns a poller until its session is installed
///
/// Dropped armed (failed connect, or the connecting future was cancelled), it
/// aborts the poller and marks the session down.
struct PollerGuard {
    poller: Option<JoinHandle<()>>,
    flags: Arc<SessionFlags>,
}

impl PollerGuard {
    fn new(poller: JoinHandle<()>, flags: Arc<SessionFlags>) -> Self {
        Self {
            poller: Some(poller),
            flags,
        }
    }

    /// Hand the poller over to a live session
    fn disarm(mut self) -> Option<JoinHandle<()>> {
        self.poller.take()
    }
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            self.flags.closing.store(true, Ordering::SeqCst);
            self.flags.connected.store(false, Ordering::SeqCst);
            poller.abort();
        }
    }
}

/// FIFO of callers waiting for the packet id of their request
#[derive(Debug, Default)]
struct PendingAcks {
    waiters: StdMutex<VecDeque<oneshot::Sender<u16>>>,
}

impl PendingAcks {
    fn push(&self) -> oneshot::Receiver<u16> {
        let (tx, rx) = oneshot::channel();
        self.lock().push_back(tx);
        rx
    }

    /// Drop the most recent waiter after its request failed to queue
    fn cancel_last(&self) {
        self.lock().pop_back();
    }

    fn resolve(&self, pkid: u16) {
        match self.lock().pop_front() {
            // The caller may have timed out already
            Some(waiter) => {
                let _ = waiter.send(pkid);
            }
            None => trace!(pkid, "Packet id with no waiter"),
        }
    }

    /// Wake every waiter with a closed channel
    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<oneshot::Sender<u16>>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `rumqttc`-backed [`Transport`]
pub struct MqttTransport {
    address: BrokerAddress,
    connect_timeout: Duration,
    ack_timeout: Duration,
    session: Mutex<Option<Session>>,
    flags: StdRwLock<Arc<SessionFlags>>,
    pending: Arc<PendingAcks>,
    events: EventSender,
}

impl MqttTransport {
    pub fn new(config: &MqttSection) -> Result<Self, TransportError> {
        let address = BrokerAddress::parse(&config.broker_url)?;
        Ok(Self {
            address,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            ack_timeout: ACK_TIMEOUT,
            session: Mutex::new(None),
            flags: StdRwLock::new(Arc::new(SessionFlags::default())),
            pending: Arc::new(PendingAcks::default()),
            events: Arc::new(StdRwLock::new(None)),
        })
    }

    pub fn broker_address(&self) -> &BrokerAddress {
        &self.address
    }

    fn current_flags(&self) -> Arc<SessionFlags> {
        self.flags
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn install_flags(&self, flags: Arc<SessionFlags>) {
        *self
            .flags
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = flags;
    }

    /// Wait for the poller to report the packet id
    ///
    /// 0 when the session was torn down before the request went out. A
    /// request still sitting with the session after the timeout is
    /// [`TransportError::Unconfirmed`].
    async fn await_packet_id(&self, waiter: oneshot::Receiver<u16>) -> Result<u16, TransportError> {
        match tokio::time::timeout(self.ack_timeout, waiter).await {
            Ok(Ok(pkid)) => Ok(pkid),
            Ok(Err(_)) => {
                debug!("Session closed before the request was sent");
                Ok(0)
            }
            Err(_) => {
                warn!("Timed out waiting for packet id");
                Err(TransportError::Unconfirmed("packet id"))
            }
        }
    }

    /// Run `request` against the live session with a waiter registered
    async fn submit<F, Fut>(&self, count: usize, request: F) -> Result<Vec<oneshot::Receiver<u16>>, TransportError>
    where
        F: FnOnce(AsyncClient) -> Fut,
        Fut: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(TransportError::NotConnected)?;
        if !session.flags.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let waiters: Vec<_> = (0..count).map(|_| self.pending.push()).collect();
        if let Err(e) = request(session.client.clone()).await {
            for _ in 0..count {
                self.pending.cancel_last();
            }
            return Err(TransportError::RequestFailed(Box::new(e)));
        }
        Ok(waiters)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectReturnCode, TransportError> {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            old.flags.closing.store(true, Ordering::SeqCst);
            old.poller.abort();
        }
        self.pending.clear();

        let mqtt_options = configure_mqtt_options(&self.address, options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let flags = Arc::new(SessionFlags::default());
        self.install_flags(flags.clone());

        let (connack_tx, connack_rx) = oneshot::channel();
        let poller = PollerGuard::new(
            tokio::spawn(poll_events(
                event_loop,
                flags.clone(),
                self.pending.clone(),
                self.events.clone(),
                connack_tx,
            )),
            flags.clone(),
        );

        info!(
            host = %self.address.host,
            port = self.address.port,
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        match tokio::time::timeout(self.connect_timeout, connack_rx).await {
            Ok(Ok(Ok(code))) if MessageHandler::is_accepted(code) => {
                if let Some(poller) = poller.disarm() {
                    *session = Some(Session {
                        client,
                        poller,
                        flags,
                    });
                }
                Ok(code)
            }
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(reason))) => Err(TransportError::ConnectionFailed(reason)),
            Ok(Err(_)) => Err(TransportError::ConnectionFailed(
                "Event loop stopped before ConnAck".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout("ConnAck")),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.flags.closing.store(true, Ordering::SeqCst);

        let mut result = Ok(());
        if session.flags.connected.load(Ordering::SeqCst) {
            result = session
                .client
                .disconnect()
                .await
                .map_err(|e| TransportError::RequestFailed(Box::new(e)));
            if tokio::time::timeout(DISCONNECT_GRACE, &mut session.poller)
                .await
                .is_err()
            {
                debug!("Poller did not stop after DISCONNECT, aborting");
            }
        }
        session.poller.abort();
        session.flags.connected.store(false, Ordering::SeqCst);
        self.pending.clear();

        info!("Disconnected from MQTT broker");
        result
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<u16, TransportError> {
        let topic = topic.to_string();
        let mut waiters = self
            .submit(1, |client| async move {
                client.publish_bytes(topic, qos, retain, payload).await
            })
            .await?;
        match waiters.pop() {
            Some(waiter) => self.await_packet_id(waiter).await,
            None => Ok(0),
        }
    }

    async fn subscribe(&self, topics: &[String], qos: &[QoS]) -> Result<u16, TransportError> {
        if topics.is_empty() || topics.len() != qos.len() {
            return Err(TransportError::InvalidRequest(format!(
                "{} topics with {} QoS levels",
                topics.len(),
                qos.len()
            )));
        }

        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .zip(qos)
            .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos))
            .collect();
        let mut waiters = self
            .submit(1, |client| async move { client.subscribe_many(filters).await })
            .await?;
        match waiters.pop() {
            Some(waiter) => self.await_packet_id(waiter).await,
            None => Ok(0),
        }
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<u16, TransportError> {
        if topics.is_empty() {
            return Err(TransportError::InvalidRequest("no topics".to_string()));
        }

        // One UNSUBSCRIBE per topic; the last packet id stands for the batch
        let owned = topics.to_vec();
        let waiters = self
            .submit(topics.len(), |client| async move {
                for topic in owned {
                    client.unsubscribe(topic).await?;
                }
                Ok(())
            })
            .await?;

        let mut last = 0;
        for waiter in waiters {
            let pkid = self.await_packet_id(waiter).await?;
            if pkid == 0 {
                return Ok(0);
            }
            last = pkid;
        }
        Ok(last)
    }

    fn is_connected(&self) -> bool {
        self.current_flags().connected.load(Ordering::SeqCst)
    }

    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        *self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.poller.abort();
        }
    }
}

async fn forward_event(events: &EventSender, event: TransportEvent) {
    let sender = events
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    match sender {
        Some(sender) => {
            if sender.send(event).await.is_err() {
                debug!("Transport event receiver dropped");
            }
        }
        None => trace!("No transport event sender installed"),
    }
}

/// Drive one session's event loop until it ends
async fn poll_events(
    mut event_loop: EventLoop,
    flags: Arc<SessionFlags>,
    pending: Arc<PendingAcks>,
    events: EventSender,
    connack_tx: oneshot::Sender<Result<ConnectReturnCode, String>>,
) {
    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged(code) => {
                    let accepted = MessageHandler::is_accepted(code);
                    flags.connected.store(accepted, Ordering::SeqCst);
                    if let Some(tx) = connack_tx.take() {
                        let _ = tx.send(Ok(code));
                    }
                    if !accepted {
                        break;
                    }
                }
                EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                } => {
                    trace!(topic = %topic, bytes = payload.len(), "Inbound publish");
                    forward_event(
                        &events,
                        TransportEvent::MessageReceived(Message::inbound(topic, payload, retain)),
                    )
                    .await;
                }
                EventRoute::PacketSubmitted(pkid) => pending.resolve(pkid),
                EventRoute::ClientDisconnecting => {
                    flags.connected.store(false, Ordering::SeqCst);
                    break;
                }
                EventRoute::Disconnected => debug!("Broker sent DISCONNECT"),
                EventRoute::InfrastructureEvent(description) => trace!("MQTT event: {}", description),
                EventRoute::OutgoingEvent => {}
            },
            Err(ConnectionError::ConnectionRefused(code)) => {
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Ok(code));
                }
                break;
            }
            Err(error) => {
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Err(error.to_string()));
                    break;
                }

                let was_connected = flags.connected.swap(false, Ordering::SeqCst);
                pending.clear();
                if was_connected && !flags.closing.load(Ordering::SeqCst) {
                    warn!(error = %error, "MQTT connection lost");
                    forward_event(&events, TransportEvent::ConnectionLost(error.to_string())).await;
                }
                break;
            }
        }
    }

    flags.connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_acks_resolve_in_order() {
        let pending = PendingAcks::default();
        let mut first = pending.push();
        let mut second = pending.push();

        pending.resolve(1);
        pending.resolve(2);

        assert_eq!(first.try_recv().unwrap(), 1);
        assert_eq!(second.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_pending_acks_cancel_last() {
        let pending = PendingAcks::default();
        let mut kept = pending.push();
        let mut cancelled = pending.push();
        pending.cancel_last();

        pending.resolve(9);
        assert_eq!(kept.try_recv().unwrap(), 9);
        assert!(cancelled.try_recv().is_err());
    }

    #[test]
    fn test_pending_acks_clear_closes_waiters() {
        let pending = PendingAcks::default();
        let mut waiter = pending.push();
        pending.clear();
        assert!(matches!(
            waiter.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_connect_aborts_its_poller() {
        let flags = Arc::new(SessionFlags::default());
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let guard = PollerGuard::new(
            tokio::spawn(async move {
                let _alive = alive_tx;
                std::future::pending::<()>().await
            }),
            flags.clone(),
        );
        flags.connected.store(true, Ordering::SeqCst);

        drop(guard);

        assert!(alive_rx.await.is_err());
        assert!(!flags.connected.load(Ordering::SeqCst));
        assert!(flags.closing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_installed_poller_keeps_running() {
        let flags = Arc::new(SessionFlags::default());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let guard = PollerGuard::new(
            tokio::spawn(async move {
                let _ = stop_rx.await;
            }),
            flags.clone(),
        );

        let poller = guard.disarm().unwrap();
        assert!(!flags.closing.load(Ordering::SeqCst));
        assert!(!poller.is_finished());

        stop_tx.send(()).unwrap();
        poller.await.unwrap();
    }

    #[tokio::test]
    async fn test_packet_id_wait_outcomes() {
        let mut transport = MqttTransport::new(&MqttSection::default()).unwrap();
        transport.ack_timeout = Duration::from_millis(20);

        let waiter = transport.pending.push();
        transport.pending.resolve(7);
        assert_eq!(transport.await_packet_id(waiter).await.unwrap(), 7);

        // Session torn down before the request left: safe to send again
        let waiter = transport.pending.push();
        transport.pending.clear();
        assert_eq!(transport.await_packet_id(waiter).await.unwrap(), 0);

        // Handed to the session but never reported
        let waiter = transport.pending.push();
        assert!(matches!(
            transport.await_packet_id(waiter).await,
            Err(TransportError::Unconfirmed(_))
        ));
    }

    #[test]
    fn test_new_rejects_bad_url() {
        let config = MqttSection {
            broker_url: "not a url".to_string(),
            ..MqttSection::default()
        };
        assert!(matches!(
            MqttTransport::new(&config),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_requests_fail_when_not_connected() {
        let transport = MqttTransport::new(&MqttSection::default()).unwrap();
        assert!(!transport.is_connected());

        let result = transport
            .publish("status", Bytes::from_static(b"x"), QoS::ExactlyOnce, false)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));

        let result = transport
            .subscribe(&["cmd/+".to_string()], &[QoS::ExactlyOnce])
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));

        // Disconnecting without a session is a no-op
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_mismatched_qos() {
        let transport = MqttTransport::new(&MqttSection::default()).unwrap();
        let result = transport.subscribe(&["a".to_string()], &[]).await;
        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }
}
