//! In-memory transport for exercising the client without a broker

use crate::protocol::Message;
use crate::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, QoS};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Topic, payload and retain flag of an accepted publish
pub type PublishedMessage = (String, Bytes, bool);

/// Every call the transport received, in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOperation {
    Connect(ConnectOptions),
    Disconnect,
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        id: u16,
    },
    Subscribe {
        topics: Vec<String>,
        id: u16,
    },
    Unsubscribe {
        topics: Vec<String>,
        id: u16,
    },
}

#[derive(Debug)]
struct MockState {
    operations: Vec<TransportOperation>,
    connect_code: ConnectReturnCode,
    connect_error: Option<String>,
    reject_submissions: bool,
    rejected_topics: Vec<String>,
    unconfirmed_topics: Vec<String>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    connected: AtomicBool,
    next_id: AtomicU16,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                operations: Vec::new(),
                connect_code: ConnectReturnCode::Success,
                connect_error: None,
                reject_submissions: false,
                rejected_topics: Vec::new(),
                unconfirmed_topics: Vec::new(),
                events: None,
            }),
            connected: AtomicBool::new(false),
            next_id: AtomicU16::new(1),
        }
    }

    /// Return code for subsequent connect attempts
    pub fn set_connect_code(&self, code: ConnectReturnCode) {
        self.lock().connect_code = code;
    }

    /// Make connect attempts fail without a return code
    pub fn fail_connect(&self, error: Option<&str>) {
        self.lock().connect_error = error.map(str::to_string);
    }

    /// Answer publish/subscribe/unsubscribe with packet id 0
    pub fn reject_submissions(&self, reject: bool) {
        self.lock().reject_submissions = reject;
    }

    /// Answer requests touching `topic` with packet id 0, every time
    pub fn reject_topic(&self, topic: &str) {
        self.lock().rejected_topics.push(topic.to_string());
    }

    /// Take requests touching `topic` but never report their packet id
    pub fn lose_acknowledgements_for(&self, topic: &str) {
        self.lock().unconfirmed_topics.push(topic.to_string());
    }

    /// Every publish attempt on `topic`, accepted or not
    pub fn publish_attempts(&self, topic: &str) -> usize {
        self.lock()
            .operations
            .iter()
            .filter(|op| matches!(op, TransportOperation::Publish { topic: t, .. } if t == topic))
            .count()
    }

    pub fn operations(&self) -> Vec<TransportOperation> {
        self.lock().operations.clone()
    }

    /// Accepted publishes, in submission order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock()
            .operations
            .iter()
            .filter_map(|op| match op {
                TransportOperation::Publish {
                    topic,
                    payload,
                    retain,
                    id,
                    ..
                } if *id > 0 => Some((topic.clone(), payload.clone(), *retain)),
                _ => None,
            })
            .collect()
    }

    /// Topics of accepted subscriptions, in submission order
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock()
            .operations
            .iter()
            .filter_map(|op| match op {
                TransportOperation::Subscribe { topics, id } if *id > 0 => Some(topics.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.lock()
            .operations
            .iter()
            .filter(|op| matches!(op, TransportOperation::Connect(_)))
            .count()
    }

    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.lock().operations.iter().rev().find_map(|op| match op {
            TransportOperation::Connect(options) => Some(options.clone()),
            _ => None,
        })
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Deliver a publish as if the broker had sent it
    pub async fn inject_message(&self, topic: &str, payload: impl Into<Bytes>) {
        let message = Message::inbound(topic, payload.into(), false);
        self.send_event(TransportEvent::MessageReceived(message)).await;
    }

    /// Drop the session and report the loss
    pub async fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.send_event(TransportEvent::ConnectionLost(cause.to_string()))
            .await;
    }

    async fn send_event(&self, event: TransportEvent) {
        let sender = self.lock().events.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Packet id for a submission, or 0 when rejecting
    fn submission_id(&self, topics: &[String]) -> Result<u16, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let state = self.lock();
        let touches = |list: &[String]| topics.iter().any(|t| list.contains(t));
        if state.reject_submissions || touches(&state.rejected_topics) {
            return Ok(0);
        }
        if touches(&state.unconfirmed_topics) {
            return Err(TransportError::Unconfirmed("packet id"));
        }
        drop(state);
        Ok(self.next_packet_id())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectReturnCode, TransportError> {
        let mut state = self.lock();
        if let Some(error) = &state.connect_error {
            return Err(TransportError::ConnectionFailed(error.clone()));
        }
        state.operations.push(TransportOperation::Connect(options.clone()));
        let code = state.connect_code;
        self.connected
            .store(code == ConnectReturnCode::Success, Ordering::SeqCst);
        Ok(code)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.lock().operations.push(TransportOperation::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<u16, TransportError> {
        let result = self.submission_id(&[topic.to_string()]);
        // An unconfirmed publish still reached the wire
        let id = match &result {
            Ok(id) => *id,
            Err(TransportError::Unconfirmed(_)) => 0,
            Err(_) => return result,
        };
        self.lock().operations.push(TransportOperation::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            id,
        });
        result
    }

    async fn subscribe(&self, topics: &[String], _qos: &[QoS]) -> Result<u16, TransportError> {
        let id = self.submission_id(topics)?;
        self.lock().operations.push(TransportOperation::Subscribe {
            topics: topics.to_vec(),
            id,
        });
        Ok(id)
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<u16, TransportError> {
        let id = self.submission_id(topics)?;
        self.lock().operations.push(TransportOperation::Unsubscribe {
            topics: topics.to_vec(),
            id,
        });
        Ok(id)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        self.lock().events = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "dev".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            will: None,
        }
    }

    #[tokio::test]
    async fn test_records_operations() {
        let transport = MockTransport::new();
        transport.connect(&options()).await.unwrap();

        let first = transport
            .publish("a", Bytes::from_static(b"1"), QoS::ExactlyOnce, true)
            .await
            .unwrap();
        let second = transport
            .subscribe(&["cmd/+".to_string()], &[QoS::ExactlyOnce])
            .await
            .unwrap();

        assert!(first > 0 && second > first);
        assert_eq!(transport.published(), vec![("a".to_string(), Bytes::from_static(b"1"), true)]);
        assert_eq!(transport.subscriptions(), vec!["cmd/+".to_string()]);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let transport = MockTransport::new();
        let result = transport
            .publish("a", Bytes::new(), QoS::ExactlyOnce, false)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_connect_stays_disconnected() {
        let transport = MockTransport::new();
        transport.set_connect_code(ConnectReturnCode::NotAuthorized);
        let code = transport.connect(&options()).await.unwrap();
        assert_eq!(code, ConnectReturnCode::NotAuthorized);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_events_reach_sender() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        transport.set_event_sender(tx);

        transport.inject_message("cmd/reset", "now").await;
        transport.drop_connection("gone").await;

        assert!(matches!(rx.recv().await, Some(TransportEvent::MessageReceived(_))));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::ConnectionLost("gone".to_string()))
        );
    }
}
