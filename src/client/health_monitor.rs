//! Pure reconnect decisions and health metrics for the supervisor

use super::connection::ConnectionState;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// What a reconnect timer firing should do (pure function)
    ///
    /// A connected state stands until the transport reports the loss.
    pub fn should_attempt_reconnection(state: ConnectionState) -> ReconnectionDecision {
        match state {
            ConnectionState::Shutdown => ReconnectionDecision::AbortShutdownRequested,
            ConnectionState::Connecting => ReconnectionDecision::SkipAttemptInFlight,
            ConnectionState::Connected => ReconnectionDecision::SkipConnected,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                ReconnectionDecision::Proceed
            }
        }
    }

    /// Check if connection state allows transport requests (pure function)
    pub fn can_submit(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for the current epoch (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        reconnect_count: u32,
        queue_depth: usize,
        queue_capacity: usize,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|t| t.elapsed());

        HealthMetrics {
            uptime,
            reconnect_count,
            queue_depth,
            is_healthy: Self::determine_health_status(uptime, queue_depth, queue_capacity),
        }
    }

    /// Healthy while connected and the queue still has room
    fn determine_health_status(
        uptime: Option<Duration>,
        queue_depth: usize,
        queue_capacity: usize,
    ) -> bool {
        uptime.is_some() && queue_depth < queue_capacity
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting) => {
                info!("Attempting to reconnect");
            }
            (_, ConnectionState::Shutdown) => {
                info!("MQTT client shut down");
            }
            _ => {
                debug!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for a reconnect timer firing
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed,
    SkipConnected,
    SkipAttemptInFlight,
    AbortShutdownRequested,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current epoch connected
    pub uptime: Option<Duration>,
    /// Successful reconnects after the first connect
    pub reconnect_count: u32,
    /// Messages waiting in the delivery queue
    pub queue_depth: usize,
    pub is_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_decisions() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(ConnectionState::Connected),
            ReconnectionDecision::SkipConnected
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(ConnectionState::Disconnected),
            ReconnectionDecision::Proceed
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(ConnectionState::Reconnecting),
            ReconnectionDecision::Proceed
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(ConnectionState::Connecting),
            ReconnectionDecision::SkipAttemptInFlight
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(ConnectionState::Shutdown),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_can_submit() {
        assert!(HealthMonitor::can_submit(ConnectionState::Connected));
        assert!(!HealthMonitor::can_submit(ConnectionState::Reconnecting));
        assert!(!HealthMonitor::can_submit(ConnectionState::Shutdown));
    }

    #[test]
    fn test_health_metrics() {
        let metrics = HealthMonitor::calculate_health_metrics(Some(Instant::now()), 2, 3, 10);
        assert!(metrics.uptime.is_some());
        assert_eq!(metrics.reconnect_count, 2);
        assert_eq!(metrics.queue_depth, 3);
        assert!(metrics.is_healthy);

        let full = HealthMonitor::calculate_health_metrics(Some(Instant::now()), 0, 10, 10);
        assert!(!full.is_healthy);

        let offline = HealthMonitor::calculate_health_metrics(None, 0, 0, 10);
        assert!(offline.uptime.is_none());
        assert!(!offline.is_healthy);
    }
}
