//! Loading and lifecycle of the configured handler set

use super::{Handler, HandlerError, HandlerHost, HostState};
use crate::client::Client;
use crate::lifecycle_span;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, Instrument};

/// Outcome of [`HandlerManager::load`]
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, HandlerError)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the hosts of every loaded handler
pub struct HandlerManager {
    client: Arc<Client>,
    hosts: RwLock<Vec<Arc<HandlerHost>>>,
}

impl HandlerManager {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            hosts: RwLock::new(Vec::new()),
        }
    }

    /// Host and initialize each handler
    ///
    /// A handler that fails, panics or repeats an id is disposed and reported;
    /// the rest still load.
    pub async fn load(&self, handlers: Vec<Arc<dyn Handler>>) -> LoadReport {
        let mut report = LoadReport::default();

        for handler in handlers {
            let id = handler.identifier().to_string();
            if self.contains(&id).await {
                error!(handler = %id, "Duplicate handler identifier");
                report.failed.push((id.clone(), HandlerError::Duplicate(id)));
                continue;
            }

            let host = HandlerHost::new(handler, self.client.clone()).await;
            let result = host
                .initialize()
                .instrument(lifecycle_span!(event = "handler_load", handler = %id))
                .await;

            match result {
                Ok(()) => {
                    self.hosts.write().await.push(host);
                    report.loaded.push(id);
                }
                Err(e) => {
                    error!(handler = %id, error = %e, "Handler failed to load");
                    host.dispose().await;
                    report.failed.push((id, e));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Handlers loaded"
        );
        report
    }

    /// Start the workers of every initialized handler
    pub async fn start(&self) -> usize {
        self.hosts
            .read()
            .await
            .iter()
            .filter(|host| host.start())
            .count()
    }

    pub async fn notify_server_state(&self, connected: bool) {
        let hosts = self.hosts.read().await.clone();
        for host in hosts {
            host.notify_server_state(connected).await;
        }
    }

    /// Dispose every handler in reverse load order
    pub async fn dispose_all(&self) {
        let hosts = std::mem::take(&mut *self.hosts.write().await);
        for host in hosts.into_iter().rev() {
            host.dispose().await;
        }
    }

    pub async fn handler_ids(&self) -> Vec<String> {
        self.hosts
            .read()
            .await
            .iter()
            .map(|host| host.id().to_string())
            .collect()
    }

    pub async fn host_state(&self, handler_id: &str) -> Option<HostState> {
        self.hosts
            .read()
            .await
            .iter()
            .find(|host| host.id() == handler_id)
            .map(|host| host.state())
    }

    async fn contains(&self, handler_id: &str) -> bool {
        self.hosts
            .read()
            .await
            .iter()
            .any(|host| host.id() == handler_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::handler::HandlerContext;
    use crate::protocol::Message;
    use crate::routing::TopicRouter;
    use crate::testing::MockTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Named {
        id: &'static str,
        fail: bool,
        connected: AtomicBool,
    }

    impl Named {
        fn new(id: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                fail,
                connected: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Handler for Named {
        fn identifier(&self) -> &str {
            self.id
        }

        async fn initialize(&self, _ctx: &HandlerContext) -> Result<(), HandlerError> {
            if self.fail {
                panic!("initialize exploded");
            }
            Ok(())
        }

        async fn process_message(&self, _ctx: &HandlerContext, _message: Message) {}

        async fn server_state_changed(&self, _ctx: &HandlerContext, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }
    }

    fn manager() -> HandlerManager {
        let client = Client::new(
            ClientConfig {
                auto_reconnect: false,
                ..ClientConfig::default()
            },
            Arc::new(MockTransport::new()),
            Arc::new(TopicRouter::default()),
        );
        HandlerManager::new(client)
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let manager = manager();
        let report = manager
            .load(vec![
                Named::new("a", false),
                Named::new("boom", true),
                Named::new("a", false),
                Named::new("b", false),
            ])
            .await;

        assert_eq!(report.loaded, vec!["a", "b"]);
        assert_eq!(report.failed.len(), 2);
        assert!(matches!(report.failed[0].1, HandlerError::Panicked(_)));
        assert!(matches!(report.failed[1].1, HandlerError::Duplicate(_)));
        assert!(!report.is_complete());
        assert_eq!(manager.handler_ids().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_start_notify_and_dispose() {
        let manager = manager();
        let a = Named::new("a", false);
        manager.load(vec![a.clone()]).await;

        assert_eq!(manager.start().await, 1);
        assert_eq!(manager.host_state("a").await, Some(HostState::Running));

        manager.notify_server_state(true).await;
        assert!(a.connected.load(Ordering::SeqCst));

        manager.dispose_all().await;
        assert!(manager.handler_ids().await.is_empty());
    }
}
