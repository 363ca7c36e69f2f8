//! Bridge coordinator
//!
//! Wires the [`Client`], its [`TopicRouter`] and the configured handlers
//! together and owns the background tasks that keep them in step.

pub mod lifecycle;

pub use lifecycle::{run_event_loop, ServerStateChange};

use crate::client::{Client, ClientConfig, ClientError};
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::handler::{builtin, HandlerManager, LoadReport};
use crate::lifecycle_span;
use crate::routing::TopicRouter;
use crate::transport::Transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// The running bridge
pub struct Bridge {
    config: BridgeConfig,
    client: Arc<Client>,
    router: Arc<TopicRouter>,
    handlers: Arc<HandlerManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Build the client and router from `config`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> BridgeResult<Self> {
        config.validate()?;

        let router = Arc::new(TopicRouter::new(
            config.mqtt.overflow_capacity,
            Duration::from_secs(config.mqtt.overflow_ttl_secs),
        ));
        let client = Client::new(
            ClientConfig::from_bridge_config(&config),
            transport,
            router.clone(),
        );
        let handlers = Arc::new(HandlerManager::new(client.clone()));

        Ok(Self {
            config,
            client,
            router,
            handlers,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn handlers(&self) -> &Arc<HandlerManager> {
        &self.handlers
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Connect in the background, then load and start the enabled handlers
    ///
    /// A refused first connect is logged; the reconnect timer keeps trying.
    pub async fn start(&self) -> BridgeResult<LoadReport> {
        let span = lifecycle_span!(event = "bridge_start", device_id = %self.client.device_id());
        async {
            let events = self.client.subscribe_events();
            let event_loop = tokio::spawn(run_event_loop(events, self.handlers.clone()));

            let client = self.client.clone();
            let connect = tokio::spawn(async move {
                match client.connect().await {
                    Ok(()) => {}
                    Err(ClientError::Refused { reason }) => {
                        warn!(reason = %reason, "Initial connect refused, retrying on timer")
                    }
                    Err(e) => error!(error = %e, "Initial connect failed"),
                }
            });
            self.push_tasks([connect, event_loop]);

            let report = self.load_handlers().await;
            let started = self.handlers.start().await;
            self.handlers
                .notify_server_state(self.client.is_connected())
                .await;

            info!(
                started,
                failed = report.failed.len(),
                "Bridge started"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Dispose handlers, close the connection and stop background tasks
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *tasks)
        };
        // The connect task goes first so disconnect never waits on an attempt
        if let Some(connect) = tasks.first() {
            connect.abort();
        }

        self.handlers.dispose_all().await;
        let result = self.client.disconnect().await;

        for task in tasks {
            task.abort();
        }
        info!("Bridge shut down");
        result.map_err(Into::into)
    }

    async fn load_handlers(&self) -> LoadReport {
        let mut handlers = Vec::new();
        let mut rejected = Vec::new();
        for name in builtin::enabled_names(&self.config.handlers) {
            match builtin::create(&name, &self.config.handlers) {
                Ok(handler) => handlers.push(handler),
                Err(e) => {
                    error!(handler = %name, error = %e, "Cannot create handler");
                    rejected.push((name, e));
                }
            }
        }

        let mut report = self.handlers.load(handlers).await;
        report.failed.extend(rejected);
        report
    }

    fn push_tasks(&self, new: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(new);
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
