//! Per-handler inbox, worker task and panic isolation

use super::{Handler, HandlerContext, HandlerError};
use crate::client::Client;
use crate::handler_span;
use crate::protocol::Message;
use crate::routing::{MessageSink, TopicRouter};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Where a hosted handler is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Initialized,
    Running,
    Failed,
    Disposed,
}

struct HostInner {
    state: HostState,
    inbox: Option<mpsc::UnboundedReceiver<Message>>,
    worker: Option<JoinHandle<()>>,
}

/// Runs one handler
///
/// Deliveries accumulate in the inbox from the moment the host is attached
/// to the router; the worker drains them in order once started.
pub struct HandlerHost {
    id: String,
    handler: Arc<dyn Handler>,
    context: HandlerContext,
    router: Arc<TopicRouter>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inner: Mutex<HostInner>,
}

impl HandlerHost {
    /// Wrap `handler` and make it reachable through the client's router
    pub async fn new(handler: Arc<dyn Handler>, client: Arc<Client>) -> Arc<Self> {
        let id = handler.identifier().to_string();
        let router = client.router().clone();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let host = Arc::new(Self {
            context: HandlerContext::new(id.clone(), client),
            id,
            handler,
            router,
            inbox_tx,
            inner: Mutex::new(HostInner {
                state: HostState::Created,
                inbox: Some(inbox_rx),
                worker: None,
            }),
        });

        let weak = Arc::downgrade(&host);
        let sink: Weak<dyn MessageSink> = weak;
        host.router.attach(sink).await;
        host
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HostState {
        self.lock().state
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Check compatibility and run the handler's `initialize`
    pub async fn initialize(&self) -> Result<(), HandlerError> {
        if self.state() != HostState::Created {
            return Err(HandlerError::InitializationFailed(format!(
                "{} is {:?}",
                self.id,
                self.state()
            )));
        }

        if !self.handler.is_compatible() {
            self.set_state(HostState::Failed);
            return Err(HandlerError::Incompatible(self.id.clone()));
        }

        let result = guarded(&self.id, "initialize", self.handler.initialize(&self.context))
            .instrument(handler_span!(handler = %self.id, callback = "initialize"))
            .await;

        match result {
            Some(Ok(())) => {
                self.set_state(HostState::Initialized);
                info!(handler = %self.id, "Handler initialized");
                Ok(())
            }
            Some(Err(e)) => {
                self.set_state(HostState::Failed);
                Err(e)
            }
            None => {
                self.set_state(HostState::Failed);
                Err(HandlerError::Panicked(self.id.clone()))
            }
        }
    }

    /// Start draining the inbox; only after a successful `initialize`
    pub fn start(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != HostState::Initialized {
            return false;
        }
        let Some(mut inbox) = inner.inbox.take() else {
            return false;
        };

        let id = self.id.clone();
        let handler = self.handler.clone();
        let context = self.context.clone();
        inner.worker = Some(tokio::spawn(
            async move {
                while let Some(message) = inbox.recv().await {
                    guarded(&id, "process_message", handler.process_message(&context, message))
                        .await;
                }
            }
            .instrument(handler_span!(handler = %self.id, callback = "process_message")),
        ));
        inner.state = HostState::Running;
        debug!(handler = %self.id, "Handler worker started");
        true
    }

    /// Forward a broker reachability change
    pub async fn notify_server_state(&self, connected: bool) {
        if !matches!(self.state(), HostState::Initialized | HostState::Running) {
            return;
        }
        guarded(
            &self.id,
            "server_state_changed",
            self.handler.server_state_changed(&self.context, connected),
        )
        .await;
    }

    /// Remove every route, stop the worker and uninitialize once
    pub async fn dispose(&self) {
        let (was_initialized, worker) = {
            let mut inner = self.lock();
            if inner.state == HostState::Disposed {
                return;
            }
            let was_initialized =
                matches!(inner.state, HostState::Initialized | HostState::Running);
            inner.state = HostState::Disposed;
            inner.inbox = None;
            (was_initialized, inner.worker.take())
        };

        let removed = self.router.unregister_all(&self.id).await;
        self.router.detach(&self.id).await;
        if let Some(worker) = worker {
            worker.abort();
        }

        if was_initialized {
            guarded(&self.id, "uninitialize", self.handler.uninitialize()).await;
        }
        info!(handler = %self.id, routes = removed, "Handler disposed");
    }

    fn set_state(&self, state: HostState) {
        self.lock().state = state;
    }

    fn lock(&self) -> MutexGuard<'_, HostInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MessageSink for HandlerHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn deliver(&self, message: Message) {
        if self.state() == HostState::Disposed {
            return;
        }
        if self.inbox_tx.send(message).is_err() {
            debug!(handler = %self.id, "Inbox closed, message dropped");
        }
    }
}

/// Run a handler callback, turning a panic into `None`
async fn guarded<F: Future>(handler_id: &str, callback: &str, future: F) -> Option<F::Output> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(output) => Some(output),
        Err(panic) => {
            error!(
                handler = handler_id,
                callback,
                panic = %panic_message(panic.as_ref()),
                "Handler panicked"
            );
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
