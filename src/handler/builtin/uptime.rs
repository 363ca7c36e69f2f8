//! Periodic process uptime report

use crate::handler::{Handler, HandlerContext, HandlerError};
use crate::protocol::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const IDENTIFIER: &str = "uptime";

const REPORT_TOPIC: &str = "uptime";
const REQUEST_TOPIC: &str = "uptime/get";

/// Body published on `<device>/uptime`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UptimeReport {
    pub device: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

struct Clock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Clock {
    fn report(&self, device: &str) -> UptimeReport {
        UptimeReport {
            device: device.to_string(),
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

pub struct UptimeHandler {
    interval: Duration,
    clock: Arc<Clock>,
    broker_up: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl UptimeHandler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            clock: Arc::new(Clock {
                started_at: Utc::now(),
                started: Instant::now(),
            }),
            broker_up: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        }
    }

    fn set_ticker(&self, ticker: Option<JoinHandle<()>>) {
        let mut slot = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = std::mem::replace(&mut *slot, ticker) {
            previous.abort();
        }
    }
}

async fn publish_report(ctx: &HandlerContext, clock: &Clock) -> bool {
    let report = clock.report(ctx.device_id());
    let body = match serde_json::to_string(&report) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to encode uptime report");
            return false;
        }
    };
    ctx.publish(Message::publish(REPORT_TOPIC, body).with_device_prefix(true))
        .await
}

#[async_trait]
impl Handler for UptimeHandler {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    async fn initialize(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        self.broker_up.store(ctx.is_connected(), Ordering::SeqCst);
        ctx.queue_subscribe(REQUEST_TOPIC, true).await?;

        let ctx = ctx.clone();
        let clock = self.clock.clone();
        let broker_up = self.broker_up.clone();
        let interval = self.interval;
        self.set_ticker(Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !broker_up.load(Ordering::SeqCst) {
                    continue;
                }
                publish_report(&ctx, &clock).await;
            }
        })));
        Ok(())
    }

    async fn process_message(&self, ctx: &HandlerContext, message: Message) {
        let request = format!("{}/{}", ctx.device_id(), REQUEST_TOPIC);
        if message.resolved_topic() == request {
            debug!("Uptime requested");
            publish_report(ctx, &self.clock).await;
        }
    }

    async fn server_state_changed(&self, _ctx: &HandlerContext, connected: bool) {
        self.broker_up.store(connected, Ordering::SeqCst);
    }

    async fn uninitialize(&self) {
        self.set_ticker(None);
    }
}
