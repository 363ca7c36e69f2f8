//! Topic relay: republish everything under one root beneath another

use crate::config::RelayConfig;
use crate::handler::{Handler, HandlerContext, HandlerError};
use crate::protocol::{normalize_topic, topic_matches, Message};
use async_trait::async_trait;
use tracing::{debug, warn};

pub const IDENTIFIER: &str = "relay";

pub struct RelayHandler {
    source: String,
    target: String,
}

impl RelayHandler {
    /// Fails when either root is empty or the target lies under the source
    pub fn new(config: &RelayConfig) -> Result<Self, HandlerError> {
        let source = normalize_topic(&config.source);
        let target = normalize_topic(&config.target);

        if source.is_empty() || target.is_empty() {
            return Err(HandlerError::InvalidConfig(
                "relay source and target must not be empty".to_string(),
            ));
        }
        if topic_matches(&format!("{source}/#"), &target) {
            return Err(HandlerError::InvalidConfig(format!(
                "relay target {target} lies under source {source}"
            )));
        }

        Ok(Self { source, target })
    }

    /// Topic a relayed message is republished on, if it came from the source
    fn relayed_topic(&self, topic: &str) -> Option<String> {
        let remainder = topic.strip_prefix(self.source.as_str())?;
        if remainder.is_empty() {
            return Some(self.target.clone());
        }
        let remainder = remainder.strip_prefix('/')?;
        Some(format!("{}/{}", self.target, remainder))
    }
}

#[async_trait]
impl Handler for RelayHandler {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    async fn initialize(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let pattern = Message::subscribe(&self.source).multi_level_wildcard();
        ctx.queue_subscribe(pattern.topic(), false).await?;
        debug!(source = %self.source, target = %self.target, "Relay armed");
        Ok(())
    }

    async fn process_message(&self, ctx: &HandlerContext, message: Message) {
        let Some(topic) = self.relayed_topic(message.resolved_topic()) else {
            return;
        };
        let outbound = Message::publish(&topic, message.payload().clone())
            .retain(message.is_retained());
        if !ctx.publish(outbound).await {
            warn!(topic = %topic, "Relay publish was not accepted");
        }
    }
}
