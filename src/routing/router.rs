//! Topic-pattern routing of inbound messages to handlers
//!
//! The table maps normalized patterns to the handlers registered on them.
//! Handlers are reached through a weakly held [`MessageSink`], so a dropped
//! handler is never invoked. Every inbound message is also held in a bounded,
//! expiring buffer and replayed to the first matching registration of each
//! handler it has not reached yet.

use crate::protocol::{normalize_topic, topic_matches, validate_pattern, Message, TopicError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Default number of inbound messages held for late registrations
pub const DEFAULT_OVERFLOW_CAPACITY: usize = 500;
/// Default lifetime of a held message
pub const DEFAULT_OVERFLOW_TTL: Duration = Duration::from_secs(30);

/// Receiving end of a route
///
/// `deliver` must not block; implementations hand the message to an inbox.
pub trait MessageSink: Send + Sync {
    fn id(&self) -> &str;
    fn deliver(&self, message: Message);
}

/// Metadata recorded with a registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMeta {
    /// The subscription was issued with the device prefix
    pub prepend_device_id: bool,
}

#[derive(Debug, Clone)]
struct Route {
    handler_id: String,
    meta: RouteMeta,
}

struct HeldMessage {
    message: Message,
    arrived: Instant,
    delivered_to: HashSet<String>,
}

#[derive(Default)]
struct RouterTable {
    routes: HashMap<String, Vec<Route>>,
    sinks: HashMap<String, Weak<dyn MessageSink>>,
    overflow: VecDeque<HeldMessage>,
}

impl RouterTable {
    /// Handlers whose patterns match `topic`, each listed once
    fn matching_handlers(&self, topic: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut handlers = Vec::new();
        for (pattern, routes) in &self.routes {
            if !topic_matches(pattern, topic) {
                continue;
            }
            for route in routes {
                if seen.insert(route.handler_id.as_str()) {
                    handlers.push(route.handler_id.clone());
                }
            }
        }
        handlers
    }

    fn deliver(&self, handler_id: &str, message: &Message) -> bool {
        match self.sinks.get(handler_id).and_then(Weak::upgrade) {
            Some(sink) => {
                sink.deliver(message.clone());
                true
            }
            None => {
                trace!(handler = handler_id, "No live sink for handler");
                false
            }
        }
    }

    fn evict_overflow(&mut self, capacity: usize, ttl: Duration) {
        let now = Instant::now();
        while self
            .overflow
            .front()
            .is_some_and(|held| now.duration_since(held.arrived) >= ttl)
        {
            self.overflow.pop_front();
        }
        while self.overflow.len() > capacity {
            self.overflow.pop_front();
        }
    }
}

/// Pattern → handler routing table
pub struct TopicRouter {
    table: RwLock<RouterTable>,
    overflow_capacity: usize,
    overflow_ttl: Duration,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new(DEFAULT_OVERFLOW_CAPACITY, DEFAULT_OVERFLOW_TTL)
    }
}

impl TopicRouter {
    pub fn new(overflow_capacity: usize, overflow_ttl: Duration) -> Self {
        Self {
            table: RwLock::new(RouterTable::default()),
            overflow_capacity,
            overflow_ttl,
        }
    }

    /// Make a handler reachable by its id
    pub async fn attach(&self, sink: Weak<dyn MessageSink>) {
        let Some(id) = sink.upgrade().map(|s| s.id().to_string()) else {
            return;
        };
        self.table.write().await.sinks.insert(id, sink);
    }

    /// Forget a handler's sink; its routes stay until unregistered
    pub async fn detach(&self, handler_id: &str) {
        self.table.write().await.sinks.remove(handler_id);
    }

    /// Route `pattern` to `handler_id` and replay held messages it matches
    ///
    /// Returns the number of held messages replayed.
    pub async fn register(
        &self,
        pattern: &str,
        handler_id: &str,
        meta: RouteMeta,
    ) -> Result<usize, TopicError> {
        let pattern = normalize_topic(pattern);
        if pattern.is_empty() {
            return Err(TopicError::EmptyTopic);
        }
        validate_pattern(&pattern)?;

        let mut table = self.table.write().await;
        let routes = table.routes.entry(pattern.clone()).or_default();
        match routes.iter_mut().find(|r| r.handler_id == handler_id) {
            Some(existing) => existing.meta = meta,
            None => routes.push(Route {
                handler_id: handler_id.to_string(),
                meta,
            }),
        }

        table.evict_overflow(self.overflow_capacity, self.overflow_ttl);
        let table = &mut *table;
        let mut replayed = 0;
        for held in table.overflow.iter_mut() {
            if held.delivered_to.contains(handler_id)
                || !topic_matches(&pattern, held.message.resolved_topic())
            {
                continue;
            }
            let sink = table.sinks.get(handler_id).and_then(Weak::upgrade);
            if let Some(sink) = sink {
                sink.deliver(held.message.clone());
                held.delivered_to.insert(handler_id.to_string());
                replayed += 1;
            }
        }

        debug!(
            pattern = %pattern,
            handler = handler_id,
            replayed,
            "Route registered"
        );
        Ok(replayed)
    }

    /// Remove one route; returns whether it existed
    pub async fn unregister(&self, pattern: &str, handler_id: &str) -> bool {
        let pattern = normalize_topic(pattern);
        let mut table = self.table.write().await;
        let Some(routes) = table.routes.get_mut(&pattern) else {
            return false;
        };
        let before = routes.len();
        routes.retain(|r| r.handler_id != handler_id);
        let removed = routes.len() != before;
        if routes.is_empty() {
            table.routes.remove(&pattern);
        }
        removed
    }

    /// Remove every route of a handler in one step
    pub async fn unregister_all(&self, handler_id: &str) -> usize {
        let mut table = self.table.write().await;
        let mut removed = 0;
        table.routes.retain(|_, routes| {
            let before = routes.len();
            routes.retain(|r| r.handler_id != handler_id);
            removed += before - routes.len();
            !routes.is_empty()
        });
        removed
    }

    /// Deliver an inbound message to every matching handler, once each
    ///
    /// Returns the number of handlers reached, which may be 0. The message is
    /// also held, marked with those handlers, so a handler that registers a
    /// matching pattern later still gets it once.
    pub async fn dispatch(&self, message: Message) -> usize {
        let topic = normalize_topic(message.resolved_topic());

        // Delivery and holding share one write lock so a registration cannot
        // slip in between and miss the message
        let mut table = self.table.write().await;
        let delivered_to: HashSet<String> = table
            .matching_handlers(&topic)
            .into_iter()
            .filter(|id| table.deliver(id, &message))
            .collect();
        let reached = delivered_to.len();

        if self.overflow_capacity > 0 {
            trace!(topic = %topic, reached, "Holding message for late registrations");
            table.overflow.push_back(HeldMessage {
                message,
                arrived: Instant::now(),
                delivered_to,
            });
            table.evict_overflow(self.overflow_capacity, self.overflow_ttl);
        }
        reached
    }

    /// Distinct patterns currently routed
    pub async fn patterns(&self) -> Vec<String> {
        let table = self.table.read().await;
        let mut patterns: Vec<String> = table.routes.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Patterns routed to one handler, with their metadata
    pub async fn routes_for(&self, handler_id: &str) -> Vec<(String, RouteMeta)> {
        let table = self.table.read().await;
        let mut routes: Vec<(String, RouteMeta)> = table
            .routes
            .iter()
            .flat_map(|(pattern, routes)| {
                routes
                    .iter()
                    .filter(|r| r.handler_id == handler_id)
                    .map(|r| (pattern.clone(), r.meta.clone()))
            })
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    /// Messages currently held for late registrations
    pub async fn held_count(&self) -> usize {
        let mut table = self.table.write().await;
        table.evict_overflow(self.overflow_capacity, self.overflow_ttl);
        table.overflow.len()
    }
}
