//! Inbound message routing
//!
//! [`TopicRouter`] owns the pattern table shared by the client (which
//! registers routes when subscriptions are accepted and feeds inbound
//! messages) and the handler hosts (which receive them).

pub mod router;

pub use router::{MessageSink, RouteMeta, TopicRouter, DEFAULT_OVERFLOW_CAPACITY, DEFAULT_OVERFLOW_TTL};
