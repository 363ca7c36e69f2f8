//! Testing utilities
//!
//! [`MockTransport`] stands in for a broker so the client, router and
//! handlers can be exercised in-process.

pub mod mocks;

pub use mocks::*;
