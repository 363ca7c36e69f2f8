//! Message model and topic rules shared by every layer of the bridge

pub mod message;
pub mod topics;

pub use message::*;
pub use topics::*;
