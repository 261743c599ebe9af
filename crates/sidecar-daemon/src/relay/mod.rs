//! Relay module: bridges an agent's event bus to one client.
//!
//! This is the "glue" that connects:
//! - EventBus (backend events, request/response slots)
//! - Correlator (blocking request/reply with timeout)
//! - ClientSink (outbound wire records)

mod pipeline;
mod translate;
mod types;

pub use pipeline::EventRelay;
pub use translate::translate;
pub use types::*;
