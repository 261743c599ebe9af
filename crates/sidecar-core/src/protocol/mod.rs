//! Agent sidecar protocol.
//!
//! Three message families:
//! - [`AgentEvent`]: typed events the backend emits on stdout
//! - [`BackendCommand`] / [`UserResponse`]: lines written to backend stdin
//! - [`OutboundRecord`] / [`ControlMessage`]: client wire frames

mod backend;
mod events;
mod parser;
mod wire;

pub use backend::*;
pub use events::*;
pub use parser::{parse_line, parse_value};
pub use wire::*;
