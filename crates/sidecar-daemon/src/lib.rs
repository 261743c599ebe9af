//! Sidecar Daemon Library
//!
//! Relays agent backend activity to WebSocket clients:
//! - Agent backends and their lifecycle (reuse, soft invalidation, reload)
//! - Per-agent event bus and the relay that forwards it to one client
//! - Blocking request/reply correlation with timeouts
//! - Per-connection session orchestration
//! - Settings, API key and identity provider management over the socket

pub mod agent;
pub mod attachments;
pub mod bus;
pub mod interaction;
pub mod lifecycle;
pub mod oauth;
pub mod relay;
pub mod server;
pub mod session;
pub mod shared;
pub mod sink;
