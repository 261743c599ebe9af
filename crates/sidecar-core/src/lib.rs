//! Sidecar Core Library
//!
//! Shared functionality for sidecar components:
//! - Agent event, backend and client wire protocol types
//! - Tolerant NDJSON reader for the agent backend's stdout
//! - Persisted settings (agents, models, API keys, stored credentials)
//! - Common error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::{ConfigStore, Settings};
pub use error::{Error, Result};
