//! # Configuration Modules
//!
//! Typed settings consumed by the ingest, filter and delivery components,
//! plus the error type raised while resolving them.

/// Resolved per-component settings with defaults.
pub mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, FilterSettings, OverflowPolicy, QueueSettings,
    SupervisorSettings, UploaderSettings,
};
