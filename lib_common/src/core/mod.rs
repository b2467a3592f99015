//! # Core Engine Module
//!
//! The decision-making heart of the gateway, sitting between the ingestors and
//! the delivery queue.
//!
//! ## Core Components:
//!
//! - **`filter`**: the identity filter and deduplication engine. It owns one
//!   record per tracked identity (dedup window, last accepted time, counters)
//!   and turns accepted fixes into delivery payloads.
//!
//! - **`backoff`**: the doubling, capped wait applied between failed cycles.
//!
//! - **`supervisor`**: the ingest loop. It drives the packet source, framing,
//!   parser and filter once per cycle, recycles quiet connections, logs
//!   periodic statistics and coordinates shutdown with the uploader.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Supervisor wait escalation.
pub mod backoff;
/// Identity matching, deduplication and rate limiting.
pub mod filter;
/// The ingest loop and its lifecycle.
pub mod supervisor;

// --- Public API Re-exports ---
pub use backoff::Backoff;
pub use filter::{FilterDecision, IdentityFilter, RejectReason};
pub use supervisor::{CycleReport, Supervisor, SupervisorReport, SupervisorState};
