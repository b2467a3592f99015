//! # lib_common
//!
//! Ingest, filter and delivery engine of the `aprs2gpaero` gateway: it reads an
//! APRS-IS (or OGN) feed, keeps the position reports of a few tracked
//! identities, and pushes them to glideport.aero.
//!
//! Modules are gated by feature folders; `full` (the default) enables all of
//! them. `model`, `stats` and `configs` are always available.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Typed settings and configuration errors.
pub mod configs;
/// Records passed between the pipeline stages.
pub mod model;
/// Per-identity ingest and delivery counters.
pub mod stats;

/// Identity filter and supervisor loop.
#[cfg(feature = "core")]
pub mod core;
/// Delivery queue, push interface and uploader.
#[cfg(feature = "delivery")]
pub mod delivery;
/// Packet sources and frame assembly.
#[cfg(feature = "ingestors")]
pub mod ingestors;
/// APRS and OGN normalizers.
#[cfg(feature = "parsers")]
pub mod parsers;
/// HTTP push client.
#[cfg(feature = "retrieve")]
pub mod retrieve;

pub use model::{DeliveryPayload, DestinationId, PositionFix, TrackedIdentities};
