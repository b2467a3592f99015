//! # Data Ingestors Module
//!
//! The byte-level "front door" of the gateway. Each source hides its transport
//! (TCP socket or recorded file) behind the `PacketSource` trait, and the
//! framing layer turns whatever bytes arrive into complete feed lines.
//!
//! ## Contained Modules:
//! - **`connection`**: the APRS-IS TCP client with its login handshake, plus
//!   per-connection bookkeeping and the throughput meter.
//! - **`replay`**: a file-backed source and the raw packet recorder feeding it.
//! - **`framing`**: CRLF frame assembly across arbitrary read boundaries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Packet source trait and the live TCP client.
pub mod connection;
/// CRLF line assembly.
pub mod framing;
/// Recorded-feed replay and recording.
pub mod replay;

// --- Public API Re-exports ---
pub use connection::{ConnectionState, IngestError, PacketSource, TcpPacketSource, ThroughputMeter};
pub use framing::FrameAssembler;
pub use replay::{PacketRecorder, ReplayPacketSource};
