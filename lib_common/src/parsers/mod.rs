//! # Packet Normalizers
//!
//! Dialect strategies that turn one raw feed line into a normalized
//! `PositionFix`. The supervisor is handed one `PacketParser` trait object at
//! construction time and never needs to know which dialect it is talking to.
//!
//! ## Contained Modules:
//! - **`aprs`**: uncompressed APRS position reports from APRS-IS.
//! - **`ogn`**: the OGN flavour of APRS, with receiver and address-type screening.
//! - **`timestamp`**: post-acceptance timestamp corrections (DST shift).
//!
//! Only position reports are decoded; every other packet type is reported as
//! "not applicable" (`Ok(None)`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use thiserror::Error;

use crate::model::PositionFix;

/// APRS-IS position report decoding.
pub mod aprs;
/// OGN dialect on top of the APRS decoder.
pub mod ogn;
/// Timestamp correction strategies.
pub mod timestamp;

pub use aprs::AprsParser;
pub use ogn::OgnParser;
pub use timestamp::{LocalDstCorrection, NoCorrection, TimestampCorrection, TimezoneDstCorrection};

/// Why a line could not be decoded. Always non-fatal: the line is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The `SRC>DEST,PATH:` header is missing or malformed.
    #[error("Malformed header: {0}")]
    Header(String),

    /// The coordinates could not be decoded.
    #[error("Malformed position: {0}")]
    Position(String),

    /// The embedded timestamp could not be decoded.
    #[error("Malformed timestamp: {0}")]
    Timestamp(String),

    /// A structurally valid encoding this normalizer does not decode.
    #[error("Unsupported format: {0}")]
    Unsupported(&'static str),
}

/// # Packet Parser Strategy
///
/// `parse` returns `Err` for corrupt lines and `Ok(None)` for lines that are
/// valid but carry no position. The supervisor treats both as "no fix".
///
/// `post_filter` runs only for fixes that matched a tracked identity, before
/// deduplication, so packets it drops never reach the statistics.
pub trait PacketParser: Send {
    /// Dialect name, used in logs.
    fn name(&self) -> &'static str;

    /// Decodes one raw line.
    fn parse(&self, line: &str) -> Result<Option<PositionFix>, ParseError>;

    /// Drops or rewrites an already-matched fix. Keeps everything by default.
    fn post_filter(&self, fix: PositionFix) -> Option<PositionFix> {
        Some(fix)
    }
}
