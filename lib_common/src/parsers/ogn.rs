//! # OGN Dialect
//!
//! OGN-flavoured APRS reuses the APRS position encoding and appends an
//! `idXXYYYYYY` token to the comment: `XX` is a hex flag byte whose two low
//! bits carry the device address type, `YYYYYY` the device address.
//!
//! Matched fixes are screened twice: by address type, and by receiver name so
//! that relays of trackers which already report to glideport.aero themselves
//! (inReach, Spot, ADS-B) are not forwarded a second time.

use chrono::{DateTime, Utc};
use log::info;

use super::aprs::{decode_position, epoch_secs, split_frame};
use super::{PacketParser, ParseError};
use crate::model::PositionFix;

/// Receivers whose relays are dropped by default, matched case-insensitively as substrings.
pub const DEFAULT_RX_NAMES_TO_REJECT: [&str; 3] = ["inreach", "spot", "adsb"];

/// Address types forwarded by default: ICAO, FLARM and OGN tracker (0 is unknown).
pub const DEFAULT_ADDRESS_TYPES_ACCEPTED: [u8; 3] = [1, 2, 3];

/// # OGN Parser
#[derive(Debug, Clone)]
pub struct OgnParser {
    rx_names_to_reject: Vec<String>,
    address_types_accepted: Vec<u8>,
}

impl Default for OgnParser {
    fn default() -> Self {
        Self::new(
            DEFAULT_RX_NAMES_TO_REJECT.iter().map(|s| s.to_string()),
            DEFAULT_ADDRESS_TYPES_ACCEPTED,
        )
    }
}

impl OgnParser {
    /// Builds a parser with explicit screening lists.
    pub fn new<R, A>(rx_names_to_reject: R, address_types_accepted: A) -> Self
    where
        R: IntoIterator<Item = String>,
        A: IntoIterator<Item = u8>,
    {
        let parser = Self {
            rx_names_to_reject: rx_names_to_reject.into_iter().map(|name| name.to_lowercase()).collect(),
            address_types_accepted: address_types_accepted.into_iter().collect(),
        };
        info!(
            "Will reject receivers {:?} and accept address types {:?}",
            parser.rx_names_to_reject, parser.address_types_accepted
        );
        parser
    }

    /// Decodes `line` as if it was received at `now`.
    pub fn parse_at(&self, line: &str, now: DateTime<Utc>) -> Result<Option<PositionFix>, ParseError> {
        let Some(frame) = split_frame(line)? else {
            return Ok(None);
        };
        let Some(position) = decode_position(frame.body, now)? else {
            return Ok(None);
        };

        let mut fix = PositionFix::new(
            frame.source,
            position.latitude,
            position.longitude,
            position.timestamp.unwrap_or_else(|| epoch_secs(now)),
        )
        .with_altitude(position.altitude.unwrap_or(0.0));
        fix.receiver = frame.receiver().map(str::to_string);
        fix.address_type = address_type(position.comment);
        Ok(Some(fix))
    }

    fn rejects_receiver(&self, receiver: &str) -> bool {
        let receiver = receiver.to_lowercase();
        self.rx_names_to_reject.iter().any(|name| receiver.contains(name.as_str()))
    }
}

/// Address type from the `idXXYYYYYY` comment token.
fn address_type(comment: &str) -> Option<u8> {
    comment
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("id"))
        .filter(|rest| rest.len() == 8 && rest.is_ascii())
        .find_map(|rest| u8::from_str_radix(&rest[0..2], 16).ok())
        .map(|flags| flags & 0b11)
}

impl PacketParser for OgnParser {
    fn name(&self) -> &'static str {
        "OGN2GPAERO"
    }

    fn parse(&self, line: &str) -> Result<Option<PositionFix>, ParseError> {
        self.parse_at(line, Utc::now())
    }

    fn post_filter(&self, fix: PositionFix) -> Option<PositionFix> {
        match fix.address_type {
            Some(kind) if self.address_types_accepted.contains(&kind) => {}
            other => {
                info!(
                    "Address type {:?} not in {:?}, discarding fix from {}",
                    other, self.address_types_accepted, fix.source_id
                );
                return None;
            }
        }

        match fix.receiver.as_deref() {
            Some(receiver) if !self.rejects_receiver(receiver) => Some(fix),
            other => {
                info!(
                    "Receiver {:?} is one of {:?}, discarding fix from {}",
                    other, self.rx_names_to_reject, fix.source_id
                );
                None
            }
        }
    }
}
