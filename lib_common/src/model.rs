//! # Pipeline Records
//!
//! The records that travel between the gateway stages: the tracked identity table
//! loaded from configuration, the normalized `PositionFix` produced by a packet
//! parser, and the wire-ready `DeliveryPayload` consumed by the uploader.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// # Destination Identifier
///
/// The opaque identifier glideport.aero knows a tracker by (usually an IMEI).
/// Configuration files carry either strings or bare numbers, and the value is
/// sent back out in the same JSON shape it was loaded with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DestinationId {
    /// A numeric identifier, e.g. `300434063000000`.
    Number(i64),
    /// A textual identifier, e.g. `"IMEI123"`.
    Text(String),
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationId::Number(n) => write!(f, "{}", n),
            DestinationId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for DestinationId {
    fn from(value: &str) -> Self {
        DestinationId::Text(value.to_string())
    }
}

impl From<i64> for DestinationId {
    fn from(value: i64) -> Self {
        DestinationId::Number(value)
    }
}

/// One normalized position report.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    /// Source-side identity (APRS callsign or OGN device address).
    pub source_id: String,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Altitude in metres; `0.0` when the source did not report one.
    pub altitude: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Last station of the relay path (igate or OGN receiver), when known.
    pub receiver: Option<String>,
    /// OGN device address type (0 unknown, 1 ICAO, 2 FLARM, 3 OGN tracker).
    pub address_type: Option<u8>,
}

impl PositionFix {
    /// Creates a fix without altitude.
    pub fn new(source_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: f64) -> Self {
        Self {
            source_id: source_id.into(),
            latitude,
            longitude,
            altitude: 0.0,
            timestamp,
            receiver: None,
            address_type: None,
        }
    }

    /// Sets the altitude in metres.
    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    /// Coordinate-derived deduplication key.
    ///
    /// Uses the shortest round-trip rendering of each value, i.e. exactly the
    /// precision the normalizer produced.
    pub fn fingerprint(&self) -> String {
        format!("{} {} {}", self.longitude, self.latitude, self.altitude)
    }
}

/// # Tracked Identity Table
///
/// Maps source-side identity prefixes to destination identifiers. The table is
/// immutable once loaded. Each entry owns a stable index that the filter uses to
/// address its per-identity record.
#[derive(Debug, Clone, Default)]
pub struct TrackedIdentities {
    entries: Vec<(String, DestinationId)>,
}

impl TrackedIdentities {
    /// Builds the table from a configuration map.
    pub fn new(ids: BTreeMap<String, DestinationId>) -> Self {
        Self {
            entries: ids.into_iter().collect(),
        }
    }

    /// Finds the tracked identity whose key is a prefix of `source_id`.
    ///
    /// When several keys match (e.g. `N0CALL` and `N0CALL-9`), the longest one wins.
    pub fn resolve(&self, source_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, (key, _))| source_id.starts_with(key.as_str()))
            .max_by_key(|(_, (key, _))| key.len())
            .map(|(index, _)| index)
    }

    /// Identity key at `index`.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(key, _)| key.as_str())
    }

    /// Destination identifier at `index`.
    pub fn destination(&self, index: usize) -> Option<&DestinationId> {
        self.entries.get(index).map(|(_, dest)| dest)
    }

    /// Iterates `(identity, destination)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DestinationId)> {
        self.entries.iter().map(|(key, dest)| (key.as_str(), dest))
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, DestinationId)> for TrackedIdentities {
    fn from_iter<I: IntoIterator<Item = (String, DestinationId)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Coordinates of one delivered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPoint {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Altitude in metres.
    pub altitude: f64,
}

/// One event inside a push payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// Destination the event is credited to.
    #[serde(rename = "imei")]
    pub destination_id: DestinationId,
    /// Event time in milliseconds since the epoch.
    #[serde(rename = "timeStamp")]
    pub timestamp_ms: i64,
    /// Reported position.
    pub point: DeliveryPoint,
}

/// # Delivery Payload
///
/// The JSON body posted to the push endpoint:
///
/// ```json
/// {"Version": 2.0, "Events": [{"imei": "IMEI123", "timeStamp": 1554359951000,
///   "point": {"latitude": -32.06, "longitude": 115.82, "altitude": 23.1}}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    /// Push protocol version.
    #[serde(rename = "Version")]
    pub version: f64,
    /// The events carried by this push; the gateway always sends exactly one.
    #[serde(rename = "Events")]
    pub events: Vec<DeliveryEvent>,
}

impl DeliveryPayload {
    /// Push protocol version spoken by the gateway.
    pub const VERSION: f64 = 2.0;

    /// Wraps one fix into a single-event payload.
    ///
    /// `timestamp` is passed separately because it may have been corrected after
    /// the fix was accepted.
    pub fn from_fix(destination_id: DestinationId, fix: &PositionFix, timestamp: f64) -> Self {
        Self {
            version: Self::VERSION,
            events: vec![DeliveryEvent {
                destination_id,
                timestamp_ms: (timestamp * 1000.0) as i64,
                point: DeliveryPoint {
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    altitude: fix.altitude,
                },
            }],
        }
    }

    /// Destination of the first event, used for per-destination statistics.
    pub fn destination_id(&self) -> Option<&DestinationId> {
        self.events.first().map(|event| &event.destination_id)
    }
}
