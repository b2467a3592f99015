//! # APRS Position Normalizer
//!
//! Decodes the uncompressed position reports relayed by APRS-IS:
//!
//! ```text
//! N0CALL-9>APRS,WIDE1-1,qAR,IGATE:!4903.50N/07201.75W-Test /A=001234
//! FLRDDA5BA>APRS,qAS,LFMX:/160829h4415.41N/00600.03E'342/049/A=005524 id0ADDA5BA
//! ```
//!
//! Position types `!` and `=` carry no timestamp (the receive time is used);
//! `/` and `@` carry a `DDHHMMz` or `HHMMSSh` stamp. Altitude comes from the
//! `/A=` comment extension in feet and is reported in metres. Compressed and
//! Mic-E encodings are rejected as unsupported.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};

use super::{PacketParser, ParseError};
use crate::model::PositionFix;

const FEET_TO_METRES: f64 = 0.3048;

/// A header-split APRS line.
#[derive(Debug)]
pub(crate) struct AprsFrame<'a> {
    pub source: &'a str,
    pub path: Vec<&'a str>,
    pub body: &'a str,
}

impl<'a> AprsFrame<'a> {
    /// The last station of the path, i.e. the igate or receiver that injected it.
    pub fn receiver(&self) -> Option<&'a str> {
        if self.path.len() < 2 {
            return None;
        }
        self.path.last().map(|hop| hop.trim_end_matches('*'))
    }
}

/// Position fields decoded from an information field.
#[derive(Debug)]
pub(crate) struct DecodedPosition<'a> {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub timestamp: Option<f64>,
    pub comment: &'a str,
}

/// Splits `SRC>DEST,PATH:BODY`. Server comment lines yield `Ok(None)`.
pub(crate) fn split_frame(line: &str) -> Result<Option<AprsFrame<'_>>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (header, body) = line
        .split_once(':')
        .ok_or_else(|| ParseError::Header(format!("no information field in {:?}", line)))?;
    let (source, path) = header
        .split_once('>')
        .ok_or_else(|| ParseError::Header(format!("no destination in {:?}", header)))?;

    if source.is_empty() || !source.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ParseError::Header(format!("bad source {:?}", source)));
    }
    let path: Vec<&str> = path.split(',').collect();
    if path.iter().any(|hop| hop.is_empty()) {
        return Err(ParseError::Header(format!("bad path {:?}", header)));
    }

    Ok(Some(AprsFrame { source, path, body }))
}

/// Decodes the position carried by an information field, if any.
pub(crate) fn decode_position(body: &str, now: DateTime<Utc>) -> Result<Option<DecodedPosition<'_>>, ParseError> {
    let Some(kind) = body.chars().next() else {
        return Ok(None);
    };

    let (timestamp, rest) = match kind {
        '!' | '=' => (None, &body[1..]),
        '/' | '@' => {
            let stamp = body
                .get(1..8)
                .ok_or_else(|| ParseError::Timestamp(format!("truncated in {:?}", body)))?;
            (Some(decode_timestamp(stamp, now)?), body.get(8..).unwrap_or(""))
        }
        '`' | '\'' => return Err(ParseError::Unsupported("Mic-E position")),
        _ => return Ok(None),
    };

    match rest.chars().next() {
        Some(c) if c.is_ascii_digit() || c == ' ' => {}
        Some(_) => return Err(ParseError::Unsupported("compressed position")),
        None => return Err(ParseError::Position("empty position".to_string())),
    }

    let latitude = decode_latitude(rest.get(0..8))?;
    let longitude = decode_longitude(rest.get(9..18))?;
    let comment = rest.get(19..).unwrap_or("");

    Ok(Some(DecodedPosition {
        latitude,
        longitude,
        altitude: find_altitude(comment),
        timestamp,
        comment,
    }))
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// `DDMM.mmN`; spaces (position ambiguity) read as zeros.
fn decode_latitude(field: Option<&str>) -> Result<f64, ParseError> {
    let field = field
        .filter(|f| f.is_ascii())
        .ok_or_else(|| ParseError::Position("truncated latitude".to_string()))?;
    let field = field.replace(' ', "0");
    let degrees: f64 = field[0..2]
        .parse()
        .map_err(|_| ParseError::Position(format!("latitude degrees {:?}", field)))?;
    let minutes: f64 = field[2..7]
        .parse()
        .map_err(|_| ParseError::Position(format!("latitude minutes {:?}", field)))?;
    let sign = match &field[7..8] {
        "N" => 1.0,
        "S" => -1.0,
        other => return Err(ParseError::Position(format!("latitude hemisphere {:?}", other))),
    };
    let latitude = degrees + minutes / 60.0;
    if latitude > 90.0 || minutes >= 60.0 {
        return Err(ParseError::Position(format!("latitude out of range {:?}", field)));
    }
    Ok(round6(sign * latitude))
}

/// `DDDMM.mmE`; spaces (position ambiguity) read as zeros.
fn decode_longitude(field: Option<&str>) -> Result<f64, ParseError> {
    let field = field
        .filter(|f| f.is_ascii())
        .ok_or_else(|| ParseError::Position("truncated longitude".to_string()))?;
    let field = field.replace(' ', "0");
    let degrees: f64 = field[0..3]
        .parse()
        .map_err(|_| ParseError::Position(format!("longitude degrees {:?}", field)))?;
    let minutes: f64 = field[3..8]
        .parse()
        .map_err(|_| ParseError::Position(format!("longitude minutes {:?}", field)))?;
    let sign = match &field[8..9] {
        "E" => 1.0,
        "W" => -1.0,
        other => return Err(ParseError::Position(format!("longitude hemisphere {:?}", other))),
    };
    let longitude = degrees + minutes / 60.0;
    if longitude > 180.0 || minutes >= 60.0 {
        return Err(ParseError::Position(format!("longitude out of range {:?}", field)));
    }
    Ok(round6(sign * longitude))
}

/// `/A=001234` or `/A=-00012`, in feet.
fn find_altitude(comment: &str) -> Option<f64> {
    let start = comment.find("/A=")? + 3;
    let digits = comment.get(start..start + 6)?;
    digits.parse::<i32>().ok().map(|feet| f64::from(feet) * FEET_TO_METRES)
}

/// Resolves a 7-character APRS timestamp against the receive time.
///
/// `HHMMSSh` is taken on the receive date, shifted by a day when that puts it
/// more than 12 hours away. `DDHHMMz` (and local `DDHHMM/`, read as UTC) is
/// taken in the receive month, or the previous month if it would lie in the
/// future.
pub(crate) fn decode_timestamp(stamp: &str, now: DateTime<Utc>) -> Result<f64, ParseError> {
    let bad = || ParseError::Timestamp(format!("{:?}", stamp));
    if stamp.len() != 7 || !stamp.is_ascii() || !stamp[0..6].chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let field = |range: std::ops::Range<usize>| stamp[range].parse::<u32>().map_err(|_| bad());
    let (a, b, c) = (field(0..2)?, field(2..4)?, field(4..6)?);
    let half_day = ChronoDuration::hours(12);

    let resolved = match &stamp[6..7] {
        "h" => {
            let time = NaiveTime::from_hms_opt(a, b, c).ok_or_else(bad)?;
            let candidate = now.date_naive().and_time(time).and_utc();
            if candidate - now > half_day {
                candidate - ChronoDuration::days(1)
            } else if now - candidate > half_day {
                candidate + ChronoDuration::days(1)
            } else {
                candidate
            }
        }
        "z" | "/" => {
            let this_month = Utc.with_ymd_and_hms(now.year(), now.month(), a, b, c, 0).single();
            match this_month {
                Some(candidate) if candidate - now <= half_day => candidate,
                _ => {
                    let (year, month) = if now.month() == 1 {
                        (now.year() - 1, 12)
                    } else {
                        (now.year(), now.month() - 1)
                    };
                    Utc.with_ymd_and_hms(year, month, a, b, c, 0).single().ok_or_else(bad)?
                }
            }
        }
        _ => return Err(bad()),
    };

    Ok(resolved.timestamp() as f64)
}

/// Seconds since the epoch, with millisecond resolution.
pub(crate) fn epoch_secs(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

/// # APRS-IS Parser
///
/// The default dialect: the identity is the packet's source callsign.
#[derive(Debug, Clone, Copy, Default)]
pub struct AprsParser;

impl AprsParser {
    /// Creates the parser.
    pub fn new() -> Self {
        Self
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
        Ok(Some(fix))
    }
}

impl PacketParser for AprsParser {
    fn name(&self) -> &'static str {
        "APRSIS2GPRAW"
    }

    fn parse(&self, line: &str) -> Result<Option<PositionFix>, ParseError> {
        self.parse_at(line, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn decodes_plain_position_with_altitude() {
        let now = at(2019, 4, 4, 6, 40, 0);
        let fix = AprsParser
            .parse_at("N0CALL-9>APRS,WIDE1-1,qAR,IGATE:!4903.50N/07201.75W-Test /A=001234", now)
            .unwrap()
            .unwrap();

        assert_eq!(fix.source_id, "N0CALL-9");
        assert_eq!(fix.latitude, 49.058333);
        assert_eq!(fix.longitude, -72.029167);
        assert!((fix.altitude - 1234.0 * 0.3048).abs() < 1e-9);
        assert_eq!(fix.timestamp, epoch_secs(now));
        assert_eq!(fix.receiver.as_deref(), Some("IGATE"));
    }

    #[test]
    fn missing_altitude_defaults_to_zero() {
        let fix = AprsParser
            .parse_at("VK6FLYR>APRS:=3204.04S/11549.64E>", at(2019, 4, 4, 6, 40, 0))
            .unwrap()
            .unwrap();
        assert_eq!(fix.altitude, 0.0);
        assert_eq!(fix.latitude, -32.067333);
        assert!(fix.receiver.is_none());
    }

    #[test]
    fn hms_timestamp_resolves_across_midnight() {
        let now = at(2019, 4, 10, 0, 5, 0);
        let fix = AprsParser
            .parse_at("FLRDDA5BA>APRS,qAS,LFMX:/235900h4415.41N/00600.03E'342/049/A=005524", now)
            .unwrap()
            .unwrap();
        assert_eq!(fix.timestamp, at(2019, 4, 9, 23, 59, 0).timestamp() as f64);
        assert_eq!(fix.receiver.as_deref(), Some("LFMX"));
    }

    #[test]
    fn dhm_timestamp_in_the_future_falls_back_a_month() {
        let now = at(2019, 1, 2, 0, 0, 0);
        assert_eq!(decode_timestamp("092345z", now).unwrap(), at(2018, 12, 9, 23, 45, 0).timestamp() as f64);
        assert_eq!(decode_timestamp("012345z", now).unwrap(), at(2019, 1, 1, 23, 45, 0).timestamp() as f64);
        assert!(decode_timestamp("0923x5z", now).is_err());
        assert!(decode_timestamp("092345q", now).is_err());
    }

    #[test]
    fn non_position_lines_are_not_applicable() {
        let now = at(2019, 4, 4, 6, 40, 0);
        assert_eq!(AprsParser.parse_at("# aprsc 2.1.4-g408ed49", now), Ok(None));
        assert_eq!(AprsParser.parse_at("N0CALL>APRS,TCPIP*:>status text", now), Ok(None));
        assert_eq!(AprsParser.parse_at("", now), Ok(None));
    }

    #[test]
    fn corrupt_lines_are_errors() {
        let now = at(2019, 4, 4, 6, 40, 0);
        assert!(matches!(AprsParser.parse_at("garbage without header", now), Err(ParseError::Header(_))));
        assert!(matches!(AprsParser.parse_at("N0CALL>APRS:!49x3.50N/07201.75W-", now), Err(ParseError::Position(_))));
        assert!(matches!(AprsParser.parse_at("N0CALL>APRS:!4903.50", now), Err(ParseError::Position(_))));
        assert!(matches!(
            AprsParser.parse_at("N0CALL>APRS:!/5L!!<*e7>7P[", now),
            Err(ParseError::Unsupported(_))
        ));
        assert!(matches!(
            AprsParser.parse_at("N0CALL>T2SP0W:`(_fn\"Oj/", now),
            Err(ParseError::Unsupported(_))
        ));
    }
}
