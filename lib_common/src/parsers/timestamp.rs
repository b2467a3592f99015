//! # Timestamp Corrections
//!
//! Some feeds report times that are off by the local daylight-saving offset.
//! The filter applies a `TimestampCorrection` to every accepted fix just before
//! the payload is built. Deduplication and rate limiting always see the raw time.
//!
//! `LocalDstCorrection` finds the zone at the fix position (OGN needs this);
//! `TimezoneDstCorrection` pins one zone for every fix.

use chrono::{DateTime, TimeZone};
use chrono_tz::{OffsetComponents, Tz};
use tzf_rs::DefaultFinder;

/// Maps a raw fix timestamp to the one that is delivered.
pub trait TimestampCorrection: Send + Sync {
    /// Returns the corrected timestamp in seconds since the epoch.
    fn correct(&self, timestamp: f64, latitude: f64, longitude: f64) -> f64;
}

/// Delivers timestamps unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCorrection;

impl TimestampCorrection for NoCorrection {
    fn correct(&self, timestamp: f64, _latitude: f64, _longitude: f64) -> f64 {
        timestamp
    }
}

/// Adds the DST offset in effect in a fixed time zone at the fix time.
///
/// Outside DST the offset is zero; in most zones it is one hour during summer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimezoneDstCorrection {
    zone: Tz,
}

impl TimezoneDstCorrection {
    /// Uses `zone` for every fix.
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    /// Parses an IANA zone name such as `Europe/Paris`.
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse::<Tz>().ok().map(Self::new)
    }

    /// The DST offset at `timestamp`, in seconds.
    pub fn dst_offset_secs(&self, timestamp: f64) -> i64 {
        dst_offset_secs(self.zone, timestamp)
    }
}

impl TimestampCorrection for TimezoneDstCorrection {
    fn correct(&self, timestamp: f64, _latitude: f64, _longitude: f64) -> f64 {
        timestamp + self.dst_offset_secs(timestamp) as f64
    }
}

/// Adds the DST offset of the zone the fix lies in.
///
/// Positions without a known zone are delivered unchanged.
pub struct LocalDstCorrection {
    finder: DefaultFinder,
}

impl LocalDstCorrection {
    /// Loads the zone boundaries; do this once.
    pub fn new() -> Self {
        Self {
            finder: DefaultFinder::new(),
        }
    }

    /// The IANA zone containing a position.
    pub fn zone_at(&self, latitude: f64, longitude: f64) -> Option<Tz> {
        self.finder.get_tz_name(longitude, latitude).parse::<Tz>().ok()
    }
}

impl Default for LocalDstCorrection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalDstCorrection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalDstCorrection")
    }
}

impl TimestampCorrection for LocalDstCorrection {
    fn correct(&self, timestamp: f64, latitude: f64, longitude: f64) -> f64 {
        match self.zone_at(latitude, longitude) {
            Some(zone) => timestamp + dst_offset_secs(zone, timestamp) as f64,
            None => timestamp,
        }
    }
}

fn dst_offset_secs(zone: Tz, timestamp: f64) -> i64 {
    let secs = timestamp.floor() as i64;
    match DateTime::from_timestamp(secs, 0) {
        Some(utc) => zone.offset_from_utc_datetime(&utc.naive_utc()).dst_offset().num_seconds(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn no_correction_is_identity() {
        assert_eq!(NoCorrection.correct(1554359951.5, 1.0, 2.0), 1554359951.5);
    }

    #[test]
    fn summer_time_adds_an_hour() {
        let paris = TimezoneDstCorrection::from_name("Europe/Paris").unwrap();
        let summer = Utc.with_ymd_and_hms(2019, 6, 29, 12, 0, 0).unwrap().timestamp() as f64;
        let winter = Utc.with_ymd_and_hms(2019, 1, 15, 12, 0, 0).unwrap().timestamp() as f64;

        assert_eq!(paris.correct(summer, 44.0, 6.0), summer + 3600.0);
        assert_eq!(paris.correct(winter, 44.0, 6.0), winter);
    }

    #[test]
    fn local_correction_follows_the_fix_position() {
        let local = LocalDstCorrection::new();
        let june = Utc.with_ymd_and_hms(2019, 6, 29, 12, 0, 0).unwrap().timestamp() as f64;
        let january = Utc.with_ymd_and_hms(2019, 1, 15, 12, 0, 0).unwrap().timestamp() as f64;

        assert_eq!(local.zone_at(48.8566, 2.3522), Some(chrono_tz::Europe::Paris));
        assert_eq!(local.correct(june, 48.8566, 2.3522), june + 3600.0);
        // Johannesburg never observes DST, Sydney only in the southern summer.
        assert_eq!(local.correct(june, -26.2041, 28.0473), june);
        assert_eq!(local.correct(june, -33.8688, 151.2093), june);
        assert_eq!(local.correct(january, -33.8688, 151.2093), january + 3600.0);
    }

    #[test]
    fn unknown_zone_is_rejected() {
        assert!(TimezoneDstCorrection::from_name("Mars/Olympus").is_none());
    }
}
