//! # Identity Filter & Deduplication Engine
//!
//! Decides which normalized fixes become delivery payloads. Each tracked
//! identity owns one record holding its dedup window, the time of its last
//! accepted fix and its ingest counters. For a fix matching a tracked identity:
//!
//! 1. a fingerprint already in the window is a duplicate;
//! 2. otherwise a fix less than `min_interval_secs` after the last accepted
//!    one is rate limited;
//! 3. otherwise it is accepted, and its delivered timestamp goes through the
//!    configured `TimestampCorrection`.
//!
//! The fingerprint enters the window in all three cases, but only an accepted
//! fix moves the last-accepted time.

use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::configs::FilterSettings;
use crate::model::{DeliveryPayload, PositionFix, TrackedIdentities};
use crate::parsers::{NoCorrection, PacketParser, TimestampCorrection};
use crate::stats::{log_counters, IngestCounters};

/// Why a fix did not produce a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No tracked identity is a prefix of the source id. Not counted.
    NotTracked,
    /// Dropped by the dialect's post-filter. Not counted.
    Screened,
    /// Same coordinates as a recent fix of this identity.
    Duplicate,
    /// Too soon after the last accepted fix of this identity.
    RateLimited,
}

/// Outcome of `IdentityFilter::process`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    /// The fix becomes this payload.
    Accepted(DeliveryPayload),
    /// The fix is dropped.
    Rejected(RejectReason),
}

#[derive(Debug, Default)]
struct IdentityRecord {
    window: VecDeque<String>,
    last_accepted: Option<f64>,
    counters: IngestCounters,
}

impl IdentityRecord {
    fn remember(&mut self, fingerprint: String, depth: usize) {
        while self.window.len() >= depth {
            self.window.pop_front();
        }
        self.window.push_back(fingerprint);
    }
}

/// # Identity Filter
pub struct IdentityFilter {
    identities: TrackedIdentities,
    records: Vec<IdentityRecord>,
    settings: FilterSettings,
    correction: Box<dyn TimestampCorrection>,
}

impl IdentityFilter {
    /// Creates a filter with no timestamp correction.
    pub fn new(identities: TrackedIdentities, settings: FilterSettings) -> Self {
        for (identity, destination) in identities.iter() {
            info!("Tracking {} : {}", identity, destination);
        }
        let records = (0..identities.len()).map(|_| IdentityRecord::default()).collect();
        Self {
            identities,
            records,
            settings: FilterSettings {
                window_depth: settings.window_depth.max(1),
                ..settings
            },
            correction: Box::new(NoCorrection),
        }
    }

    /// Replaces the timestamp correction applied to accepted fixes.
    pub fn with_correction(mut self, correction: Box<dyn TimestampCorrection>) -> Self {
        self.correction = correction;
        self
    }

    /// The identity table.
    pub fn identities(&self) -> &TrackedIdentities {
        &self.identities
    }

    /// Runs one fix through identity match, dedup and rate limiting.
    pub fn process(&mut self, fix: PositionFix) -> FilterDecision {
        self.process_screened(fix, Some)
    }

    /// Like `process`, with the parser's post-filter applied after the identity match.
    pub fn process_with(&mut self, fix: PositionFix, parser: &dyn PacketParser) -> FilterDecision {
        self.process_screened(fix, |fix| parser.post_filter(fix))
    }

    fn process_screened<F>(&mut self, fix: PositionFix, screen: F) -> FilterDecision
    where
        F: FnOnce(PositionFix) -> Option<PositionFix>,
    {
        let Some(index) = self.identities.resolve(&fix.source_id) else {
            return FilterDecision::Rejected(RejectReason::NotTracked);
        };
        let Some(fix) = screen(fix) else {
            return FilterDecision::Rejected(RejectReason::Screened);
        };
        let Some(destination) = self.identities.destination(index).cloned() else {
            return FilterDecision::Rejected(RejectReason::NotTracked);
        };

        let fingerprint = fix.fingerprint();
        let min_interval = self.settings.min_interval_secs;
        let record = &mut self.records[index];

        let decision = if record.window.contains(&fingerprint) {
            record.counters.duplicate += 1;
            warn!("Dropping duplicate of recent fix from {}: {}", fix.source_id, fingerprint);
            FilterDecision::Rejected(RejectReason::Duplicate)
        } else if let Some(elapsed) = record
            .last_accepted
            .map(|last| fix.timestamp - last)
            .filter(|elapsed| *elapsed < min_interval)
        {
            record.counters.rate_limited += 1;
            warn!(
                "Got new fix from {} too soon - {:.1} sec after last one, < {:.1} sec",
                fix.source_id, elapsed, min_interval
            );
            FilterDecision::Rejected(RejectReason::RateLimited)
        } else {
            record.counters.good += 1;
            record.last_accepted = Some(fix.timestamp);
            let delivered_at = self.correction.correct(fix.timestamp, fix.latitude, fix.longitude);
            info!("Adding fix from {} for {}: {}", fix.source_id, destination, fingerprint);
            FilterDecision::Accepted(DeliveryPayload::from_fix(destination, &fix, delivered_at))
        };

        record.remember(fingerprint, self.settings.window_depth);
        decision
    }

    /// Counters of the tracked identity `identity` (exact key).
    pub fn counters(&self, identity: &str) -> Option<IngestCounters> {
        self.identities
            .iter()
            .position(|(key, _)| key == identity)
            .and_then(|index| self.records.get(index))
            .map(|record| record.counters)
    }

    /// `(identity, counters)` for every tracked identity, in key order.
    pub fn all_counters(&self) -> Vec<(String, IngestCounters)> {
        self.identities
            .iter()
            .zip(&self.records)
            .map(|((key, _), record)| (key.to_string(), record.counters))
            .collect()
    }

    /// Logs every identity's counters under `prefix`.
    pub fn log_stats(&self, prefix: &str) {
        debug!("logging {} identity counters", self.records.len());
        log_counters(prefix, self.all_counters());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DestinationId;
    use crate::parsers::ParseError;

    fn filter(min_interval_secs: f64, window_depth: usize) -> IdentityFilter {
        let ids = [("N0CALL-9".to_string(), DestinationId::from("IMEI123"))].into_iter().collect();
        IdentityFilter::new(ids, FilterSettings { min_interval_secs, window_depth })
    }

    fn fix(lat: f64, ts: f64) -> PositionFix {
        PositionFix::new("N0CALL-9", lat, 2.0, ts)
    }

    #[test]
    fn untracked_fixes_are_not_counted() {
        let mut f = filter(10.0, 5);
        let decision = f.process(PositionFix::new("K1ABC", 1.0, 2.0, 0.0));
        assert_eq!(decision, FilterDecision::Rejected(RejectReason::NotTracked));
        assert_eq!(f.counters("N0CALL-9"), Some(IngestCounters::default()));
    }

    #[test]
    fn first_fix_at_epoch_zero_is_accepted() {
        let mut f = filter(10.0, 5);
        assert!(matches!(f.process(fix(1.0, 0.0)), FilterDecision::Accepted(_)));
    }

    #[test]
    fn duplicates_and_rate_limits_do_not_move_last_accepted() {
        let mut f = filter(10.0, 5);
        assert!(matches!(f.process(fix(1.0, 100.0)), FilterDecision::Accepted(_)));
        assert_eq!(f.process(fix(2.0, 105.0)), FilterDecision::Rejected(RejectReason::RateLimited));
        assert_eq!(f.process(fix(1.0, 200.0)), FilterDecision::Rejected(RejectReason::Duplicate));
        // 10 s after the last *accepted* fix, not after the rejected ones.
        assert!(matches!(f.process(fix(3.0, 110.0)), FilterDecision::Accepted(_)));
        assert_eq!(
            f.counters("N0CALL-9"),
            Some(IngestCounters { good: 2, duplicate: 1, rate_limited: 1 })
        );
    }

    #[test]
    fn rate_limited_fingerprints_still_enter_the_window() {
        let mut f = filter(10.0, 5);
        f.process(fix(1.0, 0.0));
        assert_eq!(f.process(fix(2.0, 1.0)), FilterDecision::Rejected(RejectReason::RateLimited));
        assert_eq!(f.process(fix(2.0, 50.0)), FilterDecision::Rejected(RejectReason::Duplicate));
    }

    #[test]
    fn window_forgets_oldest_fingerprint() {
        let mut f = filter(0.0, 2);
        f.process(fix(1.0, 0.0));
        f.process(fix(2.0, 1.0));
        f.process(fix(3.0, 2.0));
        assert!(matches!(f.process(fix(1.0, 3.0)), FilterDecision::Accepted(_)));
        assert_eq!(f.process(fix(3.0, 4.0)), FilterDecision::Rejected(RejectReason::Duplicate));
    }

    #[test]
    fn correction_changes_only_the_delivered_time() {
        struct PlusHour;
        impl TimestampCorrection for PlusHour {
            fn correct(&self, timestamp: f64, _: f64, _: f64) -> f64 {
                timestamp + 3600.0
            }
        }

        let mut f = filter(10.0, 5).with_correction(Box::new(PlusHour));
        let FilterDecision::Accepted(payload) = f.process(fix(1.0, 100.0)) else {
            panic!("expected acceptance");
        };
        assert_eq!(payload.events[0].timestamp_ms, 3_700_000);
        // Rate limiting still runs on the raw time.
        assert!(matches!(f.process(fix(2.0, 110.0)), FilterDecision::Accepted(_)));
    }

    #[test]
    fn post_filter_runs_after_identity_match_and_is_not_counted() {
        struct DropAll;
        impl PacketParser for DropAll {
            fn name(&self) -> &'static str {
                "drop-all"
            }
            fn parse(&self, _line: &str) -> Result<Option<PositionFix>, ParseError> {
                Ok(None)
            }
            fn post_filter(&self, _fix: PositionFix) -> Option<PositionFix> {
                None
            }
        }

        let mut f = filter(10.0, 5);
        assert_eq!(f.process_with(fix(1.0, 0.0), &DropAll), FilterDecision::Rejected(RejectReason::Screened));
        assert_eq!(
            f.process_with(PositionFix::new("K1ABC", 1.0, 2.0, 0.0), &DropAll),
            FilterDecision::Rejected(RejectReason::NotTracked)
        );
        assert_eq!(f.counters("N0CALL-9"), Some(IngestCounters::default()));
        // The screened fix never reached the window.
        assert!(matches!(f.process(fix(1.0, 0.0)), FilterDecision::Accepted(_)));
    }
}
