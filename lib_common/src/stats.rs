//! # Packet Statistics
//!
//! Monotonic per-identity counters for both ends of the pipeline. They only
//! reset when the process restarts and are surfaced exclusively through log
//! lines.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::BTreeMap;
use std::fmt;

/// Ingest-side counters kept by the identity filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    /// Fixes accepted and turned into payloads.
    pub good: u64,
    /// Fixes whose fingerprint was already in the dedup window.
    pub duplicate: u64,
    /// Fixes that arrived before the minimum interval had elapsed.
    pub rate_limited: u64,
}

impl fmt::Display for IngestCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{good: {}, duplicate: {}, rate_limited: {}}}",
            self.good, self.duplicate, self.rate_limited
        )
    }
}

/// Delivery-side counters kept by the uploader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounters {
    /// Payloads accepted by the endpoint.
    pub success: u64,
    /// Payloads dropped after a non-retryable failure.
    pub failed: u64,
    /// Push attempts that timed out and were re-enqueued.
    pub timed_out: u64,
}

impl fmt::Display for DeliveryCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{success: {}, failed: {}, timed_out: {}}}",
            self.success, self.failed, self.timed_out
        )
    }
}

/// Delivery counters for every destination seen so far, in key order.
pub type DeliveryStats = BTreeMap<String, DeliveryCounters>;

/// Logs one line per entry with a fixed prefix, e.g. `upload_stats IMEI123: {...}`.
pub fn log_counters<K, V, I>(prefix: &str, entries: I)
where
    K: fmt::Display,
    V: fmt::Display,
    I: IntoIterator<Item = (K, V)>,
{
    for (key, counters) in entries {
        log::info!("{} {}: {}", prefix, key, counters);
    }
}
