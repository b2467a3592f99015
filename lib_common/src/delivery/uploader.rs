//! # Background Uploader
//!
//! A single task draining the delivery queue into a `PushTarget`:
//!
//! - success: count it and reset the retry delay to its base value;
//! - timeout: sleep the current delay, grow it by a random factor in
//!   `[1.0, 2.0)`, and put the payload back at the tail of the queue;
//! - any other failure: count it and drop the payload.
//!
//! Timeouts are retried without limit and the delay has no cap. A timeout
//! usually means the endpoint itself is down, so the payload waits for it
//! instead of being discarded.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use super::push::{PushError, PushTarget};
use super::queue::{DeliveryQueue, QueueItem};
use crate::configs::UploaderSettings;
use crate::model::DeliveryPayload;
use crate::stats::{log_counters, DeliveryStats};

/// The consumer side of the delivery queue.
pub struct Uploader {
    queue: Arc<DeliveryQueue>,
    target: Arc<dyn PushTarget>,
    settings: UploaderSettings,
}

impl Uploader {
    /// Binds a queue to a push target.
    pub fn new(queue: Arc<DeliveryQueue>, target: Arc<dyn PushTarget>, settings: UploaderSettings) -> Self {
        Self { queue, target, settings }
    }

    /// Runs `run` on a new task.
    pub fn spawn(self) -> JoinHandle<DeliveryStats> {
        tokio::spawn(self.run())
    }

    /// Uploads until a `Stop` item is popped and returns the final statistics.
    pub async fn run(self) -> DeliveryStats {
        info!("Uploader entering loop, pushing to {}", self.target.name());
        let mut stats = DeliveryStats::new();
        let mut delay = self.settings.base_retry_delay;
        let mut last_print = Instant::now();

        loop {
            let payload = match self.queue.pop().await {
                QueueItem::Stop => {
                    info!("got a stop request");
                    break;
                }
                QueueItem::Payload(payload) => payload,
            };

            let Some(destination) = payload.destination_id().map(ToString::to_string) else {
                warn!("could not get destination from payload {:?}, badly formed? skipping", payload);
                self.queue.complete();
                continue;
            };

            if last_print.elapsed() > self.settings.stats_interval {
                last_print = Instant::now();
                self.log_stats(&stats, "upload_stats");
            }

            let outcome = self.push(&payload).await;
            let counters = stats.entry(destination).or_default();
            match outcome {
                Ok(()) => {
                    counters.success += 1;
                    delay = self.settings.base_retry_delay;
                    self.queue.complete();
                }
                Err(e) if e.is_timeout() => {
                    warn!(
                        "{}, shoving payload back to end of queue (N = {}), and waiting {:.2} sec",
                        e,
                        self.queue.len() + 1,
                        delay.as_secs_f64()
                    );
                    counters.timed_out += 1;
                    sleep(delay).await;
                    delay = jittered(delay);
                    self.queue.requeue(payload);
                }
                Err(e) => {
                    warn!("failed to upload due to *{}*, dropping payload {:?}", e, payload);
                    counters.failed += 1;
                    self.queue.complete();
                }
            }
        }

        info!("exited upload loop");
        self.log_stats(&stats, "final upload_stats");
        stats
    }

    async fn push(&self, payload: &DeliveryPayload) -> Result<(), PushError> {
        let limit = self.settings.push_timeout;
        match timeout(limit, self.target.push(payload, limit)).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Timeout(limit)),
        }
    }

    fn log_stats(&self, stats: &DeliveryStats, prefix: &str) {
        info!("{} queue N = {}", prefix, self.queue.len());
        log_counters(prefix, stats);
    }
}

/// Grows a retry delay by a uniform random factor in `[1.0, 2.0)`.
pub fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(1.0..2.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
