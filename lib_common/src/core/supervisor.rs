//! # Supervisor Loop
//!
//! Drives one ingest cycle at a time: connect if needed, read, frame,
//! normalize, filter and enqueue. Between cycles it waits, and the wait
//! follows a `Backoff`: it doubles (up to a cap) after every failed cycle and
//! returns to its base after the first successful one.
//!
//! The loop also owns the liveness check. Reads that frame fewer than
//! `min_lines_per_read` lines are counted, and after
//! `max_consecutive_data_loss` of them in a row the connection is recycled
//! even though no error was raised.
//!
//! The loop ends on an operator interrupt (the shutdown broadcast) or when the
//! uploader task has died. Both are observed mid-cycle too, so a producer
//! parked on a full queue still stops; the interrupted cycle is dropped.
//! Shutdown sends the queue's stop sentinel, waits a
//! bounded time for the uploader, logs final statistics and closes the source.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout, Instant};

use super::backoff::Backoff;
use super::filter::{FilterDecision, IdentityFilter};
use crate::configs::SupervisorSettings;
use crate::delivery::DeliveryQueue;
use crate::ingestors::{ConnectionState, IngestError, PacketRecorder, PacketSource, ThroughputMeter};
use crate::parsers::PacketParser;
use crate::stats::{DeliveryStats, IngestCounters};

/// Lifecycle of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// The last cycle succeeded; waiting the base interval between cycles.
    Running,
    /// The last cycle failed; waiting an escalated interval.
    BackingOff,
    /// Terminal.
    Stopped,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Bytes read.
    pub bytes: usize,
    /// Complete lines framed.
    pub lines: usize,
    /// Lines that decoded to a position fix.
    pub fixes: usize,
    /// Fixes accepted and enqueued.
    pub accepted: usize,
    /// True when the liveness check recycled the connection.
    pub reconnected: bool,
}

/// Final statistics returned by `Supervisor::run`.
#[derive(Debug, Clone, Default)]
pub struct SupervisorReport {
    /// Ingest counters per tracked identity.
    pub ingest: Vec<(String, IngestCounters)>,
    /// Delivery counters, when the uploader stopped in time.
    pub delivery: Option<DeliveryStats>,
}

/// # Supervisor
pub struct Supervisor {
    source: Box<dyn PacketSource>,
    parser: Box<dyn PacketParser>,
    filter: IdentityFilter,
    queue: Arc<DeliveryQueue>,
    recorder: Option<PacketRecorder>,
    settings: SupervisorSettings,
    state: SupervisorState,
    backoff: Backoff,
    connection: ConnectionState,
    meter: ThroughputMeter,
    started: Instant,
    last_info: Instant,
    last_stats: Instant,
    last_monitor: Instant,
}

impl Supervisor {
    /// Wires the ingest side of the pipeline.
    pub fn new(
        source: Box<dyn PacketSource>,
        parser: Box<dyn PacketParser>,
        filter: IdentityFilter,
        queue: Arc<DeliveryQueue>,
        settings: SupervisorSettings,
    ) -> Self {
        let now = Instant::now();
        Self {
            source,
            parser,
            filter,
            queue,
            recorder: None,
            backoff: Backoff::new(settings.base_wait, settings.max_wait),
            meter: ThroughputMeter::new(settings.mean_window, now),
            settings,
            state: SupervisorState::Running,
            connection: ConnectionState::default(),
            started: now,
            last_info: now,
            last_stats: now,
            last_monitor: now,
        }
    }

    /// Records every decoded raw line.
    pub fn with_recorder(mut self, recorder: PacketRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// The wait that follows the current cycle.
    pub fn current_wait(&self) -> std::time::Duration {
        self.backoff.current()
    }

    /// The identity filter and its counters.
    pub fn filter(&self) -> &IdentityFilter {
        &self.filter
    }

    /// Bookkeeping of the current connection.
    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Runs until interrupted or until the uploader dies.
    pub async fn run(
        mut self,
        mut uploader: JoinHandle<DeliveryStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> SupervisorReport {
        info!(
            "Supervisor started: {} via {}, {} tracked identities",
            self.source.describe(),
            self.parser.name(),
            self.filter.identities().len()
        );

        let finished = loop {
            // A cycle may wait on a full queue, so it has to yield to both exits.
            let outcome = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("stopping upon request");
                    break None;
                }
                joined = &mut uploader => {
                    warn!("found upload task to be dead, aborting!");
                    break Some(joined);
                }
                outcome = self.run_cycle() => outcome,
            };

            let wait = match outcome {
                Ok(report) => {
                    debug!("cycle: {:?}", report);
                    self.backoff.on_success();
                    self.state = SupervisorState::Running;
                    self.backoff.current()
                }
                Err(e) => {
                    self.source.close().await;
                    let wait = self.backoff.on_failure();
                    self.state = SupervisorState::BackingOff;
                    warn!("Problem monitoring due to {}, wait time now {:.1} sec", e, wait.as_secs_f64());
                    wait
                }
            };

            self.log_periodic();

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("stopping upon request");
                    break None;
                }
                joined = &mut uploader => {
                    warn!("found upload task to be dead, aborting!");
                    break Some(joined);
                }
                _ = sleep(wait) => {}
            }
        };

        self.stop(uploader, finished).await
    }

    /// Runs one ingest cycle.
    ///
    /// A failing cycle leaves the source as it is; `run` closes it before
    /// backing off.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, IngestError> {
        if !self.source.is_connected() {
            self.source.connect().await?;
            self.connection.reset(Instant::now());
        }

        let chunk = self.source.read(self.settings.read_block_len.max(1)).await?;
        let lines = self.connection.frames.push(&chunk);
        let now = Instant::now();

        self.meter.record(lines.len(), now);
        if now.saturating_duration_since(self.last_info) > self.settings.info_interval {
            self.last_info = now;
            self.meter.log(lines.len(), now);
        }

        let mut report = CycleReport {
            bytes: chunk.len(),
            lines: lines.len(),
            ..CycleReport::default()
        };
        for line in &lines {
            self.handle_line(line, &mut report).await;
        }

        let low_reads =
            self.connection
                .record_read(chunk.len(), lines.len(), self.settings.min_lines_per_read, now);
        if low_reads >= self.settings.max_consecutive_data_loss {
            error!(
                "got too little data for too many consecutive cycles (>= {}), resetting connection",
                self.settings.max_consecutive_data_loss
            );
            self.source.close().await;
            sleep(self.settings.reconnect_pause).await;
            self.source.connect().await?;
            self.connection.reset(Instant::now());
            report.reconnected = true;
        }

        Ok(report)
    }

    async fn handle_line(&mut self, line: &str, report: &mut CycleReport) {
        debug!("raw packet : {}", line);
        if line.is_empty() {
            return;
        }

        let fix = match self.parser.parse(line) {
            Ok(Some(fix)) => fix,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping line due to {}: *{}*", e, line);
                return;
            }
        };
        report.fixes += 1;

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.record(line).await {
                warn!("could not record packet to {}: {}", recorder.path().display(), e);
            }
        }

        match self.filter.process_with(fix, self.parser.as_ref()) {
            FilterDecision::Accepted(payload) => {
                report.accepted += 1;
                if let Some(evicted) = self.queue.push(payload).await {
                    debug!("evicted from delivery queue: {:?}", evicted);
                }
            }
            FilterDecision::Rejected(reason) => debug!("rejected ({:?}): {}", reason, line),
        }
    }

    fn log_periodic(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_stats) > self.settings.stats_interval {
            self.last_stats = now;
            self.filter.log_stats("packet_stats");
            info!(
                "delivery queue N = {} of {}, {} dropped",
                self.queue.len(),
                self.queue.capacity(),
                self.queue.dropped()
            );
        }
        if let Some(interval) = self.settings.monitor_interval {
            if now.saturating_duration_since(self.last_monitor) > interval {
                self.last_monitor = now;
                info!("monitor dt = {:.1} sec", now.saturating_duration_since(self.started).as_secs_f64());
            }
        }
    }

    async fn stop(
        mut self,
        mut uploader: JoinHandle<DeliveryStats>,
        finished: Option<Result<DeliveryStats, JoinError>>,
    ) -> SupervisorReport {
        self.state = SupervisorState::Stopped;
        self.queue.send_stop();

        let joined = match finished {
            Some(joined) => Some(joined),
            None => match timeout(self.settings.shutdown_timeout, &mut uploader).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    warn!(
                        "upload task did not stop within {:.1} sec, {} payloads abandoned",
                        self.settings.shutdown_timeout.as_secs_f64(),
                        self.queue.len()
                    );
                    uploader.abort();
                    None
                }
            },
        };
        let delivery = match joined {
            Some(Ok(stats)) => Some(stats),
            Some(Err(e)) => {
                error!("upload task failed: {}", e);
                None
            }
            None => None,
        };

        self.filter.log_stats("final packet_stats");
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.flush().await {
                warn!("could not flush packet recording: {}", e);
            }
        }
        self.source.close().await;
        info!("Supervisor stopped");

        SupervisorReport {
            ingest: self.filter.all_counters(),
            delivery,
        }
    }
}
