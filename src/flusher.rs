use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::{
    buffer::ResultBuffer,
    clients::ResultStore,
    models::outcome::{ResultKind, RowBatch},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub popped: usize,
    pub persisted: usize,
    /// Undecodable entries, gone for good.
    pub discarded: usize,
    /// Rows lost to a failed bulk insert.
    pub dropped: usize,
    /// The previous tick was still running.
    pub skipped: bool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains one result buffer into the store in bounded batches.
pub struct BatchFlusher {
    kind: ResultKind,
    buffer: ResultBuffer,
    store: Arc<dyn ResultStore>,
    max_batch_size: usize,
    in_flight: AtomicBool,
}

impl BatchFlusher {
    pub fn new(
        kind: ResultKind,
        buffer: ResultBuffer,
        store: Arc<dyn ResultStore>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            kind,
            buffer,
            store,
            max_batch_size,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// One scheduled run. Returns immediately if another run is in progress.
    pub async fn tick(&self) -> FlushReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(kind = %self.kind, "Previous flush still running, skipping tick");
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        }
        let _guard = InFlight(&self.in_flight);

        let report = self.flush().await;
        if report.popped > 0 {
            info!(
                kind = %self.kind,
                popped = report.popped,
                persisted = report.persisted,
                discarded = report.discarded,
                dropped = report.dropped,
                "Result flush finished"
            );
        }
        report
    }

    async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let mut batch = RowBatch::empty(self.kind);

        while report.popped < self.max_batch_size {
            let raw = match self.buffer.pop(self.kind).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    error!(kind = %self.kind, error = %e, "Failed to pop from result buffer");
                    break;
                }
            };
            report.popped += 1;

            if let Err(e) = batch.push_raw(&raw) {
                warn!(
                    kind = %self.kind,
                    error = %e,
                    entry = %raw,
                    "Discarding corrupt buffered result"
                );
                report.discarded += 1;
            }
        }

        if batch.is_empty() {
            return report;
        }

        let rows = batch.len();
        match self.store.create_many(batch).await {
            Ok(_) => report.persisted = rows,
            Err(e) => {
                error!(
                    severity = "critical",
                    kind = %self.kind,
                    rows,
                    error = %e,
                    "Bulk insert failed, batch dropped"
                );
                report.dropped = rows;
            }
        }

        report
    }

    /// Ticks every `period` until `shutdown` flips, then runs one last tick.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(kind = %self.kind, period_secs = period.as_secs(), "Result flusher started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            let report = self.tick().await;
            info!(
                kind = %self.kind,
                persisted = report.persisted,
                "Result flusher stopped after final flush"
            );
        })
    }
}
