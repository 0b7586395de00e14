//! Normalizer -> Aggregator -> Metrics -> Sink, plus the per-direction
//! demand feed for the signal controller.

use crate::aggregate::{Aggregator, IngestOutcome};
use crate::controller::{DirectionLanes, direction_counts};
use crate::error::{AppError, LateEventError, MalformedRecordError};
use crate::ingest::{DetectionEvent, SensorId, normalize_batch};
use crate::metrics::{SignalTiming, WindowMetrics, compute_windows_parallel};
use crate::sink::MetricsSink;
use crate::state::AppState;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// What happened to one batch of raw records.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub malformed: Vec<MalformedRecordError>,
    pub late: Vec<LateEventError>,
}

pub struct Pipeline {
    aggregator: Aggregator,
    timing: SignalTiming,
    directions: Vec<DirectionLanes>,
    sensor_id: SensorId,
    sink: Box<dyn MetricsSink>,
    state: Arc<RwLock<AppState>>,
    /// Computed windows the sink has not accepted yet, oldest first.
    pending: VecDeque<WindowMetrics>,
}

impl Pipeline {
    pub fn new(
        aggregator: Aggregator,
        timing: SignalTiming,
        directions: Vec<DirectionLanes>,
        sensor_id: SensorId,
        sink: Box<dyn MetricsSink>,
        state: Arc<RwLock<AppState>>,
    ) -> Self {
        Self {
            aggregator,
            timing,
            directions,
            sensor_id,
            sink,
            state,
            pending: VecDeque::new(),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Windows held back by an earlier sink failure.
    pub fn pending_windows(&self) -> usize {
        self.pending.len()
    }

    /// Normalize and ingest raw records. Bad or late records are reported and
    /// skipped; only a poisoned lock fails the whole batch.
    pub fn ingest_records(&self, rows: &[serde_json::Value]) -> Result<BatchReport, AppError> {
        let (events, malformed) = normalize_batch(rows, self.sensor_id);
        let mut report = self.ingest_events(&events)?;
        report.malformed = malformed;

        let mut state = self.state.write().map_err(|_| AppError::StateLock)?;
        let stats = state.stats_mut();
        stats.accepted += report.accepted as u64;
        stats.duplicates += report.duplicates as u64;
        stats.malformed += report.malformed.len() as u64;
        stats.late += report.late.len() as u64;
        drop(state);

        debug!(
            rows = rows.len(),
            accepted = report.accepted,
            duplicates = report.duplicates,
            malformed = report.malformed.len(),
            late = report.late.len(),
            "Batch ingested"
        );
        Ok(report)
    }

    pub fn ingest_events(&self, events: &[DetectionEvent]) -> Result<BatchReport, AppError> {
        let mut report = BatchReport::default();
        for event in events {
            match self.aggregator.ingest(event) {
                Ok(IngestOutcome::Inserted) => report.accepted += 1,
                Ok(IngestOutcome::Duplicate) => report.duplicates += 1,
                Err(AppError::LateEvent(err)) => report.late.push(err),
                Err(err) => return Err(err),
            }
        }
        self.aggregator.close_expired()?;
        Ok(report)
    }

    /// Compute metrics for every window closed so far and write them out in
    /// ascending order. A window with invalid timing parameters is skipped.
    /// On a sink failure the failed window and everything after it stay
    /// pending and are retried first on the next pass.
    pub async fn process_closed_windows(&mut self) -> Result<Vec<WindowMetrics>, AppError> {
        let windows = self.aggregator.drain_closed()?;
        let mut invalid_windows = 0u64;
        if !windows.is_empty() {
            let lanes = Arc::new(self.aggregator.all_lanes()?);
            for result in compute_windows_parallel(windows, lanes, self.timing).await? {
                match result {
                    Ok(metrics) => self.pending.push_back(metrics),
                    Err(err) => {
                        warn!(error = %err, "Skipping window with invalid parameters");
                        invalid_windows += 1;
                    }
                }
            }
        }

        let mut emitted = Vec::with_capacity(self.pending.len());
        let mut sink_error = None;
        while let Some(metrics) = self.pending.front() {
            match self.sink.emit(metrics) {
                Ok(()) => {
                    if let Some(metrics) = self.pending.pop_front() {
                        emitted.push(metrics);
                    }
                }
                Err(err @ AppError::OutOfOrderWindow { .. }) => {
                    // Can never be written; retrying would block every later window.
                    error!(window = %metrics.window, error = %err, "Dropping out-of-order window");
                    self.pending.pop_front();
                    sink_error = Some(err);
                    break;
                }
                Err(err) => {
                    error!(
                        window = %metrics.window,
                        pending = self.pending.len(),
                        error = %err,
                        "Metrics sink failed, keeping windows for retry"
                    );
                    sink_error = Some(err);
                    break;
                }
            }
        }

        self.publish(&emitted, invalid_windows)?;

        match sink_error {
            Some(err) => Err(err),
            None => Ok(emitted),
        }
    }

    fn publish(&self, emitted: &[WindowMetrics], invalid_windows: u64) -> Result<(), AppError> {
        let mut state = self.state.write().map_err(|_| AppError::StateLock)?;
        let stats = state.stats_mut();
        stats.windows_emitted += emitted.len() as u64;
        stats.invalid_windows += invalid_windows;

        if let Some(latest) = emitted.last() {
            state.set_direction_counts(direction_counts(latest, &self.directions));
            state.set_latest_metrics(latest.clone());
        }
        Ok(())
    }

    /// Close every open window and process it. Used at end of input and on
    /// shutdown.
    pub async fn finish(&mut self) -> Result<Vec<WindowMetrics>, AppError> {
        self.aggregator.flush()?;
        self.process_closed_windows().await
    }
}
