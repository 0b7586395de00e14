use crate::controller::DirectionCount;
use crate::metrics::WindowMetrics;
use serde::Serialize;
use tokio::sync::watch;

/// Running totals for everything the pipeline accepted or dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub late: u64,
    pub invalid_windows: u64,
    pub windows_emitted: u64,
}

impl IngestStats {
    pub fn dropped(&self) -> u64 {
        self.malformed + self.late + self.invalid_windows
    }
}

#[derive(Debug)]
pub struct AppState {
    latest_metrics: Option<WindowMetrics>,
    metrics_tx: watch::Sender<Option<WindowMetrics>>,
    direction_counts_tx: watch::Sender<Vec<DirectionCount>>,
    stats: IngestStats,
}

impl AppState {
    pub fn new() -> Self {
        let (metrics_tx, _metrics_rx) = watch::channel(None);
        let (direction_counts_tx, _counts_rx) = watch::channel(Vec::new());
        Self {
            latest_metrics: None,
            metrics_tx,
            direction_counts_tx,
            stats: IngestStats::default(),
        }
    }

    pub fn latest_metrics(&self) -> Option<&WindowMetrics> {
        self.latest_metrics.as_ref()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<Option<WindowMetrics>> {
        self.metrics_tx.subscribe()
    }

    pub fn set_latest_metrics(&mut self, metrics: WindowMetrics) {
        self.latest_metrics = Some(metrics.clone());
        self.metrics_tx.send_replace(Some(metrics));
    }

    pub fn direction_counts(&self) -> Vec<DirectionCount> {
        self.direction_counts_tx.borrow().clone()
    }

    /// Demand feed read by the signal controller at every SELECT.
    pub fn subscribe_direction_counts(&self) -> watch::Receiver<Vec<DirectionCount>> {
        self.direction_counts_tx.subscribe()
    }

    pub fn set_direction_counts(&mut self, counts: Vec<DirectionCount>) {
        self.direction_counts_tx.send_replace(counts);
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut IngestStats {
        &mut self.stats
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
