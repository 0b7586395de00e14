//! Serialization of per-window metrics for downstream storage/dashboards.

use crate::aggregate::TimeWindow;
use crate::error::AppError;
use crate::metrics::{LaneMetrics, WindowMetrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LaneMetricsRecord {
    pub cars_in_lane: u32,
    pub queue_cars: f64,
    pub queue_length_m: f64,
    pub queue_length_sec: f64,
    pub queue_increase: f64,
    pub queue_delay: f64,
}

impl From<&LaneMetrics> for LaneMetricsRecord {
    fn from(metrics: &LaneMetrics) -> Self {
        Self {
            cars_in_lane: metrics.vehicle_count,
            queue_cars: metrics.queue_vehicle_count,
            queue_length_m: metrics.queue_length_m,
            queue_length_sec: metrics.queue_length_sec,
            queue_increase: metrics.queue_growth_rate,
            queue_delay: metrics.queue_delay_sec,
        }
    }
}

/// One window as written to the sink. Lane keys are stringified lane ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsRecord {
    pub timestamp: String,
    pub lane_metrics: BTreeMap<String, LaneMetricsRecord>,
    pub total_flow_intensity: f64,
    pub total_capacity: f64,
}

impl MetricsRecord {
    pub fn from_metrics(metrics: &WindowMetrics) -> Result<Self, AppError> {
        Ok(Self {
            timestamp: metrics.window.format_start()?,
            lane_metrics: metrics
                .lanes
                .iter()
                .map(|(lane, lane_metrics)| (lane.to_string(), lane_metrics.into()))
                .collect(),
            total_flow_intensity: metrics.total_flow_intensity,
            total_capacity: metrics.capacity.total_capacity,
        })
    }
}

pub trait MetricsSink: Send {
    /// Append one window. Windows must arrive in ascending order.
    fn emit(&mut self, metrics: &WindowMetrics) -> Result<(), AppError>;
}

/// Keeps the last emitted window and refuses anything not after it.
#[derive(Debug, Default, Clone, Copy)]
struct OrderGuard {
    last: Option<TimeWindow>,
}

impl OrderGuard {
    fn check(&self, window: TimeWindow) -> Result<(), AppError> {
        if let Some(last) = self.last
            && window <= last
        {
            return Err(AppError::OutOfOrderWindow { window, last });
        }
        Ok(())
    }

    /// Only called once the window is written, so a failed write can be
    /// retried with the same window.
    fn record(&mut self, window: TimeWindow) {
        self.last = Some(window);
    }
}

/// Writes one JSON object per line and flushes after every window, so a
/// reader tailing the output always sees whole records.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    order: OrderGuard,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            order: OrderGuard::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<BufWriter<File>> {
    /// Open `path` for appending, creating it if needed.
    pub fn append_to_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> MetricsSink for JsonLinesSink<W> {
    fn emit(&mut self, metrics: &WindowMetrics) -> Result<(), AppError> {
        let record = MetricsRecord::from_metrics(metrics)?;
        self.order.check(metrics.window)?;
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.order.record(metrics.window);
        debug!(window = %metrics.window, "Metrics record written");
        Ok(())
    }
}

/// Collects records in memory; used when no output file is configured.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<MetricsRecord>,
    order: OrderGuard,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[MetricsRecord] {
        &self.records
    }
}

impl MetricsSink for MemorySink {
    fn emit(&mut self, metrics: &WindowMetrics) -> Result<(), AppError> {
        let record = MetricsRecord::from_metrics(metrics)?;
        self.order.check(metrics.window)?;
        self.records.push(record);
        self.order.record(metrics.window);
        Ok(())
    }
}
