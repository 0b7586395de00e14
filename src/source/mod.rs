//! Detection record sources and the periodic refresh task that drains them
//! into the pipeline.

use crate::error::AppError;
use crate::pipeline::{BatchReport, Pipeline};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Only objects with this name carry vehicle detections.
pub const DETECTION_OBJECT_NAME: &str = "OBJECTS";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetectionDocument {
    Objects { objects: Vec<DetectionObject> },
    Rows(Vec<Value>),
}

#[derive(Debug, Deserialize)]
struct DetectionObject {
    name: String,
    #[serde(default)]
    rows_data: Vec<Value>,
}

/// Flatten a detection document into its raw records, in file order.
pub fn parse_detection_document(contents: &str) -> Result<Vec<Value>, AppError> {
    let document: DetectionDocument = serde_json::from_str(contents)?;
    Ok(match document {
        DetectionDocument::Objects { objects } => objects
            .into_iter()
            .filter(|object| object.name == DETECTION_OBJECT_NAME)
            .flat_map(|object| object.rows_data)
            .collect(),
        DetectionDocument::Rows(rows) => rows,
    })
}

pub trait RecordSource: Send {
    /// Records that became available since the previous call.
    fn refresh(&mut self) -> Result<Vec<Value>, AppError>;
}

/// Polls a JSON detection file that the sensor transport rewrites or
/// appends to. Remembers how many rows it has handed out.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    delivered: usize,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delivered: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for JsonFileSource {
    fn refresh(&mut self) -> Result<Vec<Value>, AppError> {
        let contents = std::fs::read_to_string(&self.path)?;
        let mut rows = parse_detection_document(&contents)?;
        if rows.len() < self.delivered {
            warn!(
                path = %self.path.display(),
                rows = rows.len(),
                delivered = self.delivered,
                "Detection file shrank, reading it from the start"
            );
            self.delivered = 0;
        }
        let fresh = rows.split_off(self.delivered);
        self.delivered += fresh.len();
        Ok(fresh)
    }
}

/// One poll: pull new records, ingest them, emit whatever windows closed.
pub async fn run_refresh_cycle<S: RecordSource>(
    source: &mut S,
    pipeline: &mut Pipeline,
) -> Result<BatchReport, AppError> {
    let records = source.refresh()?;
    let report = pipeline.ingest_records(&records)?;
    pipeline.process_closed_windows().await?;
    Ok(report)
}

/// Poll `source` every `interval` until `cancel` fires, then flush the
/// remaining open windows. Returns the pipeline once stopped.
pub fn spawn_refresh_task<S>(
    mut source: S,
    mut pipeline: Pipeline,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Pipeline>
where
    S: RecordSource + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = run_refresh_cycle(&mut source, &mut pipeline).await {
                warn!(error = %err, "Refresh cycle failed");
            }
        }

        if let Err(err) = pipeline.finish().await {
            warn!(error = %err, "Failed to flush open windows on shutdown");
        }
        info!("Refresh task stopped");
        pipeline
    })
}
