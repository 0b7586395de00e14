use crate::aggregate::TimeWindow;
use thiserror::Error;

/// A raw detection record that could not be turned into a `DetectionEvent`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedRecordError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("record does not match the detection shape: {0}")]
    Shape(String),
}

/// An event whose window was already closed when it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("late event for lane {lane_id} in window {window} (closed through {closed_through})")]
pub struct LateEventError {
    pub lane_id: crate::ingest::LaneId,
    pub vehicle_id: String,
    pub window: TimeWindow,
    pub closed_through: TimeWindow,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidParameterError {
    #[error("missing parameter `{0}`")]
    Missing(&'static str),
    #[error("parameter `{name}` must be positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("parameter `{name}` must be a finite non-negative number, got {value}")]
    Negative { name: &'static str, value: f64 },
    #[error("max_green ({max_green}) is below min_green ({min_green})")]
    GreenBounds { min_green: f64, max_green: f64 },
    #[error("no signal directions configured")]
    NoDirections,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("malformed record: {0}")]
    MalformedRecord(#[from] MalformedRecordError),
    #[error(transparent)]
    LateEvent(#[from] LateEventError),
    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] InvalidParameterError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("window {window} emitted after {last}")]
    OutOfOrderWindow { window: TimeWindow, last: TimeWindow },
    #[error("worker task failed: {0}")]
    Task(String),
    #[error("timestamp format error: {0}")]
    TimestampFormat(#[from] time::error::Format),
    #[error("state lock poisoned")]
    StateLock,
}
