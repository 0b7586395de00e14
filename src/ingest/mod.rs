//! Event normalizer: raw detection records in, canonical `DetectionEvent`s out.
//!
//! A record is usable when it names a lane, a vehicle id and a timestamp in
//! the `YYYY-MM-DD HH:MM:SS.ffffff` layout. Positions are carried through
//! untouched and default to the origin when a transport omits them.

use crate::error::MalformedRecordError;
use serde::Deserialize;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::warn;

pub type LaneId = u32;
pub type SensorId = u32;

pub const DETECTION_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");

/// Detection record as delivered by the sensor transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDetection {
    pub lane: Option<LaneId>,
    pub uuid: Option<String>,
    pub time: Option<String>,
    pub point_x: Option<f64>,
    pub point_y: Option<f64>,
    /// Some transports tag rows with the sensor that produced them.
    pub sensor: Option<SensorId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub sensor_id: SensorId,
    pub lane_id: LaneId,
    pub vehicle_id: String,
    pub timestamp: PrimitiveDateTime,
    pub position_x: f64,
    pub position_y: f64,
}

pub fn parse_detection_time(value: &str) -> Result<PrimitiveDateTime, MalformedRecordError> {
    PrimitiveDateTime::parse(value.trim(), DETECTION_TIME_FORMAT).map_err(|err| {
        MalformedRecordError::InvalidTimestamp {
            value: value.to_string(),
            reason: err.to_string(),
        }
    })
}

pub fn normalize(
    raw: RawDetection,
    default_sensor: SensorId,
) -> Result<DetectionEvent, MalformedRecordError> {
    let lane_id = raw.lane.ok_or(MalformedRecordError::MissingField("lane"))?;
    let vehicle_id = raw
        .uuid
        .filter(|uuid| !uuid.trim().is_empty())
        .ok_or(MalformedRecordError::MissingField("uuid"))?;
    let time = raw.time.ok_or(MalformedRecordError::MissingField("time"))?;
    let timestamp = parse_detection_time(&time)?;

    Ok(DetectionEvent {
        sensor_id: raw.sensor.unwrap_or(default_sensor),
        lane_id,
        vehicle_id,
        timestamp,
        position_x: raw.point_x.unwrap_or(0.0),
        position_y: raw.point_y.unwrap_or(0.0),
    })
}

/// Normalize one record that has not been deserialized yet.
pub fn normalize_value(
    value: &serde_json::Value,
    default_sensor: SensorId,
) -> Result<DetectionEvent, MalformedRecordError> {
    let raw: RawDetection = serde_json::from_value(value.clone())
        .map_err(|err| MalformedRecordError::Shape(err.to_string()))?;
    normalize(raw, default_sensor)
}

/// Normalize a batch, dropping bad records. Every failure is logged and
/// returned so the caller can count it; good records are never held back.
pub fn normalize_batch(
    rows: &[serde_json::Value],
    default_sensor: SensorId,
) -> (Vec<DetectionEvent>, Vec<MalformedRecordError>) {
    let mut events = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        match normalize_value(row, default_sensor) {
            Ok(event) => events.push(event),
            Err(err) => {
                warn!(index, error = %err, "Dropping malformed detection record");
                errors.push(err);
            }
        }
    }

    (events, errors)
}
