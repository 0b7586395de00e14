use crate::state::IngestStats;
use serde::Serialize;

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoData,
    InvalidParameter,
    InternalError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthSuccessResponse {
    pub status: HealthStatus,
    pub stats: IngestStats,
    pub timestamp: String,
}
