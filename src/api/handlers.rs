use crate::api::ApiState;
use crate::api::responses::{ErrorCode, ErrorResponse, HealthStatus, HealthSuccessResponse};
use crate::controller::{ControllerInput, GreenAllocation, SignalState, plan_cycle};
use crate::sink::MetricsRecord;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, warn};

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug)]
enum TimestampError {
    Format(time::error::Format),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Format(err) => write!(f, "timestamp format error: {err}"),
        }
    }
}

pub enum ApiResponse<T> {
    Success(T),
    Error {
        status: StatusCode,
        body: ErrorResponse,
    },
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    build_metrics_response(&state, SystemTime::now())
}

pub async fn get_signal(State(state): State<ApiState>) -> impl IntoResponse {
    build_signal_response(&state, SystemTime::now())
}

pub async fn get_health(State(state): State<ApiState>) -> impl IntoResponse {
    build_health_response(&state, SystemTime::now())
}

pub async fn post_plan(Json(input): Json<ControllerInput>) -> impl IntoResponse {
    build_plan_response(&input, SystemTime::now())
}

fn build_metrics_response(state: &ApiState, now: SystemTime) -> ApiResponse<MetricsRecord> {
    let guard = match state.app.read() {
        Ok(guard) => guard,
        Err(_) => return internal_error("/api/metrics", "state lock poisoned while reading metrics"),
    };
    let latest = guard.latest_metrics().cloned();
    drop(guard);

    match latest {
        Some(metrics) => match MetricsRecord::from_metrics(&metrics) {
            Ok(record) => ApiResponse::Success(record),
            Err(err) => {
                error!(error = %err, "Failed to build metrics record");
                internal_error("/api/metrics", "metrics record conversion failure")
            }
        },
        None => no_data("/api/metrics", "No closed window available yet", now),
    }
}

fn build_signal_response(state: &ApiState, now: SystemTime) -> ApiResponse<SignalState> {
    let snapshot = state.signal.borrow().clone();
    match snapshot {
        Some(signal) => ApiResponse::Success(signal),
        None => no_data("/api/signal", "Signal controller has not selected a phase yet", now),
    }
}

fn build_health_response(state: &ApiState, now: SystemTime) -> ApiResponse<HealthSuccessResponse> {
    let stats = match state.app.read() {
        Ok(guard) => guard.stats(),
        Err(_) => return internal_error("/api/health", "state lock poisoned while reading stats"),
    };

    let timestamp = match format_timestamp(now) {
        Ok(formatted) => formatted,
        Err(_) => return internal_error("/api/health", "timestamp formatting failure"),
    };

    let status = if stats.dropped() == 0 {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };

    ApiResponse::Success(HealthSuccessResponse {
        status,
        stats,
        timestamp,
    })
}

fn build_plan_response(input: &ControllerInput, now: SystemTime) -> ApiResponse<GreenAllocation> {
    match plan_cycle(input) {
        Ok(allocation) => ApiResponse::Success(allocation),
        Err(err) => {
            warn!(error = %err, "Rejected signal plan request");
            match format_timestamp(now) {
                Ok(timestamp) => ApiResponse::Error {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    body: ErrorResponse {
                        error_code: ErrorCode::InvalidParameter,
                        error_message: err.to_string(),
                        timestamp,
                    },
                },
                Err(_) => internal_error("/api/signal/plan", "timestamp formatting failure"),
            }
        }
    }
}

fn no_data<T>(route: &str, message: &str, now: SystemTime) -> ApiResponse<T> {
    match format_timestamp(now) {
        Ok(timestamp) => ApiResponse::Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorResponse {
                error_code: ErrorCode::NoData,
                error_message: message.to_string(),
                timestamp,
            },
        },
        Err(_) => internal_error(route, "timestamp formatting failure"),
    }
}

fn internal_error<T>(route: &str, message: &str) -> ApiResponse<T> {
    error!(route = route, message = message, "Internal error while handling request");
    let formatted = format_timestamp(SystemTime::now()).unwrap_or_else(|err| {
        error!(error = %err, "Failed to format internal error timestamp");
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    });
    ApiResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            error_code: ErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: formatted,
        },
    }
}

fn format_timestamp(timestamp: SystemTime) -> Result<String, TimestampError> {
    let datetime = OffsetDateTime::from(timestamp);
    datetime.format(&Rfc3339).map_err(TimestampError::Format)
}
