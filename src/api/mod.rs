use crate::controller::SignalState;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

pub mod handlers;
pub mod responses;

#[derive(Debug, Clone)]
pub struct ApiState {
    pub app: Arc<RwLock<AppState>>,
    pub signal: watch::Receiver<Option<SignalState>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/metrics", get(handlers::get_metrics))
        .route("/api/signal", get(handlers::get_signal))
        .route("/api/signal/plan", post(handlers::post_plan))
        .route("/api/health", get(handlers::get_health))
        .with_state(state)
}
