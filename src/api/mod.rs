//! Admin surface: health checks and cycle control.

pub mod cycles;
pub mod health;

use crate::db::Repository;
use crate::orchestration::SettlementOrchestrator;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub orchestrator: Arc<SettlementOrchestrator>,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, orchestrator: Arc<SettlementOrchestrator>) -> Self {
        Self { repo, orchestrator }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/cycles/:cycle_id", get(cycles::get_cycle))
        .route("/v1/cycles/:cycle_id/run", post(cycles::run_cycle))
        .route("/v1/cycles/:cycle_id/cancel", post(cycles::cancel_cycle))
        .layer(cors)
        .with_state(state)
}
