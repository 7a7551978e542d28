use std::sync::Arc;

use axum::Router;

use crate::lifecycle::PingRecorder;

pub mod error;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<dyn PingRecorder>,
    pub max_body_bytes: usize,
}

/// Ping ingestion routes, served both at the root and under `/v1`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let pings = routes::ping_routes::create_ping_router();
    Router::new()
        .nest("/pings", pings.clone())
        .nest("/v1/pings", pings)
        .with_state(state)
}
