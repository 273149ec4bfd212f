use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;
use crate::config::StorageBackend;
use crate::db::Store;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: String,
    pub seed_pool: usize,
    pub seed_refill_in_flight: bool,
    pub event_subscribers: usize,
    pub battle_workers: usize,
}

pub async fn health_check<S: Store>(State(state): State<AppState<S>>) -> Json<HealthResponse> {
    let storage = match state.config.storage_backend {
        StorageBackend::Postgres => "postgres",
        StorageBackend::Memory => "memory",
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: storage.to_string(),
        seed_pool: state.seeds.available().await,
        seed_refill_in_flight: state.seeds.is_refilling(),
        event_subscribers: state.events.subscriber_count(),
        battle_workers: state.battles.active_workers(),
    })
}
