use axum::http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod constants;
mod crypto;
mod db;
mod error;
mod models;
mod services;
mod websocket;

use config::{Config, StorageBackend};
use constants::API_VERSION;
use db::{Database, MemoryStore, Store};
use services::{
    BattleOrchestrator, BroadcastEventSink, CaseOpeningEngine, DiceLedger, RandomnessPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "case_battle_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting case battle backend");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("API Version: {}", API_VERSION);

    match config.storage_backend {
        StorageBackend::Postgres => {
            let db = Database::new(&config).await?;

            tracing::info!("Running database migrations...");
            db.run_migrations().await?;

            serve(db, config).await
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; nothing survives a restart");
            serve(MemoryStore::new(), config).await
        }
    }
}

async fn serve<S: Store>(store: S, config: Config) -> anyhow::Result<()> {
    let seeds = RandomnessPool::from_config(&config);
    let events = BroadcastEventSink::new();
    let engine = CaseOpeningEngine::new(
        store.clone(),
        DiceLedger::new(seeds.clone()),
        Arc::new(events.clone()),
        config.clone(),
    );
    let battles = BattleOrchestrator::new(engine.clone());

    let app_state = api::AppState {
        config: config.clone(),
        store,
        engine,
        battles: battles.clone(),
        events,
        seeds: seeds.clone(),
    };

    // Build router
    let app = build_router(app_state);

    // Start background services
    tokio::spawn(services::start_background_services(seeds, battles));

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn build_router<S: Store>(state: api::AppState<S>) -> Router {
    // CORS configuration
    let cors = cors_from_config(&state.config);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check::<S>))
        // Dice
        .route("/api/v1/dice/verify", get(api::dice::verify_roll))
        .route(
            "/api/v1/dice/sessions/{session_id}",
            get(api::dice::get_session::<S>),
        )
        // Cases
        .route(
            "/api/v1/cases/{case_id}/open",
            post(api::cases::open_case::<S>),
        )
        // Battles
        .route(
            "/api/v1/battles",
            get(api::battles::list_battles::<S>).post(api::battles::create_battle::<S>),
        )
        .route(
            "/api/v1/battles/{battle_id}",
            get(api::battles::get_battle::<S>),
        )
        .route(
            "/api/v1/battles/{battle_id}/join",
            post(api::battles::join_battle::<S>),
        )
        .route(
            "/api/v1/battles/{battle_id}/ready",
            post(api::battles::ready_battle::<S>),
        )
        .route(
            "/api/v1/battles/{battle_id}/quit",
            post(api::battles::quit_battle::<S>),
        )
        .route(
            "/api/v1/battles/{battle_id}/cancel",
            post(api::battles::cancel_battle::<S>),
        )
        // WebSocket endpoints
        .route("/ws/events", get(websocket::events::handler::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_from_config(config: &Config) -> CorsLayer {
    match allowed_origins(&config.cors_allowed_origins) {
        Some(allowed) => CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::very_permissive(),
    }
}

// `None` means every origin is allowed.
fn allowed_origins(raw: &str) -> Option<Vec<HeaderValue>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        return None;
    }

    let allowed: Vec<HeaderValue> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("No valid CORS origins parsed; falling back to permissive");
        return None;
    }
    Some(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_falls_back_to_permissive_on_garbage() {
        for raw in ["", "*", " , ", "  "] {
            assert_eq!(allowed_origins(raw), None, "{:?}", raw);
        }
    }

    #[test]
    fn cors_keeps_listed_origins() {
        let allowed =
            allowed_origins(" https://cases.example, ,https://admin.cases.example ").unwrap();
        assert_eq!(
            allowed,
            vec![
                HeaderValue::from_static("https://cases.example"),
                HeaderValue::from_static("https://admin.cases.example"),
            ]
        );
        assert_eq!(
            allowed_origins("https://only.example").map(|v| v.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn router_builds_over_memory_store() {
        let config = config::test_config();
        let seeds = services::test_support::pool();
        let events = BroadcastEventSink::new();
        let store = MemoryStore::new();
        let engine = CaseOpeningEngine::new(
            store.clone(),
            DiceLedger::new(seeds.clone()),
            Arc::new(events.clone()),
            config.clone(),
        );
        let battles = BattleOrchestrator::new(engine.clone());
        let _router = build_router(api::AppState {
            config,
            store,
            engine,
            battles,
            events,
            seeds,
        });
    }
}
