use axum::{
    extract::{Path, Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::{
    db::{Store, UnitOfWork},
    error::{AppError, Result},
    models::{ApiResponse, PublicDiceSession},
    services::dice_ledger,
};

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub nonce: u64,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub roll: Decimal,
}

/// GET /api/v1/dice/verify
///
/// Recomputes a roll from revealed seeds. No authentication.
pub async fn verify_roll(Query(query): Query<VerifyQuery>) -> Result<Json<ApiResponse<VerifyResponse>>> {
    if query.nonce == 0 {
        return Err(AppError::BadRequest("Nonces start at 1".to_string()));
    }
    let valid = dice_ledger::verify(&query.server_seed, &query.server_seed_hash);
    let roll = dice_ledger::compute_roll(&query.server_seed, &query.client_seed, query.nonce)?;
    Ok(Json(ApiResponse::success(VerifyResponse { valid, roll })))
}

/// GET /api/v1/dice/sessions/{session_id}
pub async fn get_session<S: Store>(
    State(state): State<AppState<S>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PublicDiceSession>>> {
    let mut tx = state.store.begin().await?;
    let session = tx
        .dice_session(session_id)
        .await?
        .ok_or(AppError::SessionNotFound)?;
    Ok(Json(ApiResponse::success(session.public())))
}
