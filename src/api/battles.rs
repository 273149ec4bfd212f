use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{require_user, AppState};
use crate::{
    db::Store,
    error::Result,
    models::{ApiResponse, Battle, BattleStatus},
    services::battle::CreateBattleRequest,
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinBody {
    pub seed: Option<String>,
}

/// POST /api/v1/battles
pub async fn create_battle<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(req): Json<CreateBattleRequest>,
) -> Result<Json<ApiResponse<Battle>>> {
    let user_id = require_user(&headers, &state)?;
    let battle = state.battles.create(user_id, req).await?;
    Ok(Json(ApiResponse::success(battle)))
}

/// GET /api/v1/battles?status=pending
pub async fn list_battles<S: Store>(
    State(state): State<AppState<S>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<Battle>>>> {
    let status = query
        .status
        .as_deref()
        .map(BattleStatus::parse)
        .unwrap_or(BattleStatus::Pending);
    let battles = state.battles.list(status).await?;
    Ok(Json(ApiResponse::success(battles)))
}

/// GET /api/v1/battles/{battle_id}
pub async fn get_battle<S: Store>(
    State(state): State<AppState<S>>,
    Path(battle_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Battle>>> {
    let battle = state.battles.get(battle_id).await?;
    Ok(Json(ApiResponse::success(battle)))
}

/// POST /api/v1/battles/{battle_id}/join
pub async fn join_battle<S: Store>(
    State(state): State<AppState<S>>,
    Path(battle_id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<JoinBody>>,
) -> Result<Json<ApiResponse<Battle>>> {
    let user_id = require_user(&headers, &state)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let battle = state
        .battles
        .join(battle_id, user_id, body.seed.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(battle)))
}

/// POST /api/v1/battles/{battle_id}/ready
pub async fn ready_battle<S: Store>(
    State(state): State<AppState<S>>,
    Path(battle_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Battle>>> {
    let user_id = require_user(&headers, &state)?;
    let battle = state.battles.set_ready(battle_id, user_id).await?;
    Ok(Json(ApiResponse::success(battle)))
}

/// POST /api/v1/battles/{battle_id}/quit
pub async fn quit_battle<S: Store>(
    State(state): State<AppState<S>>,
    Path(battle_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Battle>>> {
    let user_id = require_user(&headers, &state)?;
    let battle = state.battles.quit(battle_id, user_id).await?;
    Ok(Json(ApiResponse::success(battle)))
}

/// POST /api/v1/battles/{battle_id}/cancel
pub async fn cancel_battle<S: Store>(
    State(state): State<AppState<S>>,
    Path(battle_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Battle>>> {
    let user_id = require_user(&headers, &state)?;
    let battle = state.battles.cancel(battle_id, user_id).await?;
    Ok(Json(ApiResponse::success(battle)))
}
