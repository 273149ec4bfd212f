use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use std::net::SocketAddr;
use uuid::Uuid;

use super::{require_user, AppState};
use crate::{
    db::Store,
    error::Result,
    models::ApiResponse,
    services::case_opening::{DiceSource, OpenCaseRequest, OpeningOutcome},
};

fn default_count() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct OpenCaseBody {
    #[serde(default = "default_count")]
    pub count: u32,
    pub client_seed: String,
    #[serde(default)]
    pub testing: bool,
}

/// Resolves the caller address: the first hop of X-Forwarded-For when
/// `trust_proxy` is set, the peer address otherwise.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy: bool,
) -> Option<String> {
    let forwarded = if trust_proxy {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    } else {
        None
    };
    forwarded.or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// POST /api/v1/cases/{case_id}/open
pub async fn open_case<S: Store>(
    State(state): State<AppState<S>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(case_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<OpenCaseBody>,
) -> Result<Json<ApiResponse<OpeningOutcome>>> {
    let user_id = require_user(&headers, &state)?;

    let request = OpenCaseRequest {
        user_id,
        case_id,
        count: body.count,
        dice: DiceSource::NewSession {
            client_seed: body.client_seed,
        },
        ip: client_ip(&headers, Some(peer), state.config.trust_proxy_headers),
        testing: body.testing,
        battle_id: None,
    };
    let outcome = state.engine.open_case(request).await?;
    Ok(Json(ApiResponse::success(outcome)))
}
