pub mod battles;
pub mod cases;
pub mod dice;
pub mod health;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::services::{
    battle::BattleOrchestrator, case_opening::CaseOpeningEngine, event_bus::BroadcastEventSink,
    randomness::RandomnessPool,
};

pub struct AppState<S: Store> {
    pub config: Config,
    pub store: S,
    pub engine: CaseOpeningEngine<S>,
    pub battles: Arc<BattleOrchestrator<S>>,
    pub events: BroadcastEventSink,
    pub seeds: Arc<RandomnessPool>,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            engine: self.engine.clone(),
            battles: self.battles.clone(),
            events: self.events.clone(),
            seeds: self.seeds.clone(),
        }
    }
}

/// Bearer token claims. Tokens are issued by the account service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: usize,
    pub iat: usize,
}

pub fn extract_user_from_token(token: &str, secret: &str) -> Result<Uuid> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::AuthError("Invalid or expired token".to_string()))?;

    Uuid::parse_str(&token_data.claims.sub)
        .map_err(|_| AppError::AuthError("Token subject is not a user id".to_string()))
}

pub fn require_user<S: Store>(headers: &HeaderMap, state: &AppState<S>) -> Result<Uuid> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::AuthError("Missing Authorization header".to_string()))?;
    let auth_str = auth_header
        .to_str()
        .map_err(|_| AppError::AuthError("Invalid Authorization header".to_string()))?;
    let token = auth_str
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::AuthError("Invalid Authorization scheme".to_string()))?;

    extract_user_from_token(token, &state.config.jwt_secret)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub fn token_for(sub: &str, secret: &str) -> String {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + 3600,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }
}
