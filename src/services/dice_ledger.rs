use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::sync::Arc;
use uuid::Uuid;

use super::randomness::RandomnessPool;
use crate::{
    constants::{ROLL_HEX_CHARS, ROLL_MODULUS, ROLL_SCALE},
    crypto::hash::{hmac_sha512_hex, sha256_hex},
    db::UnitOfWork,
    error::{AppError, Result},
    models::{DiceSession, DiceStatus, RollResult},
};

/// Commitment sequences and roll derivation.
///
/// Every method runs inside the caller's unit of work so that rolls,
/// balance changes and outcome records commit together.
#[derive(Clone)]
pub struct DiceLedger {
    pool: Arc<RandomnessPool>,
}

impl DiceLedger {
    pub fn new(pool: Arc<RandomnessPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<RandomnessPool> {
        &self.pool
    }

    pub async fn create_session<U: UnitOfWork>(
        &self,
        tx: &mut U,
        client_seed: &str,
        battle_id: Option<Uuid>,
    ) -> Result<DiceSession> {
        let server_seed = self.pool.acquire().await;
        let session = DiceSession {
            id: Uuid::new_v4(),
            server_seed_hash: commitment(&server_seed),
            server_seed,
            client_seed: client_seed.to_string(),
            index: 0,
            status: DiceStatus::Active,
            battle_id,
            created_at: Utc::now(),
            completed_at: None,
        };
        tx.save_dice_session(&session).await?;
        tracing::debug!("Dice session {} created", session.id);
        Ok(session)
    }

    pub async fn roll_result<U: UnitOfWork>(
        &self,
        tx: &mut U,
        session_id: Uuid,
        nonces: &[u64],
        complete: bool,
    ) -> Result<RollResult> {
        let max_nonce = match nonces.iter().max() {
            Some(&max) => max,
            None => return Err(AppError::BadRequest("No nonces to roll".to_string())),
        };
        if nonces.contains(&0) {
            return Err(AppError::BadRequest("Nonces start at 1".to_string()));
        }

        let mut session = load_active(tx, session_id).await?;
        let values = nonces
            .iter()
            .map(|&nonce| compute_roll(&session.server_seed, &session.client_seed, nonce))
            .collect::<Result<Vec<_>>>()?;

        session.index = session.index.max(max_nonce);
        if complete {
            session.status = DiceStatus::Completed;
            session.completed_at = Some(Utc::now());
        }
        tx.save_dice_session(&session).await?;

        Ok(RollResult {
            nonces: nonces.to_vec(),
            values,
            server_seed_hash: session.server_seed_hash.clone(),
            client_seed: session.client_seed.clone(),
            server_seed: complete.then(|| session.server_seed.clone()),
        })
    }

    pub async fn change_client_seed<U: UnitOfWork>(
        &self,
        tx: &mut U,
        session_id: Uuid,
        client_seed: &str,
    ) -> Result<DiceSession> {
        let mut session = load_unrolled(tx, session_id).await?;
        session.client_seed = client_seed.to_string();
        tx.save_dice_session(&session).await?;
        Ok(session)
    }

    /// Re-commits the session to a fresh server seed from the pool.
    pub async fn change_server_seed<U: UnitOfWork>(
        &self,
        tx: &mut U,
        session_id: Uuid,
    ) -> Result<DiceSession> {
        let mut session = load_unrolled(tx, session_id).await?;
        let server_seed = self.pool.acquire().await;
        session.server_seed_hash = commitment(&server_seed);
        session.server_seed = server_seed;
        tx.save_dice_session(&session).await?;
        Ok(session)
    }

    /// Completes the session and reveals the seed without rolling.
    pub async fn close<U: UnitOfWork>(&self, tx: &mut U, session_id: Uuid) -> Result<DiceSession> {
        let mut session = load_active(tx, session_id).await?;
        session.status = DiceStatus::Completed;
        session.completed_at = Some(Utc::now());
        tx.save_dice_session(&session).await?;
        Ok(session)
    }
}

async fn load_active<U: UnitOfWork>(tx: &mut U, session_id: Uuid) -> Result<DiceSession> {
    let session = tx
        .dice_session(session_id)
        .await?
        .ok_or(AppError::SessionNotFound)?;
    if session.is_completed() {
        return Err(AppError::SessionAlreadyClosed);
    }
    Ok(session)
}

async fn load_unrolled<U: UnitOfWork>(tx: &mut U, session_id: Uuid) -> Result<DiceSession> {
    let session = load_active(tx, session_id).await?;
    if session.index != 0 {
        return Err(AppError::TooLateToChange);
    }
    Ok(session)
}

// ==================== PURE HELPERS ====================

/// Public commitment for a server seed: SHA-256 hex of its bytes.
pub fn commitment(server_seed: &str) -> String {
    sha256_hex(server_seed.as_bytes())
}

pub fn verify(server_seed: &str, server_seed_hash: &str) -> bool {
    commitment(server_seed).eq_ignore_ascii_case(server_seed_hash.trim())
}

/// Roll in (0, 100] with three decimals, derived from
/// HMAC-SHA512(server_seed, "{client_seed}-{nonce}").
pub fn compute_roll(server_seed: &str, client_seed: &str, nonce: u64) -> Result<Decimal> {
    let message = format!("{}-{}", client_seed, nonce);
    let digest = hmac_sha512_hex(server_seed.as_bytes(), message.as_bytes());
    let prefix = digest
        .get(..ROLL_HEX_CHARS)
        .ok_or_else(|| AppError::Internal("HMAC digest too short".to_string()))?;
    let raw = u64::from_str_radix(prefix, 16)
        .map_err(|e| AppError::Internal(format!("Invalid HMAC digest: {}", e)))?;
    let ticket = raw % ROLL_MODULUS + 1;
    Ok(Decimal::new(ticket as i64, ROLL_SCALE))
}

/// Maps a roll uniformly onto `count` slots.
///
/// The roll's 100 000 possible tickets are split into `count` contiguous
/// blocks that differ in size by at most one ticket.
pub fn roll_to_index(roll: Decimal, count: usize) -> usize {
    if count <= 1 {
        return 0;
    }
    let ticket = (roll * Decimal::from(1_000u64)).trunc();
    let ticket = ticket.to_u64().unwrap_or(ROLL_MODULUS).clamp(1, ROLL_MODULUS) - 1;
    let index = ticket * count as u64 / ROLL_MODULUS;
    (index as usize).min(count - 1)
}
