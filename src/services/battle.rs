use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use super::{
    case_opening::{balance_event, CaseOpeningEngine, DiceSource, OpenCaseRequest},
    dice_ledger::roll_to_index,
    event_bus::DomainEvent,
    odds_mapper::OddsTable,
};
use crate::{
    constants::{
        EVENT_BATTLE_CANCEL, EVENT_BATTLE_CREATED, EVENT_BATTLE_END, EVENT_BATTLE_JOIN,
        EVENT_BATTLE_QUIT, EVENT_BATTLE_READY, EVENT_BATTLE_ROUND, EVENT_BATTLE_START,
        MIN_BATTLE_PLAYERS,
    },
    db::{Store, UnitOfWork},
    error::{AppError, ErrorKind, Result},
    models::{
        Battle, BattleCase, BattleRoll, BattleSession, BattleStatus, CaseKind, RoundOutcome,
        Transaction, TransactionKind, User,
    },
};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBattleRequest {
    pub cases: Vec<BattleCase>,
    pub capacity: u32,
    #[serde(default)]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cancelled: usize,
    pub resumed: usize,
    pub scheduled: usize,
    /// Expired battles whose cancellation failed and is retried in the background.
    pub retrying: usize,
}

enum RoundStep {
    Continue,
    Finished,
}

/// Multi-player battles on top of the case opening engine.
///
/// Membership changes run in one unit of work each. Once running, a
/// per-battle worker resolves one round per unit of work; any worker error
/// cancels the battle and refunds every stake.
pub struct BattleOrchestrator<S: Store> {
    engine: CaseOpeningEngine<S>,
    workers: StdMutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl<S: Store> BattleOrchestrator<S> {
    pub fn new(engine: CaseOpeningEngine<S>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            workers: StdMutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &CaseOpeningEngine<S> {
        &self.engine
    }

    fn store(&self) -> &S {
        self.engine.store()
    }

    fn round_delay(&self) -> Duration {
        Duration::from_millis(self.engine.config().battle_round_delay_ms)
    }

    fn cancel_retry_delay(&self) -> Duration {
        Duration::from_millis(self.engine.config().battle_cancel_retry_ms)
    }

    pub async fn get(&self, battle_id: Uuid) -> Result<Battle> {
        let mut tx = self.store().begin().await?;
        load_battle(&mut tx, battle_id).await
    }

    pub async fn list(&self, status: BattleStatus) -> Result<Vec<Battle>> {
        let mut tx = self.store().begin().await?;
        tx.battles_by_status(status).await
    }

    // ==================== MEMBERSHIP ====================

    pub async fn create(
        self: &Arc<Self>,
        creator_id: Uuid,
        request: CreateBattleRequest,
    ) -> Result<Battle> {
        let config = self.engine.config();
        if request.cases.is_empty() {
            return Err(AppError::BadRequest("Battle needs at least one case".to_string()));
        }
        if request.capacity < MIN_BATTLE_PLAYERS || request.capacity > config.max_battle_players {
            return Err(AppError::BadRequest(format!(
                "Capacity must be between {} and {}",
                MIN_BATTLE_PLAYERS, config.max_battle_players
            )));
        }
        if request
            .cases
            .iter()
            .any(|c| c.count == 0 || c.count > config.max_open_count)
        {
            return Err(AppError::BadRequest(format!(
                "Case count must be between 1 and {}",
                config.max_open_count
            )));
        }

        let mut events = Vec::new();
        let mut tx = self.store().begin().await?;
        let mut price = Decimal::ZERO;
        for entry in &request.cases {
            let case = tx
                .case(entry.case_id)
                .await?
                .ok_or_else(|| AppError::NotFound("Case not found".to_string()))?;
            if !case.enabled {
                return Err(AppError::CaseDisabled);
            }
            if case.kind != CaseKind::Standard {
                return Err(AppError::BadRequest(format!(
                    "{} cases cannot be battled",
                    case.kind.as_str()
                )));
            }
            OddsTable::build(&case.items)?;
            price += case.price * Decimal::from(entry.count);
        }

        let mut creator = load_player(&mut tx, creator_id).await?;
        let seed = player_seed(request.seed.as_deref());
        let expires_at =
            Utc::now() + ChronoDuration::seconds(config.battle_expiry_secs as i64);
        let mut battle = Battle::new(
            creator_id,
            &seed,
            request.cases,
            request.capacity,
            price,
            Uuid::nil(),
            expires_at,
        );

        stake(&mut tx, &mut creator, &battle).await?;
        let session = self
            .engine
            .ledger()
            .create_session(&mut tx, &battle.combined_client_seed(), Some(battle.id))
            .await?;
        battle.dice_session_id = session.id;
        tx.save_battle(&battle).await?;
        tx.commit().await?;

        events.push(balance_event(&creator));
        events.push(DomainEvent::global(
            EVENT_BATTLE_CREATED,
            serde_json::json!({ "battle": battle, "server_seed_hash": session.server_seed_hash }),
        ));
        self.engine.events().dispatch(events);
        tracing::info!(
            "Battle {} created by {} ({} rounds, stake {})",
            battle.id,
            creator_id,
            battle.total_rounds,
            battle.price
        );

        self.schedule_expiry(&battle);
        Ok(battle)
    }

    pub async fn join(
        self: &Arc<Self>,
        battle_id: Uuid,
        user_id: Uuid,
        seed: Option<&str>,
    ) -> Result<Battle> {
        let mut events = Vec::new();
        let mut tx = self.store().begin().await?;
        let mut battle = load_battle(&mut tx, battle_id).await?;
        if battle.status != BattleStatus::Pending {
            return Err(AppError::BattleNotPending);
        }
        if battle.is_participant(user_id) {
            return Err(AppError::AlreadyJoined);
        }
        if battle.is_full() {
            return Err(AppError::BattleFull);
        }

        let mut user = load_player(&mut tx, user_id).await?;
        stake(&mut tx, &mut user, &battle).await?;
        battle
            .sessions
            .push(BattleSession::new(user_id, &player_seed(seed)));
        self.recommit_seed(&mut tx, &battle).await?;

        events.push(balance_event(&user));
        events.push(DomainEvent::global(
            EVENT_BATTLE_JOIN,
            serde_json::json!({ "battle_id": battle.id, "user_id": user_id, "username": user.username }),
        ));
        let started = self.start_if_ready(&mut tx, &mut battle, &mut events).await?;
        tx.save_battle(&battle).await?;
        tx.commit().await?;
        self.engine.events().dispatch(events);

        tracing::info!("User {} joined battle {}", user_id, battle_id);
        if started {
            self.spawn_worker(battle.id);
        }
        Ok(battle)
    }

    pub async fn set_ready(self: &Arc<Self>, battle_id: Uuid, user_id: Uuid) -> Result<Battle> {
        let mut events = Vec::new();
        let mut tx = self.store().begin().await?;
        let mut battle = load_battle(&mut tx, battle_id).await?;
        if battle.status != BattleStatus::Pending {
            return Err(AppError::BattleNotPending);
        }
        let session = battle.session_mut(user_id).ok_or(AppError::NotJoined)?;
        if session.ready {
            return Err(AppError::AlreadyReady);
        }
        session.ready = true;

        events.push(DomainEvent::to_room(
            EVENT_BATTLE_READY,
            battle.id,
            serde_json::json!({ "battle_id": battle.id, "user_id": user_id }),
        ));
        let started = self.start_if_ready(&mut tx, &mut battle, &mut events).await?;
        tx.save_battle(&battle).await?;
        tx.commit().await?;
        self.engine.events().dispatch(events);

        if started {
            self.spawn_worker(battle.id);
        }
        Ok(battle)
    }

    pub async fn quit(&self, battle_id: Uuid, user_id: Uuid) -> Result<Battle> {
        let mut tx = self.store().begin().await?;
        let mut battle = load_battle(&mut tx, battle_id).await?;
        if battle.status != BattleStatus::Pending {
            return Err(AppError::BattleNotPending);
        }
        if battle.creator_id == user_id {
            return Err(AppError::BadRequest(
                "The creator cancels the battle instead of quitting".to_string(),
            ));
        }
        let position = battle
            .sessions
            .iter()
            .position(|s| s.user_id == user_id)
            .ok_or(AppError::NotJoined)?;

        let mut user = load_user(&mut tx, user_id).await?;
        refund(&mut tx, &mut user, &battle).await?;
        battle.sessions.remove(position);
        self.recommit_seed(&mut tx, &battle).await?;
        tx.save_battle(&battle).await?;
        tx.commit().await?;

        self.engine.events().dispatch(vec![
            balance_event(&user),
            DomainEvent::global(
                EVENT_BATTLE_QUIT,
                serde_json::json!({ "battle_id": battle.id, "user_id": user_id }),
            ),
        ]);
        tracing::info!("User {} left battle {}", user_id, battle_id);
        Ok(battle)
    }

    /// Creator-initiated cancellation of a pending battle.
    pub async fn cancel(&self, battle_id: Uuid, user_id: Uuid) -> Result<Battle> {
        let battle = self.get(battle_id).await?;
        if battle.creator_id != user_id {
            return Err(AppError::NotBattleCreator);
        }
        match battle.status {
            BattleStatus::Cancelled => Ok(battle),
            BattleStatus::Pending => self.cancel_with(battle_id, true, "creator").await,
            _ => Err(AppError::BattleNotPending),
        }
    }

    /// Cancels a pending or running battle. Terminal battles are returned as is.
    pub async fn force_cancel(&self, battle_id: Uuid, reason: &str) -> Result<Battle> {
        self.cancel_with(battle_id, false, reason).await
    }

    // Refunds every stake in one unit of work, then purges the battle's
    // openings, items and dice session in a second one.
    async fn cancel_with(&self, battle_id: Uuid, pending_only: bool, reason: &str) -> Result<Battle> {
        let mut events = Vec::new();
        let mut tx = self.store().begin().await?;
        let mut battle = load_battle(&mut tx, battle_id).await?;
        if battle.status.is_terminal() {
            return Ok(battle);
        }
        if pending_only && battle.status != BattleStatus::Pending {
            return Err(AppError::BattleNotPending);
        }

        if battle.status == BattleStatus::Running {
            for roll in battle.sessions.iter().flat_map(|s| &s.rolls) {
                self.engine
                    .reverse_opening_in(&mut tx, roll.opening_id, &mut events)
                    .await?;
            }
        }
        for session in &battle.sessions {
            let mut user = load_user(&mut tx, session.user_id).await?;
            refund(&mut tx, &mut user, &battle).await?;
            events.push(balance_event(&user));
        }
        battle.transition(BattleStatus::Cancelled)?;
        battle.winner_id = None;
        tx.save_battle(&battle).await?;
        tx.commit().await?;

        events.push(DomainEvent::global(
            EVENT_BATTLE_CANCEL,
            serde_json::json!({ "battle_id": battle.id, "reason": reason, "refunded": battle.pot() }),
        ));
        self.engine.events().dispatch(events);
        tracing::info!("Battle {} cancelled ({})", battle_id, reason);

        if let Err(e) = self.purge(&battle).await {
            tracing::warn!("Failed to purge cancelled battle {}: {}", battle_id, e);
        }
        Ok(battle)
    }

    // Background cancellation: infrastructure failures are retried until the
    // refunds commit, anything else is logged and left for an operator.
    async fn cancel_until_done(&self, battle_id: Uuid, pending_only: bool, reason: &str) {
        let mut attempt: u32 = 1;
        loop {
            match self.cancel_with(battle_id, pending_only, reason).await {
                Ok(_) | Err(AppError::BattleNotPending) => return,
                Err(e) if e.kind() == ErrorKind::Infrastructure => {
                    tracing::warn!(
                        "Cancel of battle {} failed (attempt {}): {}, retrying",
                        battle_id,
                        attempt,
                        e
                    );
                    attempt += 1;
                    sleep(self.cancel_retry_delay()).await;
                }
                Err(e) => {
                    tracing::error!("Giving up cancelling battle {}: {}", battle_id, e);
                    return;
                }
            }
        }
    }

    async fn purge(&self, battle: &Battle) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let openings = tx.delete_battle_openings(battle.id).await?;
        let items = tx.delete_battle_items(battle.id).await?;
        tx.delete_dice_session(battle.dice_session_id).await?;
        tx.commit().await?;
        tracing::debug!(
            "Purged battle {}: {} openings, {} items",
            battle.id,
            openings,
            items
        );
        Ok(())
    }

    async fn recommit_seed(&self, tx: &mut S::Tx, battle: &Battle) -> Result<()> {
        self.engine
            .ledger()
            .change_client_seed(tx, battle.dice_session_id, &battle.combined_client_seed())
            .await?;
        Ok(())
    }

    // ==================== START ====================

    async fn start_if_ready(
        &self,
        tx: &mut S::Tx,
        battle: &mut Battle,
        events: &mut Vec<DomainEvent>,
    ) -> Result<bool> {
        if !battle.should_start() {
            return Ok(false);
        }
        self.start_in(tx, battle, events).await?;
        Ok(true)
    }

    /// Freezes membership and reserves one opening per player and case entry.
    async fn start_in(
        &self,
        tx: &mut S::Tx,
        battle: &mut Battle,
        events: &mut Vec<DomainEvent>,
    ) -> Result<()> {
        battle.transition(BattleStatus::Running)?;
        for player in 0..battle.sessions.len() {
            let user_id = battle.sessions[player].user_id;
            let mut rolls = Vec::with_capacity(battle.cases.len());
            for (entry, case) in battle.cases.iter().enumerate() {
                let nonces: Vec<u64> = battle
                    .rounds_for_entry(entry)
                    .map(|round| battle.nonce_for(round, player))
                    .collect();
                let request = OpenCaseRequest {
                    user_id,
                    case_id: case.case_id,
                    count: case.count,
                    dice: DiceSource::Reserved {
                        session_id: battle.dice_session_id,
                        nonces: nonces.clone(),
                    },
                    ip: None,
                    testing: false,
                    battle_id: Some(battle.id),
                };
                let outcome = self.engine.open_case_in(tx, &request, events).await?;
                rolls.push(BattleRoll {
                    opening_id: outcome.opening_id,
                    case_id: case.case_id,
                    nonces,
                });
            }
            battle.sessions[player].rolls = rolls;
        }

        events.push(DomainEvent::global(
            EVENT_BATTLE_START,
            serde_json::json!({
                "battle_id": battle.id,
                "players": battle.sessions.iter().map(|s| s.user_id).collect::<Vec<_>>(),
                "client_seed": battle.combined_client_seed(),
            }),
        ));
        tracing::info!(
            "Battle {} started with {} players",
            battle.id,
            battle.player_count()
        );
        Ok(())
    }

    // ==================== ROUND WORKER ====================

    fn spawn_worker(self: &Arc<Self>, battle_id: Uuid) {
        let Ok(mut workers) = self.workers.lock() else {
            tracing::error!("Worker registry poisoned, battle {} not scheduled", battle_id);
            return;
        };
        workers.retain(|_, handle| !handle.is_finished());
        if workers.contains_key(&battle_id) {
            return;
        }
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = orchestrator.run_rounds(battle_id).await {
                tracing::error!("Battle {} worker failed: {}", battle_id, e);
                orchestrator
                    .cancel_until_done(battle_id, false, "worker failure")
                    .await;
            }
            orchestrator.release_worker(battle_id);
        });
        // Inserted under the same lock, so the task's release always follows.
        workers.insert(battle_id, handle);
    }

    fn release_worker(&self, battle_id: Uuid) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.remove(&battle_id);
        }
    }

    /// Round workers still running.
    pub fn active_workers(&self) -> usize {
        self.workers
            .lock()
            .map(|workers| workers.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Waits for a battle's round worker, if one was scheduled.
    pub async fn wait_for_worker(&self, battle_id: Uuid) {
        let handle = match self.workers.lock() {
            Ok(mut workers) => workers.remove(&battle_id),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Battle {} worker panicked: {}", battle_id, e);
            }
        }
    }

    /// Resolves the remaining rounds of a running battle in order.
    pub async fn run_rounds(&self, battle_id: Uuid) -> Result<()> {
        loop {
            match self.play_round(battle_id).await? {
                RoundStep::Continue => sleep(self.round_delay()).await,
                RoundStep::Finished => return Ok(()),
            }
        }
    }

    async fn play_round(&self, battle_id: Uuid) -> Result<RoundStep> {
        let mut events = Vec::new();
        let mut tx = self.store().begin().await?;
        let mut battle = load_battle(&mut tx, battle_id).await?;
        if battle.status != BattleStatus::Running {
            return Ok(RoundStep::Finished);
        }

        let round = battle.rounds_resolved();
        if round >= battle.total_rounds {
            self.finish_in(&mut tx, &mut battle, &mut events).await?;
        } else {
            self.resolve_round(&mut tx, &mut battle, round, &mut events)
                .await?;
            if battle.is_final_round(round) {
                self.finish_in(&mut tx, &mut battle, &mut events).await?;
            }
        }

        tx.save_battle(&battle).await?;
        tx.commit().await?;
        self.engine.events().dispatch(events);

        if battle.status == BattleStatus::Running {
            Ok(RoundStep::Continue)
        } else {
            Ok(RoundStep::Finished)
        }
    }

    async fn resolve_round(
        &self,
        tx: &mut S::Tx,
        battle: &mut Battle,
        round: u32,
        events: &mut Vec<DomainEvent>,
    ) -> Result<()> {
        let mut results = Vec::with_capacity(battle.sessions.len());
        for player in 0..battle.sessions.len() {
            let nonce = battle.nonce_for(round, player);
            let session = &battle.sessions[player];
            let opening_id = session
                .roll_for_nonce(nonce)
                .map(|roll| roll.opening_id)
                .ok_or_else(|| {
                    AppError::Inconsistency(format!(
                        "battle {} has no opening for nonce {}",
                        battle.id, nonce
                    ))
                })?;
            let won = self
                .engine
                .roll_opening_in(tx, opening_id, &[nonce], false)
                .await?;
            let won = won.into_iter().next().ok_or_else(|| {
                AppError::Inconsistency(format!("nonce {} produced no item", nonce))
            })?;

            let outcome = RoundOutcome {
                round,
                nonce,
                roll: won.roll,
                item_id: won.item_id,
                name: won.name,
                value: won.value,
            };
            let session = &mut battle.sessions[player];
            session.winnings += outcome.value;
            results.push(serde_json::json!({
                "user_id": session.user_id,
                "outcome": outcome,
                "winnings": session.winnings,
            }));
            session.rounds.push(outcome);
        }
        battle.mark_round_resolved(round)?;

        events.push(DomainEvent::to_room(
            EVENT_BATTLE_ROUND,
            battle.id,
            serde_json::json!({ "battle_id": battle.id, "round": round, "results": results }),
        ));
        tracing::debug!("Battle {} resolved round {}", battle.id, round);
        Ok(())
    }

    async fn finish_in(
        &self,
        tx: &mut S::Tx,
        battle: &mut Battle,
        events: &mut Vec<DomainEvent>,
    ) -> Result<()> {
        let best = battle
            .sessions
            .iter()
            .map(|s| s.winnings)
            .max()
            .ok_or_else(|| AppError::Inconsistency(format!("battle {} has no players", battle.id)))?;
        let tied: Vec<usize> = battle
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.winnings == best)
            .map(|(idx, _)| idx)
            .collect();

        let ledger = self.engine.ledger();
        let winner = if tied.len() == 1 {
            ledger.close(tx, battle.dice_session_id).await?;
            tied[0]
        } else {
            let roll = ledger
                .roll_result(tx, battle.dice_session_id, &[battle.tie_break_nonce()], true)
                .await?;
            let value = roll.values.first().copied().ok_or_else(|| {
                AppError::Inconsistency("tie-break roll returned no value".to_string())
            })?;
            battle.tie_break_roll = Some(value);
            tied[roll_to_index(value, tied.len())]
        };

        let winner_id = battle.sessions[winner].user_id;
        let moved = tx.reassign_battle_items(battle.id, winner_id).await?;
        battle.winner_id = Some(winner_id);
        battle.transition(BattleStatus::Completed)?;

        let server_seed = tx
            .dice_session(battle.dice_session_id)
            .await?
            .map(|s| s.server_seed);
        events.push(DomainEvent::global(
            EVENT_BATTLE_END,
            serde_json::json!({
                "battle_id": battle.id,
                "winner_id": winner_id,
                "total": best,
                "tie_break_roll": battle.tie_break_roll,
                "server_seed": server_seed,
            }),
        ));
        tracing::info!(
            "Battle {} won by {} with {} ({} items moved)",
            battle.id,
            winner_id,
            best,
            moved
        );
        Ok(())
    }

    // ==================== TIMERS & RECOVERY ====================

    fn schedule_expiry(self: &Arc<Self>, battle: &Battle) {
        let orchestrator = Arc::clone(self);
        let battle_id = battle.id;
        let wait = (battle.expires_at - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            sleep(wait).await;
            orchestrator
                .cancel_until_done(battle_id, true, "expired")
                .await;
        });
    }

    /// Cancels expired pending battles and resumes running ones. Called once
    /// at startup. A failed cancellation is handed to a background retry and
    /// never stops the remaining battles from being recovered.
    pub async fn recover_battles(self: &Arc<Self>) -> Result<RecoveryReport> {
        let (pending, running) = {
            let mut tx = self.store().begin().await?;
            let pending = tx.battles_by_status(BattleStatus::Pending).await?;
            let running = tx.battles_by_status(BattleStatus::Running).await?;
            (pending, running)
        };

        let mut report = RecoveryReport::default();
        let now = Utc::now();
        for battle in pending {
            if battle.expires_at > now {
                self.schedule_expiry(&battle);
                report.scheduled += 1;
                continue;
            }
            match self.cancel_with(battle.id, true, "expired").await {
                Ok(_) => report.cancelled += 1,
                Err(AppError::BattleNotPending) => {}
                Err(e) => {
                    tracing::warn!("Failed to cancel expired battle {}: {}", battle.id, e);
                    self.schedule_expiry(&battle);
                    report.retrying += 1;
                }
            }
        }
        for battle in running {
            self.spawn_worker(battle.id);
            report.resumed += 1;
        }
        tracing::info!(
            "Battle recovery: {} cancelled, {} resumed, {} awaiting players, {} retrying",
            report.cancelled,
            report.resumed,
            report.scheduled,
            report.retrying
        );
        Ok(report)
    }
}

// ==================== HELPERS ====================

async fn load_battle<U: UnitOfWork>(tx: &mut U, battle_id: Uuid) -> Result<Battle> {
    tx.battle(battle_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Battle not found".to_string()))
}

async fn load_user<U: UnitOfWork>(tx: &mut U, user_id: Uuid) -> Result<User> {
    tx.user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
}

async fn load_player<U: UnitOfWork>(tx: &mut U, user_id: Uuid) -> Result<User> {
    let user = load_user(tx, user_id).await?;
    if user.flagged {
        return Err(AppError::AccountFlagged);
    }
    Ok(user)
}

async fn stake<U: UnitOfWork>(tx: &mut U, user: &mut User, battle: &Battle) -> Result<()> {
    if user.balance < battle.price {
        return Err(AppError::InsufficientBalance);
    }
    user.balance -= battle.price;
    user.updated_at = Utc::now();
    tx.save_user(user).await?;
    tx.insert_transaction(&Transaction::new(
        user.id,
        TransactionKind::BattleStake,
        -battle.price,
        battle.id,
    ))
    .await
}

async fn refund<U: UnitOfWork>(tx: &mut U, user: &mut User, battle: &Battle) -> Result<()> {
    user.balance += battle.price;
    user.updated_at = Utc::now();
    tx.save_user(user).await?;
    tx.insert_transaction(&Transaction::new(
        user.id,
        TransactionKind::BattleRefund,
        battle.price,
        battle.id,
    ))
    .await
}

fn player_seed(seed: Option<&str>) -> String {
    match seed.map(str::trim) {
        Some(seed) if !seed.is_empty() => seed.to_string(),
        _ => hex::encode(rand::random::<[u8; 8]>()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{Case, DiceStatus};
    use crate::services::dice_ledger::compute_roll;
    use crate::services::test_support::{fixture, item, Fixture};

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    fn orchestrator(fx: &Fixture) -> Arc<BattleOrchestrator<MemoryStore>> {
        BattleOrchestrator::new(fx.engine.clone())
    }

    fn request(case: &Case, count: u32, capacity: u32) -> CreateBattleRequest {
        CreateBattleRequest {
            cases: vec![BattleCase {
                case_id: case.id,
                count,
            }],
            capacity,
            seed: Some("alpha".to_string()),
        }
    }

    async fn flat_case(fx: &Fixture) -> Case {
        let case = Case::new("flat", dec("5"), vec![item("coin", "3", "100")]);
        fx.store.seed(vec![], vec![case.clone()]).await;
        case
    }

    async fn total_balance(fx: &Fixture) -> Decimal {
        fx.store
            .snapshot()
            .await
            .users
            .values()
            .map(|u| u.balance)
            .sum()
    }

    #[tokio::test]
    async fn full_battle_pays_every_item_to_the_winner() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;

        let battle = orch.create(alice.id, request(&case, 3, 2)).await.unwrap();
        assert_eq!(battle.price, dec("30"));
        assert_eq!(battle.total_rounds, 3);

        let battle = orch.join(battle.id, bob.id, Some("beta")).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Running);
        orch.wait_for_worker(battle.id).await;

        let battle = orch.get(battle.id).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Completed);
        assert_eq!(battle.current_round, 2);
        let winner = battle.winner_id.unwrap();

        let state = fx.store.snapshot().await;
        assert_eq!(state.users[&alice.id].balance, dec("70"));
        assert_eq!(state.users[&bob.id].balance, dec("70"));
        assert_eq!(state.user_items.len(), 6);
        assert!(state.user_items.iter().all(|i| i.owner_id == winner));

        for session in &battle.sessions {
            let rounds: Vec<u32> = session.rounds.iter().map(|r| r.round).collect();
            assert_eq!(rounds, vec![0, 1, 2]);
            assert_eq!(
                session.winnings,
                session.rounds.iter().map(|r| r.value).sum::<Decimal>()
            );
        }
        let best = battle.sessions.iter().map(|s| s.winnings).max().unwrap();
        assert_eq!(battle.session(winner).unwrap().winnings, best);

        let dice = &state.dice_sessions[&battle.dice_session_id];
        assert_eq!(dice.status, DiceStatus::Completed);
        assert_eq!(dice.client_seed, "alphabeta");
        for (player, session) in battle.sessions.iter().enumerate() {
            for outcome in &session.rounds {
                assert_eq!(outcome.nonce, battle.nonce_for(outcome.round, player));
                assert_eq!(
                    compute_roll(&dice.server_seed, "alphabeta", outcome.nonce).unwrap(),
                    outcome.roll
                );
            }
        }

        let names = fx.sink.names();
        assert_eq!(
            names.iter().filter(|n| **n == EVENT_BATTLE_ROUND).count(),
            3
        );
        assert!(names.contains(&EVENT_BATTLE_END));
    }

    #[tokio::test]
    async fn ties_are_broken_by_a_verifiable_extra_roll() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let case = flat_case(&fx).await;

        let battle = orch.create(alice.id, request(&case, 2, 2)).await.unwrap();
        orch.join(battle.id, bob.id, Some("beta")).await.unwrap();
        orch.wait_for_worker(battle.id).await;

        let battle = orch.get(battle.id).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Completed);
        let roll = battle.tie_break_roll.unwrap();

        let state = fx.store.snapshot().await;
        let dice = &state.dice_sessions[&battle.dice_session_id];
        assert_eq!(dice.index, battle.tie_break_nonce());
        assert_eq!(
            compute_roll(&dice.server_seed, "alphabeta", battle.tie_break_nonce()).unwrap(),
            roll
        );
        let expected = battle.sessions[roll_to_index(roll, 2)].user_id;
        assert_eq!(battle.winner_id, Some(expected));
    }

    #[tokio::test]
    async fn tie_breaks_favour_no_seat() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let case = flat_case(&fx).await;
        let mut wins = [0u32; 2];

        for _ in 0..120 {
            let alice = fx.user("alice", "10").await;
            let bob = fx.user("bob", "10").await;
            let mut req = request(&case, 1, 2);
            req.seed = None;
            let battle = orch.create(alice.id, req).await.unwrap();
            orch.join(battle.id, bob.id, None).await.unwrap();
            orch.wait_for_worker(battle.id).await;
            let battle = orch.get(battle.id).await.unwrap();
            let winner = battle.winner_id.unwrap();
            wins[usize::from(winner == bob.id)] += 1;
        }
        assert!(wins.iter().all(|&w| w >= 30), "skewed tie-breaks: {:?}", wins);
    }

    #[tokio::test]
    async fn round_two_fault_cancels_and_purges() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;
        let before = total_balance(&fx).await;

        let battle = orch.create(alice.id, request(&case, 3, 2)).await.unwrap();
        // Round one inserts one item per player; the third insert is round two.
        fx.store.inject_fault(Some("insert_user_item"), 2);
        orch.join(battle.id, bob.id, None).await.unwrap();
        orch.wait_for_worker(battle.id).await;

        let battle = orch.get(battle.id).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Cancelled);
        assert!(battle.winner_id.is_none());

        let state = fx.store.snapshot().await;
        assert_eq!(total_balance(&fx).await, before);
        assert_eq!(state.users[&alice.id].balance, dec("100"));
        assert!(state.user_items.is_empty());
        assert!(state.openings.values().all(|o| o.battle_id != Some(battle.id)));
        assert!(!state.dice_sessions.contains_key(&battle.dice_session_id));
        assert!(fx.sink.names().contains(&EVENT_BATTLE_CANCEL));
        assert!(!fx.sink.names().contains(&EVENT_BATTLE_END));
    }

    #[tokio::test]
    async fn cancelled_running_battle_reverses_credit_and_counters() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let creator = fx.user("creator", "0").await;
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let mut case = fx.case("box", "10", CaseKind::Standard).await;
        case.creator_id = Some(creator.id);
        case.affiliate_cut = dec("0.1");
        fx.store.seed(vec![], vec![case.clone()]).await;

        let battle = orch.create(alice.id, request(&case, 3, 2)).await.unwrap();
        fx.store.inject_fault(Some("insert_user_item"), 2);
        orch.join(battle.id, bob.id, None).await.unwrap();
        orch.wait_for_worker(battle.id).await;
        assert_eq!(
            orch.get(battle.id).await.unwrap().status,
            BattleStatus::Cancelled
        );

        let state = fx.store.snapshot().await;
        assert_eq!(state.users[&creator.id].earnings, Decimal::ZERO);
        let credited: Decimal = state
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::AffiliateCredit)
            .map(|t| t.amount)
            .sum();
        let reversed: Decimal = state
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::AffiliateReversal)
            .map(|t| t.amount)
            .sum();
        assert_eq!(credited, dec("6"));
        assert_eq!(credited + reversed, Decimal::ZERO);
        assert_eq!(state.cases[&case.id].unbox_count, 0);
        let case_stats = &state.case_stats[&case.id];
        assert_eq!(case_stats.opens, 0);
        assert_eq!(case_stats.wagered, Decimal::ZERO);
        assert_eq!(case_stats.paid_out, Decimal::ZERO);
        for player in [alice.id, bob.id] {
            let stats = &state.user_stats[&player];
            assert_eq!(stats.opens, 0);
            assert_eq!(stats.wagered, Decimal::ZERO);
            assert_eq!(stats.won, Decimal::ZERO);
            assert_eq!(state.users[&player].balance, dec("100"));
        }
    }

    #[tokio::test]
    async fn background_cancel_retries_until_refunded() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;
        let before = total_balance(&fx).await;

        let battle = orch.create(alice.id, request(&case, 1, 3)).await.unwrap();
        orch.join(battle.id, bob.id, None).await.unwrap();
        fx.store.inject_fault(Some("save_user"), 0);
        orch.cancel_until_done(battle.id, false, "worker failure")
            .await;

        assert!(!fx.store.fault_armed());
        assert_eq!(
            orch.get(battle.id).await.unwrap().status,
            BattleStatus::Cancelled
        );
        assert_eq!(total_balance(&fx).await, before);
    }

    #[tokio::test]
    async fn finished_workers_leave_the_registry() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            let battle = orch.create(alice.id, request(&case, 1, 2)).await.unwrap();
            orch.join(battle.id, bob.id, None).await.unwrap();
            ids.push(battle.id);
        }

        let mut done = false;
        for _ in 0..500 {
            let mut completed = 0;
            for id in &ids {
                if orch.get(*id).await.unwrap().status == BattleStatus::Completed {
                    completed += 1;
                }
            }
            if completed == ids.len() && orch.active_workers() == 0 {
                done = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(done);
        assert!(orch.workers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_refunds_every_stake() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let carol = fx.user("carol", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;
        let before = total_balance(&fx).await;

        let battle = orch.create(alice.id, request(&case, 2, 3)).await.unwrap();
        orch.join(battle.id, bob.id, None).await.unwrap();
        assert_eq!(total_balance(&fx).await, before - dec("40"));

        assert!(matches!(
            orch.cancel(battle.id, bob.id).await.unwrap_err(),
            AppError::NotBattleCreator
        ));
        let cancelled = orch.cancel(battle.id, alice.id).await.unwrap();
        assert_eq!(cancelled.status, BattleStatus::Cancelled);
        assert_eq!(total_balance(&fx).await, before);

        let state = fx.store.snapshot().await;
        let staked: Decimal = state
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::BattleStake)
            .map(|t| t.amount)
            .sum();
        let refunded: Decimal = state
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::BattleRefund)
            .map(|t| t.amount)
            .sum();
        assert_eq!(staked + refunded, Decimal::ZERO);
        assert_eq!(refunded, cancelled.pot());
        assert!(!state.dice_sessions.contains_key(&battle.dice_session_id));

        // Idempotent once terminal.
        orch.cancel(battle.id, alice.id).await.unwrap();
        orch.force_cancel(battle.id, "again").await.unwrap();
        assert_eq!(total_balance(&fx).await, before);
        assert!(matches!(
            orch.join(battle.id, carol.id, None).await.unwrap_err(),
            AppError::BattleNotPending
        ));
    }

    #[tokio::test]
    async fn membership_rules_are_enforced() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let poor = fx.user("poor", "1").await;
        let carol = fx.user("carol", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;

        let battle = orch.create(alice.id, request(&case, 1, 3)).await.unwrap();
        assert!(matches!(
            orch.join(battle.id, alice.id, None).await.unwrap_err(),
            AppError::AlreadyJoined
        ));
        assert!(matches!(
            orch.join(battle.id, poor.id, None).await.unwrap_err(),
            AppError::InsufficientBalance
        ));
        assert!(matches!(
            orch.set_ready(battle.id, bob.id).await.unwrap_err(),
            AppError::NotJoined
        ));
        assert!(matches!(
            orch.quit(battle.id, alice.id).await.unwrap_err(),
            AppError::BadRequest(_)
        ));

        orch.join(battle.id, bob.id, Some("beta")).await.unwrap();
        let dice = fx.store.snapshot().await.dice_sessions[&battle.dice_session_id].clone();
        assert_eq!(dice.client_seed, "alphabeta");

        let after_quit = orch.quit(battle.id, bob.id).await.unwrap();
        assert_eq!(after_quit.player_count(), 1);
        let state = fx.store.snapshot().await;
        assert_eq!(state.users[&bob.id].balance, dec("100"));
        assert_eq!(state.dice_sessions[&battle.dice_session_id].client_seed, "alpha");

        orch.set_ready(battle.id, alice.id).await.unwrap();
        assert!(matches!(
            orch.set_ready(battle.id, alice.id).await.unwrap_err(),
            AppError::AlreadyReady
        ));
        orch.join(battle.id, carol.id, None).await.unwrap();
        let started = orch.set_ready(battle.id, carol.id).await.unwrap();
        assert_eq!(started.status, BattleStatus::Running);
        assert!(matches!(
            orch.quit(battle.id, carol.id).await.unwrap_err(),
            AppError::BattleNotPending
        ));
        orch.wait_for_worker(battle.id).await;
    }

    #[tokio::test]
    async fn full_battle_rejects_late_joiners() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let carol = fx.user("carol", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;

        let battle = orch.create(alice.id, request(&case, 1, 2)).await.unwrap();
        orch.join(battle.id, bob.id, None).await.unwrap();
        // Starting freezes membership before capacity is even checked.
        assert!(matches!(
            orch.join(battle.id, carol.id, None).await.unwrap_err(),
            AppError::BattleNotPending
        ));
        orch.wait_for_worker(battle.id).await;
    }

    #[tokio::test]
    async fn create_validates_cases_and_capacity() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;
        let daily = fx.case("daily", "0", CaseKind::Daily).await;

        assert!(orch.create(alice.id, request(&case, 1, 1)).await.is_err());
        assert!(orch.create(alice.id, request(&case, 1, 5)).await.is_err());
        assert!(orch.create(alice.id, request(&case, 0, 2)).await.is_err());
        assert!(orch.create(alice.id, request(&daily, 1, 2)).await.is_err());
        let poor = fx.user("poor", "20").await;
        assert!(matches!(
            orch.create(poor.id, request(&case, 3, 2)).await.unwrap_err(),
            AppError::InsufficientBalance
        ));
        let empty = CreateBattleRequest {
            cases: vec![],
            capacity: 2,
            seed: None,
        };
        assert!(orch.create(alice.id, empty).await.is_err());
        assert_eq!(
            fx.store.snapshot().await.users[&alice.id].balance,
            dec("100")
        );
    }

    #[tokio::test]
    async fn recovery_cancels_expired_and_resumes_running() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let carol = fx.user("carol", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;

        let mut expired = orch.create(alice.id, request(&case, 1, 2)).await.unwrap();
        expired.expires_at = Utc::now() - ChronoDuration::seconds(1);
        {
            let mut tx = fx.store.begin().await.unwrap();
            tx.save_battle(&expired).await.unwrap();
            tx.commit().await.unwrap();
        }

        // A running battle whose worker never ran, as after a restart.
        let mut running = orch.create(bob.id, request(&case, 2, 2)).await.unwrap();
        {
            let mut tx = fx.store.begin().await.unwrap();
            let mut user = tx.user(carol.id).await.unwrap().unwrap();
            stake(&mut tx, &mut user, &running).await.unwrap();
            running.sessions.push(BattleSession::new(carol.id, "gamma"));
            let mut events = Vec::new();
            orch.start_in(&mut tx, &mut running, &mut events)
                .await
                .unwrap();
            tx.save_battle(&running).await.unwrap();
            tx.commit().await.unwrap();
        }

        let fresh = BattleOrchestrator::new(fx.engine.clone());
        let report = fresh.recover_battles().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.resumed, 1);
        fresh.wait_for_worker(running.id).await;

        assert_eq!(
            fresh.get(expired.id).await.unwrap().status,
            BattleStatus::Cancelled
        );
        let resumed = fresh.get(running.id).await.unwrap();
        assert_eq!(resumed.status, BattleStatus::Completed);
        assert!(resumed.sessions.iter().all(|s| s.rounds.len() == 2));
        assert_eq!(
            fx.store.snapshot().await.users[&alice.id].balance,
            dec("100")
        );
    }

    #[tokio::test]
    async fn recovery_keeps_going_when_an_expiry_fails() {
        let fx = fixture().await;
        let orch = orchestrator(&fx);
        let alice = fx.user("alice", "100").await;
        let bob = fx.user("bob", "100").await;
        let carol = fx.user("carol", "100").await;
        let case = fx.case("box", "10", CaseKind::Standard).await;

        let mut expired = orch.create(alice.id, request(&case, 1, 2)).await.unwrap();
        expired.expires_at = Utc::now() - ChronoDuration::seconds(1);
        {
            let mut tx = fx.store.begin().await.unwrap();
            tx.save_battle(&expired).await.unwrap();
            tx.commit().await.unwrap();
        }

        let mut running = orch.create(bob.id, request(&case, 2, 2)).await.unwrap();
        {
            let mut tx = fx.store.begin().await.unwrap();
            let mut user = tx.user(carol.id).await.unwrap().unwrap();
            stake(&mut tx, &mut user, &running).await.unwrap();
            running.sessions.push(BattleSession::new(carol.id, "gamma"));
            let mut events = Vec::new();
            orch.start_in(&mut tx, &mut running, &mut events)
                .await
                .unwrap();
            tx.save_battle(&running).await.unwrap();
            tx.commit().await.unwrap();
        }

        // The expired battle's refund is the first user write of recovery.
        fx.store.inject_fault(Some("save_user"), 0);
        let fresh = BattleOrchestrator::new(fx.engine.clone());
        let report = fresh.recover_battles().await.unwrap();
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.resumed, 1);

        fresh.wait_for_worker(running.id).await;
        assert_eq!(
            fresh.get(running.id).await.unwrap().status,
            BattleStatus::Completed
        );

        let mut status = BattleStatus::Pending;
        for _ in 0..200 {
            status = fresh.get(expired.id).await.unwrap().status;
            if status == BattleStatus::Cancelled {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, BattleStatus::Cancelled);
        assert_eq!(
            fx.store.snapshot().await.users[&alice.id].balance,
            dec("100")
        );
    }
}
