use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    dice_ledger::DiceLedger,
    event_bus::{DomainEvent, EventSink},
    odds_mapper::{OddOverridePolicy, OddsTable},
};
use crate::{
    config::Config,
    constants::{EVENT_CASE_OPENED, EVENT_USER_BALANCE, MONEY_DP},
    db::{Store, UnitOfWork},
    error::{AppError, Result},
    models::{
        Case, CaseItem, CaseKind, CaseOpening, CaseStatsDelta, FreeCaseClaim, PublicDiceSession,
        RollResult, Transaction, TransactionKind, User, UserItem, UserRole, UserStatsDelta,
        WonItem,
    },
};

/// Where the rolls of an opening come from.
#[derive(Debug, Clone)]
pub enum DiceSource {
    /// Fresh single-use session; nonces `1..=count`, rolled and revealed at once.
    NewSession { client_seed: String },
    /// Roll the given nonces of an existing session now.
    Existing {
        session_id: Uuid,
        nonces: Vec<u64>,
        complete: bool,
    },
    /// Reserve nonces of an existing session; rolled later through
    /// [`CaseOpeningEngine::roll_opening_in`].
    Reserved { session_id: Uuid, nonces: Vec<u64> },
}

#[derive(Debug, Clone)]
pub struct OpenCaseRequest {
    pub user_id: Uuid,
    pub case_id: Uuid,
    pub count: u32,
    pub dice: DiceSource,
    pub ip: Option<String>,
    pub testing: bool,
    pub battle_id: Option<Uuid>,
}

impl OpenCaseRequest {
    pub fn new(user_id: Uuid, case_id: Uuid, count: u32, client_seed: &str) -> Self {
        Self {
            user_id,
            case_id,
            count,
            dice: DiceSource::NewSession {
                client_seed: client_seed.to_string(),
            },
            ip: None,
            testing: false,
            battle_id: None,
        }
    }

    fn is_battle(&self) -> bool {
        self.battle_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpeningOutcome {
    pub opening_id: Uuid,
    pub case_id: Uuid,
    pub dice_session: PublicDiceSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll: Option<RollResult>,
    pub items: Vec<WonItem>,
    pub balance: Decimal,
}

pub struct CaseOpeningEngine<S: Store> {
    store: S,
    ledger: DiceLedger,
    events: Arc<dyn EventSink>,
    config: Config,
}

impl<S: Store> Clone for CaseOpeningEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> CaseOpeningEngine<S> {
    pub fn new(store: S, ledger: DiceLedger, events: Arc<dyn EventSink>, config: Config) -> Self {
        Self {
            store,
            ledger,
            events,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &DiceLedger {
        &self.ledger
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a case in its own unit of work and dispatches events on commit.
    pub async fn open_case(&self, request: OpenCaseRequest) -> Result<OpeningOutcome> {
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        match self.open_case_in(&mut tx, &request, &mut events).await {
            Ok(outcome) => {
                tx.commit().await?;
                self.events.dispatch(events);
                Ok(outcome)
            }
            Err(AppError::AlreadyUsedFreebox) => {
                drop(tx);
                if let Some(ip) = request.ip.as_deref() {
                    self.flag_shared_ip(request.case_id, request.user_id, ip)
                        .await?;
                }
                Err(AppError::AlreadyUsedFreebox)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a case inside the caller's unit of work. Nothing is committed
    /// and no event is dispatched; events are appended to `events`.
    pub async fn open_case_in(
        &self,
        tx: &mut S::Tx,
        request: &OpenCaseRequest,
        events: &mut Vec<DomainEvent>,
    ) -> Result<OpeningOutcome> {
        let mut user = tx
            .user(request.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        if user.flagged {
            return Err(AppError::AccountFlagged);
        }
        let mut case = tx
            .case(request.case_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Case not found".to_string()))?;
        if !case.enabled {
            return Err(AppError::CaseDisabled);
        }
        OddsTable::build(&case.items)?;
        self.check_count(&case, request.count)?;

        if request.testing && user.role != UserRole::Admin && case.creator_id != Some(user.id) {
            return Err(AppError::AuthError(
                "Testing opens are limited to the case creator".to_string(),
            ));
        }

        let now = Utc::now();
        let opening_id = Uuid::new_v4();
        let grants = !request.testing;

        match case.kind {
            CaseKind::Daily if grants => {
                let cooldown = ChronoDuration::hours(self.config.daily_case_cooldown_hours);
                if user
                    .last_daily_open_at
                    .is_some_and(|last| now - last < cooldown)
                {
                    return Err(AppError::DailyCaseUsed);
                }
                if user.total_deposited < self.config.daily_case_min_deposit {
                    return Err(AppError::DepositRequired {
                        required: self.config.daily_case_min_deposit,
                    });
                }
                user.last_daily_open_at = Some(now);
            }
            CaseKind::Free if grants => {
                let ip = request
                    .ip
                    .as_deref()
                    .ok_or_else(|| AppError::BadRequest("Client IP required".to_string()))?;
                if tx.free_claim_by_user(case.id, user.id).await?.is_some() {
                    return Err(AppError::AlreadyUsedFreebox);
                }
                if tx.free_claim_by_ip(case.id, ip).await?.is_some() {
                    return Err(AppError::AlreadyUsedFreebox);
                }
                tx.insert_free_claim(&FreeCaseClaim {
                    user_id: user.id,
                    case_id: case.id,
                    ip: ip.to_string(),
                    claimed_at: now,
                })
                .await?;
            }
            _ => {}
        }

        let cost = case.price * Decimal::from(request.count);
        let charged = case.kind.is_paid() && grants && !request.is_battle();
        if charged {
            if user.balance < cost {
                return Err(AppError::InsufficientBalance);
            }
            user.balance -= cost;
            tx.insert_transaction(&Transaction::new(
                user.id,
                TransactionKind::CaseOpen,
                -cost,
                opening_id,
            ))
            .await?;
        }
        user.updated_at = now;
        tx.save_user(&user).await?;
        if charged {
            events.push(balance_event(&user));
        }

        if grants {
            self.credit_creator(tx, &case, &user, cost, opening_id, events)
                .await?;
            case.unbox_count += i64::from(request.count);
            tx.save_case(&case).await?;
        }

        let (dice_session_id, nonces, roll_now) = match &request.dice {
            DiceSource::NewSession { client_seed } => {
                let session = self
                    .ledger
                    .create_session(tx, client_seed, request.battle_id)
                    .await?;
                (session.id, (1..=u64::from(request.count)).collect(), Some(true))
            }
            DiceSource::Existing {
                session_id,
                nonces,
                complete,
            } => (*session_id, nonces.clone(), Some(*complete)),
            DiceSource::Reserved { session_id, nonces } => (*session_id, nonces.clone(), None),
        };
        if nonces.len() != request.count as usize {
            return Err(AppError::BadRequest(format!(
                "Expected {} nonces, got {}",
                request.count,
                nonces.len()
            )));
        }
        if !matches!(request.dice, DiceSource::NewSession { .. }) {
            check_fresh_nonces(tx, dice_session_id, &nonces).await?;
        }

        let wagered = if grants && case.kind.is_paid() {
            cost
        } else {
            Decimal::ZERO
        };
        let mut opening = CaseOpening {
            id: opening_id,
            case_id: case.id,
            user_id: user.id,
            dice_session_id,
            nonces: nonces.clone(),
            won: Vec::new(),
            wagered,
            testing: request.testing,
            battle_id: request.battle_id,
            created_at: now,
        };
        tx.save_opening(&opening).await?;

        if grants {
            tx.bump_case_stats(
                case.id,
                &CaseStatsDelta {
                    opens: i64::from(request.count),
                    wagered,
                    paid_out: Decimal::ZERO,
                },
            )
            .await?;
            tx.bump_user_stats(
                user.id,
                &UserStatsDelta {
                    opens: i64::from(request.count),
                    wagered,
                    won: Decimal::ZERO,
                },
            )
            .await?;
        }

        let roll = match roll_now {
            Some(complete) => Some(
                self.roll_into(tx, &mut opening, &case, user.role, &nonces, complete)
                    .await?,
            ),
            None => None,
        };

        let dice_session = tx
            .dice_session(dice_session_id)
            .await?
            .ok_or(AppError::SessionNotFound)?
            .public();

        if roll.is_some() && !request.is_battle() && !request.testing {
            events.push(DomainEvent::global(
                EVENT_CASE_OPENED,
                serde_json::json!({
                    "opening_id": opening.id,
                    "case_id": case.id,
                    "case_name": case.name,
                    "user_id": user.id,
                    "username": user.username,
                    "items": opening.won,
                }),
            ));
        }

        tracing::info!(
            "Case {} opened x{} by {} (opening {}, testing={})",
            case.id,
            request.count,
            user.id,
            opening.id,
            request.testing
        );

        Ok(OpeningOutcome {
            opening_id: opening.id,
            case_id: case.id,
            dice_session,
            roll,
            items: opening.won,
            balance: user.balance,
        })
    }

    /// Rolls reserved nonces of an existing opening and records the outcome.
    pub async fn roll_opening_in(
        &self,
        tx: &mut S::Tx,
        opening_id: Uuid,
        nonces: &[u64],
        complete: bool,
    ) -> Result<Vec<WonItem>> {
        let mut opening = tx
            .opening(opening_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Case opening not found".to_string()))?;
        if let Some(nonce) = nonces.iter().find(|n| !opening.nonces.contains(n)) {
            return Err(AppError::Inconsistency(format!(
                "nonce {} is not reserved by opening {}",
                nonce, opening.id
            )));
        }
        if let Some(nonce) = nonces.iter().find(|&&n| opening.result_for(n).is_some()) {
            return Err(AppError::Inconsistency(format!(
                "nonce {} of opening {} already rolled",
                nonce, opening.id
            )));
        }
        let case = tx
            .case(opening.case_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Case not found".to_string()))?;
        let role = tx
            .user(opening.user_id)
            .await?
            .map(|u| u.role)
            .unwrap_or(UserRole::Regular);

        let before = opening.won.len();
        self.roll_into(tx, &mut opening, &case, role, nonces, complete)
            .await?;
        Ok(opening.won[before..].to_vec())
    }

    // Internal helper that rolls, resolves and persists won items.
    async fn roll_into(
        &self,
        tx: &mut S::Tx,
        opening: &mut CaseOpening,
        case: &Case,
        role: UserRole,
        nonces: &[u64],
        complete: bool,
    ) -> Result<RollResult> {
        let table = OddsTable::build(&case.items)?;
        let policy =
            OddOverridePolicy::for_opener(role, case, self.config.influencer_override_enabled);
        let roll = self
            .ledger
            .roll_result(tx, opening.dice_session_id, nonces, complete)
            .await?;

        let picks: Vec<CaseItem> = {
            let mut rng = rand::rng();
            nonces
                .iter()
                .zip(&roll.values)
                .map(|(nonce, value)| {
                    let position = opening
                        .nonces
                        .iter()
                        .position(|n| n == nonce)
                        .unwrap_or(usize::MAX);
                    table.resolve_with(*value, position, &policy, &mut rng).clone()
                })
                .collect()
        };

        let mut paid_out = Decimal::ZERO;
        for ((nonce, value), item) in nonces.iter().zip(&roll.values).zip(picks) {
            let user_item_id = if opening.testing {
                None
            } else {
                let user_item = UserItem {
                    id: Uuid::new_v4(),
                    owner_id: opening.user_id,
                    item_id: item.item_id,
                    name: item.name.clone(),
                    value: item.value,
                    opening_id: opening.id,
                    battle_id: opening.battle_id,
                    created_at: Utc::now(),
                };
                tx.insert_user_item(&user_item).await?;
                paid_out += item.value;
                Some(user_item.id)
            };
            opening.won.push(WonItem {
                nonce: *nonce,
                roll: *value,
                item_id: item.item_id,
                name: item.name,
                value: item.value,
                user_item_id,
            });
        }
        tx.save_opening(opening).await?;

        if !opening.testing {
            tx.bump_case_stats(
                case.id,
                &CaseStatsDelta {
                    opens: 0,
                    wagered: Decimal::ZERO,
                    paid_out,
                },
            )
            .await?;
            tx.bump_user_stats(
                opening.user_id,
                &UserStatsDelta {
                    opens: 0,
                    wagered: Decimal::ZERO,
                    won: paid_out,
                },
            )
            .await?;
        }
        Ok(roll)
    }

    fn check_count(&self, case: &Case, count: u32) -> Result<()> {
        let max = if case.kind.is_paid() {
            self.config.max_open_count
        } else {
            1
        };
        if count == 0 || count > max {
            return Err(AppError::BadRequest(format!(
                "Open count must be between 1 and {}",
                max
            )));
        }
        Ok(())
    }

    async fn credit_creator(
        &self,
        tx: &mut S::Tx,
        case: &Case,
        opener: &User,
        cost: Decimal,
        opening_id: Uuid,
        events: &mut Vec<DomainEvent>,
    ) -> Result<()> {
        let creator_id = match case.creator_id {
            Some(id) if id != opener.id => id,
            _ => return Ok(()),
        };
        // Ledger columns hold cents, so the credit is truncated to them
        let credit =
            (cost * case.affiliate_cut).round_dp_with_strategy(MONEY_DP, RoundingStrategy::ToZero);
        if credit <= Decimal::ZERO {
            return Ok(());
        }
        let Some(mut creator) = tx.user(creator_id).await? else {
            tracing::warn!("Creator {} of case {} not found", creator_id, case.id);
            return Ok(());
        };
        creator.earnings += credit;
        creator.updated_at = Utc::now();
        tx.save_user(&creator).await?;
        tx.insert_transaction(&Transaction::new(
            creator.id,
            TransactionKind::AffiliateCredit,
            credit,
            opening_id,
        ))
        .await?;
        events.push(balance_event(&creator));
        Ok(())
    }

    /// Takes an opening back out of the books before it is purged: reverses
    /// the creator credit with a ledger row and subtracts the opening from the
    /// case and statistics counters. The opener's own funds are left to the
    /// caller.
    pub async fn reverse_opening_in(
        &self,
        tx: &mut S::Tx,
        opening_id: Uuid,
        events: &mut Vec<DomainEvent>,
    ) -> Result<()> {
        let Some(opening) = tx.opening(opening_id).await? else {
            return Ok(());
        };
        if opening.testing {
            return Ok(());
        }

        let credits: Vec<Transaction> = tx
            .transactions_by_reference(opening.id)
            .await?
            .into_iter()
            .filter(|t| t.kind == TransactionKind::AffiliateCredit)
            .collect();
        for credit in credits {
            let Some(mut creator) = tx.user(credit.user_id).await? else {
                tracing::warn!(
                    "Creator {} of opening {} not found, credit kept",
                    credit.user_id,
                    opening.id
                );
                continue;
            };
            creator.earnings -= credit.amount;
            creator.updated_at = Utc::now();
            tx.save_user(&creator).await?;
            tx.insert_transaction(&Transaction::new(
                creator.id,
                TransactionKind::AffiliateReversal,
                -credit.amount,
                opening.id,
            ))
            .await?;
            events.push(balance_event(&creator));
        }

        let opens = opening.nonces.len() as i64;
        if let Some(mut case) = tx.case(opening.case_id).await? {
            case.unbox_count -= opens;
            tx.save_case(&case).await?;
        }
        let paid_out: Decimal = opening
            .won
            .iter()
            .filter(|w| w.user_item_id.is_some())
            .map(|w| w.value)
            .sum();
        tx.bump_case_stats(
            opening.case_id,
            &CaseStatsDelta {
                opens: -opens,
                wagered: -opening.wagered,
                paid_out: -paid_out,
            },
        )
        .await?;
        tx.bump_user_stats(
            opening.user_id,
            &UserStatsDelta {
                opens: -opens,
                wagered: -opening.wagered,
                won: -paid_out,
            },
        )
        .await?;
        tracing::debug!("Reversed opening {} of case {}", opening.id, opening.case_id);
        Ok(())
    }

    // Flags the opener when another account already claimed the free case
    // from the same address. Runs in its own unit of work.
    async fn flag_shared_ip(&self, case_id: Uuid, user_id: Uuid, ip: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let shared = tx
            .free_claim_by_ip(case_id, ip)
            .await?
            .is_some_and(|claim| claim.user_id != user_id);
        if !shared {
            return Ok(());
        }
        let Some(mut user) = tx.user(user_id).await? else {
            return Ok(());
        };
        user.flagged = true;
        user.updated_at = Utc::now();
        tx.save_user(&user).await?;
        tx.commit().await?;
        tracing::warn!(
            "User {} flagged: free case {} already claimed from {}",
            user_id,
            case_id,
            ip
        );
        Ok(())
    }
}

// Nonces of a shared session must be unused so a known outcome cannot be
// replayed.
async fn check_fresh_nonces<U: UnitOfWork>(
    tx: &mut U,
    session_id: Uuid,
    nonces: &[u64],
) -> Result<()> {
    let session = tx
        .dice_session(session_id)
        .await?
        .ok_or(AppError::SessionNotFound)?;
    if session.is_completed() {
        return Err(AppError::SessionAlreadyClosed);
    }
    let mut sorted = nonces.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != nonces.len() {
        return Err(AppError::BadRequest("Duplicate nonces".to_string()));
    }
    if sorted.first().is_some_and(|&n| n <= session.index) {
        return Err(AppError::BadRequest(format!(
            "Nonces must be above {}",
            session.index
        )));
    }
    Ok(())
}

pub(crate) fn balance_event(user: &User) -> DomainEvent {
    DomainEvent::to_user(
        EVENT_USER_BALANCE,
        user.id,
        serde_json::json!({ "balance": user.balance, "earnings": user.earnings }),
    )
}
