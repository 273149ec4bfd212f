pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Postgres, Row,
};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{AppError, Result},
    models::*,
};

// ==================== UNIT OF WORK ====================

/// Source of units of work. Every financial sequence runs inside exactly one
/// unit of work obtained from here.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: UnitOfWork + 'static;

    async fn begin(&self) -> Result<Self::Tx>;
}

/// All-or-nothing unit over the engine's records. Reads of mutable records
/// lock them until the unit ends. Dropping a unit without calling
/// [`UnitOfWork::commit`] rolls every write back.
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    async fn user(&mut self, id: Uuid) -> Result<Option<User>>;
    async fn save_user(&mut self, user: &User) -> Result<()>;

    async fn case(&mut self, id: Uuid) -> Result<Option<Case>>;
    async fn save_case(&mut self, case: &Case) -> Result<()>;

    async fn dice_session(&mut self, id: Uuid) -> Result<Option<DiceSession>>;
    async fn save_dice_session(&mut self, session: &DiceSession) -> Result<()>;
    async fn delete_dice_session(&mut self, id: Uuid) -> Result<()>;

    async fn opening(&mut self, id: Uuid) -> Result<Option<CaseOpening>>;
    async fn save_opening(&mut self, opening: &CaseOpening) -> Result<()>;
    async fn delete_battle_openings(&mut self, battle_id: Uuid) -> Result<u64>;

    async fn insert_user_item(&mut self, item: &UserItem) -> Result<()>;
    async fn reassign_battle_items(&mut self, battle_id: Uuid, winner_id: Uuid) -> Result<u64>;
    async fn delete_battle_items(&mut self, battle_id: Uuid) -> Result<u64>;

    async fn battle(&mut self, id: Uuid) -> Result<Option<Battle>>;
    async fn save_battle(&mut self, battle: &Battle) -> Result<()>;
    async fn battles_by_status(&mut self, status: BattleStatus) -> Result<Vec<Battle>>;

    async fn insert_transaction(&mut self, tx: &Transaction) -> Result<()>;
    async fn transactions_by_reference(&mut self, reference_id: Uuid)
        -> Result<Vec<Transaction>>;

    /// Looks up the claim of `ip` on a free case. Serialises concurrent
    /// claims from the same address until the unit of work ends.
    async fn free_claim_by_ip(&mut self, case_id: Uuid, ip: &str)
        -> Result<Option<FreeCaseClaim>>;
    async fn free_claim_by_user(
        &mut self,
        case_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<FreeCaseClaim>>;
    /// Fails with [`AppError::AlreadyUsedFreebox`] when the user or the address
    /// already claimed the case.
    async fn insert_free_claim(&mut self, claim: &FreeCaseClaim) -> Result<()>;

    async fn bump_case_stats(&mut self, case_id: Uuid, delta: &CaseStatsDelta) -> Result<()>;
    async fn bump_user_stats(&mut self, user_id: Uuid, delta: &UserStatsDelta) -> Result<()>;

    async fn commit(self) -> Result<()>;
}

// ==================== POSTGRES ====================

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for Database {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> Result<PgUnitOfWork> {
        Ok(PgUnitOfWork {
            tx: self.pool.begin().await?,
        })
    }
}

pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

// Internal helper that converts stored BIGINT counters back to u64.
fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| AppError::Inconsistency(format!("negative {}", field)))
}

// Internal helper that converts u64 counters for BIGINT columns.
fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| AppError::Inconsistency(format!("{} out of range", field)))
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        role: UserRole::parse(row.try_get::<String, _>("role")?.as_str()),
        balance: row.try_get("balance")?,
        earnings: row.try_get("earnings")?,
        total_deposited: row.try_get("total_deposited")?,
        last_daily_open_at: row.try_get("last_daily_open_at")?,
        flagged: row.try_get("flagged")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn case_from_row(row: &PgRow) -> Result<Case> {
    Ok(Case {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: CaseKind::parse(row.try_get::<String, _>("kind")?.as_str()),
        price: row.try_get("price")?,
        items: row.try_get::<Json<Vec<CaseItem>>, _>("items")?.0,
        affiliate_cut: row.try_get("affiliate_cut")?,
        creator_id: row.try_get("creator_id")?,
        enabled: row.try_get("enabled")?,
        influencer_ranges: row
            .try_get::<Json<Vec<OddRangeBucket>>, _>("influencer_ranges")?
            .0,
        unbox_count: row.try_get("unbox_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn dice_from_row(row: &PgRow) -> Result<DiceSession> {
    Ok(DiceSession {
        id: row.try_get("id")?,
        server_seed: row.try_get("server_seed")?,
        server_seed_hash: row.try_get("server_seed_hash")?,
        client_seed: row.try_get("client_seed")?,
        index: to_u64(row.try_get("nonce_index")?, "nonce_index")?,
        status: DiceStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        battle_id: row.try_get("battle_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn opening_from_row(row: &PgRow) -> Result<CaseOpening> {
    Ok(CaseOpening {
        id: row.try_get("id")?,
        case_id: row.try_get("case_id")?,
        user_id: row.try_get("user_id")?,
        dice_session_id: row.try_get("dice_session_id")?,
        nonces: row.try_get::<Json<Vec<u64>>, _>("nonces")?.0,
        won: row.try_get::<Json<Vec<WonItem>>, _>("won")?.0,
        wagered: row.try_get("wagered")?,
        testing: row.try_get("testing")?,
        battle_id: row.try_get("battle_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn battle_from_row(row: &PgRow) -> Result<Battle> {
    Ok(Battle {
        id: row.try_get("id")?,
        creator_id: row.try_get("creator_id")?,
        cases: row.try_get::<Json<Vec<BattleCase>>, _>("cases")?.0,
        sessions: row.try_get::<Json<Vec<BattleSession>>, _>("sessions")?.0,
        capacity: row.try_get::<i32, _>("capacity")? as u32,
        current_round: row.try_get::<i32, _>("current_round")? as u32,
        total_rounds: row.try_get::<i32, _>("total_rounds")? as u32,
        price: row.try_get("price")?,
        status: BattleStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        dice_session_id: row.try_get("dice_session_id")?,
        winner_id: row.try_get("winner_id")?,
        tie_break_roll: row.try_get("tie_break_roll")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let kind: String = row.try_get("kind")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| AppError::Inconsistency(format!("unknown transaction kind {}", kind)))?,
        amount: row.try_get("amount")?,
        reference_id: row.try_get("reference_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}

fn free_claim_from_row(row: &PgRow) -> Result<FreeCaseClaim> {
    Ok(FreeCaseClaim {
        user_id: row.try_get("user_id")?,
        case_id: row.try_get("case_id")?,
        ip: row.try_get("ip")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    // ==================== USER QUERIES ====================
    async fn user(&mut self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_user(&mut self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users
                (id, username, role, balance, earnings, total_deposited,
                 last_daily_open_at, flagged, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,NOW())
            ON CONFLICT (id) DO UPDATE
            SET username           = EXCLUDED.username,
                role               = EXCLUDED.role,
                balance            = EXCLUDED.balance,
                earnings           = EXCLUDED.earnings,
                total_deposited    = EXCLUDED.total_deposited,
                last_daily_open_at = EXCLUDED.last_daily_open_at,
                flagged            = EXCLUDED.flagged,
                updated_at         = NOW()
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(user.balance)
        .bind(user.earnings)
        .bind(user.total_deposited)
        .bind(user.last_daily_open_at)
        .bind(user.flagged)
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // ==================== CASE QUERIES ====================
    async fn case(&mut self, id: Uuid) -> Result<Option<Case>> {
        let row = sqlx::query("SELECT * FROM cases WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(case_from_row).transpose()
    }

    async fn save_case(&mut self, case: &Case) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cases
                (id, name, kind, price, items, affiliate_cut, creator_id,
                 enabled, influencer_ranges, unbox_count, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (id) DO UPDATE
            SET name              = EXCLUDED.name,
                kind              = EXCLUDED.kind,
                price             = EXCLUDED.price,
                items             = EXCLUDED.items,
                affiliate_cut     = EXCLUDED.affiliate_cut,
                creator_id        = EXCLUDED.creator_id,
                enabled           = EXCLUDED.enabled,
                influencer_ranges = EXCLUDED.influencer_ranges,
                unbox_count       = EXCLUDED.unbox_count
            "#,
        )
        .bind(case.id)
        .bind(&case.name)
        .bind(case.kind.as_str())
        .bind(case.price)
        .bind(Json(&case.items))
        .bind(case.affiliate_cut)
        .bind(case.creator_id)
        .bind(case.enabled)
        .bind(Json(&case.influencer_ranges))
        .bind(case.unbox_count)
        .bind(case.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // ==================== DICE QUERIES ====================
    async fn dice_session(&mut self, id: Uuid) -> Result<Option<DiceSession>> {
        let row = sqlx::query("SELECT * FROM dice_sessions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(dice_from_row).transpose()
    }

    async fn save_dice_session(&mut self, session: &DiceSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dice_sessions
                (id, server_seed, server_seed_hash, client_seed, nonce_index,
                 status, battle_id, created_at, completed_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (id) DO UPDATE
            SET server_seed      = EXCLUDED.server_seed,
                server_seed_hash = EXCLUDED.server_seed_hash,
                client_seed      = EXCLUDED.client_seed,
                nonce_index      = GREATEST(dice_sessions.nonce_index, EXCLUDED.nonce_index),
                status           = EXCLUDED.status,
                battle_id        = EXCLUDED.battle_id,
                completed_at     = EXCLUDED.completed_at
            "#,
        )
        .bind(session.id)
        .bind(&session.server_seed)
        .bind(&session.server_seed_hash)
        .bind(&session.client_seed)
        .bind(to_i64(session.index, "nonce_index")?)
        .bind(session.status.as_str())
        .bind(session.battle_id)
        .bind(session.created_at)
        .bind(session.completed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_dice_session(&mut self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM dice_sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ==================== OPENING QUERIES ====================
    async fn opening(&mut self, id: Uuid) -> Result<Option<CaseOpening>> {
        let row = sqlx::query("SELECT * FROM case_openings WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(opening_from_row).transpose()
    }

    async fn save_opening(&mut self, opening: &CaseOpening) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO case_openings
                (id, case_id, user_id, dice_session_id, nonces, won,
                 wagered, testing, battle_id, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (id) DO UPDATE
            SET won       = EXCLUDED.won,
                battle_id = EXCLUDED.battle_id
            "#,
        )
        .bind(opening.id)
        .bind(opening.case_id)
        .bind(opening.user_id)
        .bind(opening.dice_session_id)
        .bind(Json(&opening.nonces))
        .bind(Json(&opening.won))
        .bind(opening.wagered)
        .bind(opening.testing)
        .bind(opening.battle_id)
        .bind(opening.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_battle_openings(&mut self, battle_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM case_openings WHERE battle_id = $1")
            .bind(battle_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== INVENTORY QUERIES ====================
    async fn insert_user_item(&mut self, item: &UserItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_items
                (id, owner_id, item_id, name, value, opening_id, battle_id, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(item.id)
        .bind(item.owner_id)
        .bind(item.item_id)
        .bind(&item.name)
        .bind(item.value)
        .bind(item.opening_id)
        .bind(item.battle_id)
        .bind(item.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn reassign_battle_items(&mut self, battle_id: Uuid, winner_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_items SET owner_id = $2 WHERE battle_id = $1 AND owner_id <> $2",
        )
        .bind(battle_id)
        .bind(winner_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_battle_items(&mut self, battle_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_items WHERE battle_id = $1")
            .bind(battle_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== BATTLE QUERIES ====================
    async fn battle(&mut self, id: Uuid) -> Result<Option<Battle>> {
        let row = sqlx::query("SELECT * FROM battles WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(battle_from_row).transpose()
    }

    async fn save_battle(&mut self, battle: &Battle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO battles
                (id, creator_id, cases, sessions, capacity, current_round,
                 total_rounds, price, status, dice_session_id, winner_id,
                 tie_break_roll, created_at, expires_at, started_at, finished_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            ON CONFLICT (id) DO UPDATE
            SET sessions       = EXCLUDED.sessions,
                current_round  = GREATEST(battles.current_round, EXCLUDED.current_round),
                status         = EXCLUDED.status,
                winner_id      = EXCLUDED.winner_id,
                tie_break_roll = EXCLUDED.tie_break_roll,
                started_at     = EXCLUDED.started_at,
                finished_at    = EXCLUDED.finished_at
            "#,
        )
        .bind(battle.id)
        .bind(battle.creator_id)
        .bind(Json(&battle.cases))
        .bind(Json(&battle.sessions))
        .bind(battle.capacity as i32)
        .bind(battle.current_round as i32)
        .bind(battle.total_rounds as i32)
        .bind(battle.price)
        .bind(battle.status.as_str())
        .bind(battle.dice_session_id)
        .bind(battle.winner_id)
        .bind(battle.tie_break_roll)
        .bind(battle.created_at)
        .bind(battle.expires_at)
        .bind(battle.started_at)
        .bind(battle.finished_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn battles_by_status(&mut self, status: BattleStatus) -> Result<Vec<Battle>> {
        let rows = sqlx::query("SELECT * FROM battles WHERE status = $1 ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(battle_from_row).collect()
    }

    // ==================== LEDGER QUERIES ====================
    async fn insert_transaction(&mut self, tx: &Transaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO transactions (id, user_id, kind, amount, reference_id, created_at)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(tx.id)
        .bind(tx.user_id)
        .bind(tx.kind.as_str())
        .bind(tx.amount)
        .bind(tx.reference_id)
        .bind(tx.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn transactions_by_reference(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE reference_id = $1 ORDER BY created_at ASC",
        )
        .bind(reference_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    // ==================== FREE CASE QUERIES ====================
    async fn free_claim_by_ip(
        &mut self,
        case_id: Uuid,
        ip: &str,
    ) -> Result<Option<FreeCaseClaim>> {
        // Serialises claims per case and address until commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || '/' || $2, 0))")
            .bind(case_id.to_string())
            .bind(ip)
            .execute(&mut *self.tx)
            .await?;
        let row = sqlx::query(
            "SELECT * FROM free_case_claims WHERE case_id = $1 AND ip = $2
             ORDER BY claimed_at ASC LIMIT 1",
        )
        .bind(case_id)
        .bind(ip)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(free_claim_from_row).transpose()
    }

    async fn free_claim_by_user(
        &mut self,
        case_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<FreeCaseClaim>> {
        let row = sqlx::query(
            "SELECT * FROM free_case_claims WHERE case_id = $1 AND user_id = $2 LIMIT 1",
        )
        .bind(case_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(free_claim_from_row).transpose()
    }

    async fn insert_free_claim(&mut self, claim: &FreeCaseClaim) -> Result<()> {
        sqlx::query(
            "INSERT INTO free_case_claims (user_id, case_id, ip, claimed_at)
             VALUES ($1,$2,$3,$4)",
        )
        .bind(claim.user_id)
        .bind(claim.case_id)
        .bind(&claim.ip)
        .bind(claim.claimed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::AlreadyUsedFreebox
            } else {
                AppError::Database(e)
            }
        })?;
        Ok(())
    }

    // ==================== STATISTICS QUERIES ====================
    async fn bump_case_stats(&mut self, case_id: Uuid, delta: &CaseStatsDelta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO case_stats (case_id, opens, wagered, paid_out, profit)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (case_id) DO UPDATE
            SET opens      = case_stats.opens    + EXCLUDED.opens,
                wagered    = case_stats.wagered  + EXCLUDED.wagered,
                paid_out   = case_stats.paid_out + EXCLUDED.paid_out,
                profit     = case_stats.profit   + EXCLUDED.profit,
                updated_at = NOW()
            "#,
        )
        .bind(case_id)
        .bind(delta.opens)
        .bind(delta.wagered)
        .bind(delta.paid_out)
        .bind(delta.profit())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn bump_user_stats(&mut self, user_id: Uuid, delta: &UserStatsDelta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_stats (user_id, opens, wagered, won)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET opens      = user_stats.opens   + EXCLUDED.opens,
                wagered    = user_stats.wagered + EXCLUDED.wagered,
                won        = user_stats.won     + EXCLUDED.won,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(delta.opens)
        .bind(delta.wagered)
        .bind(delta.won)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
