use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl BattleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Forward-only lifecycle.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleCase {
    pub case_id: Uuid,
    pub count: u32,
}

/// One case entry opened for a player at start: the opening record and the
/// nonces reserved for it, one per round of that entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleRoll {
    pub opening_id: Uuid,
    pub case_id: Uuid,
    pub nonces: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: u32,
    pub nonce: u64,
    pub roll: Decimal,
    pub item_id: Uuid,
    pub name: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleSession {
    pub user_id: Uuid,
    pub seed: String,
    pub winnings: Decimal,
    pub ready: bool,
    pub joined_at: DateTime<Utc>,
    pub rolls: Vec<BattleRoll>,
    pub rounds: Vec<RoundOutcome>,
}

impl BattleSession {
    pub fn new(user_id: Uuid, seed: &str) -> Self {
        Self {
            user_id,
            seed: seed.to_string(),
            winnings: Decimal::ZERO,
            ready: false,
            joined_at: Utc::now(),
            rolls: Vec::new(),
            rounds: Vec::new(),
        }
    }

    pub fn roll_for_nonce(&self, nonce: u64) -> Option<&BattleRoll> {
        self.rolls.iter().find(|r| r.nonces.contains(&nonce))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battle {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub cases: Vec<BattleCase>,
    pub sessions: Vec<BattleSession>,
    pub capacity: u32,
    pub current_round: u32,
    pub total_rounds: u32,
    /// Stake paid by every player.
    pub price: Decimal,
    pub status: BattleStatus,
    pub dice_session_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub tie_break_roll: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Battle {
    pub fn new(
        creator_id: Uuid,
        creator_seed: &str,
        cases: Vec<BattleCase>,
        capacity: u32,
        price: Decimal,
        dice_session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let total_rounds = cases.iter().map(|c| c.count).sum();
        Self {
            id: Uuid::new_v4(),
            creator_id,
            cases,
            sessions: vec![BattleSession::new(creator_id, creator_seed)],
            capacity,
            current_round: 0,
            total_rounds,
            price,
            status: BattleStatus::Pending,
            dice_session_id,
            winner_id: None,
            tie_break_roll: None,
            created_at: Utc::now(),
            expires_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn player_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() as u32 >= self.capacity
    }

    pub fn all_ready(&self) -> bool {
        self.sessions.iter().all(|s| s.ready)
    }

    pub fn should_start(&self) -> bool {
        self.sessions.len() > 1 && (self.is_full() || self.all_ready())
    }

    pub fn session(&self, user_id: Uuid) -> Option<&BattleSession> {
        self.sessions.iter().find(|s| s.user_id == user_id)
    }

    pub fn session_mut(&mut self, user_id: Uuid) -> Option<&mut BattleSession> {
        self.sessions.iter_mut().find(|s| s.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.creator_id == user_id || self.session(user_id).is_some()
    }

    /// Client seed committed on the battle's dice session.
    pub fn combined_client_seed(&self) -> String {
        self.sessions.iter().map(|s| s.seed.as_str()).collect()
    }

    /// Total of all stakes currently held by the battle.
    pub fn pot(&self) -> Decimal {
        self.price * Decimal::from(self.sessions.len() as u64)
    }

    pub fn transition(&mut self, next: BattleStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Inconsistency(format!(
                "invalid battle transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        let now = Utc::now();
        match next {
            BattleStatus::Running => self.started_at = Some(now),
            BattleStatus::Completed | BattleStatus::Cancelled => self.finished_at = Some(now),
            BattleStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    /// Case entry (index into `cases`) that round `round` belongs to.
    pub fn case_entry_for_round(&self, round: u32) -> Option<usize> {
        let mut first = 0;
        for (idx, entry) in self.cases.iter().enumerate() {
            if round < first + entry.count {
                return Some(idx);
            }
            first += entry.count;
        }
        None
    }

    /// Rounds covered by case entry `entry`, in order.
    pub fn rounds_for_entry(&self, entry: usize) -> std::ops::Range<u32> {
        let first: u32 = self.cases.iter().take(entry).map(|c| c.count).sum();
        let count = self.cases.get(entry).map(|c| c.count).unwrap_or(0);
        first..first + count
    }

    /// Round-robin interleaving: round `r`, player `i` of `n` rolls nonce
    /// `r * n + i + 1`, so no two players ever share a nonce.
    pub fn nonce_for(&self, round: u32, player_index: usize) -> u64 {
        let n = self.sessions.len() as u64;
        u64::from(round) * n + player_index as u64 + 1
    }

    /// First nonce after every round nonce, reserved for the tie-break roll.
    pub fn tie_break_nonce(&self) -> u64 {
        u64::from(self.total_rounds) * self.sessions.len() as u64 + 1
    }

    /// Number of rounds already resolved for every player.
    pub fn rounds_resolved(&self) -> u32 {
        self.sessions
            .iter()
            .map(|s| s.rounds.len() as u32)
            .min()
            .unwrap_or(0)
    }

    /// Moves the round cursor after `round` has been resolved. Rounds are
    /// strictly sequential and the cursor stops at `total_rounds - 1`.
    pub fn mark_round_resolved(&mut self, round: u32) -> Result<()> {
        if round >= self.total_rounds || round != self.current_round {
            return Err(AppError::Inconsistency(format!(
                "round {} out of order (current {}, total {})",
                round, self.current_round, self.total_rounds
            )));
        }
        self.current_round = (round + 1).min(self.total_rounds.saturating_sub(1));
        Ok(())
    }

    pub fn is_final_round(&self, round: u32) -> bool {
        round + 1 >= self.total_rounds
    }
}
