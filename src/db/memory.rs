use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::{
    error::{AppError, Result},
    models::*,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub users: HashMap<Uuid, User>,
    pub cases: HashMap<Uuid, Case>,
    pub dice_sessions: HashMap<Uuid, DiceSession>,
    pub openings: HashMap<Uuid, CaseOpening>,
    pub user_items: Vec<UserItem>,
    pub battles: HashMap<Uuid, Battle>,
    pub transactions: Vec<Transaction>,
    pub free_claims: Vec<FreeCaseClaim>,
    pub case_stats: HashMap<Uuid, CaseStatsDelta>,
    pub user_stats: HashMap<Uuid, UserStatsDelta>,
}

#[derive(Debug)]
struct FaultPlan {
    operation: Option<&'static str>,
    skip: usize,
}

/// In-process store. Units of work are serialised behind one async mutex and
/// edit a working copy that replaces the shared state on commit.
///
/// Tests can arm a one-shot fault that fails the n-th matching write.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fault: Arc<StdMutex<Option<FaultPlan>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the write after `skip` matching writes have gone through.
    /// `operation = None` matches every write.
    pub fn inject_fault(&self, operation: Option<&'static str>, skip: usize) {
        if let Ok(mut fault) = self.fault.lock() {
            *fault = Some(FaultPlan { operation, skip });
        }
    }

    /// Whether an injected fault is still waiting to fire.
    pub fn fault_armed(&self) -> bool {
        self.fault.lock().map(|f| f.is_some()).unwrap_or(false)
    }

    pub fn clear_fault(&self) {
        if let Ok(mut fault) = self.fault.lock() {
            *fault = None;
        }
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Seeds records outside of any unit of work.
    pub async fn seed(&self, users: Vec<User>, cases: Vec<Case>) {
        let mut state = self.state.lock().await;
        for user in users {
            state.users.insert(user.id, user);
        }
        for case in cases {
            state.cases.insert(case.id, case);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self) -> Result<MemoryUnitOfWork> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryUnitOfWork {
            guard,
            working,
            fault: self.fault.clone(),
        })
    }
}

pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fault: Arc<StdMutex<Option<FaultPlan>>>,
}

impl MemoryUnitOfWork {
    // Internal helper that fires an armed fault for `operation`.
    fn write(&mut self, operation: &'static str) -> Result<()> {
        let mut fault = self
            .fault
            .lock()
            .map_err(|_| AppError::Internal("fault plan poisoned".to_string()))?;
        let fire = match fault.as_mut() {
            Some(plan) if plan.operation.map_or(true, |op| op == operation) => {
                if plan.skip == 0 {
                    true
                } else {
                    plan.skip -= 1;
                    false
                }
            }
            _ => false,
        };
        if fire {
            *fault = None;
            return Err(AppError::Internal(format!("injected fault at {}", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn user(&mut self, id: Uuid) -> Result<Option<User>> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn save_user(&mut self, user: &User) -> Result<()> {
        self.write("save_user")?;
        self.working.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn case(&mut self, id: Uuid) -> Result<Option<Case>> {
        Ok(self.working.cases.get(&id).cloned())
    }

    async fn save_case(&mut self, case: &Case) -> Result<()> {
        self.write("save_case")?;
        self.working.cases.insert(case.id, case.clone());
        Ok(())
    }

    async fn dice_session(&mut self, id: Uuid) -> Result<Option<DiceSession>> {
        Ok(self.working.dice_sessions.get(&id).cloned())
    }

    async fn save_dice_session(&mut self, session: &DiceSession) -> Result<()> {
        self.write("save_dice_session")?;
        let mut session = session.clone();
        if let Some(existing) = self.working.dice_sessions.get(&session.id) {
            session.index = session.index.max(existing.index);
        }
        self.working.dice_sessions.insert(session.id, session);
        Ok(())
    }

    async fn delete_dice_session(&mut self, id: Uuid) -> Result<()> {
        self.write("delete_dice_session")?;
        self.working.dice_sessions.remove(&id);
        Ok(())
    }

    async fn opening(&mut self, id: Uuid) -> Result<Option<CaseOpening>> {
        Ok(self.working.openings.get(&id).cloned())
    }

    async fn save_opening(&mut self, opening: &CaseOpening) -> Result<()> {
        self.write("save_opening")?;
        self.working.openings.insert(opening.id, opening.clone());
        Ok(())
    }

    async fn delete_battle_openings(&mut self, battle_id: Uuid) -> Result<u64> {
        self.write("delete_battle_openings")?;
        let before = self.working.openings.len();
        self.working
            .openings
            .retain(|_, o| o.battle_id != Some(battle_id));
        Ok((before - self.working.openings.len()) as u64)
    }

    async fn insert_user_item(&mut self, item: &UserItem) -> Result<()> {
        self.write("insert_user_item")?;
        self.working.user_items.push(item.clone());
        Ok(())
    }

    async fn reassign_battle_items(&mut self, battle_id: Uuid, winner_id: Uuid) -> Result<u64> {
        self.write("reassign_battle_items")?;
        let mut moved = 0;
        for item in self
            .working
            .user_items
            .iter_mut()
            .filter(|i| i.battle_id == Some(battle_id) && i.owner_id != winner_id)
        {
            item.owner_id = winner_id;
            moved += 1;
        }
        Ok(moved)
    }

    async fn delete_battle_items(&mut self, battle_id: Uuid) -> Result<u64> {
        self.write("delete_battle_items")?;
        let before = self.working.user_items.len();
        self.working
            .user_items
            .retain(|i| i.battle_id != Some(battle_id));
        Ok((before - self.working.user_items.len()) as u64)
    }

    async fn battle(&mut self, id: Uuid) -> Result<Option<Battle>> {
        Ok(self.working.battles.get(&id).cloned())
    }

    async fn save_battle(&mut self, battle: &Battle) -> Result<()> {
        self.write("save_battle")?;
        self.working.battles.insert(battle.id, battle.clone());
        Ok(())
    }

    async fn battles_by_status(&mut self, status: BattleStatus) -> Result<Vec<Battle>> {
        let mut battles: Vec<Battle> = self
            .working
            .battles
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        battles.sort_by_key(|b| b.created_at);
        Ok(battles)
    }

    async fn insert_transaction(&mut self, tx: &Transaction) -> Result<()> {
        self.write("insert_transaction")?;
        self.working.transactions.push(tx.clone());
        Ok(())
    }

    async fn transactions_by_reference(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Vec<Transaction>> {
        Ok(self
            .working
            .transactions
            .iter()
            .filter(|t| t.reference_id == reference_id)
            .cloned()
            .collect())
    }

    async fn free_claim_by_ip(
        &mut self,
        case_id: Uuid,
        ip: &str,
    ) -> Result<Option<FreeCaseClaim>> {
        Ok(self
            .working
            .free_claims
            .iter()
            .find(|c| c.case_id == case_id && c.ip == ip)
            .cloned())
    }

    async fn free_claim_by_user(
        &mut self,
        case_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<FreeCaseClaim>> {
        Ok(self
            .working
            .free_claims
            .iter()
            .find(|c| c.case_id == case_id && c.user_id == user_id)
            .cloned())
    }

    async fn insert_free_claim(&mut self, claim: &FreeCaseClaim) -> Result<()> {
        self.write("insert_free_claim")?;
        let taken = self.working.free_claims.iter().any(|c| {
            c.case_id == claim.case_id && (c.user_id == claim.user_id || c.ip == claim.ip)
        });
        if taken {
            return Err(AppError::AlreadyUsedFreebox);
        }
        self.working.free_claims.push(claim.clone());
        Ok(())
    }

    async fn bump_case_stats(&mut self, case_id: Uuid, delta: &CaseStatsDelta) -> Result<()> {
        self.write("bump_case_stats")?;
        let stats = self.working.case_stats.entry(case_id).or_default();
        stats.opens += delta.opens;
        stats.wagered += delta.wagered;
        stats.paid_out += delta.paid_out;
        Ok(())
    }

    async fn bump_user_stats(&mut self, user_id: Uuid, delta: &UserStatsDelta) -> Result<()> {
        self.write("bump_user_stats")?;
        let stats = self.working.user_stats.entry(user_id).or_default();
        stats.opens += delta.opens;
        stats.wagered += delta.wagered;
        stats.won += delta.won;
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}
