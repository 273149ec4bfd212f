pub mod battle;
pub mod case_opening;
pub mod dice_ledger;
pub mod event_bus;
pub mod odds_mapper;
pub mod randomness;

#[cfg(test)]
pub(crate) mod test_support;

pub use battle::BattleOrchestrator;
pub use case_opening::CaseOpeningEngine;
pub use dice_ledger::DiceLedger;
pub use event_bus::{BroadcastEventSink, EventSink};
pub use randomness::RandomnessPool;

use crate::db::Store;
use std::sync::Arc;

/// Start all background services
pub async fn start_background_services<S: Store>(
    seeds: Arc<RandomnessPool>,
    battles: Arc<BattleOrchestrator<S>>,
) {
    tracing::info!("Starting background services...");

    seeds.warm_up();

    match battles.recover_battles().await {
        Ok(report) => tracing::debug!("Recovered battles: {:?}", report),
        Err(e) => tracing::error!("Battle recovery failed: {}", e),
    }

    tracing::info!("All background services started successfully");
}
