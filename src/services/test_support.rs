use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

use super::{
    case_opening::CaseOpeningEngine,
    dice_ledger::DiceLedger,
    event_bus::RecordingEventSink,
    randomness::{LocalEntropyProvider, RandomnessPool},
};
use crate::{
    config::{test_config, Config},
    db::MemoryStore,
    models::{Case, CaseItem, CaseKind, User},
};

pub struct Fixture {
    pub store: MemoryStore,
    pub sink: RecordingEventSink,
    pub engine: CaseOpeningEngine<MemoryStore>,
    pub config: Config,
}

pub fn pool() -> Arc<RandomnessPool> {
    RandomnessPool::new(Arc::new(LocalEntropyProvider), 4, 8, Duration::from_millis(1))
}

pub async fn fixture() -> Fixture {
    let config = test_config();
    let store = MemoryStore::new();
    let sink = RecordingEventSink::default();
    let engine = CaseOpeningEngine::new(
        store.clone(),
        DiceLedger::new(pool()),
        Arc::new(sink.clone()),
        config.clone(),
    );
    Fixture {
        store,
        sink,
        engine,
        config,
    }
}

pub fn item(name: &str, value: &str, odd: &str) -> CaseItem {
    CaseItem {
        item_id: Uuid::new_v4(),
        name: name.to_string(),
        value: value.parse().unwrap(),
        odd: odd.parse().unwrap(),
    }
}

impl Fixture {
    pub async fn user(&self, name: &str, balance: &str) -> User {
        let user = User::new(name, balance.parse::<Decimal>().unwrap());
        self.store.seed(vec![user.clone()], vec![]).await;
        user
    }

    pub async fn case(&self, name: &str, price: &str, kind: CaseKind) -> Case {
        let mut case = Case::new(
            name,
            price.parse().unwrap(),
            vec![
                item("sticker", "0.50", "60"),
                item("knife", "12", "30"),
                item("gloves", "40", "10"),
            ],
        );
        case.kind = kind;
        self.store.seed(vec![], vec![case.clone()]).await;
        case
    }
}
