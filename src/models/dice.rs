use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiceStatus {
    Active,
    Completed,
}

impl DiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => Self::Completed,
            _ => Self::Active,
        }
    }
}

/// Stored form of a commitment sequence. Never serialised to clients
/// directly; use [`DiceSession::public`].
#[derive(Debug, Clone)]
pub struct DiceSession {
    pub id: Uuid,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub index: u64,
    pub status: DiceStatus,
    pub battle_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DiceSession {
    pub fn is_completed(&self) -> bool {
        self.status == DiceStatus::Completed
    }

    pub fn public(&self) -> PublicDiceSession {
        PublicDiceSession {
            id: self.id,
            server_seed_hash: self.server_seed_hash.clone(),
            client_seed: self.client_seed.clone(),
            index: self.index,
            status: self.status,
            server_seed: self.is_completed().then(|| self.server_seed.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicDiceSession {
    pub id: Uuid,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub index: u64,
    pub status: DiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollResult {
    pub nonces: Vec<u64>,
    pub values: Vec<Decimal>,
    pub server_seed_hash: String,
    pub client_seed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: DiceStatus) -> DiceSession {
        DiceSession {
            id: Uuid::new_v4(),
            server_seed: "secret".to_string(),
            server_seed_hash: "hash".to_string(),
            client_seed: "client".to_string(),
            index: 0,
            status,
            battle_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn public_projection_hides_seed_while_active() {
        let public = session(DiceStatus::Active).public();
        assert!(public.server_seed.is_none());
        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn public_projection_reveals_seed_once_completed() {
        let public = session(DiceStatus::Completed).public();
        assert_eq!(public.server_seed.as_deref(), Some("secret"));
    }
}
