use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==================== CASE ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    Standard,
    Daily,
    Free,
}

impl CaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Daily => "daily",
            Self::Free => "free",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "daily" => Self::Daily,
            "free" => Self::Free,
            _ => Self::Standard,
        }
    }

    /// Daily and free cases are never charged.
    pub fn is_paid(self) -> bool {
        matches!(self, Self::Standard)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseItem {
    pub item_id: Uuid,
    pub name: String,
    pub value: Decimal,
    pub odd: Decimal,
}

/// Price window forced onto the first roll for influencer accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddRangeBucket {
    pub odd: Decimal,
    pub min_value: Decimal,
    pub max_value: Decimal,
}

impl OddRangeBucket {
    pub fn contains(&self, value: Decimal) -> bool {
        value >= self.min_value && value <= self.max_value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: Uuid,
    pub name: String,
    pub kind: CaseKind,
    pub price: Decimal,
    pub items: Vec<CaseItem>,
    /// Fraction of `price` credited to the creator per box.
    pub affiliate_cut: Decimal,
    pub creator_id: Option<Uuid>,
    pub enabled: bool,
    pub influencer_ranges: Vec<OddRangeBucket>,
    pub unbox_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Case {
    pub fn new(name: &str, price: Decimal, items: Vec<CaseItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: CaseKind::Standard,
            price,
            items,
            affiliate_cut: Decimal::ZERO,
            creator_id: None,
            enabled: true,
            influencer_ranges: Vec::new(),
            unbox_count: 0,
            created_at: Utc::now(),
        }
    }
}

// ==================== OPENING ====================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WonItem {
    pub nonce: u64,
    pub roll: Decimal,
    pub item_id: Uuid,
    pub name: String,
    pub value: Decimal,
    pub user_item_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseOpening {
    pub id: Uuid,
    pub case_id: Uuid,
    pub user_id: Uuid,
    pub dice_session_id: Uuid,
    pub nonces: Vec<u64>,
    pub won: Vec<WonItem>,
    /// Amount counted as wagered in the statistics for this opening.
    pub wagered: Decimal,
    pub testing: bool,
    pub battle_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CaseOpening {
    pub fn is_fully_rolled(&self) -> bool {
        self.won.len() == self.nonces.len()
    }

    pub fn result_for(&self, nonce: u64) -> Option<&WonItem> {
        self.won.iter().find(|w| w.nonce == nonce)
    }
}

// ==================== STATISTICS ====================
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaseStatsDelta {
    pub opens: i64,
    pub wagered: Decimal,
    pub paid_out: Decimal,
}

impl CaseStatsDelta {
    pub fn profit(&self) -> Decimal {
        self.wagered - self.paid_out
    }
}
