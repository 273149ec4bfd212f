use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==================== USER ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Regular,
    Influencer,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Influencer => "influencer",
            Self::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "influencer" => Self::Influencer,
            "admin" => Self::Admin,
            _ => Self::Regular,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub balance: Decimal,
    pub earnings: Decimal,
    pub total_deposited: Decimal,
    pub last_daily_open_at: Option<DateTime<Utc>>,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role: UserRole::Regular,
            balance,
            earnings: Decimal::ZERO,
            total_deposited: Decimal::ZERO,
            last_daily_open_at: None,
            flagged: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ==================== INVENTORY ====================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub item_id: Uuid,
    pub name: String,
    pub value: Decimal,
    pub opening_id: Uuid,
    pub battle_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ==================== LEDGER ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    CaseOpen,
    BattleStake,
    BattleRefund,
    AffiliateCredit,
    /// Takes back a creator credit when its opening is purged.
    AffiliateReversal,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaseOpen => "case_open",
            Self::BattleStake => "battle_stake",
            Self::BattleRefund => "battle_refund",
            Self::AffiliateCredit => "affiliate_credit",
            Self::AffiliateReversal => "affiliate_reversal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "case_open" => Some(Self::CaseOpen),
            "battle_stake" => Some(Self::BattleStake),
            "battle_refund" => Some(Self::BattleRefund),
            "affiliate_credit" => Some(Self::AffiliateCredit),
            "affiliate_reversal" => Some(Self::AffiliateReversal),
            _ => None,
        }
    }
}

/// One signed balance movement. Debits are negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub reference_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(user_id: Uuid, kind: TransactionKind, amount: Decimal, reference_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            reference_id,
            created_at: Utc::now(),
        }
    }
}

// ==================== FREE CASE ====================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeCaseClaim {
    pub user_id: Uuid,
    pub case_id: Uuid,
    pub ip: String,
    pub claimed_at: DateTime<Utc>,
}

// ==================== STATISTICS ====================
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserStatsDelta {
    pub opens: i64,
    pub wagered: Decimal,
    pub won: Decimal,
}

// ==================== API RESPONSE ====================
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
