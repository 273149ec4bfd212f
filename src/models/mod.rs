// src/models/mod.rs
pub mod battle;
pub mod case;
pub mod dice;
pub mod user;

pub use battle::{Battle, BattleCase, BattleRoll, BattleSession, BattleStatus, RoundOutcome};
pub use case::{Case, CaseItem, CaseKind, CaseOpening, CaseStatsDelta, OddRangeBucket, WonItem};
pub use dice::{DiceSession, DiceStatus, PublicDiceSession, RollResult};
pub use user::{
    ApiResponse, FreeCaseClaim, Transaction, TransactionKind, User, UserItem, UserRole,
    UserStatsDelta,
};
