use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Randomness provider error: {0}")]
    ExternalAPI(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid odds configuration: {0}")]
    InvalidOdds(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dice session not found")]
    SessionNotFound,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Lifetime deposit of {required} required for this case")]
    DepositRequired { required: Decimal },

    #[error("Dice session already closed")]
    SessionAlreadyClosed,

    #[error("Too late to change seeds for this dice session")]
    TooLateToChange,

    #[error("Case is disabled")]
    CaseDisabled,

    #[error("Battle is not pending")]
    BattleNotPending,

    #[error("Battle is full")]
    BattleFull,

    #[error("Already joined this battle")]
    AlreadyJoined,

    #[error("Not a participant of this battle")]
    NotJoined,

    #[error("Already ready")]
    AlreadyReady,

    #[error("Only the battle creator can do this")]
    NotBattleCreator,

    #[error("Free case already used")]
    AlreadyUsedFreebox,

    #[error("Daily case already opened in the last 24 hours")]
    DailyCaseUsed,

    #[error("Account is flagged")]
    AccountFlagged,

    #[error("Internal inconsistency: {0}")]
    Inconsistency(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers that only care about the class of
/// failure (retry, show to user, cancel a battle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientFunds,
    StateConflict,
    AntiAbuse,
    InternalInconsistency,
    Infrastructure,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::BadRequest(_) | AppError::InvalidOdds(_) | AppError::AuthError(_) => {
                ErrorKind::Validation
            }
            AppError::DepositRequired { .. } => ErrorKind::Validation,
            AppError::NotFound(_) | AppError::SessionNotFound => ErrorKind::NotFound,
            AppError::InsufficientBalance => ErrorKind::InsufficientFunds,
            AppError::SessionAlreadyClosed
            | AppError::TooLateToChange
            | AppError::CaseDisabled
            | AppError::BattleNotPending
            | AppError::BattleFull
            | AppError::AlreadyJoined
            | AppError::NotJoined
            | AppError::AlreadyReady
            | AppError::NotBattleCreator => ErrorKind::StateConflict,
            AppError::AlreadyUsedFreebox | AppError::DailyCaseUsed | AppError::AccountFlagged => {
                ErrorKind::AntiAbuse
            }
            AppError::Inconsistency(_) => ErrorKind::InternalInconsistency,
            AppError::Database(_) | AppError::ExternalAPI(_) | AppError::Internal(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Key handed to the external translation layer.
    pub fn translation_key(&self) -> &'static str {
        match self {
            AppError::Database(_) => "errors.database",
            AppError::ExternalAPI(_) => "errors.randomness_provider",
            AppError::AuthError(_) => "errors.auth",
            AppError::BadRequest(_) => "errors.bad_request",
            AppError::InvalidOdds(_) => "errors.invalid_odds",
            AppError::NotFound(_) => "errors.not_found",
            AppError::SessionNotFound => "errors.session_not_found",
            AppError::InsufficientBalance => "errors.insufficient_balance",
            AppError::DepositRequired { .. } => "errors.deposit_required",
            AppError::SessionAlreadyClosed => "errors.session_already_closed",
            AppError::TooLateToChange => "errors.too_late_to_change",
            AppError::CaseDisabled => "errors.case_disabled",
            AppError::BattleNotPending => "errors.battle_not_pending",
            AppError::BattleFull => "errors.battle_full",
            AppError::AlreadyJoined => "errors.already_joined",
            AppError::NotJoined => "errors.not_joined",
            AppError::AlreadyReady => "errors.already_ready",
            AppError::NotBattleCreator => "errors.not_battle_creator",
            AppError::AlreadyUsedFreebox => "errors.already_used_freebox",
            AppError::DailyCaseUsed => "errors.daily_case_used",
            AppError::AccountFlagged => "errors.account_flagged",
            AppError::Inconsistency(_) => "errors.internal",
            AppError::Internal(_) => "errors.internal",
        }
    }

    // Parameters the translation layer interpolates into the message.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::DepositRequired { required } => {
                Some(serde_json::json!({ "required": required.to_string() }))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::ExternalAPI(e.to_string())
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::AntiAbuse => StatusCode::FORBIDDEN,
            ErrorKind::InternalInconsistency | ErrorKind::Infrastructure => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let status = match &self {
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            _ => status,
        };

        // Infrastructure failures are not echoed back verbatim.
        let message = match kind {
            ErrorKind::InternalInconsistency | ErrorKind::Infrastructure => {
                tracing::error!("Request failed: {}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: self.translation_key().to_string(),
                kind,
                message,
                details: self.details(),
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_taxonomy() {
        assert_eq!(AppError::InvalidOdds("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(AppError::SessionNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(AppError::InsufficientBalance.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(AppError::BattleFull.kind(), ErrorKind::StateConflict);
        assert_eq!(AppError::SessionAlreadyClosed.kind(), ErrorKind::StateConflict);
        assert_eq!(AppError::AlreadyUsedFreebox.kind(), ErrorKind::AntiAbuse);
        assert_eq!(
            AppError::Inconsistency("missing opening".into()).kind(),
            ErrorKind::InternalInconsistency
        );
    }

    #[test]
    fn insufficient_balance_maps_to_payment_required() {
        let response = AppError::InsufficientBalance.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn deposit_required_carries_translation_params() {
        let err = AppError::DepositRequired {
            required: Decimal::new(500, 2),
        };
        assert_eq!(err.translation_key(), "errors.deposit_required");
        assert_eq!(err.details(), Some(serde_json::json!({ "required": "5.00" })));
    }
}
