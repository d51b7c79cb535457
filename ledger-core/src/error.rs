//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Coarse classification used by outer layers to map errors to responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller supplied bad input; never retried
    Validation,
    /// Referenced entity does not exist
    NotFound,
    /// Legitimate state or ordering conflict
    Conflict,
    /// Credential or signature rejected
    Integrity,
    /// Store, serialization or configuration failure
    Infrastructure,
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    // Validation
    #[error("amount must be positive")]
    InvalidAmount,

    #[error("cannot transfer to yourself")]
    SelfTransfer,

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("invalid export data")]
    InvalidExport,

    #[error("validation error: {0}")]
    Validation(String),

    // Not found
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("gift link not found")]
    GiftLinkNotFound,

    #[error("harvest not found: {0}")]
    HarvestNotFound(i64),

    #[error("token not found: {0}")]
    TokenNotFound(i64),

    // State conflicts
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("insufficient balance to create gift link: required {required}, available {available}")]
    InsufficientBalanceForGift { required: i64, available: i64 },

    #[error("gift link has already been redeemed")]
    GiftLinkRedeemed,

    #[error("gift link has expired")]
    GiftLinkExpired,

    #[error("gift link is not active")]
    GiftLinkInactive,

    #[error("cannot redeem your own gift link")]
    CannotRedeemOwnLink,

    #[error("cannot delete gift link you don't own")]
    NotGiftLinkOwner,

    #[error("harvest already completed: {0}")]
    HarvestAlreadyCompleted(i64),

    #[error("harvest has no assigned user: {0}")]
    NoAssignedUser(i64),

    #[error("token expired")]
    ExpiredToken,

    // Infrastructure
    #[error("failed to generate unique gift code after {0} attempts")]
    CodeGenerationExhausted(u32),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("token signing error: {0}")]
    Signing(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Classify the error for the caller
    pub fn class(&self) -> ErrorClass {
        use LedgerError::*;

        match self {
            InvalidAmount | SelfTransfer | InvalidUsername(_) | InvalidExpiry(_)
            | InvalidExport | Validation(_) => ErrorClass::Validation,

            InvalidToken | ExpiredToken => ErrorClass::Integrity,

            UserNotFound(_) | RecipientNotFound(_) | GiftLinkNotFound | HarvestNotFound(_)
            | TokenNotFound(_) => ErrorClass::NotFound,

            InsufficientBalance { .. }
            | InsufficientBalanceForGift { .. }
            | GiftLinkRedeemed
            | GiftLinkExpired
            | GiftLinkInactive
            | CannotRedeemOwnLink
            | NotGiftLinkOwner
            | HarvestAlreadyCompleted(_)
            | NoAssignedUser(_) => ErrorClass::Conflict,

            CodeGenerationExhausted(_) | Database(_) | Migration(_) | Serialization(_)
            | Signing(_) | Config(_) | Io(_) => ErrorClass::Infrastructure,
        }
    }

    /// Stable snake_case identifier, used as the `type` field of API errors
    pub fn kind(&self) -> &'static str {
        use LedgerError::*;

        match self {
            InvalidAmount => "invalid_amount",
            SelfTransfer => "self_transfer",
            InvalidUsername(_) => "invalid_username",
            InvalidExpiry(_) => "invalid_expiry",
            InvalidToken => "invalid_token",
            InvalidExport => "invalid_export",
            Validation(_) => "validation_error",
            UserNotFound(_) => "user_not_found",
            RecipientNotFound(_) => "recipient_not_found",
            GiftLinkNotFound => "gift_link_not_found",
            HarvestNotFound(_) => "harvest_not_found",
            TokenNotFound(_) => "token_not_found",
            InsufficientBalance { .. } => "insufficient_balance",
            InsufficientBalanceForGift { .. } => "insufficient_balance_for_gift",
            GiftLinkRedeemed => "gift_link_redeemed",
            GiftLinkExpired => "gift_link_expired",
            GiftLinkInactive => "gift_link_inactive",
            CannotRedeemOwnLink => "cannot_redeem_own_link",
            NotGiftLinkOwner => "not_gift_link_owner",
            HarvestAlreadyCompleted(_) => "harvest_already_completed",
            NoAssignedUser(_) => "no_assigned_user",
            ExpiredToken => "expired_token",
            CodeGenerationExhausted(_) => "code_generation_failed",
            Database(_) => "database_error",
            Migration(_) => "migration_error",
            Serialization(_) => "serialization_error",
            Signing(_) => "signing_error",
            Config(_) => "config_error",
            Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(LedgerError::InvalidAmount.class(), ErrorClass::Validation);
        assert_eq!(LedgerError::SelfTransfer.class(), ErrorClass::Validation);
        assert_eq!(
            LedgerError::UserNotFound("alice".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            LedgerError::InsufficientBalance {
                required: 20,
                available: 10
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(LedgerError::ExpiredToken.class(), ErrorClass::Integrity);
        assert_eq!(
            LedgerError::Config("missing".into()).class(),
            ErrorClass::Infrastructure
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            LedgerError::NotGiftLinkOwner.to_string(),
            "cannot delete gift link you don't own"
        );
        assert_eq!(
            LedgerError::InsufficientBalance {
                required: 20,
                available: 10
            }
            .to_string(),
            "insufficient balance: required 20, available 10"
        );
        assert_eq!(LedgerError::GiftLinkRedeemed.kind(), "gift_link_redeemed");
    }
}
