use crate::errors::ApiError;
use bean_ledger::{Account, GiftLink, GiftLinkState, UserRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Transfer request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct TransferRequest {
    #[validate(length(min = 1, max = 50))]
    pub to_user: String,
    #[validate(range(min = 1))]
    pub amount: i64,
    /// Create the recipient if it does not exist
    #[serde(default)]
    pub force: bool,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub message: String,
    pub entry_id: i64,
    pub amount: i64,
    pub to_user: String,
}

/// Gift link creation request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateGiftLinkRequest {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(max = 500))]
    pub message: Option<String>,
    /// `never`, `1h`, `24h`, `7d` or `30d`; empty means never
    #[serde(default)]
    pub expires_in: String,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct RedeemGiftLinkRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

/// What an unauthenticated visitor may see of a gift link
#[derive(Debug, Serialize)]
pub struct GiftLinkInfo {
    pub code: String,
    pub amount: i64,
    pub message: Option<String>,
    pub from_username: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub state: GiftLinkState,
    pub expired: bool,
}

impl From<&GiftLink> for GiftLinkInfo {
    fn from(link: &GiftLink) -> Self {
        Self {
            code: link.code.clone(),
            amount: link.amount,
            message: link.message.clone(),
            from_username: link.owner.clone(),
            expires_at: link.expires_at,
            state: link.state(),
            expired: link.is_expired(Utc::now()),
        }
    }
}

/// API token creation request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateTokenRequest {
    /// Lifetime such as `30m`, `24h` or `30d`
    #[validate(length(min = 2, max = 16))]
    pub expires_in: String,
}

/// Harvest create/update request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct HarvestRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub description: String,
    #[serde(alias = "bean_amount")]
    #[validate(range(min = 1))]
    pub reward: i64,
}

/// Harvest assignment, by id or by username
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct AssignHarvestRequest {
    pub user_id: Option<i64>,
    #[validate(length(min = 1, max = 50))]
    pub username: Option<String>,
}

impl AssignHarvestRequest {
    pub fn user_ref(&self) -> Result<UserRef, ApiError> {
        match (&self.username, self.user_id) {
            (Some(username), _) => Ok(UserRef::Username(username.clone())),
            (None, Some(id)) => Ok(UserRef::Id(id)),
            (None, None) => Err(ApiError::Validation(
                "either user_id or username is required".to_string(),
            )),
        }
    }
}

/// Administrative balance override
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct UpdateWalletRequest {
    #[serde(alias = "bean_amount")]
    #[validate(range(min = 0))]
    pub balance: i64,
}

#[derive(Debug, Deserialize)]
pub struct HarvestSearchQuery {
    #[serde(default)]
    pub q: String,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UserSearchQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub username: String,
    pub balance: i64,
}

impl From<Account> for WalletResponse {
    fn from(account: Account) -> Self {
        Self {
            username: account.username,
            balance: account.balance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub username: String,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub entries: Vec<LeaderboardEntry>,
    pub total: usize,
}

impl LeaderboardResponse {
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let entries: Vec<LeaderboardEntry> = accounts
            .into_iter()
            .enumerate()
            .map(|(i, account)| LeaderboardEntry {
                rank: i + 1,
                username: account.username,
                balance: account.balance,
            })
            .collect();
        let total = entries.len();
        Self { entries, total }
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
}
