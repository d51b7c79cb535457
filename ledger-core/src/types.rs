//! Core types for the ledger
//!
//! Amounts are whole beans (`i64`). Rows map one-to-one onto the tables in
//! `migrations/`; joined usernames are carried alongside foreign keys so the
//! outer layers never need a second lookup.

use crate::{LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Reserved account that holds escrowed beans and signs harvest payouts
pub const SYSTEM_ACCOUNT: &str = "system";

/// Beans minted into a wallet the first time it is materialized
pub const SIGNUP_BONUS: i64 = 1;

/// Longest accepted username, in characters
pub const MAX_USERNAME_LEN: usize = 50;

/// Check the shape of a username: 1-50 characters, no whitespace or control characters.
pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if len == 0 || len > MAX_USERNAME_LEN {
        return Err(LedgerError::InvalidUsername(format!(
            "username must be 1-{} characters",
            MAX_USERNAME_LEN
        )));
    }

    if username
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(LedgerError::InvalidUsername(format!(
            "username contains whitespace or control characters: {:?}",
            username
        )));
    }

    Ok(())
}

/// Like [`validate_username`], and additionally refuses the reserved escrow name.
pub fn validate_user_facing(username: &str) -> Result<()> {
    validate_username(username)?;
    if username == SYSTEM_ACCOUNT {
        return Err(LedgerError::InvalidUsername(format!(
            "{} is a reserved account",
            SYSTEM_ACCOUNT
        )));
    }
    Ok(())
}

/// A named balance holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one completed movement of beans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub from_user: String,
    pub to_user: String,
    pub amount: i64,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether `username` is on either side of the entry
    pub fn involves(&self, username: &str) -> bool {
        self.from_user == username || self.to_user == username
    }
}

/// Derived lifecycle state of a gift link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiftLinkState {
    Active,
    Redeemed,
    Inactive,
}

impl fmt::Display for GiftLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GiftLinkState::Active => write!(f, "active"),
            GiftLinkState::Redeemed => write!(f, "redeemed"),
            GiftLinkState::Inactive => write!(f, "inactive"),
        }
    }
}

/// Escrow-backed claimable link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GiftLink {
    pub id: i64,
    pub code: String,
    pub owner_id: i64,
    pub owner: String,
    pub amount: i64,
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by_id: Option<i64>,
    pub redeemed_by: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GiftLink {
    /// Lifecycle state. Redemption wins over deactivation since both are terminal.
    pub fn state(&self) -> GiftLinkState {
        if self.redeemed_at.is_some() {
            GiftLinkState::Redeemed
        } else if !self.active {
            GiftLinkState::Inactive
        } else {
            GiftLinkState::Active
        }
    }

    /// Whether the link's expiry, if any, lies before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }
}

/// Symbolic gift-link lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryPolicy {
    Never,
    OneHour,
    OneDay,
    SevenDays,
    ThirtyDays,
}

impl ExpiryPolicy {
    /// Parse `""`, `"never"`, `"1h"`, `"24h"`, `"7d"` or `"30d"`.
    ///
    /// Anything else is rejected rather than silently treated as "never".
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim() {
            "" | "never" => Ok(ExpiryPolicy::Never),
            "1h" => Ok(ExpiryPolicy::OneHour),
            "24h" => Ok(ExpiryPolicy::OneDay),
            "7d" => Ok(ExpiryPolicy::SevenDays),
            "30d" => Ok(ExpiryPolicy::ThirtyDays),
            other => Err(LedgerError::InvalidExpiry(format!(
                "unsupported expiry {:?}, expected one of never, 1h, 24h, 7d, 30d",
                other
            ))),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            ExpiryPolicy::Never => None,
            ExpiryPolicy::OneHour => Some(Duration::hours(1)),
            ExpiryPolicy::OneDay => Some(Duration::hours(24)),
            ExpiryPolicy::SevenDays => Some(Duration::days(7)),
            ExpiryPolicy::ThirtyDays => Some(Duration::days(30)),
        }
    }

    /// Concrete expiry timestamp relative to `now`
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now + d)
    }
}

/// Derived lifecycle state of a harvest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestState {
    Created,
    Assigned,
    Completed,
}

/// Task paying a fixed reward to its assignee on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Harvest {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub reward: i64,
    pub assigned_account_id: Option<i64>,
    pub assigned_user: Option<String>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Harvest {
    pub fn state(&self) -> HarvestState {
        if self.completed {
            HarvestState::Completed
        } else if self.assigned_account_id.is_some() {
            HarvestState::Assigned
        } else {
            HarvestState::Created
        }
    }
}

/// Reference to an account by primary key or by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Id(i64),
    Username(String),
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRef::Id(id) => write!(f, "#{}", id),
            UserRef::Username(name) => write!(f, "{}", name),
        }
    }
}

/// One page of a harvest search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestPage {
    pub harvests: Vec<Harvest>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl HarvestPage {
    pub fn new(harvests: Vec<Harvest>, total: i64, page: i64, limit: i64) -> Self {
        let total_pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
        Self {
            harvests,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// Stored API token metadata; the credential itself is never listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ApiToken {
    pub id: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A freshly issued bearer credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gift(active: bool, redeemed: bool, expires_at: Option<DateTime<Utc>>) -> GiftLink {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        GiftLink {
            id: 1,
            code: "code".into(),
            owner_id: 1,
            owner: "alice".into(),
            amount: 10,
            message: None,
            expires_at,
            redeemed_at: redeemed.then_some(now),
            redeemed_by_id: redeemed.then_some(2),
            redeemed_by: redeemed.then(|| "bob".to_string()),
            active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a").is_ok());
        assert!(validate_username(&"x".repeat(50)).is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username(&"x".repeat(51)).is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username("bob\n").is_err());
        assert!(validate_username(SYSTEM_ACCOUNT).is_ok());
        assert!(validate_user_facing(SYSTEM_ACCOUNT).is_err());
    }

    #[test]
    fn test_expiry_policy_parse() {
        assert_eq!(ExpiryPolicy::parse("").unwrap(), ExpiryPolicy::Never);
        assert_eq!(ExpiryPolicy::parse("never").unwrap(), ExpiryPolicy::Never);
        assert_eq!(ExpiryPolicy::parse("1h").unwrap(), ExpiryPolicy::OneHour);
        assert_eq!(ExpiryPolicy::parse("24h").unwrap(), ExpiryPolicy::OneDay);
        assert_eq!(ExpiryPolicy::parse("7d").unwrap(), ExpiryPolicy::SevenDays);
        assert_eq!(ExpiryPolicy::parse("30d").unwrap(), ExpiryPolicy::ThirtyDays);
        assert!(matches!(
            ExpiryPolicy::parse("2w"),
            Err(LedgerError::InvalidExpiry(_))
        ));
        assert!(ExpiryPolicy::parse("forever").is_err());
    }

    #[test]
    fn test_expiry_policy_timestamps() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(ExpiryPolicy::Never.expires_at(now), None);
        assert_eq!(
            ExpiryPolicy::SevenDays.expires_at(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_gift_link_state() {
        assert_eq!(gift(true, false, None).state(), GiftLinkState::Active);
        assert_eq!(gift(false, true, None).state(), GiftLinkState::Redeemed);
        assert_eq!(gift(false, false, None).state(), GiftLinkState::Inactive);
    }

    #[test]
    fn test_gift_link_expiry() {
        let deadline = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let link = gift(true, false, Some(deadline));
        assert!(!link.is_expired(deadline));
        assert!(link.is_expired(deadline + Duration::seconds(1)));
        assert!(!gift(true, false, None).is_expired(deadline));
    }

    #[test]
    fn test_harvest_page_math() {
        assert_eq!(HarvestPage::new(vec![], 0, 1, 20).total_pages, 0);
        assert_eq!(HarvestPage::new(vec![], 20, 1, 20).total_pages, 1);
        assert_eq!(HarvestPage::new(vec![], 21, 1, 20).total_pages, 2);
    }
}
