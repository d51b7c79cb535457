//! Gift-link escrow
//!
//! Creating a link moves its amount from the owner into the reserved
//! [`SYSTEM_ACCOUNT`]; redeeming releases it to the redeemer and deleting
//! refunds the owner. Every state change locks the gift-link row before any
//! account row, and runs the bean movement through
//! [`TransferEngine::transfer_in_tx`] on the same transaction as the link
//! update.

use crate::storage::LedgerStore;
use crate::transfer::{RecipientPolicy, Transfer, TransferEngine};
use crate::types::{validate_username, ExpiryPolicy, GiftLink, SYSTEM_ACCOUNT};
use crate::{LedgerError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use sqlx::postgres::PgConnection;
use tracing::{debug, info, warn};

/// Random bytes per gift code
pub const CODE_BYTES: usize = 32;

const GIFT_SELECT: &str = r#"
    SELECT g.id, g.code, g.owner_id, o.username AS owner, g.amount, g.message,
           g.expires_at, g.redeemed_at, g.redeemed_by_id, r.username AS redeemed_by,
           g.active, g.created_at, g.updated_at
    FROM gift_links g
    JOIN accounts o ON o.id = g.owner_id
    LEFT JOIN accounts r ON r.id = g.redeemed_by_id
"#;

/// Draw a fresh URL-safe gift code from the OS RNG
pub fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Gift-link escrow
#[derive(Debug, Clone)]
pub struct GiftLinkEscrow {
    store: LedgerStore,
    code_attempts: u32,
}

impl GiftLinkEscrow {
    pub fn new(store: LedgerStore, code_attempts: u32) -> Self {
        Self {
            store,
            code_attempts: code_attempts.max(1),
        }
    }

    /// Escrow `amount` of the owner's beans behind a new claimable code
    pub async fn create(
        &self,
        owner: &str,
        amount: i64,
        message: Option<&str>,
        expiry: ExpiryPolicy,
    ) -> Result<GiftLink> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        validate_username(owner)?;

        // Early rejection only; the locked re-check in the transfer is authoritative.
        let account = self
            .store
            .find_account(owner)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(owner.to_string()))?;
        if account.balance < amount {
            return Err(LedgerError::InsufficientBalanceForGift {
                required: amount,
                available: account.balance,
            });
        }

        let code = self.unique_code().await?;
        let expires_at = expiry.expires_at(Utc::now());
        let message = message.filter(|m| !m.is_empty());

        let mut tx = self.store.begin().await?;

        let escrow = Transfer::new(owner, SYSTEM_ACCOUNT, amount)
            .recipient(RecipientPolicy::CreateIfMissing)
            .note(Some("Gift link escrow"));
        TransferEngine::transfer_in_tx(&mut tx, escrow)
            .await
            .map_err(|e| match e {
                LedgerError::InsufficientBalance {
                    required,
                    available,
                } => LedgerError::InsufficientBalanceForGift {
                    required,
                    available,
                },
                other => other,
            })?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO gift_links (code, owner_id, amount, message, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&code)
        .bind(account.id)
        .bind(amount)
        .bind(message)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        let link = Self::fetch_by_id(&mut tx, id, false)
            .await?
            .ok_or(LedgerError::GiftLinkNotFound)?;

        tx.commit().await?;

        info!(
            "Gift link {} created by {} escrowing {} bean(s), expires {:?}",
            link.id, owner, amount, link.expires_at
        );
        Ok(link)
    }

    /// Release the escrowed beans to `redeemer`
    pub async fn redeem(&self, code: &str, redeemer: &str) -> Result<GiftLink> {
        validate_username(redeemer)?;

        let mut tx = self.store.begin().await?;

        let link = Self::fetch_by_code(&mut tx, code, true)
            .await?
            .ok_or(LedgerError::GiftLinkNotFound)?;

        if let Err(e) = check_redeemable(&link, redeemer) {
            debug!("Redemption of gift link {} by {} refused: {}", link.id, redeemer, e);
            return Err(e);
        }

        let release = Transfer::new(SYSTEM_ACCOUNT, redeemer, link.amount)
            .recipient(RecipientPolicy::CreateIfMissing)
            .note(Some("Gift link redeemed"));
        TransferEngine::transfer_in_tx(&mut tx, release).await?;

        sqlx::query(
            r#"
            UPDATE gift_links
            SET redeemed_at = NOW(),
                redeemed_by_id = (SELECT id FROM accounts WHERE username = $2),
                active = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(link.id)
        .bind(redeemer)
        .execute(&mut *tx)
        .await?;

        let redeemed = Self::fetch_by_id(&mut tx, link.id, false)
            .await?
            .ok_or(LedgerError::GiftLinkNotFound)?;

        tx.commit().await?;

        info!(
            "Gift link {} redeemed by {} for {} bean(s)",
            redeemed.id, redeemer, redeemed.amount
        );
        Ok(redeemed)
    }

    /// Deactivate a link, refunding the owner if it was never redeemed.
    ///
    /// Deleting a link that is already inactive changes nothing.
    pub async fn delete(&self, id: i64, requester: &str) -> Result<GiftLink> {
        let mut tx = self.store.begin().await?;

        let link = Self::fetch_by_id(&mut tx, id, true)
            .await?
            .ok_or(LedgerError::GiftLinkNotFound)?;

        if link.owner != requester {
            warn!("{} tried to delete gift link {} owned by {}", requester, id, link.owner);
            return Err(LedgerError::NotGiftLinkOwner);
        }

        if !link.active {
            debug!("Gift link {} already inactive", id);
            return Ok(link);
        }

        let refund = link.redeemed_at.is_none();
        if refund {
            let transfer = Transfer::new(SYSTEM_ACCOUNT, &link.owner, link.amount)
                .recipient(RecipientPolicy::CreateIfMissing)
                .note(Some("Gift link refunded"));
            TransferEngine::transfer_in_tx(&mut tx, transfer).await?;
        }

        sqlx::query("UPDATE gift_links SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let deleted = Self::fetch_by_id(&mut tx, id, false)
            .await?
            .ok_or(LedgerError::GiftLinkNotFound)?;

        tx.commit().await?;

        if refund {
            info!(
                "Gift link {} deleted, refunded {} bean(s) to {}",
                id, deleted.amount, deleted.owner
            );
        } else {
            info!("Gift link {} deactivated", id);
        }
        Ok(deleted)
    }

    /// Active links owned by `owner`, newest first
    pub async fn list(&self, owner: &str) -> Result<Vec<GiftLink>> {
        if self.store.find_account(owner).await?.is_none() {
            return Err(LedgerError::UserNotFound(owner.to_string()));
        }

        let sql = format!(
            "{} WHERE o.username = $1 AND g.active ORDER BY g.created_at DESC, g.id DESC",
            GIFT_SELECT
        );
        let links = sqlx::query_as::<_, GiftLink>(&sql)
            .bind(owner)
            .fetch_all(self.store.pool())
            .await?;
        Ok(links)
    }

    pub async fn get_by_code(&self, code: &str) -> Result<GiftLink> {
        let mut conn = self.store.pool().acquire().await?;
        Self::fetch_by_code(&mut conn, code, false)
            .await?
            .ok_or(LedgerError::GiftLinkNotFound)
    }

    async fn unique_code(&self) -> Result<String> {
        for attempt in 1..=self.code_attempts {
            let code = generate_code();
            let taken: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM gift_links WHERE code = $1)")
                    .bind(&code)
                    .fetch_one(self.store.pool())
                    .await?;
            if !taken {
                return Ok(code);
            }
            warn!("Gift code collision on attempt {}", attempt);
        }
        Err(LedgerError::CodeGenerationExhausted(self.code_attempts))
    }

    async fn fetch_by_code(
        conn: &mut PgConnection,
        code: &str,
        for_update: bool,
    ) -> Result<Option<GiftLink>> {
        let sql = format!("{} WHERE g.code = $1{}", GIFT_SELECT, lock_clause(for_update));
        let link = sqlx::query_as::<_, GiftLink>(&sql)
            .bind(code)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(link)
    }

    async fn fetch_by_id(
        conn: &mut PgConnection,
        id: i64,
        for_update: bool,
    ) -> Result<Option<GiftLink>> {
        let sql = format!("{} WHERE g.id = $1{}", GIFT_SELECT, lock_clause(for_update));
        let link = sqlx::query_as::<_, GiftLink>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(link)
    }
}

// Only the gift-link row is locked here; account rows are locked later by the
// transfer, in username order.
fn lock_clause(for_update: bool) -> &'static str {
    if for_update {
        " FOR UPDATE OF g"
    } else {
        ""
    }
}

/// Redemption guards, in the order they are reported
pub fn check_redeemable(link: &GiftLink, redeemer: &str) -> Result<()> {
    if link.redeemed_at.is_some() {
        return Err(LedgerError::GiftLinkRedeemed);
    }
    if !link.active {
        return Err(LedgerError::GiftLinkInactive);
    }
    if link.is_expired(Utc::now()) {
        return Err(LedgerError::GiftLinkExpired);
    }
    if link.owner == redeemer {
        return Err(LedgerError::CannotRedeemOwnLink);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn link() -> GiftLink {
        let now = Utc::now();
        GiftLink {
            id: 7,
            code: generate_code(),
            owner_id: 1,
            owner: "alice".into(),
            amount: 100,
            message: None,
            expires_at: None,
            redeemed_at: None,
            redeemed_by_id: None,
            redeemed_by: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_code_shape() {
        let code = generate_code();
        // 32 bytes, unpadded base64
        assert_eq!(code.len(), 43);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_codes_do_not_repeat() {
        let codes: HashSet<String> = (0..1000).map(|_| generate_code()).collect();
        assert_eq!(codes.len(), 1000);
    }

    #[test]
    fn test_redeemable() {
        assert!(check_redeemable(&link(), "bob").is_ok());
    }

    #[test]
    fn test_own_link() {
        assert!(matches!(
            check_redeemable(&link(), "alice"),
            Err(LedgerError::CannotRedeemOwnLink)
        ));
    }

    #[test]
    fn test_expired_link() {
        let mut l = link();
        l.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(matches!(
            check_redeemable(&l, "bob"),
            Err(LedgerError::GiftLinkExpired)
        ));
    }

    #[test]
    fn test_guard_order() {
        // Redeemed wins over inactive, inactive over expired, expired over own-link.
        let mut l = link();
        l.expires_at = Some(Utc::now() - Duration::minutes(1));
        l.active = false;
        l.redeemed_at = Some(Utc::now());
        assert!(matches!(
            check_redeemable(&l, "alice"),
            Err(LedgerError::GiftLinkRedeemed)
        ));

        l.redeemed_at = None;
        assert!(matches!(
            check_redeemable(&l, "alice"),
            Err(LedgerError::GiftLinkInactive)
        ));

        l.active = true;
        assert!(matches!(
            check_redeemable(&l, "alice"),
            Err(LedgerError::GiftLinkExpired)
        ));
    }
}
