//! Transfer engine
//!
//! Moves a positive whole number of beans between two wallets and appends one
//! ledger entry, all inside a single store transaction. The same primitive is
//! exposed as [`TransferEngine::transfer_in_tx`] so escrow and payout flows
//! can run it on a transaction they already hold.

use crate::storage::LedgerStore;
use crate::types::{validate_username, LedgerEntry};
use crate::{LedgerError, Result};
use sqlx::postgres::PgConnection;
use tracing::{debug, info, warn};

/// What to do when the recipient wallet does not exist yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientPolicy {
    /// Fail with `RecipientNotFound`
    MustExist,
    /// Create it with a zero balance (no signup bonus)
    CreateIfMissing,
}

impl RecipientPolicy {
    pub fn from_force(force: bool) -> Self {
        if force {
            RecipientPolicy::CreateIfMissing
        } else {
            RecipientPolicy::MustExist
        }
    }
}

/// A single movement of beans
#[derive(Debug, Clone, Copy)]
pub struct Transfer<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub amount: i64,
    pub recipient: RecipientPolicy,
    pub note: Option<&'a str>,
}

impl<'a> Transfer<'a> {
    pub fn new(from: &'a str, to: &'a str, amount: i64) -> Self {
        Self {
            from,
            to,
            amount,
            recipient: RecipientPolicy::MustExist,
            note: None,
        }
    }

    pub fn recipient(mut self, policy: RecipientPolicy) -> Self {
        self.recipient = policy;
        self
    }

    pub fn note(mut self, note: Option<&'a str>) -> Self {
        self.note = note.filter(|n| !n.is_empty());
        self
    }

    /// Checks that need no store access. Runs before any lock is taken.
    pub fn check(&self) -> Result<()> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if self.from == self.to {
            return Err(LedgerError::SelfTransfer);
        }
        validate_username(self.from)?;
        validate_username(self.to)?;
        Ok(())
    }
}

/// Transfer engine
#[derive(Debug, Clone)]
pub struct TransferEngine {
    store: LedgerStore,
}

impl TransferEngine {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Run one transfer in its own transaction
    pub async fn transfer(&self, transfer: Transfer<'_>) -> Result<LedgerEntry> {
        transfer.check()?;

        let mut tx = self.store.begin().await?;
        let entry = match Self::transfer_in_tx(&mut tx, transfer).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    "Transfer {} -> {} of {} rejected: {}",
                    transfer.from, transfer.to, transfer.amount, e
                );
                return Err(e);
            }
        };
        tx.commit().await?;

        info!(
            "Transferred {} bean(s) from {} to {} (entry {})",
            entry.amount, entry.from_user, entry.to_user, entry.id
        );
        Ok(entry)
    }

    /// Run a transfer on a transaction the caller owns.
    ///
    /// Both account rows are locked in the global username order before any
    /// balance is read. Nothing is committed here; on error the caller drops
    /// the transaction and every write made so far is discarded.
    pub async fn transfer_in_tx(
        conn: &mut PgConnection,
        transfer: Transfer<'_>,
    ) -> Result<LedgerEntry> {
        transfer.check()?;

        let locked = LedgerStore::lock_accounts(&mut *conn, &[transfer.from, transfer.to]).await?;

        let sender = locked
            .get(transfer.from)
            .cloned()
            .ok_or_else(|| LedgerError::UserNotFound(transfer.from.to_string()))?;

        if sender.balance < transfer.amount {
            return Err(LedgerError::InsufficientBalance {
                required: transfer.amount,
                available: sender.balance,
            });
        }

        let recipient = match locked.get(transfer.to) {
            Some(account) => account.clone(),
            None => match transfer.recipient {
                RecipientPolicy::MustExist => {
                    return Err(LedgerError::RecipientNotFound(transfer.to.to_string()))
                }
                RecipientPolicy::CreateIfMissing => {
                    let (account, created) =
                        LedgerStore::insert_if_absent(&mut *conn, transfer.to, 0).await?;
                    if created {
                        debug!("Created recipient wallet {} with zero balance", transfer.to);
                    }
                    // A concurrent creator may have committed between the lock
                    // pass and the insert, so take the row lock explicitly.
                    LedgerStore::lock_account_by_id(&mut *conn, account.id)
                        .await?
                        .ok_or_else(|| LedgerError::RecipientNotFound(transfer.to.to_string()))?
                }
            },
        };

        LedgerStore::adjust_balance(&mut *conn, sender.id, -transfer.amount).await?;
        LedgerStore::adjust_balance(&mut *conn, recipient.id, transfer.amount).await?;

        LedgerStore::append_entry(&mut *conn, &sender, &recipient, transfer.amount, transfer.note)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_amount() {
        assert!(matches!(
            Transfer::new("alice", "bob", 0).check(),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            Transfer::new("alice", "bob", -5).check(),
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[test]
    fn test_rejects_self_transfer() {
        assert!(matches!(
            Transfer::new("alice", "alice", 10).check(),
            Err(LedgerError::SelfTransfer)
        ));
    }

    #[test]
    fn test_amount_checked_before_self_transfer() {
        assert!(matches!(
            Transfer::new("alice", "alice", 0).check(),
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[test]
    fn test_rejects_malformed_names() {
        assert!(matches!(
            Transfer::new("alice", "", 1).check(),
            Err(LedgerError::InvalidUsername(_))
        ));
        assert!(Transfer::new("alice", "bob", 1).check().is_ok());
    }

    #[test]
    fn test_builder() {
        let t = Transfer::new("alice", "bob", 3)
            .recipient(RecipientPolicy::from_force(true))
            .note(Some(""));
        assert_eq!(t.recipient, RecipientPolicy::CreateIfMissing);
        assert_eq!(t.note, None);

        let t = Transfer::new("alice", "bob", 3).note(Some("lunch"));
        assert_eq!(t.note, Some("lunch"));
        assert_eq!(RecipientPolicy::from_force(false), RecipientPolicy::MustExist);
    }
}
