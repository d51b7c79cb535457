//! Ledger facade
//!
//! Ties the store and the engines together behind the operations callers
//! use. Caller-supplied usernames are checked here, including the rule that
//! nobody may act as the reserved escrow account; the engines underneath
//! stay free to move beans through it.
//!
//! # Example
//!
//! ```no_run
//! use bean_ledger::{Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> bean_ledger::Result<()> {
//!     let config = Config::from_env()?;
//!     let ledger = Ledger::open(config).await?;
//!
//!     ledger.get_or_create_wallet("alice").await?;
//!     ledger.transfer("alice", "bob", 1, true, Some("welcome")).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::escrow::GiftLinkEscrow;
use crate::export::{ExportDocument, ExportService};
use crate::harvest::HarvestPayout;
use crate::storage::LedgerStore;
use crate::tokens::{spawn_token_sweeper, TokenClaims, TokenIssuer};
use crate::transfer::{RecipientPolicy, Transfer, TransferEngine};
use crate::types::{
    validate_user_facing, Account, ApiToken, ExpiryPolicy, GiftLink, Harvest, HarvestPage,
    IssuedToken, LedgerEntry, UserRef,
};
use crate::{Config, LedgerError, Result};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    store: LedgerStore,
    transfers: TransferEngine,
    escrow: GiftLinkEscrow,
    harvests: HarvestPayout,
    tokens: TokenIssuer,
    exports: ExportService,
    config: Config,
}

impl Ledger {
    /// Validate configuration, connect and apply migrations
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = LedgerStore::connect(&config.database).await?;
        store.migrate().await?;

        info!("Ledger {} ready", config.service_name);
        Ok(Self::with_store(store, config))
    }

    /// Build on an existing store without touching the schema
    pub fn with_store(store: LedgerStore, config: Config) -> Self {
        Self {
            transfers: TransferEngine::new(store.clone()),
            escrow: GiftLinkEscrow::new(store.clone(), config.escrow.code_attempts),
            harvests: HarvestPayout::new(store.clone()),
            tokens: TokenIssuer::new(store.clone(), &config),
            exports: ExportService::new(store.clone(), &config.signing.export_key),
            store,
            config,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    /// Move beans between two user wallets. With `force`, a missing
    /// recipient is created with a zero balance.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        force: bool,
        note: Option<&str>,
    ) -> Result<LedgerEntry> {
        let request = Transfer::new(from, to, amount)
            .recipient(RecipientPolicy::from_force(force))
            .note(note);
        request.check()?;
        validate_user_facing(from)?;
        validate_user_facing(to)?;

        self.transfers.transfer(request).await
    }

    pub async fn get_or_create_wallet(&self, username: &str) -> Result<Account> {
        self.store.get_or_create(username).await
    }

    /// Returns the wallet and whether it was created by this call
    pub async fn open_wallet(&self, username: &str) -> Result<(Account, bool)> {
        self.store.open_account(username).await
    }

    pub async fn find_wallet(&self, username: &str) -> Result<Option<Account>> {
        self.store.find_account(username).await
    }

    pub async fn get_balance(&self, username: &str) -> Result<i64> {
        self.store.balance(username).await
    }

    pub async fn get_history(&self, username: &str) -> Result<Vec<LedgerEntry>> {
        self.store.history(username).await
    }

    pub async fn total_supply(&self) -> Result<i64> {
        self.store.total_supply().await
    }

    pub async fn top_accounts(&self, limit: i64) -> Result<Vec<Account>> {
        self.store.top_accounts(limit).await
    }

    pub async fn search_accounts(&self, prefix: &str, limit: i64) -> Result<Vec<Account>> {
        self.store.search_accounts(prefix, limit).await
    }

    /// Administrative balance override; writes no ledger entry
    pub async fn set_balance(&self, username: &str, amount: i64) -> Result<Account> {
        self.store.set_balance(username, amount).await
    }

    pub async fn recent_entries(&self, limit: i64) -> Result<Vec<LedgerEntry>> {
        self.store.recent_entries(limit).await
    }

    // ------------------------------------------------------------------
    // Gift links
    // ------------------------------------------------------------------

    pub async fn create_gift_link(
        &self,
        owner: &str,
        amount: i64,
        message: Option<&str>,
        expires_in: &str,
    ) -> Result<GiftLink> {
        validate_user_facing(owner)?;
        let expiry = ExpiryPolicy::parse(expires_in)?;
        self.escrow.create(owner, amount, message, expiry).await
    }

    pub async fn redeem_gift_link(&self, code: &str, redeemer: &str) -> Result<GiftLink> {
        validate_user_facing(redeemer)?;
        self.escrow.redeem(code, redeemer).await
    }

    pub async fn delete_gift_link(&self, id: i64, requester: &str) -> Result<GiftLink> {
        validate_user_facing(requester)?;
        self.escrow.delete(id, requester).await
    }

    pub async fn list_gift_links(&self, owner: &str) -> Result<Vec<GiftLink>> {
        self.escrow.list(owner).await
    }

    pub async fn get_gift_link_by_code(&self, code: &str) -> Result<GiftLink> {
        self.escrow.get_by_code(code).await
    }

    // ------------------------------------------------------------------
    // Harvests
    // ------------------------------------------------------------------

    pub async fn create_harvest(&self, title: &str, description: &str, reward: i64) -> Result<Harvest> {
        self.harvests.create(title, description, reward).await
    }

    pub async fn update_harvest(
        &self,
        id: i64,
        title: &str,
        description: &str,
        reward: i64,
    ) -> Result<Harvest> {
        self.harvests.update(id, title, description, reward).await
    }

    pub async fn assign_harvest(&self, id: i64, user: &UserRef) -> Result<Harvest> {
        self.harvests.assign(id, user).await
    }

    pub async fn complete_harvest(&self, id: i64) -> Result<Harvest> {
        self.harvests.complete(id).await
    }

    pub async fn search_harvests(&self, query: &str, page: i64, limit: i64) -> Result<HarvestPage> {
        self.harvests.search(query, page, limit).await
    }

    pub async fn get_harvest(&self, id: i64) -> Result<Harvest> {
        self.harvests.get(id).await
    }

    pub async fn list_harvests(&self) -> Result<Vec<Harvest>> {
        self.harvests.list().await
    }

    pub async fn delete_harvest(&self, id: i64) -> Result<()> {
        self.harvests.delete(id).await
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Issue a bearer token; `lifetime` is a duration such as `24h` or `30d`
    pub async fn issue_token(&self, username: &str, lifetime: &str) -> Result<IssuedToken> {
        let lifetime = self.tokens.parse_lifetime(lifetime)?;
        self.tokens.issue(username, lifetime).await
    }

    pub async fn validate_token(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.tokens.validate(token).await?;
        validate_user_facing(&claims.username).map_err(|_| LedgerError::InvalidToken)?;
        Ok(claims)
    }

    pub async fn list_tokens(&self, username: &str) -> Result<Vec<ApiToken>> {
        self.tokens.list(username).await
    }

    pub async fn delete_token(&self, username: &str, id: i64) -> Result<()> {
        self.tokens.delete(username, id).await
    }

    pub async fn purge_expired_tokens(&self) -> Result<u64> {
        self.tokens.purge_expired().await
    }

    /// Start the periodic expired-token sweep at the configured interval
    pub fn spawn_token_sweeper(&self) -> JoinHandle<()> {
        let every = Duration::from_secs(self.config.tokens.sweep_interval_secs.max(1));
        info!("Sweeping expired API tokens every {:?}", every);
        spawn_token_sweeper(self.tokens.clone(), every)
    }

    // ------------------------------------------------------------------
    // Exports
    // ------------------------------------------------------------------

    pub async fn export_history(&self, username: &str) -> Result<ExportDocument> {
        self.exports.export_history(username).await
    }

    pub fn verify_export(&self, bytes: &[u8], signature: &str) -> Result<bool> {
        self.exports.verify_export(bytes, signature)
    }

    pub fn verify_structured(&self, document: &ExportDocument) -> Result<bool> {
        self.exports.verify_structured(document)
    }
}
