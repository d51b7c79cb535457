//! Bean Ledger Core
//!
//! Wallets, peer transfers, gift-link escrow, harvest payouts, API tokens and
//! signed history exports over a single PostgreSQL store.
//!
//! # Architecture
//!
//! - **Store transactions**: every mutation runs in one transaction and
//!   either commits whole or rolls back whole
//! - **Row locks**: account rows are locked in username order, gift-link and
//!   harvest rows before any account row
//! - **Escrow account**: the reserved `system` wallet holds gift-link funds
//!   and is the sender of harvest payouts
//!
//! # Invariants
//!
//! - Balances never go negative
//! - Total supply only grows through the signup bonus and harvest completion
//! - Ledger entries are append-only

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod escrow;
pub mod export;
pub mod harvest;
pub mod ledger;
pub mod storage;
pub mod tokens;
pub mod transfer;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{ErrorClass, LedgerError, Result};
pub use export::{ExportDocument, ExportedEntry};
pub use ledger::Ledger;
pub use storage::LedgerStore;
pub use tokens::TokenClaims;
pub use types::{
    Account, ApiToken, ExpiryPolicy, GiftLink, GiftLinkState, Harvest, HarvestPage, HarvestState,
    IssuedToken, LedgerEntry, UserRef, SYSTEM_ACCOUNT,
};
