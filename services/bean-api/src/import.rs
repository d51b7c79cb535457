//! Bulk wallet import from a legacy `[{"nick": .., "beans": ..}]` dump

use bean_ledger::{Ledger, LedgerError, SYSTEM_ACCOUNT};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

lazy_static! {
    static ref NICK_PATTERN: Regex =
        Regex::new(r"^[a-zA-Z0-9_-]{1,50}$").expect("nickname pattern is valid");
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImportRecord {
    pub nick: String,
    pub beans: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub skip_zero: bool,
    /// Abort before writing anything if a record is invalid
    pub strict: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            skip_zero: true,
            strict: false,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped_zero: usize,
    pub skipped_invalid: usize,
    pub total_beans: i64,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Failed to read import file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Malformed import file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid record {nick:?}: {reason}")]
    InvalidRecord { nick: String, reason: &'static str },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Import,
    SkipZero,
    Invalid(&'static str),
}

pub fn classify(record: &ImportRecord, options: &ImportOptions) -> Disposition {
    if !NICK_PATTERN.is_match(&record.nick) {
        return Disposition::Invalid("nickname must match [a-zA-Z0-9_-]{1,50}");
    }
    if record.nick == SYSTEM_ACCOUNT {
        return Disposition::Invalid("reserved account name");
    }
    if record.beans < 0 {
        return Disposition::Invalid("negative balance");
    }
    if record.beans == 0 && options.skip_zero {
        return Disposition::SkipZero;
    }
    Disposition::Import
}

pub fn parse_records(bytes: &[u8]) -> Result<Vec<ImportRecord>, ImportError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Create each wallet and overwrite its balance with the imported amount
pub async fn import_records(
    ledger: &Ledger,
    records: &[ImportRecord],
    options: ImportOptions,
) -> Result<ImportSummary, ImportError> {
    if options.strict {
        for record in records {
            if let Disposition::Invalid(reason) = classify(record, &options) {
                return Err(ImportError::InvalidRecord {
                    nick: record.nick.clone(),
                    reason,
                });
            }
        }
    }

    let mut summary = ImportSummary::default();
    for record in records {
        match classify(record, &options) {
            Disposition::Import => {
                ledger.get_or_create_wallet(&record.nick).await?;
                ledger.set_balance(&record.nick, record.beans).await?;
                summary.imported += 1;
                summary.total_beans += record.beans;
            }
            Disposition::SkipZero => summary.skipped_zero += 1,
            Disposition::Invalid(reason) => {
                warn!("Skipping {:?}: {}", record.nick, reason);
                summary.skipped_invalid += 1;
            }
        }
    }

    info!(
        "Imported {} wallets ({} beans), skipped {} empty and {} invalid",
        summary.imported, summary.total_beans, summary.skipped_zero, summary.skipped_invalid
    );
    Ok(summary)
}

pub async fn import_file(
    ledger: &Ledger,
    path: impl AsRef<Path>,
    options: ImportOptions,
) -> Result<ImportSummary, ImportError> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    let records = parse_records(&bytes)?;
    info!("Read {} records from {}", records.len(), path.as_ref().display());
    import_records(ledger, &records, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(nick: &str, beans: i64) -> ImportRecord {
        ImportRecord {
            nick: nick.to_string(),
            beans,
        }
    }

    #[test]
    fn test_parse_records() {
        let records = parse_records(br#"[{"nick":"alice","beans":12},{"nick":"bob-2","beans":0}]"#)
            .unwrap();
        assert_eq!(records, vec![record("alice", 12), record("bob-2", 0)]);

        assert!(matches!(
            parse_records(br#"{"nick":"alice"}"#),
            Err(ImportError::Parse(_))
        ));
    }

    #[test]
    fn test_classify() {
        let options = ImportOptions::default();
        assert_eq!(classify(&record("alice_1", 5), &options), Disposition::Import);
        assert_eq!(classify(&record("alice", 0), &options), Disposition::SkipZero);
        assert!(matches!(
            classify(&record("bad nick", 5), &options),
            Disposition::Invalid(_)
        ));
        assert!(matches!(
            classify(&record(&"x".repeat(51), 5), &options),
            Disposition::Invalid(_)
        ));
        assert!(matches!(classify(&record("", 5), &options), Disposition::Invalid(_)));
        assert!(matches!(
            classify(&record("system", 5), &options),
            Disposition::Invalid(_)
        ));
        assert!(matches!(
            classify(&record("alice", -1), &options),
            Disposition::Invalid(_)
        ));

        let keep_zero = ImportOptions {
            skip_zero: false,
            strict: false,
        };
        assert_eq!(classify(&record("alice", 0), &keep_zero), Disposition::Import);
    }
}
