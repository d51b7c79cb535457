//! Signed history exports
//!
//! An export is a JSON snapshot of one account and every entry involving it.
//! The signature is the HMAC of the document serialized with `signature`
//! set to the empty string. Field order follows the struct declarations and
//! timestamps are always RFC 3339 in UTC with microseconds, so any verifier
//! that re-serializes the same values gets the same bytes.

use crate::crypto::ExportSigner;
use crate::storage::LedgerStore;
use crate::types::LedgerEntry;
use crate::{LedgerError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Fixed-precision RFC 3339 timestamps
pub mod canonical_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let ts = DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)?;

        // Only the exact rendering `format` produces is accepted.
        if format(&ts) != raw {
            return Err(serde::de::Error::custom(format!(
                "timestamp {:?} is not in canonical form",
                raw
            )));
        }
        Ok(ts)
    }
}

/// One ledger entry as it appears in an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportedEntry {
    pub id: i64,
    pub from_user: String,
    pub to_user: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(with = "canonical_time")]
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for ExportedEntry {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            from_user: entry.from_user,
            to_user: entry.to_user,
            amount: entry.amount,
            note: entry.note.filter(|n| !n.is_empty()),
            created_at: entry.created_at.trunc_subsecs(6),
        }
    }
}

/// Signed statement of one account's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportDocument {
    pub user_id: i64,
    pub username: String,
    pub email: Option<String>,
    pub total_beans: i64,
    pub transactions: Vec<ExportedEntry>,
    #[serde(with = "canonical_time")]
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
}

impl ExportDocument {
    /// Bytes covered by the signature
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn sign(mut self, signer: &ExportSigner) -> Result<Self> {
        self.signature = signer.sign(&self.signing_payload()?)?;
        Ok(self)
    }

    /// Recompute and compare. A document without a signature is malformed.
    pub fn verify(&self, signer: &ExportSigner) -> Result<bool> {
        if self.signature.is_empty() {
            return Err(LedgerError::InvalidExport);
        }
        signer.verify(&self.signing_payload()?, &self.signature)
    }
}

/// Export signer and verifier over the store
#[derive(Debug, Clone)]
pub struct ExportService {
    store: LedgerStore,
    signer: ExportSigner,
}

impl ExportService {
    pub fn new(store: LedgerStore, signing_key: &str) -> Self {
        Self {
            store,
            signer: ExportSigner::new(signing_key),
        }
    }

    /// Snapshot and sign the full history of `username`
    pub async fn export_history(&self, username: &str) -> Result<ExportDocument> {
        let account = self
            .store
            .find_account(username)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(username.to_string()))?;

        let entries = self.store.history(username).await?;

        let document = ExportDocument {
            user_id: account.id,
            username: account.username,
            email: account.email,
            total_beans: account.balance,
            transactions: entries.into_iter().map(ExportedEntry::from).collect(),
            exported_at: Utc::now().trunc_subsecs(6),
            signature: String::new(),
        }
        .sign(&self.signer)?;

        info!(
            "Exported {} entr(ies) for {}",
            document.transactions.len(),
            username
        );
        Ok(document)
    }

    /// Verify raw export bytes against a separately supplied signature.
    ///
    /// Input that does not parse as an export, or an empty signature, is
    /// `InvalidExport`; everything else answers `Ok(valid)`.
    pub fn verify_export(&self, bytes: &[u8], claimed_signature: &str) -> Result<bool> {
        let mut document: ExportDocument =
            serde_json::from_slice(bytes).map_err(|_| LedgerError::InvalidExport)?;

        if claimed_signature.is_empty() {
            return Err(LedgerError::InvalidExport);
        }
        document.signature = claimed_signature.to_string();

        self.verify_structured(&document)
    }

    pub fn verify_structured(&self, document: &ExportDocument) -> Result<bool> {
        let valid = document.verify(&self.signer)?;
        debug!(
            "Export of {} verified: valid={}",
            document.username, valid
        );
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn document() -> ExportDocument {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        ExportDocument {
            user_id: 3,
            username: "alice".into(),
            email: None,
            total_beans: 70,
            transactions: vec![
                ExportedEntry {
                    id: 2,
                    from_user: "alice".into(),
                    to_user: "bob".into(),
                    amount: 30,
                    note: Some("lunch".into()),
                    created_at: at,
                },
                ExportedEntry {
                    id: 1,
                    from_user: "system".into(),
                    to_user: "alice".into(),
                    amount: 100,
                    note: None,
                    created_at: at,
                },
            ],
            exported_at: at,
            signature: String::new(),
        }
    }

    fn signer() -> ExportSigner {
        ExportSigner::new("export-key")
    }

    #[test]
    fn test_canonical_layout() {
        let json = String::from_utf8(document().signing_payload().unwrap()).unwrap();
        assert!(json.starts_with(r#"{"user_id":3,"username":"alice","email":null,"total_beans":70,"transactions":[{"id":2,"#));
        assert!(json.contains(r#""note":"lunch","created_at":"2024-03-01T09:30:00.000000Z"}"#));
        // Absent notes are omitted entirely
        assert!(json.contains(r#"{"id":1,"from_user":"system","to_user":"alice","amount":100,"created_at""#));
        assert!(json.ends_with(r#""exported_at":"2024-03-01T09:30:00.000000Z","signature":""}"#));
    }

    #[test]
    fn test_payload_ignores_existing_signature() {
        let unsigned = document();
        let mut signed = document();
        signed.signature = "deadbeef".into();
        assert_eq!(
            unsigned.signing_payload().unwrap(),
            signed.signing_payload().unwrap()
        );
    }

    #[test]
    fn test_sign_then_verify() {
        let doc = document().sign(&signer()).unwrap();
        assert_eq!(doc.signature.len(), 64);
        assert!(doc.verify(&signer()).unwrap());
    }

    #[test]
    fn test_balance_tamper_detected() {
        let mut doc = document().sign(&signer()).unwrap();
        doc.total_beans = 7_000;
        assert!(!doc.verify(&signer()).unwrap());
    }

    #[test]
    fn test_entry_tamper_detected() {
        let mut doc = document().sign(&signer()).unwrap();
        doc.transactions[1].note = Some("bonus".into());
        assert!(!doc.verify(&signer()).unwrap());
    }

    #[test]
    fn test_other_key_detected() {
        let doc = document().sign(&ExportSigner::new("other-key")).unwrap();
        assert!(!doc.verify(&signer()).unwrap());
    }

    #[test]
    fn test_missing_signature_is_invalid() {
        assert!(matches!(
            document().verify(&signer()),
            Err(LedgerError::InvalidExport)
        ));
    }

    #[test]
    fn test_json_round_trip_keeps_signature_valid() {
        let doc = document().sign(&signer()).unwrap();
        let bytes = serde_json::to_vec(&doc).unwrap();
        let parsed: ExportDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, doc);
        assert!(parsed.verify(&signer()).unwrap());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = br#"{"user_id":1,"username":"a","email":null,"total_beans":1,"transactions":[],"exported_at":"2024-03-01T09:30:00.000000Z","signature":"","admin":true}"#;
        assert!(serde_json::from_slice::<ExportDocument>(raw).is_err());
    }

    #[test]
    fn test_non_canonical_timestamps_rejected() {
        let doc = document().sign(&signer()).unwrap();
        let json = String::from_utf8(serde_json::to_vec(&doc).unwrap()).unwrap();

        let nanos = json.replacen("09:30:00.000000Z", "09:30:00.000000001Z", 1);
        assert!(serde_json::from_str::<ExportDocument>(&nanos).is_err());

        let offset = json.replacen("2024-03-01T09:30:00.000000Z", "2024-03-01T10:30:00.000000+01:00", 1);
        assert!(serde_json::from_str::<ExportDocument>(&offset).is_err());

        let short = json.replacen("09:30:00.000000Z", "09:30:00Z", 1);
        assert!(serde_json::from_str::<ExportDocument>(&short).is_err());

        assert!(serde_json::from_str::<ExportDocument>(&json).is_ok());
    }
}
