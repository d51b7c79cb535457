//! Keyed signatures for exported statements
//!
//! HMAC-SHA256 with a server-held key, rendered as lowercase hex.
//! Verification goes through `Mac::verify_slice`, which compares in
//! constant time.

use crate::{LedgerError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of a hex-encoded signature
pub const SIGNATURE_HEX_LEN: usize = 64;

/// HMAC-SHA256 signer
#[derive(Clone)]
pub struct ExportSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for ExportSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExportSigner { .. }")
    }
}

impl ExportSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| LedgerError::Signing(e.to_string()))
    }

    /// Hex HMAC of `payload`
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Whether `signature_hex` is the HMAC of `payload`. Anything but
    /// lowercase hex is a mismatch.
    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> Result<bool> {
        if !is_lowercase_hex(signature_hex) {
            return Ok(false);
        }
        let claimed = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };

        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.verify_slice(&claimed).is_ok())
    }
}

fn is_lowercase_hex(raw: &str) -> bool {
    raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signer = ExportSigner::new("Jefe");
        assert_eq!(
            signer.sign(b"what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = ExportSigner::new("export-key");
        let sig = signer.sign(b"payload").unwrap();
        assert_eq!(sig.len(), SIGNATURE_HEX_LEN);
        assert!(signer.verify(b"payload", &sig).unwrap());
        assert!(!signer.verify(b"payload!", &sig).unwrap());
    }

    #[test]
    fn test_other_key_fails() {
        let sig = ExportSigner::new("key-a").sign(b"payload").unwrap();
        assert!(!ExportSigner::new("key-b").verify(b"payload", &sig).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_mismatch() {
        let signer = ExportSigner::new("export-key");
        assert!(!signer.verify(b"payload", "zz").unwrap());
        assert!(!signer.verify(b"payload", "abcd").unwrap());
    }

    #[test]
    fn test_uppercase_signature_is_mismatch() {
        let signer = ExportSigner::new("export-key");
        let sig = signer.sign(b"payload").unwrap();
        assert!(signer.verify(b"payload", &sig).unwrap());
        assert!(!signer.verify(b"payload", &sig.to_uppercase()).unwrap());
    }
}
