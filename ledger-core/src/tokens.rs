//! API token issuer and validator
//!
//! A token is an HS256 JWT bound to a username plus a row in `api_tokens`
//! carrying the same expiry. Validation needs both: a good signature and a
//! live row. Deleting the row revokes the token before its `exp` passes.

use crate::config::Config;
use crate::storage::LedgerStore;
use crate::types::{validate_user_facing, ApiToken, IssuedToken};
use crate::{LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// JWT claims carried by an API token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub username: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub jti: String,
}

/// Requested token lifetime, bounded by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetime(Duration);

impl TokenLifetime {
    /// Parse `<n>s`, `<n>m`, `<n>h` or `<n>d` with `n > 0`.
    pub fn parse(input: &str, max: Duration) -> Result<Self> {
        let input = input.trim();
        let invalid = || {
            LedgerError::Validation(format!(
                "invalid lifetime {:?}, use a positive duration like 30m, 24h or 7d",
                input
            ))
        };

        let unit = input.chars().last().ok_or_else(invalid)?;
        let unit_secs: i64 = match unit {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };

        let value: i64 = input[..input.len() - 1].parse().map_err(|_| invalid())?;
        if value <= 0 {
            return Err(invalid());
        }

        let secs = value.checked_mul(unit_secs).ok_or_else(invalid)?;
        if secs > max.num_seconds() {
            return Err(LedgerError::Validation(format!(
                "lifetime {} exceeds the maximum of {} days",
                input,
                max.num_days()
            )));
        }

        Ok(Self(Duration::seconds(secs)))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

/// HS256 signing and verification of [`TokenClaims`]
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
        }
    }

    pub fn claims(&self, username: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> TokenClaims {
        TokenClaims {
            username: username.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn sign(&self, claims: &TokenClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| LedgerError::Signing(e.to_string()))
    }

    /// Check signature, algorithm, issuer and `exp`.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;

        decode::<TokenClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => LedgerError::ExpiredToken,
                _ => LedgerError::InvalidToken,
            })
    }
}

/// Token issuer and validator backed by the store
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    store: LedgerStore,
    signer: TokenSigner,
    max_lifetime: Duration,
}

impl TokenIssuer {
    pub fn new(store: LedgerStore, config: &Config) -> Self {
        Self {
            store,
            signer: TokenSigner::new(&config.signing.jwt_secret, &config.signing.jwt_issuer),
            max_lifetime: Duration::days(config.tokens.max_lifetime_days),
        }
    }

    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    pub fn parse_lifetime(&self, input: &str) -> Result<TokenLifetime> {
        TokenLifetime::parse(input, self.max_lifetime)
    }

    pub async fn issue(&self, username: &str, lifetime: TokenLifetime) -> Result<IssuedToken> {
        validate_user_facing(username)?;
        let account = self
            .store
            .find_account(username)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(username.to_string()))?;

        let now = Utc::now();
        // Stored and signed expiry must agree to the second.
        let expires_at = DateTime::<Utc>::from_timestamp((now + lifetime.duration()).timestamp(), 0)
            .ok_or_else(|| LedgerError::Validation("token expiry out of range".into()))?;

        let claims = self.signer.claims(username, now, expires_at);
        let token = self.signer.sign(&claims)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO api_tokens (account_id, token, expires_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(account.id)
        .bind(&token)
        .bind(expires_at)
        .fetch_one(self.store.pool())
        .await?;

        info!("Issued API token {} for {} expiring {}", id, username, expires_at);
        Ok(IssuedToken {
            id,
            token,
            expires_at,
        })
    }

    /// Resolve a bearer token to its claims, requiring a live store record
    pub async fn validate(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.signer.verify(token)?;

        let record: Option<(DateTime<Utc>, String)> = sqlx::query_as(
            r#"
            SELECT t.expires_at, a.username
            FROM api_tokens t
            JOIN accounts a ON a.id = t.account_id
            WHERE t.token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(self.store.pool())
        .await?;

        let (expires_at, owner) = record.ok_or_else(|| {
            debug!("Token for {} has no store record", claims.username);
            LedgerError::InvalidToken
        })?;

        if expires_at <= Utc::now() {
            return Err(LedgerError::ExpiredToken);
        }
        if owner != claims.username {
            warn!(
                "Token record owner {} does not match claim {}",
                owner, claims.username
            );
            return Err(LedgerError::InvalidToken);
        }

        Ok(claims)
    }

    pub async fn list(&self, username: &str) -> Result<Vec<ApiToken>> {
        let tokens = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT t.id, t.expires_at, t.created_at
            FROM api_tokens t
            JOIN accounts a ON a.id = t.account_id
            WHERE a.username = $1
            ORDER BY t.created_at DESC, t.id DESC
            "#,
        )
        .bind(username)
        .fetch_all(self.store.pool())
        .await?;
        Ok(tokens)
    }

    /// Revoke one of the caller's tokens. Other users' ids are reported as not found.
    pub async fn delete(&self, username: &str, id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM api_tokens t
            USING accounts a
            WHERE t.id = $1 AND t.account_id = a.id AND a.username = $2
            "#,
        )
        .bind(id)
        .bind(username)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::TokenNotFound(id));
        }

        info!("Revoked API token {} of {}", id, username);
        Ok(())
    }

    /// Drop every token whose expiry has passed
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM api_tokens WHERE expires_at <= NOW()")
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

/// Run [`TokenIssuer::purge_expired`] every `every` until the task is aborted
pub fn spawn_token_sweeper(issuer: TokenIssuer, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match issuer.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!("Swept {} expired API token(s)", n),
                Err(e) => warn!("Expired token sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", "beanbank")
    }

    #[test]
    fn test_lifetime_parse() {
        let max = Duration::days(365);
        assert_eq!(
            TokenLifetime::parse("90s", max).unwrap().duration(),
            Duration::seconds(90)
        );
        assert_eq!(
            TokenLifetime::parse("30m", max).unwrap().duration(),
            Duration::minutes(30)
        );
        assert_eq!(
            TokenLifetime::parse("24h", max).unwrap().duration(),
            Duration::hours(24)
        );
        assert_eq!(
            TokenLifetime::parse("7d", max).unwrap().duration(),
            Duration::days(7)
        );
        assert_eq!(
            TokenLifetime::parse("365d", max).unwrap().duration(),
            Duration::days(365)
        );
    }

    #[test]
    fn test_lifetime_rejects() {
        let max = Duration::days(365);
        for input in ["", "d", "0h", "-1d", "7w", "1.5h", "h7", "366d", "99999999999999999d"] {
            assert!(
                matches!(TokenLifetime::parse(input, max), Err(LedgerError::Validation(_))),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = signer();
        let now = Utc::now();
        let claims = signer.claims("alice", now, now + Duration::hours(1));
        let token = signer.sign(&claims).unwrap();

        let verified = signer.verify(&token).unwrap();
        assert_eq!(verified, claims);
        assert_eq!(verified.iss, "beanbank");
    }

    #[test]
    fn test_tokens_differ_within_one_second() {
        let signer = signer();
        let now = Utc::now();
        let a = signer.sign(&signer.claims("alice", now, now + Duration::hours(1))).unwrap();
        let b = signer.sign(&signer.claims("alice", now, now + Duration::hours(1))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let now = Utc::now();
        let other = TokenSigner::new("other-secret", "beanbank");
        let token = other
            .sign(&other.claims("alice", now, now + Duration::hours(1)))
            .unwrap();
        assert!(matches!(signer().verify(&token), Err(LedgerError::InvalidToken)));
    }

    #[test]
    fn test_wrong_issuer_is_invalid() {
        let now = Utc::now();
        let other = TokenSigner::new("test-secret", "someone-else");
        let token = other
            .sign(&other.claims("alice", now, now + Duration::hours(1)))
            .unwrap();
        assert!(matches!(signer().verify(&token), Err(LedgerError::InvalidToken)));
    }

    #[test]
    fn test_expired_signature() {
        let signer = signer();
        let now = Utc::now();
        let claims = signer.claims("alice", now - Duration::hours(2), now - Duration::hours(1));
        let token = signer.sign(&claims).unwrap();
        assert!(matches!(signer.verify(&token), Err(LedgerError::ExpiredToken)));
    }

    #[test]
    fn test_other_algorithm_is_invalid() {
        let now = Utc::now();
        let s = signer();
        let claims = s.claims("alice", now, now + Duration::hours(1));
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(s.verify(&token), Err(LedgerError::InvalidToken)));
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(signer().verify("not.a.jwt"), Err(LedgerError::InvalidToken)));
        assert!(matches!(signer().verify(""), Err(LedgerError::InvalidToken)));
    }
}
