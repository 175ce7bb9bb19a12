use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    /// Bad signature, malformed token, or a token of the wrong kind
    #[error("invalid token")]
    Invalid,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub iat: i64,
    pub exp: i64,
    pub typ: TokenKind,
}

/// Result of a successful verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedToken {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Keys derived once from the configured secrets. Read-only after startup.
pub struct SigningKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
}

impl SigningKeys {
    pub fn new(access_secret: &str, refresh_secret: &str) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(refresh_secret.as_bytes()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let refresh = config.refresh_secret.as_deref().unwrap_or(&config.jwt_secret);
        Self::new(&config.jwt_secret, refresh)
    }

    fn encoding(&self, kind: TokenKind) -> &EncodingKey {
        match kind {
            TokenKind::Access => &self.access_encoding,
            TokenKind::Refresh => &self.refresh_encoding,
        }
    }

    fn decoding(&self, kind: TokenKind) -> &DecodingKey {
        match kind {
            TokenKind::Access => &self.access_decoding,
            TokenKind::Refresh => &self.refresh_decoding,
        }
    }
}

/// Stateless HS256 access/refresh tokens.
///
/// There is no revocation list: a token stays valid until its `exp`.
#[derive(Clone)]
pub struct TokenService {
    keys: Arc<SigningKeys>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(keys: SigningKeys, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            keys: Arc::new(keys),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            SigningKeys::from_config(config),
            Duration::seconds(config.access_token_ttl_secs as i64),
            Duration::seconds(config.refresh_token_ttl_secs as i64),
        )
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.access_ttl.num_seconds().max(0) as u64
    }

    pub fn issue_tokens(&self, user_id: Uuid) -> Result<IssuedTokens, TokenError> {
        self.issue_tokens_at(user_id, Utc::now())
    }

    pub fn issue_tokens_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens, TokenError> {
        Ok(IssuedTokens {
            access_token: self.sign(user_id, TokenKind::Access, now)?,
            refresh_token: self.sign(user_id, TokenKind::Refresh, now)?,
            expires_in: self.access_ttl_secs(),
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        self.verify_at(token, TokenKind::Access, Utc::now())
    }

    pub fn verify_refresh(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        self.verify_at(token, TokenKind::Refresh, Utc::now())
    }

    /// Mint a new access token from a refresh token. The refresh token itself
    /// is neither extended nor replaced.
    pub fn rotate_access(&self, refresh_token: &str) -> Result<(String, u64), TokenError> {
        self.rotate_access_at(refresh_token, Utc::now())
    }

    pub fn rotate_access_at(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, u64), TokenError> {
        let verified = self.verify_at(refresh_token, TokenKind::Refresh, now)?;
        let access = self.sign(verified.user_id, TokenKind::Access, now)?;
        Ok((access, self.access_ttl_secs()))
    }

    /// Signature first, then kind, then expiry. A token is expired from `exp` onwards.
    pub fn verify_at(
        &self,
        token: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<VerifiedToken, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked below against `now`, without leeway
        validation.validate_exp = false;

        let claims = decode::<Claims>(token, self.keys.decoding(kind), &validation)
            .map_err(|_| TokenError::Invalid)?
            .claims;

        if claims.typ != kind {
            return Err(TokenError::Invalid);
        }
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Invalid)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(TokenError::Invalid)?;

        if now >= expires_at {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedToken {
            user_id,
            expires_at,
        })
    }

    fn sign(&self, user_id: Uuid, kind: TokenKind, now: DateTime<Utc>) -> Result<String, TokenError> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            typ: kind,
        };
        encode(&Header::new(Algorithm::HS256), &claims, self.keys.encoding(kind))
            .map_err(|e| TokenError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(secret: &str) -> TokenService {
        TokenService::new(
            SigningKeys::new(secret, secret),
            Duration::minutes(15),
            Duration::days(7),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_access_token_valid_until_ttl() {
        let svc = service("secret");
        let user = Uuid::new_v4();
        let tokens = svc.issue_tokens_at(user, at(0)).unwrap();
        assert_eq!(tokens.expires_in, 900);

        let verified = svc
            .verify_at(&tokens.access_token, TokenKind::Access, at(0))
            .unwrap();
        assert_eq!(verified.user_id, user);
        assert_eq!(verified.expires_at, at(900));

        let last_second = svc.verify_at(&tokens.access_token, TokenKind::Access, at(899));
        assert_eq!(last_second.map(|v| v.user_id), Ok(user));
    }

    #[test]
    fn test_access_token_expires_at_ttl() {
        let svc = service("secret");
        let tokens = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();

        for secs in [900, 901, 86_400] {
            assert_eq!(
                svc.verify_at(&tokens.access_token, TokenKind::Access, at(secs)),
                Err(TokenError::Expired)
            );
        }
    }

    #[test]
    fn test_refresh_token_outlives_access_token() {
        let svc = service("secret");
        let user = Uuid::new_v4();
        let tokens = svc.issue_tokens_at(user, at(0)).unwrap();

        let day = 86_400;
        let verified = svc
            .verify_at(&tokens.refresh_token, TokenKind::Refresh, at(6 * day))
            .unwrap();
        assert_eq!(verified.user_id, user);
        assert_eq!(
            svc.verify_at(&tokens.refresh_token, TokenKind::Refresh, at(7 * day)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_token_kinds_are_not_interchangeable() {
        let svc = service("secret");
        let tokens = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();

        assert_eq!(
            svc.verify_at(&tokens.refresh_token, TokenKind::Access, at(1)),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            svc.verify_at(&tokens.access_token, TokenKind::Refresh, at(1)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_kind_check_holds_with_separate_secrets() {
        let svc = TokenService::new(
            SigningKeys::new("access-secret", "refresh-secret"),
            Duration::minutes(15),
            Duration::days(7),
        );
        let tokens = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();
        assert!(svc.verify_at(&tokens.access_token, TokenKind::Access, at(1)).is_ok());
        assert!(svc.verify_at(&tokens.refresh_token, TokenKind::Refresh, at(1)).is_ok());
        assert_eq!(
            svc.verify_at(&tokens.refresh_token, TokenKind::Access, at(1)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let issuer = service("secret-a");
        let verifier = service("secret-b");
        let tokens = issuer.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();
        assert_eq!(
            verifier.verify_at(&tokens.access_token, TokenKind::Access, at(1)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_tampered_payload_is_invalid() {
        let svc = service("secret");
        let victim = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();
        let attacker = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();

        let victim_parts: Vec<&str> = victim.access_token.split('.').collect();
        let attacker_parts: Vec<&str> = attacker.access_token.split('.').collect();
        let forged = format!(
            "{}.{}.{}",
            attacker_parts[0], victim_parts[1], attacker_parts[2]
        );

        assert_eq!(
            svc.verify_at(&forged, TokenKind::Access, at(1)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_expired_and_tampered_reports_invalid() {
        let svc = service("secret");
        let tokens = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();
        let mut forged = tokens.access_token.clone();
        forged.push('x');
        assert_eq!(
            svc.verify_at(&forged, TokenKind::Access, at(10_000)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_garbage_is_invalid() {
        let svc = service("secret");
        assert_eq!(svc.verify_access("not-a-token"), Err(TokenError::Invalid));
        assert_eq!(svc.verify_refresh(""), Err(TokenError::Invalid));
    }

    #[test]
    fn test_rotate_access_keeps_user() {
        let svc = service("secret");
        let user = Uuid::new_v4();
        let tokens = svc.issue_tokens_at(user, at(0)).unwrap();

        let (access, ttl) = svc.rotate_access_at(&tokens.refresh_token, at(3_600)).unwrap();
        assert_eq!(ttl, 900);
        let verified = svc.verify_at(&access, TokenKind::Access, at(3_601)).unwrap();
        assert_eq!(verified.user_id, user);
        assert_eq!(verified.expires_at, at(3_600 + 900));
    }

    #[test]
    fn test_rotate_access_rejects_access_token() {
        let svc = service("secret");
        let tokens = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();
        assert_eq!(
            svc.rotate_access_at(&tokens.access_token, at(1)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_rotate_access_rejects_expired_refresh() {
        let svc = service("secret");
        let tokens = svc.issue_tokens_at(Uuid::new_v4(), at(0)).unwrap();
        assert_eq!(
            svc.rotate_access_at(&tokens.refresh_token, at(8 * 86_400)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_live_clock_round_trip() {
        let svc = service("secret");
        let user = Uuid::new_v4();
        let tokens = svc.issue_tokens(user).unwrap();
        assert_eq!(svc.verify_access(&tokens.access_token).unwrap().user_id, user);
        assert_eq!(svc.verify_refresh(&tokens.refresh_token).unwrap().user_id, user);
    }
}
