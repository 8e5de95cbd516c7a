//! Session tokens
//!
//! HS256 JWTs whose `jti` is the key of a row in `sessions`, so a token can
//! be revoked before it expires.

use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Clock skew tolerated on `exp`
const LEEWAY_SECONDS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly signed token with its session key
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry: Duration,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry: Duration::hours(expiry_hours),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn generate_token(&self, user_id: Uuid, email: &str, role: &str) -> Result<IssuedToken, JwtError> {
        self.generate_token_at(user_id, email, role, OffsetDateTime::now_utc())
    }

    pub fn generate_token_at(
        &self,
        user_id: Uuid,
        email: &str,
        role: &str,
        issued_at: OffsetDateTime,
    ) -> Result<IssuedToken, JwtError> {
        let expires_at = issued_at + self.expiry;
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            role: role.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Signing(e.to_string()))?;

        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        })
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECONDS;
        validation.set_required_spec_claims(&["exp", "sub"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    #[test]
    fn test_generate_and_validate() {
        let manager = JwtManager::new(SECRET, 24);
        let user_id = Uuid::new_v4();

        let issued = manager.generate_token(user_id, "jane@example.com", "user").unwrap();
        let claims = manager.validate_token(&issued.token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "jane@example.com");
        assert_eq!(claims.role, "user");
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(claims.exp, issued.expires_at.unix_timestamp());
    }

    #[test]
    fn test_each_token_gets_its_own_jti() {
        let manager = JwtManager::new(SECRET, 1);
        let user_id = Uuid::new_v4();
        let a = manager.generate_token(user_id, "a@example.com", "user").unwrap();
        let b = manager.generate_token(user_id, "a@example.com", "user").unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new(SECRET, 1);
        let other = JwtManager::new("another-secret-that-is-long-enough!!", 1);
        let issued = issuer.generate_token(Uuid::new_v4(), "a@example.com", "user").unwrap();
        assert_eq!(other.validate_token(&issued.token), Err(JwtError::Invalid));
    }
}
