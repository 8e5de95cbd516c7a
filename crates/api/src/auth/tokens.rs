//! Emailed verification tokens
//!
//! The clear token only ever exists in the email. The `verifications` row
//! holds its SHA-256 under an identifier of the form `<purpose>:<user id>`,
//! and consuming a token deletes the row.

use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::ApiResult;

pub const TOKEN_TTL: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
    DeleteAccount,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "email-verification",
            TokenPurpose::PasswordReset => "reset-password",
            TokenPurpose::DeleteAccount => "delete-account",
        }
    }

    pub fn identifier(&self, user_id: Uuid) -> String {
        format!("{}:{}", self.as_str(), user_id)
    }

    /// User id from an identifier written for this purpose
    pub fn parse_identifier(&self, identifier: &str) -> Option<Uuid> {
        identifier
            .strip_prefix(self.as_str())?
            .strip_prefix(':')
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

/// 32 random bytes, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Store a fresh token for `user_id`, replacing any earlier one for the same purpose
pub async fn issue(pool: &PgPool, purpose: TokenPurpose, user_id: Uuid) -> ApiResult<String> {
    let token = generate_token();
    let identifier = purpose.identifier(user_id);
    let expires_at = OffsetDateTime::now_utc() + TOKEN_TTL;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM verifications WHERE identifier = $1")
        .bind(&identifier)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO verifications (identifier, value, expires_at)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(&identifier)
    .bind(hash_token(&token))
    .bind(expires_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(token)
}

/// Redeem a token once
///
/// Returns the owning user when the token exists, matches the purpose and has
/// not expired. The row is deleted in the same statement, so a second
/// redemption finds nothing.
pub async fn consume(pool: &PgPool, purpose: TokenPurpose, token: &str) -> ApiResult<Option<Uuid>> {
    let row: Option<(String, OffsetDateTime)> = sqlx::query_as(
        r#"
        DELETE FROM verifications
        WHERE value = $1
          AND identifier LIKE $2
        RETURNING identifier, expires_at
        "#,
    )
    .bind(hash_token(token))
    .bind(format!("{}:%", purpose.as_str()))
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(identifier, expires_at)| {
        if expires_at <= OffsetDateTime::now_utc() {
            tracing::info!(purpose = purpose.as_str(), "Expired verification token presented");
            return None;
        }
        purpose.parse_identifier(&identifier)
    }))
}

/// Owner of a live token, leaving it redeemable
pub async fn peek(pool: &PgPool, purpose: TokenPurpose, token: &str) -> ApiResult<Option<Uuid>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT identifier FROM verifications
        WHERE value = $1
          AND identifier LIKE $2
          AND expires_at > NOW()
        "#,
    )
    .bind(hash_token(token))
    .bind(format!("{}:%", purpose.as_str()))
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(identifier,)| purpose.parse_identifier(&identifier)))
}

/// Drop expired tokens
pub async fn purge_expired(pool: &PgPool) -> ApiResult<u64> {
    let result = sqlx::query("DELETE FROM verifications WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
