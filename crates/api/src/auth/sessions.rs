//! User session management for JWT revocation
//!
//! Every issued JWT has a row in `sessions` keyed by its `jti` (the `token`
//! column). A token is only accepted while its row exists, belongs to the
//! token's subject, is not revoked and has not expired.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;

/// Maximum concurrent sessions per user
const MAX_SESSIONS_PER_USER: i64 = 10;

/// Save a new session to the database
///
/// Called right after signing a token. When the user is at the session limit
/// the oldest live session is revoked first.
pub async fn save_session(
    pool: &PgPool,
    user_id: Uuid,
    jti: &str,
    expires_at: OffsetDateTime,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> ApiResult<()> {
    let mut tx = pool.begin().await?;

    let session_count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM sessions
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > NOW()
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    if session_count.0 >= MAX_SESSIONS_PER_USER {
        tracing::info!(
            user_id = %user_id,
            current_sessions = session_count.0,
            max_sessions = MAX_SESSIONS_PER_USER,
            "Revoking oldest session due to max sessions limit"
        );

        sqlx::query(
            r#"
            UPDATE sessions
            SET revoked_at = NOW(),
                revocation_reason = 'max_sessions_exceeded',
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM sessions
                WHERE user_id = $1
                  AND revoked_at IS NULL
                  AND expires_at > NOW()
                ORDER BY created_at ASC
                LIMIT 1
            )
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO sessions (token, user_id, expires_at, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(jti)
    .bind(user_id)
    .bind(expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(())
}

/// Check if a session (by JTI) is valid (owned, not revoked and not expired)
pub async fn is_session_valid(pool: &PgPool, jti: &str, expected_user_id: Uuid) -> ApiResult<bool> {
    let result: Option<(bool,)> = sqlx::query_as(
        r#"
        SELECT TRUE
        FROM sessions
        WHERE token = $1
          AND user_id = $2
          AND revoked_at IS NULL
          AND expires_at > NOW()
        "#,
    )
    .bind(jti)
    .bind(expected_user_id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_some())
}

/// Revoke a specific session by JTI
///
/// Returns true if the session was found and revoked, false if not found.
pub async fn revoke_session(pool: &PgPool, jti: &str, reason: &str) -> ApiResult<bool> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE sessions
        SET revoked_at = NOW(),
            revocation_reason = $2,
            updated_at = NOW()
        WHERE token = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(jti)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected > 0)
}

/// Revoke all sessions for a user
///
/// Called after a password reset and before account deletion.
pub async fn revoke_all_sessions(pool: &PgPool, user_id: Uuid, reason: &str) -> ApiResult<u64> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE sessions
        SET revoked_at = NOW(),
            revocation_reason = $2,
            updated_at = NOW()
        WHERE user_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(user_id)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected)
}

/// Delete sessions that expired, or were revoked, more than `retention_days` ago
pub async fn purge_expired_sessions(pool: &PgPool, retention_days: i32) -> ApiResult<u64> {
    let rows_affected = sqlx::query(
        r#"
        DELETE FROM sessions
        WHERE expires_at < NOW() - make_interval(days => $1)
           OR revoked_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected)
}
