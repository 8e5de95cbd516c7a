//! User and credential persistence

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// `accounts.provider_id` of email/password credentials
pub const CREDENTIAL_PROVIDER: &str = "credential";

const MAX_EMAIL_LENGTH: usize = 254;
const MAX_NAME_LENGTH: usize = 100;

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: String,
    pub email_verified: bool,
    pub image: Option<String>,
    pub role: String,
    pub is_admin: bool,
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub ban_expires: Option<OffsetDateTime>,
    pub is_trial_active: bool,
    pub trial_start_date: Option<OffsetDateTime>,
    pub trial_end_date: Option<OffsetDateTime>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const USER_COLUMNS: &str = "id, name, firstname, lastname, email, email_verified, image, role, \
     is_admin, banned, ban_reason, ban_expires, is_trial_active, trial_start_date, trial_end_date, \
     stripe_subscription_id, created_at, updated_at";

impl UserRecord {
    pub fn trial_running(&self, now: OffsetDateTime) -> bool {
        self.is_trial_active && self.trial_end_date.is_some_and(|end| end > now)
    }
}

/// Public view of the signed-in user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub name: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: String,
    pub email_verified: bool,
    pub image: Option<String>,
    pub role: String,
    pub is_admin: bool,
    pub is_on_trial: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UserView {
    pub fn from_record(user: &UserRecord, now: OffsetDateTime) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            email: user.email.clone(),
            email_verified: user.email_verified,
            image: user.image.clone(),
            role: user.role.clone(),
            is_admin: user.is_admin,
            is_on_trial: user.trial_running(now),
            trial_start_date: user.trial_start_date,
            trial_end_date: user.trial_end_date,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug)]
pub struct NewUser<'a> {
    pub name: &'a str,
    pub firstname: Option<&'a str>,
    pub lastname: Option<&'a str>,
    pub email: &'a str,
    pub image: Option<&'a str>,
    pub password_hash: &'a str,
}

/// Trimmed, lowercased address with a plausible shape
pub fn normalize_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    let valid = email.len() <= MAX_EMAIL_LENGTH
        && !email.chars().any(char::is_whitespace)
        && match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
            }
            None => false,
        };
    if !valid {
        return Err(ApiError::Validation("Invalid email address".to_string()));
    }
    Ok(email)
}

pub fn validate_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Name is required".to_string()));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ApiError::Validation(format!(
            "Name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}

pub async fn find_by_id(pool: &PgPool, user_id: Uuid) -> ApiResult<Option<UserRecord>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    Ok(sqlx::query_as(&sql).bind(user_id).fetch_optional(pool).await?)
}

pub async fn find_by_email(pool: &PgPool, email: &str) -> ApiResult<Option<UserRecord>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
    Ok(sqlx::query_as(&sql).bind(email).fetch_optional(pool).await?)
}

/// Argon2 hash of the user's email/password credential
pub async fn credential_hash(pool: &PgPool, user_id: Uuid) -> ApiResult<Option<String>> {
    let hash: Option<Option<String>> = sqlx::query_scalar(
        "SELECT password FROM accounts WHERE user_id = $1 AND provider_id = $2",
    )
    .bind(user_id)
    .bind(CREDENTIAL_PROVIDER)
    .fetch_optional(pool)
    .await?;
    Ok(hash.flatten())
}

/// Insert the user and its credential account together
pub async fn create_with_password(pool: &PgPool, new: NewUser<'_>) -> ApiResult<UserRecord> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        "INSERT INTO users (name, firstname, lastname, email, image) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
    );
    let user: UserRecord = sqlx::query_as(&sql)
        .bind(new.name)
        .bind(new.firstname)
        .bind(new.lastname)
        .bind(new.email)
        .bind(new.image)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::Conflict("An account with this email already exists".to_string())
            }
            other => other.into(),
        })?;

    sqlx::query(
        r#"
        INSERT INTO accounts (account_id, provider_id, user_id, password)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(user.id.to_string())
    .bind(CREDENTIAL_PROVIDER)
    .bind(user.id)
    .bind(new.password_hash)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(user)
}

pub async fn set_password(pool: &PgPool, user_id: Uuid, password_hash: &str) -> ApiResult<()> {
    let updated = sqlx::query(
        r#"
        UPDATE accounts
        SET password = $3, updated_at = NOW()
        WHERE user_id = $1 AND provider_id = $2
        "#,
    )
    .bind(user_id)
    .bind(CREDENTIAL_PROVIDER)
    .bind(password_hash)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(())
}

pub async fn mark_email_verified(pool: &PgPool, user_id: Uuid) -> ApiResult<bool> {
    let updated = sqlx::query(
        "UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1",
    )
    .bind(user_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Delete the user; sessions, accounts, roles and history cascade
pub async fn delete(pool: &PgPool, user_id: Uuid) -> ApiResult<bool> {
    let deleted = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}
