//! Role-based access control
//!
//! A user's effective permissions are the union of the grants of every role
//! assigned to them. Administrators (`users.is_admin`) are superusers.

use boilerkit_shared::{Action, Grant, PermissionSet, Subject};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};

const MAX_ROLE_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleWithGrants {
    #[serde(flatten)]
    pub role: Role,
    pub permissions: Vec<Grant>,
}

#[derive(Debug, FromRow)]
struct GrantRow {
    role_id: Uuid,
    resource_type: String,
    actions: serde_json::Value,
}

/// Parse one stored grant, `None` when it is malformed
fn parse_grant(resource_type: &str, actions: &serde_json::Value) -> Option<Grant> {
    let actions: Vec<String> = match serde_json::from_value(actions.clone()) {
        Ok(actions) => actions,
        Err(e) => {
            tracing::warn!(resource_type = %resource_type, error = %e, "Skipping grant with malformed actions");
            return None;
        }
    };
    match Grant::from_stored(resource_type, &actions) {
        Ok(grant) => Some(grant),
        Err(e) => {
            tracing::warn!(resource_type = %resource_type, error = %e, "Skipping unknown grant");
            None
        }
    }
}

/// Union of stored grants
///
/// Rows naming an unknown subject or action are skipped, so a grant written
/// by a newer release never widens access on an older one.
pub fn fold_grants<'a, I>(rows: I) -> PermissionSet
where
    I: IntoIterator<Item = (&'a str, &'a serde_json::Value)>,
{
    PermissionSet::from_grants(
        rows.into_iter()
            .filter_map(|(resource_type, actions)| parse_grant(resource_type, actions)),
    )
}

pub async fn effective_permissions(pool: &PgPool, user_id: Uuid, is_admin: bool) -> ApiResult<PermissionSet> {
    if is_admin {
        return Ok(PermissionSet::superuser());
    }

    let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
        r#"
        SELECT rr.resource_type, rr.actions
        FROM user_roles ur
        JOIN role_resources rr ON rr.role_id = ur.role_id
        WHERE ur.user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(fold_grants(rows.iter().map(|(r, a)| (r.as_str(), a))))
}

/// Guard for handlers: fails with 403 unless the user may do `action` on `subject`
pub async fn require_permission(
    pool: &PgPool,
    user: &AuthUser,
    action: Action,
    subject: Subject,
) -> ApiResult<PermissionSet> {
    let permissions = effective_permissions(pool, user.user_id, user.is_admin).await?;
    if !permissions.can(action, subject) {
        tracing::warn!(
            user_id = %user.user_id,
            action = %action,
            subject = %subject,
            "Permission denied"
        );
        return Err(ApiError::Forbidden);
    }
    Ok(permissions)
}

pub async fn roles_for_user(pool: &PgPool, user_id: Uuid) -> ApiResult<Vec<Role>> {
    let roles = sqlx::query_as::<_, Role>(
        r#"
        SELECT r.id, r.name, r.description, r.created_at
        FROM roles r
        JOIN user_roles ur ON ur.role_id = r.id
        WHERE ur.user_id = $1
        ORDER BY r.name
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(roles)
}

pub async fn list_roles(pool: &PgPool) -> ApiResult<Vec<RoleWithGrants>> {
    let roles = sqlx::query_as::<_, Role>(
        "SELECT id, name, description, created_at FROM roles ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let grant_rows = sqlx::query_as::<_, GrantRow>(
        "SELECT role_id, resource_type, actions FROM role_resources ORDER BY resource_type",
    )
    .fetch_all(pool)
    .await?;

    Ok(roles
        .into_iter()
        .map(|role| {
            let permissions = grant_rows
                .iter()
                .filter(|row| row.role_id == role.id)
                .filter_map(|row| parse_grant(&row.resource_type, &row.actions))
                .collect();
            RoleWithGrants { role, permissions }
        })
        .collect())
}

pub fn validate_role_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Role name is required".to_string()));
    }
    if name.chars().count() > MAX_ROLE_NAME_LENGTH {
        return Err(ApiError::Validation(format!(
            "Role name must be at most {MAX_ROLE_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}

/// Create a role with its grants in one transaction
pub async fn create_role(
    pool: &PgPool,
    name: &str,
    description: Option<&str>,
    grants: &[Grant],
) -> ApiResult<RoleWithGrants> {
    let name = validate_role_name(name)?;
    let mut tx = pool.begin().await?;

    let role = sqlx::query_as::<_, Role>(
        r#"
        INSERT INTO roles (name, description)
        VALUES ($1, $2)
        RETURNING id, name, description, created_at
        "#,
    )
    .bind(&name)
    .bind(description)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ApiError::Conflict(format!("Role '{name}' already exists"))
        }
        other => other.into(),
    })?;

    for grant in grants {
        let actions = serde_json::to_value(&grant.actions)
            .map_err(|e| ApiError::Internal(format!("serialize actions: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO role_resources (role_id, resource_type, actions)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(role.id)
        .bind(grant.subject.as_str())
        .bind(actions)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(role_id = %role.id, name = %role.name, grants = grants.len(), "Role created");

    Ok(RoleWithGrants {
        role,
        permissions: grants.to_vec(),
    })
}

/// Returns false when the user already had the role
pub async fn assign_role(pool: &PgPool, user_id: Uuid, role_id: Uuid) -> ApiResult<bool> {
    let user_exists: Option<(bool,)> = sqlx::query_as("SELECT TRUE FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    let role_exists: Option<(bool,)> = sqlx::query_as("SELECT TRUE FROM roles WHERE id = $1")
        .bind(role_id)
        .fetch_optional(pool)
        .await?;
    if user_exists.is_none() || role_exists.is_none() {
        return Err(ApiError::NotFound);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO user_roles (user_id, role_id)
        VALUES ($1, $2)
        ON CONFLICT (user_id, role_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(role_id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(inserted > 0)
}

pub async fn remove_role(pool: &PgPool, user_id: Uuid, role_id: Uuid) -> ApiResult<()> {
    let removed = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
        .bind(user_id)
        .bind(role_id)
        .execute(pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(())
}
