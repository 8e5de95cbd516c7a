//! Role and permission routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use boilerkit_shared::{Action, Grant, Subject};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    rbac,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Grant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
}

/// GET /api/v1/permissions/me
pub async fn my_permissions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let permissions =
        rbac::effective_permissions(&state.pool, auth_user.user_id, auth_user.is_admin).await?;
    let roles = rbac::roles_for_user(&state.pool, auth_user.user_id).await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "isSuperuser": permissions.is_superuser(),
            "roles": roles,
            "permissions": permissions.grants(),
        }
    })))
}

/// GET /api/v1/roles
pub async fn list(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    rbac::require_permission(&state.pool, &auth_user, Action::Read, Subject::Role).await?;
    let roles = rbac::list_roles(&state.pool).await?;
    Ok(Json(json!({ "success": true, "data": roles })))
}

/// POST /api/v1/roles
pub async fn create(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateRoleRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    rbac::require_permission(&state.pool, &auth_user, Action::Create, Subject::Role).await?;

    let role = rbac::create_role(
        &state.pool,
        &req.name,
        req.description.as_deref(),
        &req.permissions,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": role })),
    ))
}

/// POST /api/v1/users/{user_id}/roles
pub async fn assign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AssignRoleRequest>,
) -> ApiResult<Json<Value>> {
    rbac::require_permission(&state.pool, &auth_user, Action::Update, Subject::Role).await?;

    let assigned = rbac::assign_role(&state.pool, user_id, req.role_id).await?;
    tracing::info!(
        actor = %auth_user.user_id,
        user_id = %user_id,
        role_id = %req.role_id,
        assigned = assigned,
        "Role assignment"
    );

    Ok(Json(json!({ "success": true, "data": { "assigned": assigned } })))
}

/// DELETE /api/v1/users/{user_id}/roles/{role_id}
pub async fn remove(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    rbac::require_permission(&state.pool, &auth_user, Action::Update, Subject::Role).await?;

    rbac::remove_role(&state.pool, user_id, role_id).await?;
    tracing::info!(actor = %auth_user.user_id, user_id = %user_id, role_id = %role_id, "Role removed");

    Ok(Json(json!({ "success": true })))
}
