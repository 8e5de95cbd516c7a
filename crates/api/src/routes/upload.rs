//! File upload routes

use axum::{
    extract::{multipart::MultipartError, Extension, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
    storage::{ensure_within_limit, sanitize_folder, StorageError},
};

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::Validation(e.body_text())
    }
}

/// POST /api/v1/upload
///
/// Multipart form with a `file` part and an optional `folder` field.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut folder: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("folder") => {
                folder = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or(StorageError::Empty)?;
    ensure_within_limit(bytes.len(), state.config.upload.max_bytes)?;
    let folder = sanitize_folder(folder.as_deref())?;

    let size = bytes.len();
    let uploaded = state.storage.upload(bytes, &filename, &folder).await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        public_id = %uploaded.public_id,
        size = size,
        "File uploaded"
    );

    Ok(Json(json!({ "success": true, "data": uploaded })))
}

/// DELETE /api/v1/upload/{public_id}
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(public_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.storage.delete(&public_id).await?;
    tracing::info!(user_id = %auth_user.user_id, public_id = %public_id, "File deleted");
    Ok(Json(json!({ "success": true })))
}
