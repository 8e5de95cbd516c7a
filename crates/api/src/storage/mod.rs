//! Uploaded file storage
//!
//! Handlers talk to a [`FileStorage`]; the backend is picked from
//! configuration at startup.

mod cloudinary;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use cloudinary::{CloudinaryConfig, CloudinaryStorage};
pub use local::LocalStorage;

use crate::config::{UploadBackend, UploadConfig};

/// Folder used when the client does not name one
pub const DEFAULT_FOLDER: &str = "general";

const MAX_FOLDER_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("No file provided")]
    Empty,

    #[error("File is {size} bytes, the limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Storage transport error: {0}")]
    Transport(String),

    #[error("Storage provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Where a stored file ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub url: String,
    pub public_id: String,
    pub resource_type: String,
}

#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store `bytes` under `folder`, which has already been sanitised
    async fn upload(&self, bytes: Vec<u8>, filename: &str, folder: &str) -> Result<UploadedFile, StorageError>;

    async fn delete(&self, public_id: &str) -> Result<(), StorageError>;
}

pub fn storage_from_config(config: &UploadConfig) -> Arc<dyn FileStorage> {
    match &config.backend {
        UploadBackend::Cloudinary(cloudinary) => {
            tracing::info!(cloud_name = %cloudinary.cloud_name, "File uploads stored on Cloudinary");
            Arc::new(CloudinaryStorage::new(cloudinary.clone()))
        }
        UploadBackend::Local { dir, public_url } => {
            tracing::info!(dir = %dir.display(), "File uploads stored on local disk");
            Arc::new(LocalStorage::new(dir.clone(), public_url.clone()))
        }
    }
}

pub fn ensure_within_limit(size: usize, limit: usize) -> Result<(), StorageError> {
    if size == 0 {
        return Err(StorageError::Empty);
    }
    if size > limit {
        return Err(StorageError::TooLarge { size, limit });
    }
    Ok(())
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Normalise a client supplied folder
///
/// Missing or blank folders become [`DEFAULT_FOLDER`]. Segments may only
/// contain ASCII letters, digits, `-`, `_` and `.`, and `.`/`..` are refused.
pub fn sanitize_folder(folder: Option<&str>) -> Result<String, StorageError> {
    let trimmed = folder.map(|f| f.trim().trim_matches('/')).unwrap_or_default();
    if trimmed.is_empty() {
        return Ok(DEFAULT_FOLDER.to_string());
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() > MAX_FOLDER_DEPTH || !segments.iter().all(|s| is_safe_segment(s)) {
        return Err(StorageError::InvalidPath(trimmed.to_string()));
    }
    Ok(segments.join("/"))
}

/// Refuse public ids that could resolve outside the storage root
pub fn validate_public_id(public_id: &str) -> Result<(), StorageError> {
    let ok = !public_id.is_empty()
        && !public_id.starts_with('/')
        && public_id.split('/').all(is_safe_segment);
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(public_id.to_string()))
    }
}

/// Last path component with unsafe characters replaced
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Resource type in Cloudinary's vocabulary, from the file extension
pub fn resource_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" | "bmp" | "ico" | "avif" | "heic" | "pdf" => "image",
        "mp4" | "mov" | "webm" | "avi" | "mkv" | "mp3" | "wav" | "ogg" | "m4a" | "flac" => "video",
        _ => "raw",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_defaults_to_general() {
        assert_eq!(sanitize_folder(None).unwrap(), "general");
        assert_eq!(sanitize_folder(Some("  ")).unwrap(), "general");
        assert_eq!(sanitize_folder(Some("/")).unwrap(), "general");
    }

    #[test]
    fn test_folder_normalised() {
        assert_eq!(sanitize_folder(Some("/avatars/")).unwrap(), "avatars");
        assert_eq!(sanitize_folder(Some("users/42/docs")).unwrap(), "users/42/docs");
    }

    #[test]
    fn test_folder_traversal_refused() {
        for folder in ["../secrets", "a/../../b", "a//b", "a/./b", "sp ace", "a/b/c/d/e"] {
            assert!(
                matches!(sanitize_folder(Some(folder)), Err(StorageError::InvalidPath(_))),
                "{folder:?} should be refused"
            );
        }
    }

    #[test]
    fn test_public_id_validation() {
        assert!(validate_public_id("general/abc-photo.png").is_ok());
        for id in ["", "/etc/passwd", "../x", "general/../../x", "a\\b", "a//b"] {
            assert!(validate_public_id(id).is_err(), "{id:?} should be refused");
        }
    }

    #[test]
    fn test_filename_sanitised() {
        assert_eq!(sanitize_filename("photo.png"), "photo.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\My Photo.jpg"), "My_Photo.jpg");
        assert_eq!(sanitize_filename(".env"), "env");
        assert_eq!(sanitize_filename(""), "file");
    }

    #[test]
    fn test_resource_types() {
        assert_eq!(resource_type_for("a.PNG"), "image");
        assert_eq!(resource_type_for("clip.mp4"), "video");
        assert_eq!(resource_type_for("notes.txt"), "raw");
        assert_eq!(resource_type_for("README"), "raw");
    }

    #[test]
    fn test_size_limits() {
        assert!(matches!(ensure_within_limit(0, 10), Err(StorageError::Empty)));
        assert!(ensure_within_limit(10, 10).is_ok());
        assert!(matches!(
            ensure_within_limit(11, 10),
            Err(StorageError::TooLarge { size: 11, limit: 10 })
        ));
    }
}
