//! Files on local disk
//!
//! Used in development and by self-hosted deployments that put a static file
//! server in front of the upload directory.

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    resource_type_for, sanitize_filename, validate_public_id, FileStorage, StorageError, UploadedFile,
};

pub struct LocalStorage {
    root: PathBuf,
    public_url: String,
}

impl LocalStorage {
    pub fn new(root: PathBuf, public_url: String) -> Self {
        Self {
            root,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, public_id: &str) -> Result<PathBuf, StorageError> {
        validate_public_id(public_id)?;
        Ok(public_id.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, folder: &str) -> Result<UploadedFile, StorageError> {
        let name = format!("{}-{}", Uuid::new_v4().simple(), sanitize_filename(filename));
        let public_id = format!("{folder}/{name}");
        let path = self.path_for(&public_id)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        tracing::info!(public_id = %public_id, size = bytes.len(), "File stored on disk");
        Ok(UploadedFile {
            url: format!("{}/{}", self.public_url, public_id),
            resource_type: resource_type_for(&name).to_string(),
            public_id,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<(), StorageError> {
        let path = self.path_for(public_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(public_id = %public_id, "File deleted from disk");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(public_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
