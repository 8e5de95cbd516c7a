//! Cloudinary upload API
//!
//! Signed requests against the REST upload API. The signature is the
//! SHA-256 of the sorted `key=value` parameters joined with `&`, followed by
//! the API secret.

use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::{validate_public_id, FileStorage, StorageError, UploadedFile};

#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
}

impl CloudinaryConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.cloudinary.com";
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
    resource_type: String,
}

#[derive(Debug, Deserialize)]
struct DestroyResponse {
    result: String,
}

/// Signature over the parameters that Cloudinary signs
///
/// `file`, `api_key`, `resource_type` and `signature_algorithm` are not part
/// of the signed set.
pub fn sign(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    hex::encode(Sha256::digest(format!("{joined}{api_secret}").as_bytes()))
}

pub struct CloudinaryStorage {
    client: Client,
    config: CloudinaryConfig,
}

impl CloudinaryStorage {
    pub fn new(config: CloudinaryConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self, resource_type: &str, action: &str) -> String {
        format!(
            "{}/v1_1/{}/{}/{}",
            self.config.base_url, self.config.cloud_name, resource_type, action
        )
    }

    async fn read_error(response: reqwest::Response) -> StorageError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StorageError::Rejected { status, body }
    }
}

#[async_trait]
impl FileStorage for CloudinaryStorage {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, folder: &str) -> Result<UploadedFile, StorageError> {
        let timestamp = OffsetDateTime::now_utc().unix_timestamp().to_string();
        let signature = sign(
            &[("folder", folder.to_string()), ("timestamp", timestamp.clone())],
            &self.config.api_secret,
        );

        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(filename.to_string()))
            .text("folder", folder.to_string())
            .text("timestamp", timestamp)
            .text("api_key", self.config.api_key.clone())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");

        let response = self
            .client
            .post(self.endpoint("auto", "upload"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let err = Self::read_error(response).await;
            tracing::error!(folder = %folder, error = %err, "Cloudinary upload failed");
            return Err(err);
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        tracing::info!(public_id = %uploaded.public_id, resource_type = %uploaded.resource_type, "File uploaded to Cloudinary");
        Ok(UploadedFile {
            url: uploaded.secure_url,
            public_id: uploaded.public_id,
            resource_type: uploaded.resource_type,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<(), StorageError> {
        validate_public_id(public_id)?;

        let timestamp = OffsetDateTime::now_utc().unix_timestamp().to_string();
        let signature = sign(
            &[("public_id", public_id.to_string()), ("timestamp", timestamp.clone())],
            &self.config.api_secret,
        );

        let response = self
            .client
            .post(self.endpoint("image", "destroy"))
            .form(&[
                ("public_id", public_id),
                ("timestamp", timestamp.as_str()),
                ("api_key", self.config.api_key.as_str()),
                ("signature", signature.as_str()),
                ("signature_algorithm", "sha256"),
            ])
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let destroyed: DestroyResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        match destroyed.result.as_str() {
            "ok" => {
                tracing::info!(public_id = %public_id, "File deleted from Cloudinary");
                Ok(())
            }
            "not found" => Err(StorageError::NotFound(public_id.to_string())),
            other => Err(StorageError::Rejected {
                status: 200,
                body: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    fn storage(base_url: String) -> CloudinaryStorage {
        CloudinaryStorage::new(CloudinaryConfig {
            cloud_name: "demo".to_string(),
            api_key: "key_123".to_string(),
            api_secret: "shh".to_string(),
            base_url,
        })
    }

    #[test]
    fn test_signature_sorts_and_skips_empty() {
        let expected = hex::encode(Sha256::digest(b"folder=avatars&timestamp=1700000000shh"));
        let signature = sign(
            &[
                ("timestamp", "1700000000".to_string()),
                ("folder", "avatars".to_string()),
                ("tags", String::new()),
            ],
            "shh",
        );
        assert_eq!(signature, expected);
    }

    #[tokio::test]
    async fn test_upload_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1_1/demo/auto/upload")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("name=\"folder\"\r\n\r\navatars".to_string()),
                Matcher::Regex("name=\"api_key\"\r\n\r\nkey_123".to_string()),
                Matcher::Regex("name=\"signature_algorithm\"\r\n\r\nsha256".to_string()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"secure_url":"https://res.cloudinary.com/demo/image/upload/v1/avatars/abc.png","public_id":"avatars/abc","resource_type":"image"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let uploaded = storage(server.url())
            .upload(b"png-bytes".to_vec(), "abc.png", "avatars")
            .await
            .unwrap();

        assert_eq!(uploaded.public_id, "avatars/abc");
        assert_eq!(uploaded.resource_type, "image");
        assert!(uploaded.url.starts_with("https://res.cloudinary.com/"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1_1/demo/auto/upload")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Invalid Signature"}}"#)
            .create_async()
            .await;

        let err = storage(server.url())
            .upload(b"x".to_vec(), "a.txt", "general")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_delete_ok_and_not_found() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/v1_1/demo/image/destroy")
            .match_body(Matcher::UrlEncoded("public_id".into(), "avatars/abc".into()))
            .with_status(200)
            .with_body(r#"{"result":"ok"}"#)
            .create_async()
            .await;
        let missing = server
            .mock("POST", "/v1_1/demo/image/destroy")
            .match_body(Matcher::UrlEncoded("public_id".into(), "avatars/gone".into()))
            .with_status(200)
            .with_body(r#"{"result":"not found"}"#)
            .create_async()
            .await;

        let storage = storage(server.url());
        storage.delete("avatars/abc").await.unwrap();
        assert!(matches!(
            storage.delete("avatars/gone").await,
            Err(StorageError::NotFound(_))
        ));
        ok.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_refuses_traversal_without_calling_out() {
        let server = mockito::Server::new_async().await;
        let err = storage(server.url()).delete("../other-cloud").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }
}
