//! Blob storage (§6 / SPEC_FULL §4.7): a narrow `put` + `public_url`
//! contract in front of an HTTP object store: build a `reqwest::Client`
//! once, reuse it, and never panic on a non-2xx response.

use async_trait::async_trait;
use chrono::{Datelike, Utc};

use crate::error::BlobStoreError;

pub type Result<T> = std::result::Result<T, BlobStoreError>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;
    fn public_url(&self, path: &str) -> String;
}

/// `captures/{hw}/{YYYY}/{MM}/{DD}/{image_name}` — deterministic, so the
/// overwrite-on-conflict semantics the finalizer relies on (§4.3 step 5)
/// fall straight out of plain HTTP PUT semantics.
pub fn capture_path(hw_id: &str, image_name: &str) -> String {
    let now = Utc::now();
    format!(
        "captures/{hw_id}/{:04}/{:02}/{:02}/{image_name}",
        now.year(),
        now.month(),
        now.day(),
    )
}

pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpBlobStore {
    pub fn new(endpoint: String, bucket: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            bucket,
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            path
        )
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let url = self.object_url(path);
        let resp = self
            .client
            .put(&url)
            .header("Content-Type", content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| BlobStoreError::Internal(e.into()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobStoreError::UploadFailed { status, body });
        }
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        self.object_url(path)
    }
}

/// In-process stand-in for integration tests, grounded in the same
/// "test double behind the same trait" pattern as `InMemoryPersistence`.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    objects: std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(path).cloned()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        self.objects.write().await.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_path_is_dated_and_deterministic_for_the_same_day() {
        let p1 = capture_path("AABBCCDDEEFF", "img_1.jpg");
        let p2 = capture_path("AABBCCDDEEFF", "img_1.jpg");
        assert_eq!(p1, p2);
        assert!(p1.starts_with("captures/AABBCCDDEEFF/"));
        assert!(p1.ends_with("/img_1.jpg"));
    }
}
