//! Object storage for broker logo uploads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub public_url: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// URL the object will be served from once stored under `key`.
    fn public_url(&self, key: &str) -> String;

    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StoreError>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash-addressed object key so re-uploading the same image is a no-op.
pub fn logo_object_key(slug: &str, content_hash: &str, extension: &str) -> String {
    let ext = extension.trim_start_matches('.').trim().to_ascii_lowercase();
    let ext = if ext.is_empty() { "bin".to_string() } else { ext };
    let short = &content_hash[..content_hash.len().min(16)];
    format!("{slug}/{short}.{ext}")
}

/// Filesystem-backed object store, used for dry runs and local mirrors.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stored(&self, key: &str, hash: String, size: usize, deduplicated: bool) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            public_url: self.public_url(key),
            content_hash: hash,
            byte_size: size,
            deduplicated,
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url)
    }

    /// Writes through a temp file and an atomic rename.
    async fn put(
        &self,
        key: &str,
        _content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StoreError> {
        let hash = content_hash(bytes);
        let absolute_path = self.root.join(key);
        let Some(parent) = absolute_path.parent().map(Path::to_path_buf) else {
            return Err(StoreError::Message(format!("object key `{key}` has no parent")));
        };
        fs::create_dir_all(&parent).await?;

        if fs::try_exists(&absolute_path).await? {
            return Ok(self.stored(key, hash, bytes.len(), true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(self.stored(key, hash, bytes.len(), false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(self.stored(key, hash, bytes.len(), true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io(err))
            }
        }
    }
}

/// Hosted storage bucket reached over the backend's `/storage/v1` HTTP API.
#[derive(Debug, Clone)]
pub struct RestObjectStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bucket: String,
    backoff: BackoffPolicy,
}

impl RestObjectStore {
    pub fn new(
        base_url: &str,
        api_key: &str,
        bucket: &str,
        backoff: BackoffPolicy,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            bucket: bucket.to_string(),
            backoff,
        })
    }
}

#[async_trait]
impl ObjectStore for RestObjectStore {
    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{key}",
            self.base_url, self.bucket
        )
    }

    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StoreError> {
        let url = format!("{}/storage/v1/object/{}/{key}", self.base_url, self.bucket);
        let hash = content_hash(bytes);
        let span = info_span!("object_put", bucket = %self.bucket, key, bytes = bytes.len());

        async {
            for attempt in 0..=self.backoff.max_retries {
                let result = self
                    .client
                    .post(&url)
                    .header("apikey", &self.api_key)
                    .bearer_auth(&self.api_key)
                    .header("Content-Type", content_type)
                    .header("x-upsert", "true")
                    .body(bytes.to_vec())
                    .send()
                    .await;

                let retry = match result {
                    Ok(resp) if resp.status().is_success() => {
                        return Ok(StoredObject {
                            key: key.to_string(),
                            public_url: self.public_url(key),
                            content_hash: hash.clone(),
                            byte_size: bytes.len(),
                            deduplicated: false,
                        });
                    }
                    Ok(resp) => {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        if classify_status(status) == RetryDisposition::NonRetryable
                            || attempt == self.backoff.max_retries
                        {
                            return Err(StoreError::HttpStatus {
                                status: status.as_u16(),
                                url: url.clone(),
                                body,
                            });
                        }
                        status.to_string()
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                            || attempt == self.backoff.max_retries
                        {
                            return Err(StoreError::Request(err));
                        }
                        err.to_string()
                    }
                };
                warn!(attempt, reason = %retry, "retrying logo upload");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
            Err(StoreError::HttpStatus {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                url: url.clone(),
                body: "retries exhausted".to_string(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            content_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn logo_keys_are_hash_addressed_per_slug() {
        let hash = content_hash(b"png-bytes");
        let key = logo_object_key("ig-markets", &hash, ".PNG");
        assert_eq!(key, format!("ig-markets/{}.png", &hash[..16]));
        assert_eq!(logo_object_key("x", "abc", ""), "x/abc.bin");
    }

    #[tokio::test]
    async fn local_writes_deduplicate_by_key() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path(), "https://cdn.example.com/logos/");
        let key = logo_object_key("oanda", &content_hash(b"img"), "webp");

        let first = store.put(&key, "image/webp", b"img").await.expect("first put");
        let second = store.put(&key, "image/webp", b"img").await.expect("second put");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.public_url, format!("https://cdn.example.com/logos/{key}"));
        assert!(dir.path().join(&key).exists());
    }

    #[test]
    fn public_urls_point_at_the_bucket() {
        let store = RestObjectStore::new(
            "https://db.example.com/",
            "key",
            "broker-logos",
            BackoffPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            store.public_url("oanda/abc.png"),
            "https://db.example.com/storage/v1/object/public/broker-logos/oanda/abc.png"
        );
    }
}
