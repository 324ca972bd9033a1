use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage rejected upload of '{bucket}/{name}' (status {status}): {body}")]
    Rejected {
        bucket: String,
        name: String,
        status: u16,
        body: String,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable object storage for published artifacts and mirrored sources.
pub trait ObjectStorage: Send + Sync {
    /// Uploads `bytes`, replacing any existing object with the same name.
    fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    fn public_url(&self, bucket: &str, name: &str) -> String;
}

/// Supabase-compatible storage REST API.
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpObjectStorage {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

impl ObjectStorage for HttpObjectStorage {
    fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let url = format!("{}/storage/v1/object/{bucket}/{name}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes.to_vec())
            .send()?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(StorageError::Rejected {
            bucket: bucket.to_string(),
            name: name.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    fn public_url(&self, bucket: &str, name: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{name}", self.base_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Process-local storage, used for tests and dry runs.
#[derive(Debug)]
pub struct MemoryStorage {
    base_url: String,
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    failing: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new("memory://storage")
    }
}

impl MemoryStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent upload fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, bucket: &str, name: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }

    pub fn names(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

impl ObjectStorage for MemoryStorage {
    fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "upload of '{bucket}/{name}' refused"
            )));
        }
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (bucket.to_string(), name.to_string()),
                StoredObject {
                    bytes: bytes.to_vec(),
                    content_type: content_type.to_string(),
                },
            );
        Ok(())
    }

    fn public_url(&self, bucket: &str, name: &str) -> String {
        format!("{}/{bucket}/{name}", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_public_url_follows_storage_layout() {
        let storage = HttpObjectStorage::new(&StorageConfig {
            base_url: "https://project.supabase.co/".into(),
            api_key: "key".into(),
            artifact_bucket: "animations".into(),
            code_bucket: "manim-code".into(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(
            storage.public_url("animations", "a_step1_ff.mp4"),
            "https://project.supabase.co/storage/v1/object/public/animations/a_step1_ff.mp4"
        );
    }

    #[test]
    fn memory_storage_upserts_and_can_fail() {
        let storage = MemoryStorage::default();
        storage.upload("b", "x", b"one", "text/plain").unwrap();
        storage.upload("b", "x", b"two", "text/plain").unwrap();
        assert_eq!(storage.get("b", "x").unwrap().bytes, b"two");
        assert_eq!(storage.names("b"), vec!["x".to_string()]);

        storage.set_failing(true);
        assert!(matches!(
            storage.upload("b", "y", b"", "text/plain"),
            Err(StorageError::Unavailable(_))
        ));
    }
}
