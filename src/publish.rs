use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::ContentKey;
use crate::request::storage_id;
use crate::storage::{ObjectStorage, StorageError};

pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("artifact name '{0}' is not a single file name")]
    InvalidName(String),
    #[error("failed to read artifact {}: {source}", path.display())]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("upload failed ({upload}) and local fallback failed: {fallback}")]
    Exhausted {
        upload: String,
        #[source]
        fallback: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishLocation {
    ObjectStorage,
    LocalMedia,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub url: String,
    pub name: String,
    pub location: PublishLocation,
}

/// `<request_id>_step<step>_<hash>.mp4`, with the id passed through
/// [`storage_id`] so hostile ids cannot leave the media directory.
pub fn artifact_name(request_id: &str, step: u32, key: &ContentKey) -> String {
    format!("{}_step{step}_{key}.mp4", storage_id(request_id))
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}

pub struct ArtifactPublisher {
    storage: Option<Arc<dyn ObjectStorage>>,
    bucket: String,
    local_dir: PathBuf,
    local_base_url: String,
}

impl ArtifactPublisher {
    /// `local_base_url` is the URL prefix under which `local_dir` is served.
    pub fn new(
        storage: Option<Arc<dyn ObjectStorage>>,
        bucket: impl Into<String>,
        local_dir: impl Into<PathBuf>,
        local_base_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            local_dir: local_dir.into(),
            local_base_url: local_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn publish(&self, artifact: &Path, name: &str) -> Result<Published, PublishError> {
        if !is_plain_file_name(name) {
            return Err(PublishError::InvalidName(name.to_string()));
        }
        let upload_error = match &self.storage {
            Some(storage) => match self.upload(storage.as_ref(), artifact, name) {
                Ok(url) => {
                    info!(bucket = %self.bucket, name, url = %url, "Artifact uploaded");
                    return Ok(Published {
                        url,
                        name: name.to_string(),
                        location: PublishLocation::ObjectStorage,
                    });
                }
                Err(UploadFailure::Read(source)) => {
                    return Err(PublishError::ReadArtifact {
                        path: artifact.to_path_buf(),
                        source,
                    });
                }
                Err(UploadFailure::Storage(err)) => {
                    warn!(bucket = %self.bucket, name, error = %err, "Upload failed; using local media fallback");
                    err.to_string()
                }
            },
            None => "object storage not configured".to_string(),
        };

        let destination = self.local_dir.join(name);
        let copied = fs::create_dir_all(&self.local_dir).and_then(|_| fs::copy(artifact, &destination));
        match copied {
            Ok(_) => {
                let url = format!("{}/{name}", self.local_base_url);
                info!(path = %destination.display(), url = %url, "Artifact published to local media");
                Ok(Published {
                    url,
                    name: name.to_string(),
                    location: PublishLocation::LocalMedia,
                })
            }
            Err(fallback) => Err(PublishError::Exhausted {
                upload: upload_error,
                fallback,
            }),
        }
    }

    fn upload(
        &self,
        storage: &dyn ObjectStorage,
        artifact: &Path,
        name: &str,
    ) -> Result<String, UploadFailure> {
        let bytes = fs::read(artifact).map_err(UploadFailure::Read)?;
        storage
            .upload(&self.bucket, name, &bytes, VIDEO_CONTENT_TYPE)
            .map_err(UploadFailure::Storage)?;
        Ok(storage.public_url(&self.bucket, name))
    }
}

enum UploadFailure {
    Read(io::Error),
    Storage(StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tempfile::tempdir;

    #[test]
    fn names_carry_request_step_and_hash() {
        let key = ContentKey::of("x");
        assert_eq!(
            artifact_name("req", 3, &key),
            format!("req_step3_{}.mp4", key.as_str())
        );
    }

    #[test]
    fn hostile_request_ids_become_plain_file_names() {
        let key = ContentKey::of("x");
        for id in ["chat/42", "../../x", "a\\b"] {
            let name = artifact_name(id, 1, &key);
            assert!(is_plain_file_name(&name), "{name}");
            assert!(name.starts_with("h."), "{name}");
        }
        assert_ne!(
            artifact_name("user:1", 1, &key),
            artifact_name("user_1", 1, &key)
        );
    }

    #[test]
    fn rejects_names_with_path_components() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("Demo.mp4");
        fs::write(&artifact, b"video").unwrap();
        let publisher =
            ArtifactPublisher::new(None, "animations", temp.path().join("media"), "http://svc");

        for name in ["../escape.mp4", "nested/n.mp4", "", ".", "/abs.mp4"] {
            let err = publisher.publish(&artifact, name).unwrap_err();
            assert!(matches!(err, PublishError::InvalidName(_)), "{name}");
        }
        assert!(!temp.path().join("escape.mp4").exists());
    }

    #[test]
    fn uploads_when_storage_accepts() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("Demo.mp4");
        fs::write(&artifact, b"video").unwrap();
        let storage = Arc::new(MemoryStorage::new("https://cdn"));
        let publisher = ArtifactPublisher::new(
            Some(storage.clone()),
            "animations",
            temp.path().join("media"),
            "http://svc/media/videos",
        );

        let published = publisher.publish(&artifact, "r_step1_h.mp4").unwrap();
        assert_eq!(published.url, "https://cdn/animations/r_step1_h.mp4");
        assert_eq!(published.location, PublishLocation::ObjectStorage);
        let stored = storage.get("animations", "r_step1_h.mp4").unwrap();
        assert_eq!(stored.content_type, VIDEO_CONTENT_TYPE);
    }

    #[test]
    fn falls_back_to_local_media() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("Demo.mp4");
        fs::write(&artifact, b"video").unwrap();
        let storage = Arc::new(MemoryStorage::default());
        storage.set_failing(true);
        let media = temp.path().join("media/videos");
        let publisher =
            ArtifactPublisher::new(Some(storage), "animations", &media, "http://svc/media/videos/");

        let published = publisher.publish(&artifact, "n.mp4").unwrap();
        assert_eq!(published.url, "http://svc/media/videos/n.mp4");
        assert_eq!(published.location, PublishLocation::LocalMedia);
        assert_eq!(fs::read(media.join("n.mp4")).unwrap(), b"video");
    }

    #[test]
    fn reports_when_both_paths_fail() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("Demo.mp4");
        fs::write(&artifact, b"video").unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let publisher = ArtifactPublisher::new(None, "animations", &blocker, "http://svc");

        let err = publisher.publish(&artifact, "n.mp4").unwrap_err();
        assert!(matches!(err, PublishError::Exhausted { .. }));
    }
}
