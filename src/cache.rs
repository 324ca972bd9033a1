//! Content-addressed render cache.
//!
//! Entries are keyed by the SHA-256 of the sanitized scene source. The local
//! layer is one JSON document per key; a remote metadata store, when
//! configured, is consulted after a local miss and kept in sync on store.

use std::fmt;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::metadata::MetadataStore;
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn of(source: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(source.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub url: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// JSON file per key under a single directory.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    dir: PathBuf,
}

impl LocalCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }

    pub fn get(&self, hash: &str) -> io::Result<Option<CacheEntry>> {
        let content = match fs::read(self.entry_path(hash)) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let entry = serde_json::from_slice(&content)
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        Ok(Some(entry))
    }

    /// Atomically replaces the entry for `entry.hash`.
    pub fn put(&self, entry: &CacheEntry) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut file, entry)
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        file.flush()?;
        file.persist(self.entry_path(&entry.hash))
            .map_err(|err| err.error)?;
        Ok(())
    }

    pub fn len(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut count = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Where mirrored scene sources are uploaded as `<hash>.py`.
#[derive(Clone)]
pub struct CodeMirror {
    pub storage: Arc<dyn ObjectStorage>,
    pub bucket: String,
}

pub struct ContentCache {
    local: LocalCacheStore,
    remote: Option<Arc<dyn MetadataStore>>,
    mirror: Option<CodeMirror>,
}

impl ContentCache {
    pub fn new(
        local: LocalCacheStore,
        remote: Option<Arc<dyn MetadataStore>>,
        mirror: Option<CodeMirror>,
    ) -> Self {
        Self {
            local,
            remote,
            mirror,
        }
    }

    pub fn local(&self) -> &LocalCacheStore {
        &self.local
    }

    /// Published URL for `key`, if any layer has one. Store errors count as a
    /// miss.
    pub fn lookup(&self, key: &ContentKey) -> Option<String> {
        match self.local.get(key.as_str()) {
            Ok(Some(entry)) => {
                debug!(content_key = %key, layer = "local", "Cache hit");
                return Some(entry.url);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(content_key = %key, error = %err, "Local cache unavailable; treating as miss");
            }
        }

        let remote = self.remote.as_ref()?;
        match remote.load_cache(key.as_str()) {
            Ok(Some(entry)) => {
                debug!(content_key = %key, layer = "remote", "Cache hit");
                if let Err(err) = self.local.put(&entry) {
                    warn!(content_key = %key, error = %err, "Failed to back-fill local cache");
                }
                Some(entry.url)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(content_key = %key, error = %err, "Remote cache unavailable; treating as miss");
                None
            }
        }
    }

    /// Upserts the entry for `key`. An existing entry keeps its creation
    /// time. Remote and mirror failures are logged, not returned.
    pub fn store(&self, key: &ContentKey, source: &str, url: &str) -> io::Result<()> {
        let created_at = match self.local.get(key.as_str()) {
            Ok(Some(existing)) => existing.created_at,
            _ => Utc::now(),
        };
        let entry = CacheEntry {
            hash: key.as_str().to_string(),
            url: url.to_string(),
            source: source.to_string(),
            created_at,
        };
        self.local.put(&entry)?;
        info!(content_key = %key, url, "Stored render in cache");

        if let Some(remote) = &self.remote
            && let Err(err) = remote.store_cache(&entry)
        {
            warn!(content_key = %key, error = %err, "Failed to upsert remote cache entry");
        }

        if let Some(mirror) = &self.mirror {
            let name = format!("{key}.py");
            match mirror
                .storage
                .upload(&mirror.bucket, &name, source.as_bytes(), "text/x-python")
            {
                Ok(()) => debug!(content_key = %key, bucket = %mirror.bucket, "Mirrored scene source"),
                Err(err) => {
                    warn!(content_key = %key, error = %err, "Failed to mirror scene source")
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;
    use crate::storage::MemoryStorage;
    use tempfile::tempdir;

    #[test]
    fn content_key_is_sha256_hex() {
        assert_eq!(
            ContentKey::of("abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn store_is_an_upsert() {
        let temp = tempdir().unwrap();
        let cache = ContentCache::new(LocalCacheStore::new(temp.path()), None, None);
        let key = ContentKey::of("scene");

        assert_eq!(cache.lookup(&key), None);
        cache.store(&key, "scene", "https://a").unwrap();
        let first = cache.local().get(key.as_str()).unwrap().unwrap();
        cache.store(&key, "scene", "https://b").unwrap();
        let second = cache.local().get(key.as_str()).unwrap().unwrap();

        assert_eq!(cache.lookup(&key).as_deref(), Some("https://b"));
        assert_eq!(cache.local().len().unwrap(), 1);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let temp = tempdir().unwrap();
        let key = ContentKey::of("scene");
        fs::write(temp.path().join(format!("{key}.json")), b"{not json").unwrap();
        let cache = ContentCache::new(LocalCacheStore::new(temp.path()), None, None);
        assert_eq!(cache.lookup(&key), None);
    }

    #[test]
    fn remote_hit_back_fills_local() {
        let temp = tempdir().unwrap();
        let remote = Arc::new(MemoryMetadataStore::default());
        let key = ContentKey::of("remote scene");
        remote
            .store_cache(&CacheEntry {
                hash: key.as_str().to_string(),
                url: "https://remote".into(),
                source: "remote scene".into(),
                created_at: Utc::now(),
            })
            .unwrap();

        let cache = ContentCache::new(LocalCacheStore::new(temp.path()), Some(remote), None);
        assert_eq!(cache.lookup(&key).as_deref(), Some("https://remote"));
        assert!(cache.local().get(key.as_str()).unwrap().is_some());
    }

    #[test]
    fn mirror_failure_does_not_fail_store() {
        let temp = tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::default());
        storage.set_failing(true);
        let cache = ContentCache::new(
            LocalCacheStore::new(temp.path()),
            None,
            Some(CodeMirror {
                storage: storage.clone(),
                bucket: "code".into(),
            }),
        );
        let key = ContentKey::of("s");
        cache.store(&key, "s", "https://u").unwrap();
        assert!(storage.names("code").is_empty());

        storage.set_failing(false);
        cache.store(&key, "s", "https://u").unwrap();
        assert_eq!(storage.names("code"), vec![format!("{key}.py")]);
    }
}
