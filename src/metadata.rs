//! Durable per-request records and remote cache rows.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::cache::{CacheEntry, LocalCacheStore};
use crate::config::RestMetadataConfig;
use crate::request::storage_id;
use crate::timeline::RequestTimeline;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("metadata document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("metadata request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("metadata service returned status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Completed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    #[serde(default)]
    pub timeline: RequestTimeline,
    #[serde(default)]
    pub status: RequestStatus,
}

/// Storage for request timelines and, optionally, shared cache rows.
pub trait MetadataStore: Send + Sync {
    fn load_record(&self, request_id: &str) -> Result<Option<RequestRecord>, MetadataError>;

    /// Persists the whole record, replacing what was stored.
    fn save_record(&self, record: &RequestRecord) -> Result<(), MetadataError>;

    /// Updates only the status, leaving the stored timeline untouched.
    fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<(), MetadataError>;

    fn load_cache(&self, hash: &str) -> Result<Option<CacheEntry>, MetadataError>;

    fn store_cache(&self, entry: &CacheEntry) -> Result<(), MetadataError>;
}

/// JSON documents under a state directory: `records/<id>.json` and
/// `cache/<hash>.json`.
#[derive(Debug, Clone)]
pub struct LocalMetadataStore {
    records_dir: PathBuf,
    cache: LocalCacheStore,
}

impl LocalMetadataStore {
    pub fn new(records_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            records_dir: records_dir.into(),
            cache: LocalCacheStore::new(cache_dir),
        }
    }

    fn record_path(&self, request_id: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.json", storage_id(request_id)))
    }
}

impl MetadataStore for LocalMetadataStore {
    fn load_record(&self, request_id: &str) -> Result<Option<RequestRecord>, MetadataError> {
        match fs::read(self.record_path(request_id)) {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save_record(&self, record: &RequestRecord) -> Result<(), MetadataError> {
        write_json_atomic(&self.records_dir, &self.record_path(&record.request_id), record)
    }

    fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<(), MetadataError> {
        let mut record = self.load_record(request_id)?.unwrap_or_else(|| RequestRecord {
            request_id: request_id.to_string(),
            ..RequestRecord::default()
        });
        record.status = status;
        self.save_record(&record)
    }

    fn load_cache(&self, hash: &str) -> Result<Option<CacheEntry>, MetadataError> {
        Ok(self.cache.get(hash)?)
    }

    fn store_cache(&self, entry: &CacheEntry) -> Result<(), MetadataError> {
        Ok(self.cache.put(entry)?)
    }
}

fn write_json_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), MetadataError> {
    fs::create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.flush()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// PostgREST-compatible tables. Request rows carry `id`, `animations` and
/// `animation_status`; cache rows carry `query_hash`, `animation_url`,
/// `manim_code` and `created_at`.
#[derive(Debug, Clone)]
pub struct RestMetadataStore {
    client: Client,
    base_url: String,
    api_key: String,
    records_table: String,
    cache_table: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordRow {
    id: String,
    #[serde(default)]
    animations: Option<RequestTimeline>,
    #[serde(default)]
    animation_status: Option<RequestStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRow {
    query_hash: String,
    animation_url: String,
    #[serde(default)]
    manim_code: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl RestMetadataStore {
    pub fn new(config: &RestMetadataConfig) -> Result<Self, MetadataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            records_table: config.records_table.clone(),
            cache_table: config.cache_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
    }

    fn send(&self, builder: RequestBuilder) -> Result<reqwest::blocking::Response, MetadataError> {
        let response = self.authorized(builder).send()?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(MetadataError::Rejected {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }

    fn upsert<T: Serialize>(&self, table: &str, conflict: &str, row: &T) -> Result<(), MetadataError> {
        let builder = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);
        self.send(builder).map(|_| ())
    }
}

impl MetadataStore for RestMetadataStore {
    fn load_record(&self, request_id: &str) -> Result<Option<RequestRecord>, MetadataError> {
        let builder = self
            .client
            .get(self.table_url(&self.records_table))
            .query(&[
                ("id", format!("eq.{request_id}")),
                ("select", "id,animations,animation_status".to_string()),
            ]);
        let rows: Vec<RecordRow> = self.send(builder)?.json()?;
        Ok(rows.into_iter().next().map(|row| RequestRecord {
            request_id: row.id,
            timeline: row.animations.unwrap_or_default(),
            status: row.animation_status.unwrap_or_default(),
        }))
    }

    fn save_record(&self, record: &RequestRecord) -> Result<(), MetadataError> {
        let row = RecordRow {
            id: record.request_id.clone(),
            animations: Some(record.timeline.clone()),
            animation_status: Some(record.status),
        };
        self.upsert(&self.records_table, "id", &row)
    }

    fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<(), MetadataError> {
        let builder = self
            .client
            .patch(self.table_url(&self.records_table))
            .query(&[("id", format!("eq.{request_id}"))])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "animation_status": status }));
        self.send(builder).map(|_| ())
    }

    fn load_cache(&self, hash: &str) -> Result<Option<CacheEntry>, MetadataError> {
        let builder = self
            .client
            .get(self.table_url(&self.cache_table))
            .query(&[
                ("query_hash", format!("eq.{hash}")),
                ("select", "*".to_string()),
            ]);
        let rows: Vec<CacheRow> = self.send(builder)?.json()?;
        Ok(rows.into_iter().next().map(|row| CacheEntry {
            hash: row.query_hash,
            url: row.animation_url,
            source: row.manim_code,
            created_at: row.created_at.unwrap_or_else(Utc::now),
        }))
    }

    fn store_cache(&self, entry: &CacheEntry) -> Result<(), MetadataError> {
        let row = CacheRow {
            query_hash: entry.hash.clone(),
            animation_url: entry.url.clone(),
            manim_code: entry.source.clone(),
            created_at: Some(entry.created_at),
        };
        self.upsert(&self.cache_table, "query_hash", &row)
    }
}

/// In-memory store with switchable failure modes, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<String, RequestRecord>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    fail_reads: AtomicBool,
    fail_record_writes: AtomicBool,
    fail_status_writes: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fails full record writes while status-only updates still succeed.
    pub fn set_fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), MetadataError> {
        if flag.load(Ordering::SeqCst) {
            Err(MetadataError::Unavailable(format!("{what} refused")))
        } else {
            Ok(())
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load_record(&self, request_id: &str) -> Result<Option<RequestRecord>, MetadataError> {
        Self::check(&self.fail_reads, "read")?;
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_id)
            .cloned())
    }

    fn save_record(&self, record: &RequestRecord) -> Result<(), MetadataError> {
        Self::check(&self.fail_record_writes, "record write")?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<(), MetadataError> {
        Self::check(&self.fail_status_writes, "status write")?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(request_id.to_string())
            .or_insert_with(|| RequestRecord {
                request_id: request_id.to_string(),
                ..RequestRecord::default()
            })
            .status = status;
        Ok(())
    }

    fn load_cache(&self, hash: &str) -> Result<Option<CacheEntry>, MetadataError> {
        Self::check(&self.fail_reads, "read")?;
        Ok(self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned())
    }

    fn store_cache(&self, entry: &CacheEntry) -> Result<(), MetadataError> {
        Self::check(&self.fail_record_writes, "cache write")?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.hash.clone(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeLocking;
    use crate::timeline::{StepMerger, StepRecord};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn local_store_round_trips_records() {
        let temp = tempdir().unwrap();
        let store = LocalMetadataStore::new(temp.path().join("records"), temp.path().join("cache"));
        assert_eq!(store.load_record("req-1").unwrap(), None);

        let record = RequestRecord {
            request_id: "req-1".into(),
            timeline: RequestTimeline::from(vec![StepRecord::new(1, "https://one")]),
            status: RequestStatus::Completed,
        };
        store.save_record(&record).unwrap();
        assert_eq!(store.load_record("req-1").unwrap(), Some(record));
    }

    #[test]
    fn status_update_keeps_timeline() {
        let temp = tempdir().unwrap();
        let store = LocalMetadataStore::new(temp.path().join("records"), temp.path().join("cache"));
        store.set_status("r", RequestStatus::Completed).unwrap();
        let record = store.load_record("r").unwrap().unwrap();
        assert!(record.timeline.is_empty());
        assert_eq!(record.status, RequestStatus::Completed);
    }

    #[test]
    fn lookalike_ids_keep_separate_records() {
        let temp = tempdir().unwrap();
        let records = temp.path().join("records");
        let store = LocalMetadataStore::new(&records, temp.path().join("cache"));
        let merger = StepMerger::new(Arc::new(store.clone()), MergeLocking::None);

        merger.merge("user:1", 1, "https://one");
        merger.merge("user/1", 1, "https://slash");
        let report = merger.status("user_1").unwrap();
        assert_eq!(report.status, RequestStatus::Pending);
        assert!(report.timeline.is_empty());
        assert_eq!(
            merger.status("user:1").unwrap().timeline.get(1),
            Some("https://one")
        );

        let long = "x".repeat(400);
        merger.merge(&long, 2, "https://long");
        assert_eq!(store.load_record(&long).unwrap().unwrap().request_id, long);
        merger.merge("../../escaped", 1, "https://up");
        for entry in fs::read_dir(&records).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().contains(".."), "{name:?}");
        }
        assert_eq!(fs::read_dir(&records).unwrap().count(), 4);
        assert!(!temp.path().join("escaped.json").exists());
    }

    #[test]
    fn rest_rows_use_legacy_column_names() {
        let row: RecordRow = serde_json::from_str(
            r#"{"id":"m1","animations":[{"step":2,"url":"b"},{"step":1,"url":"a"}],"animation_status":"completed"}"#,
        )
        .unwrap();
        let timeline = row.animations.unwrap();
        assert_eq!(timeline.steps()[0].step, 1);
        assert_eq!(row.animation_status, Some(RequestStatus::Completed));

        let null_row: RecordRow =
            serde_json::from_str(r#"{"id":"m2","animations":null,"animation_status":null}"#).unwrap();
        assert!(null_row.animations.is_none());
    }
}
