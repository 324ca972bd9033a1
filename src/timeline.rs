//! Step-indexed results for one logical request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::MergeLocking;
use crate::locks::KeyedLocks;
use crate::metadata::{MetadataError, MetadataStore, RequestRecord, RequestStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub url: String,
}

impl StepRecord {
    pub fn new(step: u32, url: impl Into<String>) -> Self {
        Self {
            step,
            url: url.into(),
        }
    }
}

/// Ascending by step, at most one record per step. Deserialized input is
/// normalized on the way in, so a stored list in any order loads sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<StepRecord>", into = "Vec<StepRecord>")]
pub struct RequestTimeline {
    steps: Vec<StepRecord>,
}

impl From<Vec<StepRecord>> for RequestTimeline {
    fn from(records: Vec<StepRecord>) -> Self {
        let mut timeline = RequestTimeline::default();
        for record in records {
            timeline.merge(record.step, record.url);
        }
        timeline
    }
}

impl From<RequestTimeline> for Vec<StepRecord> {
    fn from(timeline: RequestTimeline) -> Self {
        timeline.steps
    }
}

impl RequestTimeline {
    /// Replaces the url of an existing step or inserts a new one in order.
    pub fn merge(&mut self, step: u32, url: impl Into<String>) {
        let url = url.into();
        match self.steps.binary_search_by_key(&step, |record| record.step) {
            Ok(idx) => self.steps[idx].url = url,
            Err(idx) => self.steps.insert(idx, StepRecord { step, url }),
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn get(&self, step: u32) -> Option<&str> {
        self.steps
            .binary_search_by_key(&step, |record| record.step)
            .ok()
            .map(|idx| self.steps[idx].url.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub request_id: String,
    pub status: RequestStatus,
    pub timeline: RequestTimeline,
}

/// Read-modify-write of request timelines against the metadata store, which
/// stays the source of truth.
pub struct StepMerger {
    store: Arc<dyn MetadataStore>,
    locking: MergeLocking,
    locks: KeyedLocks,
}

impl StepMerger {
    pub fn new(store: Arc<dyn MetadataStore>, locking: MergeLocking) -> Self {
        Self {
            store,
            locking,
            locks: KeyedLocks::new(),
        }
    }

    /// Records `url` for `step` and returns the timeline as it now stands.
    /// Never fails: a store that cannot take the timeline gets a status-only
    /// update, and if that fails too the error is logged.
    pub fn merge(&self, request_id: &str, step: u32, url: &str) -> RequestTimeline {
        match self.locking {
            MergeLocking::None => self.merge_unlocked(request_id, step, url),
            MergeLocking::PerRequest => self
                .locks
                .with_lock(request_id, || self.merge_unlocked(request_id, step, url)),
        }
    }

    fn merge_unlocked(&self, request_id: &str, step: u32, url: &str) -> RequestTimeline {
        let existing = match self.store.load_record(request_id) {
            Ok(record) => record.map(|r| r.timeline).unwrap_or_default(),
            Err(err) => {
                // Writing without the stored steps would drop them.
                warn!(request_id, step, error = %err, "Failed to load timeline; skipping timeline write");
                self.fallback_status(request_id, step);
                return RequestTimeline::from(vec![StepRecord::new(step, url)]);
            }
        };

        let mut timeline = existing;
        timeline.merge(step, url);
        let record = RequestRecord {
            request_id: request_id.to_string(),
            timeline,
            status: RequestStatus::Completed,
        };

        match self.store.save_record(&record) {
            Ok(()) => {
                debug!(request_id, step, steps = record.timeline.len(), "Timeline updated");
            }
            Err(err) => {
                warn!(request_id, step, error = %err, "Failed to write timeline");
                self.fallback_status(request_id, step);
            }
        }
        record.timeline
    }

    fn fallback_status(&self, request_id: &str, step: u32) {
        if let Err(err) = self.store.set_status(request_id, RequestStatus::Completed) {
            error!(request_id, step, error = %err, "Failed to update request status");
        }
    }

    /// `completed` once any step is recorded, otherwise `pending`.
    pub fn status(&self, request_id: &str) -> Result<StatusReport, MetadataError> {
        let timeline = self
            .store
            .load_record(request_id)?
            .map(|record| record.timeline)
            .unwrap_or_default();
        let status = if timeline.is_empty() {
            RequestStatus::Pending
        } else {
            RequestStatus::Completed
        };
        Ok(StatusReport {
            request_id: request_id.to_string(),
            status,
            timeline,
        })
    }
}
