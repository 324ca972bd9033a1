//! Per-request orchestration.
//!
//! sanitize → cache lookup → render → locate → publish → cache store → merge.
//! A cache hit skips straight to the merge. Any failure after sanitizing
//! degrades to the placeholder URL and returns immediately, so degraded
//! results never reach the cache or the request timeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CodeMirror, ContentCache, ContentKey, LocalCacheStore};
use crate::config::{MetadataConfig, ServiceConfig};
use crate::context::{RenderContext, RendererHealth};
use crate::degrade::{DegradationController, DegradeReason, PipelineState};
use crate::executor::{RenderError, RenderExecutor};
use crate::locator::ArtifactLocator;
use crate::locks::KeyedLocks;
use crate::metadata::{LocalMetadataStore, MetadataError, MetadataStore, RestMetadataStore};
use crate::observability::{
    MetricsCollector, STAGE_CACHE_LOOKUP, STAGE_CACHE_STORE, STAGE_EXECUTE, STAGE_LOCATE,
    STAGE_MERGE, STAGE_PUBLISH, STAGE_SANITIZE,
};
use crate::publish::{ArtifactPublisher, artifact_name};
use crate::request::RenderRequest;
use crate::sanitize::{self, SanitizeOutcome, Sanitized};
use crate::storage::{HttpObjectStorage, ObjectStorage};
use crate::timeline::{StatusReport, StepMerger, StepRecord};

#[derive(Debug, Clone)]
pub struct Buckets {
    pub artifacts: String,
    pub code: String,
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            artifacts: "animations".to_string(),
            code: "manim-code".to_string(),
        }
    }
}

/// External services the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub buckets: Buckets,
    pub metadata: Arc<dyn MetadataStore>,
    /// Second cache layer behind the local files. `None` when metadata is
    /// itself kept in local files.
    pub remote_cache: Option<Arc<dyn MetadataStore>>,
}

impl Backends {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let (storage, buckets) = match &config.storage {
            Some(storage_config) => {
                let storage = HttpObjectStorage::new(storage_config)
                    .context("Failed to build object storage client")?;
                (
                    Some(Arc::new(storage) as Arc<dyn ObjectStorage>),
                    Buckets {
                        artifacts: storage_config.artifact_bucket.clone(),
                        code: storage_config.code_bucket.clone(),
                    },
                )
            }
            None => (None, Buckets::default()),
        };

        let (metadata, remote_cache): (Arc<dyn MetadataStore>, Option<Arc<dyn MetadataStore>>) =
            match &config.metadata {
                MetadataConfig::Local => (
                    Arc::new(LocalMetadataStore::new(
                        config.records_dir(),
                        config.cache_dir(),
                    )),
                    None,
                ),
                MetadataConfig::Rest(rest) => {
                    let store: Arc<dyn MetadataStore> = Arc::new(
                        RestMetadataStore::new(rest)
                            .context("Failed to build metadata client")?,
                    );
                    (store.clone(), Some(store))
                }
            };

        Ok(Self {
            storage,
            buckets,
            metadata,
            remote_cache,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderResponse {
    pub request_id: String,
    pub step: u32,
    pub url: String,
    /// The request's timeline after this step was merged. Empty when degraded.
    pub steps: Vec<StepRecord>,
    pub state: PipelineState,
    pub content_key: String,
    pub cached: bool,
    pub sanitize: SanitizeOutcome,
}

impl RenderResponse {
    pub fn is_degraded(&self) -> bool {
        self.state.is_degraded()
    }
}

struct Produced {
    url: String,
    cached: bool,
}

struct Failure {
    reason: DegradeReason,
    cause: String,
}

impl Failure {
    fn new(reason: DegradeReason, cause: impl Into<String>) -> Self {
        Self {
            reason,
            cause: cause.into(),
        }
    }
}

impl From<RenderError> for Failure {
    fn from(err: RenderError) -> Self {
        let reason = match &err {
            RenderError::SyntaxInvalid { .. } => DegradeReason::SyntaxInvalid,
            RenderError::Timeout { .. } => DegradeReason::RenderTimeout,
            RenderError::Process { .. } | RenderError::Spawn { .. } | RenderError::Workspace(_) => {
                DegradeReason::RenderProcessFailure
            }
        };
        Failure::new(reason, err.to_string())
    }
}

pub struct Pipeline {
    ctx: RenderContext,
    executor: RenderExecutor,
    locator: ArtifactLocator,
    cache: ContentCache,
    publisher: ArtifactPublisher,
    merger: StepMerger,
    degrader: DegradationController,
    flights: KeyedLocks,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new(ctx: RenderContext, backends: Backends) -> Self {
        let config = &ctx.config;
        let mirror = backends.storage.as_ref().map(|storage| CodeMirror {
            storage: storage.clone(),
            bucket: backends.buckets.code.clone(),
        });
        let cache = ContentCache::new(
            LocalCacheStore::new(config.cache_dir()),
            backends.remote_cache.clone(),
            mirror,
        );
        let publisher = ArtifactPublisher::new(
            backends.storage.clone(),
            backends.buckets.artifacts.clone(),
            config.published_videos_dir(),
            config.published_video_url(""),
        );

        Self {
            executor: RenderExecutor::new(config.renderer.clone()),
            locator: ArtifactLocator::new(&config.locator),
            cache,
            publisher,
            merger: StepMerger::new(backends.metadata, config.merge_locking),
            degrader: DegradationController::new(config),
            flights: KeyedLocks::new(),
            metrics: MetricsCollector::new(),
            ctx,
        }
    }

    pub fn from_context(ctx: RenderContext) -> Result<Self> {
        let backends = Backends::from_config(&ctx.config)?;
        Ok(Self::new(ctx, backends))
    }

    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn placeholder_url(&self) -> &str {
        self.degrader.placeholder_url()
    }

    /// Always answers with a URL: the published artifact, a cached one, or
    /// the placeholder.
    #[instrument(skip(self, request), fields(request_id = %request.request_id(), step = request.step()))]
    pub fn process(&self, request: &RenderRequest) -> RenderResponse {
        self.metrics.record_request();

        let sanitized = {
            let _timer = self.metrics.start_stage(STAGE_SANITIZE);
            sanitize::sanitize(request.source())
        };
        let key = ContentKey::of(&sanitized.source);
        debug!(content_key = %key, scene = %sanitized.scene, "Sanitized scene source");

        if sanitized.outcome.is_substituted() && self.degrader.degrades_on_substitution() {
            let failure = Failure::new(
                DegradeReason::TemplateSubstituted,
                "scene source replaced by a template",
            );
            return self.degraded(request, sanitized, key, failure);
        }
        if let RendererHealth::Unhealthy(detail) = &self.ctx.health {
            let failure = Failure::new(DegradeReason::RendererUnhealthy, detail.clone());
            return self.degraded(request, sanitized, key, failure);
        }

        let produced = if self.ctx.config.single_flight {
            self.flights
                .with_lock(key.as_str(), || self.produce(request, &sanitized, &key))
        } else {
            self.produce(request, &sanitized, &key)
        };

        match produced {
            Ok(produced) => {
                let timeline = {
                    let _timer = self.metrics.start_stage(STAGE_MERGE);
                    self.merger
                        .merge(request.request_id(), request.step(), &produced.url)
                };
                info!(
                    url = %produced.url,
                    cached = produced.cached,
                    steps = timeline.len(),
                    "Render request completed"
                );
                RenderResponse {
                    request_id: request.request_id().to_string(),
                    step: request.step(),
                    url: produced.url,
                    steps: timeline.steps().to_vec(),
                    state: PipelineState::Normal,
                    content_key: key.to_string(),
                    cached: produced.cached,
                    sanitize: sanitized.outcome,
                }
            }
            Err(failure) => self.degraded(request, sanitized, key, failure),
        }
    }

    /// Everything up to and including the cache write; runs under the
    /// single-flight lock for `key` when enabled.
    fn produce(
        &self,
        request: &RenderRequest,
        sanitized: &Sanitized,
        key: &ContentKey,
    ) -> Result<Produced, Failure> {
        let hit = {
            let _timer = self.metrics.start_stage(STAGE_CACHE_LOOKUP);
            self.cache.lookup(key)
        };
        if let Some(url) = hit {
            self.metrics.record_cache_hit();
            info!(content_key = %key, url = %url, "Serving render from cache");
            return Ok(Produced { url, cached: true });
        }
        self.metrics.record_cache_miss();

        let workspace = {
            let _timer = self.metrics.start_stage(STAGE_EXECUTE);
            let rendered = self.executor.render(&sanitized.source, &sanitized.scene);
            if !matches!(rendered, Err(RenderError::SyntaxInvalid { .. })) {
                self.metrics.record_render();
            }
            rendered?
        };

        let artifact = {
            let _timer = self.metrics.start_stage(STAGE_LOCATE);
            self.locator.locate(workspace.path(), &sanitized.scene)
        }
        .ok_or_else(|| {
            Failure::new(
                DegradeReason::ArtifactNotFound,
                format!("no media output for scene '{}'", sanitized.scene),
            )
        })?;

        let min_bytes = self.ctx.config.min_artifact_bytes;
        if artifact.size < min_bytes {
            return Err(Failure::new(
                DegradeReason::SuspectArtifact {
                    size: artifact.size,
                },
                format!(
                    "{} is {} bytes, below the {} byte minimum",
                    artifact.path.display(),
                    artifact.size,
                    min_bytes
                ),
            ));
        }

        let name = artifact_name(request.request_id(), request.step(), key);
        let published = {
            let _timer = self.metrics.start_stage(STAGE_PUBLISH);
            self.publisher.publish(&artifact.path, &name)
        }
        .map_err(|err| Failure::new(DegradeReason::PublishFailure, err.to_string()))?;

        {
            let _timer = self.metrics.start_stage(STAGE_CACHE_STORE);
            if let Err(err) = self.cache.store(key, &sanitized.source, &published.url) {
                warn!(content_key = %key, error = %err, "Failed to store render in cache");
            }
        }

        Ok(Produced {
            url: published.url,
            cached: false,
        })
    }

    fn degraded(
        &self,
        request: &RenderRequest,
        sanitized: Sanitized,
        key: ContentKey,
        failure: Failure,
    ) -> RenderResponse {
        self.metrics.record_degraded(failure.reason.as_str());
        let url = self.degrader.degrade(
            request.request_id(),
            request.step(),
            &failure.reason,
            &failure.cause,
        );
        RenderResponse {
            request_id: request.request_id().to_string(),
            step: request.step(),
            url,
            steps: Vec::new(),
            state: PipelineState::Degraded(failure.reason),
            content_key: key.to_string(),
            cached: false,
            sanitize: sanitized.outcome,
        }
    }

    pub fn status(&self, request_id: &str) -> Result<StatusReport, MetadataError> {
        self.merger
            .status(crate::request::base_request_id(request_id))
    }

    /// Processes `requests` on up to `workers` threads. Responses come back
    /// in input order.
    pub fn run_batch(&self, requests: &[RenderRequest], workers: usize) -> Vec<RenderResponse> {
        self.metrics.reset();
        let started_at = Instant::now();
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<RenderResponse>>> =
            Mutex::new((0..requests.len()).map(|_| None).collect());
        let workers = workers.clamp(1, requests.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(request) = requests.get(idx) else {
                            break;
                        };
                        let response = self.process(request);
                        slots.lock().unwrap_or_else(PoisonError::into_inner)[idx] =
                            Some(response);
                    }
                });
            }
        });

        self.metrics.record_total_duration(started_at.elapsed());
        slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect()
    }
}
