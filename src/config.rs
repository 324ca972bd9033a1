use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8080";
pub const PLACEHOLDER_FILE_NAME: &str = "placeholder-animation.mp4";

/// Everything the pipeline needs, built once at startup and handed to each
/// component. Nothing in the crate reads process-wide state directly.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Public base URL of this service; local-fallback artifacts and the
    /// placeholder are served under it.
    pub service_url: String,
    /// Overrides `<service_url>/placeholder-animation.mp4`.
    pub placeholder_url: Option<String>,
    /// Optional file copied into the media directory as the placeholder.
    pub placeholder_source: Option<PathBuf>,
    pub media_dir: PathBuf,
    pub state_dir: PathBuf,
    pub renderer: RendererConfig,
    pub locator: LocatorConfig,
    pub min_artifact_bytes: u64,
    pub storage: Option<StorageConfig>,
    pub metadata: MetadataConfig,
    pub merge_locking: MergeLocking,
    pub single_flight: bool,
    pub degrade_on_substitution: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            placeholder_url: None,
            placeholder_source: None,
            media_dir: PathBuf::from("media"),
            state_dir: PathBuf::from("state"),
            renderer: RendererConfig::default(),
            locator: LocatorConfig::default(),
            min_artifact_bytes: 1024,
            storage: None,
            metadata: MetadataConfig::default(),
            merge_locking: MergeLocking::default(),
            single_flight: true,
            degrade_on_substitution: false,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServiceConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise falls back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn placeholder_url(&self) -> String {
        self.placeholder_url.clone().unwrap_or_else(|| {
            format!(
                "{}/{}",
                self.service_url.trim_end_matches('/'),
                PLACEHOLDER_FILE_NAME
            )
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.state_dir.join("records")
    }

    /// Directory served as `<service_url>/media/videos/`.
    pub fn published_videos_dir(&self) -> PathBuf {
        self.media_dir.join("videos")
    }

    pub fn published_video_url(&self, file_name: &str) -> String {
        format!(
            "{}/media/videos/{}",
            self.service_url.trim_end_matches('/'),
            file_name
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    pub program: String,
    /// Arguments placed before the scene file, e.g. `-m manim render`.
    pub args: Vec<String>,
    pub quality: RenderQuality,
    pub verbosity: String,
    pub timeout_secs: u64,
    /// External syntax checker run after the built-in check; the scene file
    /// path is appended as the last argument.
    pub syntax_check: Option<Vec<String>>,
    pub health_check: bool,
    pub health_timeout_secs: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".into(), "manim".into(), "render".into()],
            quality: RenderQuality::Medium,
            verbosity: "DEBUG".to_string(),
            timeout_secs: 120,
            syntax_check: None,
            health_check: true,
            health_timeout_secs: 30,
        }
    }
}

impl RendererConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RenderQuality {
    Low,
    #[default]
    Medium,
    High,
    Production,
    Fourk,
}

impl RenderQuality {
    pub fn flag(self) -> &'static str {
        match self {
            RenderQuality::Low => "-ql",
            RenderQuality::Medium => "-qm",
            RenderQuality::High => "-qh",
            RenderQuality::Production => "-qp",
            RenderQuality::Fourk => "-qk",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub max_depth: usize,
    pub extensions: Vec<String>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            extensions: vec!["mp4".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_artifact_bucket")]
    pub artifact_bucket: String,
    #[serde(default = "default_code_bucket")]
    pub code_bucket: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_artifact_bucket() -> String {
    "animations".to_string()
}

fn default_code_bucket() -> String {
    "manim-code".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MetadataConfig {
    /// JSON documents under `<state_dir>/records`.
    #[default]
    Local,
    Rest(RestMetadataConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestMetadataConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_records_table")]
    pub records_table: String,
    #[serde(default = "default_cache_table")]
    pub cache_table: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_records_table() -> String {
    "chat_messages".to_string()
}

fn default_cache_table() -> String {
    "animation_cache".to_string()
}

/// Whether concurrent merges into the same request timeline are serialized
/// inside this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeLocking {
    #[default]
    None,
    PerRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: ServiceConfig = serde_yaml::from_str(
            "service_url: https://render.example.com/\nrenderer:\n  timeout_secs: 5\n",
        )
        .unwrap();
        assert_eq!(config.renderer.timeout_secs, 5);
        assert_eq!(config.renderer.program, "python3");
        assert_eq!(config.min_artifact_bytes, 1024);
        assert!(matches!(config.metadata, MetadataConfig::Local));
        assert_eq!(
            config.placeholder_url(),
            "https://render.example.com/placeholder-animation.mp4"
        );
    }

    #[test]
    fn rest_metadata_is_tagged_by_kind() {
        let config: ServiceConfig = serde_yaml::from_str(
            "metadata:\n  kind: rest\n  base_url: https://db.example.com\n  api_key: secret\nmerge_locking: per-request\n",
        )
        .unwrap();
        match config.metadata {
            MetadataConfig::Rest(rest) => {
                assert_eq!(rest.records_table, "chat_messages");
                assert_eq!(rest.cache_table, "animation_cache");
            }
            MetadataConfig::Local => panic!("expected rest metadata"),
        }
        assert_eq!(config.merge_locking, MergeLocking::PerRequest);
    }

    #[test]
    fn quality_flags_follow_renderer_cli() {
        assert_eq!(RenderQuality::Low.flag(), "-ql");
        assert_eq!(RenderQuality::default().flag(), "-qm");
        assert_eq!(RenderQuality::Fourk.flag(), "-qk");
    }
}
