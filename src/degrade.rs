//! Graceful degradation to a fixed placeholder artifact.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{PLACEHOLDER_FILE_NAME, ServiceConfig};

/// Files smaller than this are not trusted as a playable placeholder.
pub const PLACEHOLDER_MIN_BYTES: u64 = 1000;

/// A lone `ftyp` box: size 24, major brand `mp42`, compatible `mp42` and
/// `isom`.
const MINIMAL_MP4: [u8; 24] = [
    0x00, 0x00, 0x00, 0x18, 0x66, 0x74, 0x79, 0x70, 0x6d, 0x70, 0x34, 0x32, 0x00, 0x00, 0x00, 0x01,
    0x6d, 0x70, 0x34, 0x32, 0x69, 0x73, 0x6f, 0x6d,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradeReason {
    SyntaxInvalid,
    RenderTimeout,
    RenderProcessFailure,
    ArtifactNotFound,
    SuspectArtifact { size: u64 },
    PublishFailure,
    RendererUnhealthy,
    TemplateSubstituted,
}

impl DegradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeReason::SyntaxInvalid => "syntax_invalid",
            DegradeReason::RenderTimeout => "render_timeout",
            DegradeReason::RenderProcessFailure => "render_process_failure",
            DegradeReason::ArtifactNotFound => "artifact_not_found",
            DegradeReason::SuspectArtifact { .. } => "suspect_artifact",
            DegradeReason::PublishFailure => "publish_failure",
            DegradeReason::RendererUnhealthy => "renderer_unhealthy",
            DegradeReason::TemplateSubstituted => "template_substituted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Normal,
    Degraded(DegradeReason),
}

impl PipelineState {
    pub fn is_degraded(&self) -> bool {
        matches!(self, PipelineState::Degraded(_))
    }
}

#[derive(Debug, Clone)]
pub struct DegradationController {
    placeholder_url: String,
    degrade_on_substitution: bool,
}

impl DegradationController {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            placeholder_url: config.placeholder_url(),
            degrade_on_substitution: config.degrade_on_substitution,
        }
    }

    pub fn placeholder_url(&self) -> &str {
        &self.placeholder_url
    }

    pub fn degrades_on_substitution(&self) -> bool {
        self.degrade_on_substitution
    }

    /// Logs the transition and returns the URL the caller receives.
    pub fn degrade(&self, request_id: &str, step: u32, reason: &DegradeReason, cause: &str) -> String {
        warn!(
            request_id,
            step,
            stage = reason.as_str(),
            error = cause,
            placeholder = %self.placeholder_url,
            "Degrading to placeholder"
        );
        self.placeholder_url.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceholderStatus {
    pub path: PathBuf,
    pub bytes: u64,
    pub suspect: bool,
}

/// Makes sure `<media_dir>/placeholder-animation.mp4` exists: copied from
/// `placeholder_source` when configured, otherwise a header-only stub. An
/// existing file is left alone.
pub fn provision_placeholder(config: &ServiceConfig) -> Result<PlaceholderStatus> {
    let path = config.media_dir.join(PLACEHOLDER_FILE_NAME);
    fs::create_dir_all(&config.media_dir).with_context(|| {
        format!("Failed to create media directory: {}", config.media_dir.display())
    })?;

    if !path.is_file() {
        match &config.placeholder_source {
            Some(source) => {
                fs::copy(source, &path).with_context(|| {
                    format!("Failed to copy placeholder from {}", source.display())
                })?;
                info!(source = %source.display(), path = %path.display(), "Placeholder copied");
            }
            None => {
                fs::write(&path, MINIMAL_MP4).with_context(|| {
                    format!("Failed to write placeholder stub: {}", path.display())
                })?;
                info!(path = %path.display(), "Minimal placeholder written");
            }
        }
    }

    let bytes = fs::metadata(&path)
        .with_context(|| format!("Failed to stat placeholder: {}", path.display()))?
        .len();
    let suspect = bytes < PLACEHOLDER_MIN_BYTES;
    if suspect {
        warn!(path = %path.display(), bytes, "Placeholder is suspiciously small");
    }
    Ok(PlaceholderStatus {
        path,
        bytes,
        suspect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn placeholder_url_defaults_under_service_url() {
        let config = ServiceConfig {
            service_url: "https://svc.example".into(),
            ..ServiceConfig::default()
        };
        let controller = DegradationController::new(&config);
        assert_eq!(
            controller.degrade("r", 1, &DegradeReason::ArtifactNotFound, "none"),
            "https://svc.example/placeholder-animation.mp4"
        );
    }

    #[test]
    fn stub_placeholder_is_flagged_suspect() {
        let temp = tempdir().unwrap();
        let config = ServiceConfig {
            media_dir: temp.path().join("media"),
            ..ServiceConfig::default()
        };
        let status = provision_placeholder(&config).unwrap();
        assert_eq!(status.bytes, 24);
        assert!(status.suspect);
        let bytes = fs::read(&status.path).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(declared as usize, bytes.len());
    }

    #[test]
    fn configured_source_is_copied_once() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("clip.mp4");
        fs::write(&source, vec![7u8; 4096]).unwrap();
        let config = ServiceConfig {
            media_dir: temp.path().join("media"),
            placeholder_source: Some(source.clone()),
            ..ServiceConfig::default()
        };
        let status = provision_placeholder(&config).unwrap();
        assert_eq!(status.bytes, 4096);
        assert!(!status.suspect);

        fs::write(&source, b"changed").unwrap();
        assert_eq!(provision_placeholder(&config).unwrap().bytes, 4096);
    }

    #[test]
    fn degraded_state_serializes_reason() {
        let state = PipelineState::Degraded(DegradeReason::SuspectArtifact { size: 12 });
        assert!(state.is_degraded());
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            r#"{"state":"degraded","reason":"suspect_artifact","size":12}"#
        );
    }
}
