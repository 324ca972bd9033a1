use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{RenderQuality, ServiceConfig};
use crate::executor::RenderExecutor;
use crate::locator::ArtifactLocator;

const HEALTH_SCENE_NAME: &str = "HealthCheckScene";
const HEALTH_SCENE: &str = r#"from manim import *

class HealthCheckScene(Scene):
    def construct(self):
        circle = Circle()
        self.play(Create(circle))
        self.wait(0.5)


if __name__ == '__main__':
    HealthCheckScene().render()
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RendererHealth {
    Healthy,
    Unhealthy(String),
    /// Health checking disabled in config.
    Unchecked,
}

impl RendererHealth {
    pub fn is_usable(&self) -> bool {
        !matches!(self, RendererHealth::Unhealthy(_))
    }
}

/// Renders a tiny known-good scene and requires media output.
pub fn check_renderer(config: &ServiceConfig) -> RendererHealth {
    let started_at = Instant::now();
    let executor = RenderExecutor::new(config.renderer.clone());
    let workspace = match executor.render_with(
        HEALTH_SCENE,
        HEALTH_SCENE_NAME,
        RenderQuality::Low,
        config.renderer.health_timeout(),
    ) {
        Ok(workspace) => workspace,
        Err(err) => {
            warn!(error = %err, "Renderer health check failed");
            return RendererHealth::Unhealthy(err.to_string());
        }
    };

    let locator = ArtifactLocator::new(&config.locator);
    match locator.locate(workspace.path(), HEALTH_SCENE_NAME) {
        Some(artifact) => {
            info!(
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                size = artifact.size,
                "Renderer health check passed"
            );
            RendererHealth::Healthy
        }
        None => {
            warn!("Renderer health check produced no media output");
            RendererHealth::Unhealthy("renderer produced no media output".to_string())
        }
    }
}

/// Configuration plus facts established once at startup.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub config: ServiceConfig,
    pub health: RendererHealth,
}

impl RenderContext {
    /// Runs the renderer health check when enabled.
    pub fn initialize(config: ServiceConfig) -> Self {
        let health = if config.renderer.health_check {
            check_renderer(&config)
        } else {
            RendererHealth::Unchecked
        };
        Self { config, health }
    }

    pub fn with_health(config: ServiceConfig, health: RendererHealth) -> Self {
        Self { config, health }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("renderer.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn config_with(program: String) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.renderer.program = program;
        config.renderer.args = Vec::new();
        config
    }

    #[test]
    fn healthy_when_renderer_writes_media() {
        let temp = tempfile::tempdir().unwrap();
        // $1 file, $2 scene, $3 quality, $4 --media_dir, $5 dir
        let program = script(
            temp.path(),
            "mkdir -p \"$5/videos\" && printf 'data' > \"$5/videos/$2.mp4\"",
        );
        let ctx = RenderContext::initialize(config_with(program));
        assert_eq!(ctx.health, RendererHealth::Healthy);
    }

    #[test]
    fn unhealthy_without_output() {
        let temp = tempfile::tempdir().unwrap();
        let program = script(temp.path(), "exit 0");
        let health = check_renderer(&config_with(program));
        assert!(!health.is_usable());
    }

    #[test]
    fn disabled_check_is_unchecked() {
        let mut config = config_with("/nonexistent".into());
        config.renderer.health_check = false;
        let ctx = RenderContext::initialize(config);
        assert_eq!(ctx.health, RendererHealth::Unchecked);
        assert!(ctx.health.is_usable());
    }
}
