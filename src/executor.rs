//! Bounded renderer subprocess.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RenderQuality, RendererConfig};
use crate::syntax::{self, SyntaxIssue};

pub const SCENE_FILE_NAME: &str = "scene.py";
pub const LOG_FILE_NAME: &str = "render.log";
const LOG_EXCERPT_CHARS: usize = 500;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("scene failed syntax check: {issue}")]
    SyntaxInvalid { issue: SyntaxIssue },
    #[error("renderer timed out after {}s", after.as_secs())]
    Timeout { after: Duration, log: String },
    #[error("renderer exited with status {exit_code:?}")]
    Process { exit_code: Option<i32>, log: String },
    #[error("failed to launch renderer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to prepare render workspace: {0}")]
    Workspace(#[from] io::Error),
}

impl RenderError {
    /// Combined renderer output captured before the failure.
    pub fn log(&self) -> &str {
        match self {
            RenderError::Timeout { log, .. } | RenderError::Process { log, .. } => log,
            _ => "",
        }
    }
}

/// Temporary directory owned by one render. Removed on drop.
#[derive(Debug)]
pub struct RenderWorkspace {
    dir: TempDir,
    scene: String,
    log: String,
    elapsed: Duration,
}

impl RenderWorkspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

#[derive(Debug, Clone)]
pub struct RenderExecutor {
    config: RendererConfig,
    work_root: Option<PathBuf>,
}

impl RenderExecutor {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            work_root: None,
        }
    }

    /// Creates workspaces under `root` instead of the system temp dir.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn render(&self, source: &str, scene: &str) -> Result<RenderWorkspace, RenderError> {
        self.render_with(source, scene, self.config.quality, self.config.timeout())
    }

    pub fn render_with(
        &self,
        source: &str,
        scene: &str,
        quality: RenderQuality,
        timeout: Duration,
    ) -> Result<RenderWorkspace, RenderError> {
        let dir = match &self.work_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("render-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("render-").tempdir()?,
        };
        let scene_file = dir.path().join(SCENE_FILE_NAME);
        fs::write(&scene_file, source)?;

        if let Err(issue) = syntax::check(source) {
            warn!(scene, error = %issue, "Scene rejected by syntax check");
            return Err(RenderError::SyntaxInvalid { issue });
        }
        if let Some(command) = &self.config.syntax_check
            && let Err(issue) = syntax::check_external(command, &scene_file)
        {
            warn!(scene, error = %issue, "Scene rejected by external syntax check");
            return Err(RenderError::SyntaxInvalid { issue });
        }

        let log_path = dir.path().join(LOG_FILE_NAME);
        let log_file = File::create(&log_path)?;
        let stderr_file = log_file.try_clone()?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(&scene_file)
            .arg(scene)
            .arg(quality.flag())
            .arg("--media_dir")
            .arg(dir.path())
            .arg("--verbosity")
            .arg(&self.config.verbosity)
            .arg("--progress_bar")
            .arg("none")
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file));
        debug!(command = ?command, "Launching renderer");

        let started_at = Instant::now();
        let mut child = command.spawn().map_err(|source| RenderError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        let status = supervise(&mut child, started_at, timeout)?;
        let elapsed = started_at.elapsed();
        let log = fs::read_to_string(&log_path).unwrap_or_default();

        match status {
            None => {
                warn!(
                    scene,
                    elapsed_ms = elapsed.as_millis() as u64,
                    log = %excerpt(&log),
                    "Renderer timed out"
                );
                Err(RenderError::Timeout {
                    after: timeout,
                    log,
                })
            }
            Some(status) if !status.success() => {
                let exit_code = status.code();
                warn!(
                    scene,
                    exit_code = exit_code.map(i64::from).unwrap_or(-1),
                    elapsed_ms = elapsed.as_millis() as u64,
                    log = %excerpt(&log),
                    "Renderer failed"
                );
                Err(RenderError::Process { exit_code, log })
            }
            Some(_) => {
                info!(
                    scene,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Renderer finished"
                );
                Ok(RenderWorkspace {
                    dir,
                    scene: scene.to_string(),
                    log,
                    elapsed,
                })
            }
        }
    }
}

/// What the poll loop needs from a running renderer.
trait Supervised {
    fn poll(&mut self) -> io::Result<Option<ExitStatus>>;
    /// Kills and reaps the process.
    fn terminate(&mut self);
}

impl Supervised for Child {
    fn poll(&mut self) -> io::Result<Option<ExitStatus>> {
        self.try_wait()
    }

    fn terminate(&mut self) {
        if let Err(err) = self.kill() {
            warn!(error = %err, "Failed to kill renderer");
        }
        let _ = self.wait();
    }
}

/// Waits for exit, returning `None` after killing the process at `timeout`.
/// The process never outlives this call on an error either.
fn supervise(
    child: &mut impl Supervised,
    started_at: Instant,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    loop {
        match child.poll() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) if started_at.elapsed() >= timeout => {
                child.terminate();
                return Ok(None);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                warn!(error = %err, "Lost track of renderer; killing it");
                child.terminate();
                return Err(err);
            }
        }
    }
}

/// Trailing part of the renderer log, where the failure usually is.
pub fn excerpt(log: &str) -> &str {
    let count = log.chars().count();
    if count <= LOG_EXCERPT_CHARS {
        return log;
    }
    let skip = count - LOG_EXCERPT_CHARS;
    let start = log
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &log[start..]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_executable(path: &Path) {
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("set perms");
    }

    fn fake_renderer(dir: &Path, body: &str) -> RendererConfig {
        let script = dir.join("fake-renderer");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
        make_executable(&script);
        RendererConfig {
            program: script.display().to_string(),
            args: Vec::new(),
            ..RendererConfig::default()
        }
    }

    const SCENE: &str = "from manim import *\n\nclass Demo(Scene):\n    def construct(self):\n        self.wait(1)\n";

    #[test]
    fn passes_scene_and_media_dir() {
        let dir = tempfile::tempdir().unwrap();
        let args_path = dir.path().join("args.log");
        let config = fake_renderer(
            dir.path(),
            &format!("echo \"$@\" > \"{}\"\necho rendering\necho warn >&2", args_path.display()),
        );
        let workspace = RenderExecutor::new(config).render(SCENE, "Demo").unwrap();

        let args = fs::read_to_string(&args_path).unwrap();
        assert!(args.contains("scene.py Demo -qm --media_dir"), "{args}");
        assert!(args.ends_with("--verbosity DEBUG --progress_bar none\n"), "{args}");
        assert!(workspace.log().contains("rendering"));
        assert!(workspace.log().contains("warn"));
        assert!(workspace.path().join(SCENE_FILE_NAME).exists());
    }

    #[test]
    fn syntax_errors_skip_the_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("invoked");
        let config = fake_renderer(dir.path(), &format!("touch \"{}\"", marker.display()));
        let err = RenderExecutor::new(config)
            .render("class Demo(Scene)\n    pass\n", "Demo")
            .unwrap_err();
        assert!(matches!(err, RenderError::SyntaxInvalid { .. }));
        assert!(!marker.exists());
    }

    #[test]
    fn external_checker_can_reject() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fake_renderer(dir.path(), "exit 0");
        config.syntax_check = Some(vec!["sh".into(), "-c".into(), "echo nope >&2; exit 1".into()]);
        let err = RenderExecutor::new(config).render(SCENE, "Demo").unwrap_err();
        match err {
            RenderError::SyntaxInvalid {
                issue: SyntaxIssue::External(detail),
            } => assert!(detail.contains("nope")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn surfaces_exit_code_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_renderer(dir.path(), "echo boom >&2\nexit 3");
        let err = RenderExecutor::new(config).render(SCENE, "Demo").unwrap_err();
        match err {
            RenderError::Process { exit_code, log } => {
                assert_eq!(exit_code, Some(3));
                assert!(log.contains("boom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn kills_renderer_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_renderer(dir.path(), "echo started\nexec sleep 30");
        let started = Instant::now();
        let err = RenderExecutor::new(config)
            .render_with(SCENE, "Demo", RenderQuality::Low, Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, RenderError::Timeout { .. }));
        assert!(err.log().contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let config = RendererConfig {
            program: "/nonexistent/renderer".into(),
            args: Vec::new(),
            ..RendererConfig::default()
        };
        let err = RenderExecutor::new(config).render(SCENE, "Demo").unwrap_err();
        assert!(matches!(err, RenderError::Spawn { .. }));
    }

    #[test]
    fn excerpt_keeps_the_tail() {
        let log = format!("{}END", "x".repeat(600));
        let tail = excerpt(&log);
        assert_eq!(tail.chars().count(), 500);
        assert!(tail.ends_with("END"));
    }

    struct Unpollable {
        terminated: bool,
    }

    impl Supervised for Unpollable {
        fn poll(&mut self) -> io::Result<Option<ExitStatus>> {
            Err(io::Error::other("wait failed"))
        }

        fn terminate(&mut self) {
            self.terminated = true;
        }
    }

    #[test]
    fn poll_errors_still_kill_the_renderer() {
        let mut child = Unpollable { terminated: false };
        let result = supervise(&mut child, Instant::now(), Duration::from_secs(60));
        assert!(result.is_err());
        assert!(child.terminated);
    }
}
