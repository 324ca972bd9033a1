//! Finds the renderer's output among the files it left in a workspace.
//!
//! The renderer's output layout varies by version and quality setting, so the
//! search runs from most to least specific: conventional file paths, then
//! partial-segment directories, then a depth-limited scan of the whole
//! workspace.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::LocatorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateStrategy {
    ConventionalPath,
    PartialSegments,
    WorkspaceScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub strategy: LocateStrategy,
}

#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    max_depth: usize,
    extensions: Vec<String>,
}

impl ArtifactLocator {
    pub fn new(config: &LocatorConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            extensions: config
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn locate(&self, workspace: &Path, scene: &str) -> Option<LocatedArtifact> {
        let found = self
            .conventional(workspace, scene)
            .map(|path| (path, LocateStrategy::ConventionalPath))
            .or_else(|| {
                self.partial_segments(workspace, scene)
                    .map(|path| (path, LocateStrategy::PartialSegments))
            })
            .or_else(|| {
                self.scan(workspace)
                    .map(|path| (path, LocateStrategy::WorkspaceScan))
            });

        let (path, strategy) = found?;
        let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        debug!(path = %path.display(), size, strategy = ?strategy, "Located render output");
        Some(LocatedArtifact {
            path,
            size,
            strategy,
        })
    }

    fn conventional(&self, workspace: &Path, scene: &str) -> Option<PathBuf> {
        let file_name = format!("{scene}.mp4");
        let videos = workspace.join("videos");
        for candidate in [videos.join(&file_name), videos.join("scene").join(&file_name)] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        let pattern = videos.join("*").join("*").join(&file_name);
        sorted_matches(&pattern).into_iter().find(|path| path.is_file())
    }

    fn partial_segments(&self, workspace: &Path, scene: &str) -> Option<PathBuf> {
        let videos = workspace.join("videos");
        let mut dirs = vec![videos.join("partial_movie_files").join(scene)];
        dirs.extend(sorted_matches(
            &videos
                .join("*")
                .join("*")
                .join("partial_movie_files")
                .join(scene),
        ));

        for dir in dirs {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut files: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && self.is_media(path))
                .collect();
            files.sort();
            if let Some(first) = files.into_iter().next() {
                return Some(first);
            }
        }
        None
    }

    fn scan(&self, workspace: &Path) -> Option<PathBuf> {
        WalkDir::new(workspace)
            .max_depth(self.max_depth)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && self.is_media(entry.path()))
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some(Candidate {
                    size: meta.len(),
                    modified,
                    path: entry.into_path(),
                })
            })
            .max_by(Candidate::rank)
            .map(|candidate| candidate.path)
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|wanted| *wanted == ext)
            })
    }
}

struct Candidate {
    size: u64,
    modified: SystemTime,
    path: PathBuf,
}

impl Candidate {
    /// Larger wins, then newer. Path order only breaks exact ties, with the
    /// lexicographically smaller path ranked higher.
    fn rank(a: &Candidate, b: &Candidate) -> Ordering {
        a.size
            .cmp(&b.size)
            .then(a.modified.cmp(&b.modified))
            .then_with(|| b.path.cmp(&a.path))
    }
}

fn sorted_matches(pattern: &Path) -> Vec<PathBuf> {
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let Ok(paths) = glob::glob(pattern) else {
        return Vec::new();
    };
    let mut matches: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
    matches.sort();
    matches
}
