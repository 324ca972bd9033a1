use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::request::RenderRequest;

/// A batch of render requests described in YAML.
///
/// ```yaml
/// version: 1
/// workers: 4
/// requests:
///   - source: "lessons/pythagoras/*.py"
///     request_id: pythagoras
/// ```
///
/// An entry whose pattern matches several files becomes consecutive steps
/// of one request, in sorted path order, starting at `step` (default 1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub workers: Option<usize>,
    pub requests: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestEntry {
    pub source: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub step: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PlannedRequest {
    pub path: PathBuf,
    pub request: RenderRequest,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
        let manifest: Manifest = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest YAML: {}", path.display()))?;
        Ok(manifest)
    }

    /// Resolves every entry relative to `base_dir` and reads the sources.
    pub fn expand(&self, base_dir: &Path) -> Result<Vec<PlannedRequest>> {
        let mut planned = Vec::new();
        for entry in &self.requests {
            let pattern = if Path::new(&entry.source).is_absolute() {
                entry.source.clone()
            } else {
                base_dir.join(&entry.source).to_string_lossy().into_owned()
            };
            let mut paths = Vec::new();
            for matched in glob(&pattern)
                .with_context(|| format!("Invalid glob pattern: {}", entry.source))?
            {
                let path = matched?;
                if path.is_file() {
                    paths.push(path);
                }
            }
            if paths.is_empty() {
                bail!("No sources matched pattern: {}", entry.source);
            }
            paths.sort();

            // Without an explicit id, all steps still need to land in one record.
            let request_id = entry
                .request_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let first_step = entry.step.unwrap_or(1);
            for (offset, path) in paths.into_iter().enumerate() {
                let source = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read scene source: {}", path.display()))?;
                let Some(step) = u32::try_from(offset)
                    .ok()
                    .and_then(|offset| first_step.checked_add(offset))
                else {
                    bail!(
                        "Step numbers for '{}' overflow starting at {first_step}",
                        entry.source
                    );
                };
                let request = RenderRequest::new(source, Some(&request_id), Some(step))
                    .with_context(|| format!("Rejected scene source: {}", path.display()))?;
                planned.push(PlannedRequest { path, request });
            }
        }
        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn multi_file_entries_become_steps() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("lesson")).unwrap();
        fs::write(temp.path().join("lesson/02.py"), "second").unwrap();
        fs::write(temp.path().join("lesson/01.py"), "first").unwrap();
        fs::write(temp.path().join("single.py"), "solo").unwrap();

        let manifest: Manifest = serde_yaml::from_str(
            "version: 1\nrequests:\n  - source: lesson/*.py\n    request_id: lesson\n  - source: single.py\n    step: 4\n",
        )
        .unwrap();
        let planned = manifest.expand(temp.path()).unwrap();

        assert_eq!(planned.len(), 3);
        assert_eq!(planned[0].request.source(), "first");
        assert_eq!(planned[0].request.step(), 1);
        assert_eq!(planned[1].request.step(), 2);
        assert_eq!(planned[1].request.request_id(), "lesson");
        assert_eq!(planned[2].request.step(), 4);
    }

    #[test]
    fn unmatched_pattern_is_an_error() {
        let temp = tempdir().unwrap();
        let manifest: Manifest =
            serde_yaml::from_str("version: 1\nrequests:\n  - source: missing/*.py\n").unwrap();
        let err = manifest.expand(temp.path()).unwrap_err();
        assert!(err.to_string().contains("No sources matched"));
    }

    #[test]
    fn step_overflow_is_an_error() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.py"), "one").unwrap();
        fs::write(temp.path().join("b.py"), "two").unwrap();
        let manifest: Manifest = serde_yaml::from_str(&format!(
            "version: 1\nrequests:\n  - source: \"*.py\"\n    step: {}\n",
            u32::MAX
        ))
        .unwrap();
        let err = manifest.expand(temp.path()).unwrap_err();
        assert!(err.to_string().contains("overflow"), "{err}");
    }

    #[test]
    fn blank_sources_are_rejected() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("empty.py"), "  \n").unwrap();
        let manifest: Manifest =
            serde_yaml::from_str("version: 1\nrequests:\n  - source: empty.py\n").unwrap();
        assert!(manifest.expand(temp.path()).is_err());
    }
}
