use serde::Serialize;

use crate::config::{MetadataConfig, ServiceConfig};
use crate::manifest::Manifest;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &ServiceConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    report.merge(validate_url("service_url", &config.service_url));
    if let Some(url) = &config.placeholder_url {
        report.merge(validate_url("placeholder_url", url));
    }
    if let Some(source) = &config.placeholder_source
        && !source.is_file()
    {
        report.warnings.push(format!(
            "placeholder_source '{}' does not exist; a stub will be written instead",
            source.display()
        ));
    }
    if config.media_dir.as_os_str().is_empty() {
        report.errors.push("media_dir cannot be empty".into());
    }
    if config.state_dir.as_os_str().is_empty() {
        report.errors.push("state_dir cannot be empty".into());
    }

    let renderer = &config.renderer;
    if renderer.program.trim().is_empty() {
        report.errors.push("renderer.program cannot be empty".into());
    }
    if renderer.timeout_secs == 0 {
        report
            .errors
            .push("renderer.timeout_secs must be greater than zero".into());
    }
    if renderer.health_check && renderer.health_timeout_secs == 0 {
        report
            .errors
            .push("renderer.health_timeout_secs must be greater than zero".into());
    }
    if let Some(command) = &renderer.syntax_check
        && command.is_empty()
    {
        report
            .warnings
            .push("renderer.syntax_check is empty and will be ignored".into());
    }

    if config.locator.max_depth == 0 {
        report
            .errors
            .push("locator.max_depth must be at least 1".into());
    }
    if config.locator.extensions.is_empty() {
        report
            .errors
            .push("locator.extensions must list at least one media extension".into());
    }
    if config.min_artifact_bytes == 0 {
        report
            .warnings
            .push("min_artifact_bytes is 0; empty render outputs will be published".into());
    }

    match &config.storage {
        Some(storage) => {
            report.merge(validate_url("storage.base_url", &storage.base_url));
            if storage.api_key.trim().is_empty() {
                report.errors.push("storage.api_key cannot be empty".into());
            }
            if storage.artifact_bucket.trim().is_empty() {
                report
                    .errors
                    .push("storage.artifact_bucket cannot be empty".into());
            }
        }
        None => report.warnings.push(
            "No object storage configured; artifacts will be served from the local media directory"
                .into(),
        ),
    }

    if let MetadataConfig::Rest(rest) = &config.metadata {
        report.merge(validate_url("metadata.base_url", &rest.base_url));
        if rest.api_key.trim().is_empty() {
            report.errors.push("metadata.api_key cannot be empty".into());
        }
    }

    report
}

pub fn validate_manifest(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != 1 {
        report
            .errors
            .push(format!("Unsupported manifest version: {}", manifest.version));
    }
    if manifest.requests.is_empty() {
        report
            .errors
            .push("Manifest must contain at least one request".into());
    }
    if manifest.workers == Some(0) {
        report.errors.push("workers must be at least 1".into());
    }
    for (idx, entry) in manifest.requests.iter().enumerate() {
        if entry.source.trim().is_empty() {
            report
                .errors
                .push(format!("Request {} has an empty source pattern", idx + 1));
        } else if let Err(err) = glob::Pattern::new(&entry.source) {
            report.errors.push(format!(
                "Request {} ('{}') is not a valid glob: {}",
                idx + 1,
                entry.source,
                err
            ));
        }
        if entry.step == Some(0) {
            report
                .errors
                .push(format!("Request {} has step 0; steps start at 1", idx + 1));
        }
    }

    report
}

fn validate_url(field: &str, url: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    let trimmed = url.trim();
    if trimmed.is_empty() {
        report.errors.push(format!("{field} cannot be empty"));
    } else if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        report
            .errors
            .push(format!("{field} '{url}' must be an http(s) URL"));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    #[test]
    fn defaults_are_valid_with_a_storage_warning() {
        let report = validate_config(&ServiceConfig::default());
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.contains("object storage")));
    }

    #[test]
    fn collects_every_problem() {
        let mut config = ServiceConfig {
            service_url: "ftp://nope".into(),
            ..ServiceConfig::default()
        };
        config.renderer.timeout_secs = 0;
        config.locator.extensions.clear();
        config.storage = Some(StorageConfig {
            base_url: "https://x.supabase.co".into(),
            api_key: " ".into(),
            artifact_bucket: "animations".into(),
            code_bucket: "manim-code".into(),
            timeout_secs: 30,
        });
        let report = validate_config(&config);
        assert_eq!(report.errors.len(), 4, "{:?}", report.errors);
    }
}
