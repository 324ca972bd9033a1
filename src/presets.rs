use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{
    MergeLocking, MetadataConfig, RenderQuality, RestMetadataConfig, ServiceConfig, StorageConfig,
};

pub const PRESET_NAMES: &[&str] = &["local", "supabase", "preview"];

/// Writes a ready-to-edit service configuration for the named preset.
pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = match name {
        "local" => local_preset(),
        "supabase" => supabase_preset(),
        "preview" => preview_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}' (expected one of: {})",
            PRESET_NAMES.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset config: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn local_preset() -> ServiceConfig {
    ServiceConfig::default()
}

fn supabase_preset() -> ServiceConfig {
    let project = "https://your-project.supabase.co".to_string();
    let mut config = ServiceConfig {
        service_url: "https://render.example.com".into(),
        storage: Some(StorageConfig {
            base_url: project.clone(),
            api_key: "service-role-key".into(),
            artifact_bucket: "animations".into(),
            code_bucket: "manim-code".into(),
            timeout_secs: 30,
        }),
        metadata: MetadataConfig::Rest(RestMetadataConfig {
            base_url: project,
            api_key: "service-role-key".into(),
            records_table: "chat_messages".into(),
            cache_table: "animation_cache".into(),
            timeout_secs: 30,
        }),
        merge_locking: MergeLocking::PerRequest,
        ..ServiceConfig::default()
    };
    config.renderer.quality = RenderQuality::High;
    config
}

fn preview_preset() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.renderer.quality = RenderQuality::Low;
    config.renderer.timeout_secs = 60;
    config.renderer.verbosity = "WARNING".into();
    config.min_artifact_bytes = 512;
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_config;
    use tempfile::tempdir;

    #[test]
    fn every_preset_loads_and_validates() {
        let temp = tempdir().unwrap();
        for name in PRESET_NAMES {
            let path = temp.path().join(format!("nested/{name}.yaml"));
            generate_preset(name, &path).unwrap();
            let config = ServiceConfig::load(&path).unwrap();
            let report = validate_config(&config);
            assert!(report.is_ok(), "{name}: {:?}", report.errors);
        }
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let temp = tempdir().unwrap();
        let err = generate_preset("cloud", &temp.path().join("x.yaml")).unwrap_err();
        assert!(err.to_string().contains("Unknown preset"));
    }
}
