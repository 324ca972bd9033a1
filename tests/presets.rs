use scene_render::config::{MergeLocking, MetadataConfig, RenderQuality, ServiceConfig};
use scene_render::presets::generate_preset;
use std::fs;
use tempfile::tempdir;

#[test]
fn generate_local_preset_writes_defaults() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("local.yaml");
    let generated = generate_preset("local", &path).expect("preset generation");
    assert!(generated.exists());
    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("kind: local"));
    assert!(contents.contains("program: python3"));
}

#[test]
fn supabase_preset_configures_remote_backends() {
    let temp = tempdir().unwrap();
    let path = generate_preset("supabase", &temp.path().join("supabase.yaml")).unwrap();
    let config = ServiceConfig::load(&path).unwrap();
    assert!(config.storage.is_some());
    assert!(matches!(config.metadata, MetadataConfig::Rest(_)));
    assert_eq!(config.merge_locking, MergeLocking::PerRequest);
    assert_eq!(config.renderer.quality, RenderQuality::High);
}
