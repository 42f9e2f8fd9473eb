use cascade_core::{CascadeSettings, ConflictStrategy};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_shipped_default_config_parses() {
    let raw = include_str!("../../../config/default.toml");
    let settings = CascadeSettings::from_toml_str(raw).unwrap();
    assert_eq!(settings, CascadeSettings::default());
}

#[test]
fn test_layered_files_override_in_order() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("default.toml"),
        "[tracker]\nmax_depth = 2\nmax_entities = 10\n",
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("staging.toml"),
        "[tracker]\nmax_depth = 4\n\n[client]\nconflict_strategy = \"CLIENT_WINS\"\n",
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("local.toml"),
        "[logging]\nlevel = \"debug\"\n",
    )
    .unwrap();

    let settings = CascadeSettings::load_from_sources(temp_dir.path(), "staging").unwrap();
    assert_eq!(settings.tracker.max_depth, 4);
    assert_eq!(settings.tracker.max_entities, 10);
    assert_eq!(settings.client.conflict_strategy, ConflictStrategy::ClientWins);
    assert_eq!(settings.logging.level, "debug");
}

#[test]
fn test_environment_overrides_files() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var("CASCADE__BUILDER__MAX_INVALIDATIONS", "7");
    let settings = CascadeSettings::load_from_sources(temp_dir.path(), "test");
    std::env::remove_var("CASCADE__BUILDER__MAX_INVALIDATIONS");

    assert_eq!(settings.unwrap().builder.max_invalidations, 7);
}

#[test]
fn test_missing_directory_falls_back_to_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope");
    let settings = CascadeSettings::load_from_sources(&missing, "production").unwrap();
    assert_eq!(settings.tracker, CascadeSettings::default().tracker);
}

#[test]
fn test_invalid_file_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("default.toml"),
        "[tracker]\nmax_entities = 0\n",
    )
    .unwrap();
    assert!(CascadeSettings::load_from_sources(temp_dir.path(), "test").is_err());
}
