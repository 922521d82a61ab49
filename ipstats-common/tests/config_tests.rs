//! Integration tests for analysis folder configuration
//!
//! Tests that manipulate IPSTATS_DATA_DIR are marked with #[serial]
//! so they do not race on the process environment.

use ipstats_common::config::{resolve_data_root, AnalysisPaths, ProjectConfig, DATA_DIR_ENV};
use ipstats_common::export::read_export;
use ipstats_common::{Error, ScopeId};
use serial_test::serial;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

fn write(path: &Path, content: &str) {
    std::fs::write(path, content).expect("Failed to write test file");
}

#[test]
#[serial]
fn test_data_root_cli_beats_env() {
    env::set_var(DATA_DIR_ENV, "/tmp/ipstats-env");
    let root = resolve_data_root(Some(Path::new("/tmp/ipstats-cli")), DATA_DIR_ENV);
    assert_eq!(root, PathBuf::from("/tmp/ipstats-cli"));
    env::remove_var(DATA_DIR_ENV);
}

#[test]
#[serial]
fn test_data_root_env_beats_default() {
    env::set_var(DATA_DIR_ENV, "/tmp/ipstats-env");
    assert_eq!(resolve_data_root(None, DATA_DIR_ENV), PathBuf::from("/tmp/ipstats-env"));
    env::remove_var(DATA_DIR_ENV);
}

#[test]
#[serial]
fn test_data_root_default() {
    env::remove_var(DATA_DIR_ENV);
    assert_eq!(resolve_data_root(None, DATA_DIR_ENV), PathBuf::from("data"));
}

#[test]
fn test_load_analysis_folder() {
    let temp = tempfile::tempdir().expect("Failed to create temp dir");
    let folder = temp.path().join("cnc-2024");
    std::fs::create_dir_all(&folder).unwrap();

    write(
        &folder.join("config.yaml"),
        "name: CNC 2024\nfile: export.csv\nplaces:\n  - id: 6744\n    name: Wien\n  - id: global\n",
    );
    write(
        &folder.join("export.csv"),
        "id,user_login,taxon_id,taxon_species_name,time_observed_at\n1,alice,5,Pica pica,2024-04-26 10:00:00 UTC\n",
    );

    let paths = AnalysisPaths::new(temp.path(), "cnc-2024");
    let config_path = paths.config_file().unwrap();
    assert!(config_path.ends_with("config.yaml"));

    let config = ProjectConfig::load(&config_path).unwrap();
    let hierarchy = config.scope_hierarchy(&HashMap::new()).unwrap();
    assert_eq!(hierarchy.len(), 2);
    assert_eq!(hierarchy.global().id, ScopeId::Global);

    let observations = read_export(&paths.export_file(&config)).unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].observer, "alice");
}

#[test]
fn test_toml_config_is_found_when_no_yaml() {
    let temp = tempfile::tempdir().expect("Failed to create temp dir");
    write(
        &temp.path().join("config.toml"),
        "name = \"x\"\nfile = \"y.csv\"\n[[places]]\nid = \"global\"\n",
    );
    let paths = AnalysisPaths::new(temp.path(), "");
    let config = ProjectConfig::load(&paths.config_file().unwrap()).unwrap();
    assert_eq!(config.name, "x");
}

#[test]
fn test_missing_export_file() {
    let err = read_export(Path::new("/nonexistent/export.csv")).unwrap_err();
    assert!(matches!(err, Error::Export(_)));
}

#[test]
fn test_malformed_config_reports_parse_error() {
    let temp = tempfile::tempdir().expect("Failed to create temp dir");
    let path = temp.path().join("config.yaml");
    write(&path, "name: [unterminated\n");
    let err = ProjectConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("Parse YAML failed"));
}
