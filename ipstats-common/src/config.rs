//! Project configuration loading and data folder resolution
//!
//! Each analysis lives in its own folder under the data root:
//!
//! ```text
//! data/
//!   wien-2024/
//!     config.yaml          project configuration
//!     observations.csv     iNaturalist export named by `file`
//!     output/current/      generated report
//! ```

use crate::error::{Error, Result};
use crate::scope::{Scope, ScopeHierarchy, ScopeId, DEFAULT_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding the data root
pub const DATA_DIR_ENV: &str = "IPSTATS_DATA_DIR";

/// Data root used when neither CLI nor environment name one
pub const DEFAULT_DATA_DIR: &str = "data";

const CONFIG_FILE_NAMES: [&str; 3] = ["config.yaml", "config.yml", "config.toml"];

/// Project configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Report title
    pub name: String,
    /// Export CSV file name, relative to the analysis folder
    pub file: String,
    /// iNaturalist project slug or id
    #[serde(default)]
    pub project: Option<String>,
    /// Locale for common names
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Heading level of the report title
    #[serde(default = "default_root_header_level")]
    pub root_header_level: u8,
    /// Query string appended to observer links; derived from `project` when absent
    #[serde(default)]
    pub context_query: Option<String>,
    /// Places to analyse, most specific first, ending with `global`
    #[serde(default)]
    pub places: Vec<PlaceConfig>,
    /// Tuning for upstream lookups
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

/// One configured place
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceConfig {
    /// `global`, a place id, a comma-separated id list or a YAML list of ids
    pub id: PlaceIdValue,
    /// Key used for anchors and CSV columns; defaults to the id text
    #[serde(default)]
    pub col: Option<String>,
    /// Display name; looked up upstream when absent
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub observation_threshold: Option<i64>,
    #[serde(default)]
    pub first_text: Option<String>,
}

/// Forms a place id may take in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaceIdValue {
    Number(u64),
    List(Vec<u64>),
    Text(String),
}

impl PlaceIdValue {
    pub fn to_scope_id(&self) -> Result<ScopeId> {
        match self {
            PlaceIdValue::Number(id) => Ok(ScopeId::Places(vec![*id])),
            PlaceIdValue::List(ids) => Ok(ScopeId::Places(ids.clone())),
            PlaceIdValue::Text(raw) => ScopeId::parse(raw)
                .ok_or_else(|| Error::Config(format!("invalid place id '{}'", raw))),
        }
    }
}

/// Upstream lookup tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Concurrent occurrence lookups
    pub workers: usize,
    /// Abort the run after this many seconds
    pub timeout_secs: Option<u64>,
    /// Upstream request budget
    pub requests_per_minute: u32,
    /// Retries per request after the first attempt
    pub max_retries: u32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_secs: None,
            requests_per_minute: 60,
            max_retries: 3,
        }
    }
}

fn default_locale() -> String {
    "en".to_string()
}

fn default_root_header_level() -> u8 {
    1
}

impl ProjectConfig {
    /// Load configuration, choosing YAML or TOML by file extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            _ => Self::from_yaml(&content)?,
        };

        info!(
            path = %path.display(),
            name = %config.name,
            places = config.places.len(),
            "Loaded project configuration"
        );

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Config(format!("Parse YAML failed: {}", e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Query string scoping observer links to the project
    pub fn context_query(&self) -> String {
        match (&self.context_query, &self.project) {
            (Some(query), _) => query.clone(),
            (None, Some(project)) => format!("project_id={}", project),
            (None, None) => String::new(),
        }
    }

    /// Parsed upstream identifiers of every configured place
    pub fn place_ids(&self) -> Result<Vec<ScopeId>> {
        self.places.iter().map(|p| p.id.to_scope_id()).collect()
    }

    /// Configured places whose display name must be looked up
    pub fn unnamed_places(&self) -> Result<Vec<ScopeId>> {
        let mut unnamed = Vec::new();
        for place in &self.places {
            let id = place.id.to_scope_id()?;
            if place.name.is_none() && !id.is_global() {
                unnamed.push(id);
            }
        }
        Ok(unnamed)
    }

    /// Build and validate the scope hierarchy
    ///
    /// `resolved_names` supplies display names for places configured without
    /// one; anything still unnamed falls back to its id.
    pub fn scope_hierarchy(&self, resolved_names: &HashMap<ScopeId, String>) -> Result<ScopeHierarchy> {
        let mut scopes = Vec::with_capacity(self.places.len());

        for place in &self.places {
            let id = place.id.to_scope_id()?;
            let name = place
                .name
                .clone()
                .or_else(|| resolved_names.get(&id).cloned())
                .unwrap_or_else(|| match &id {
                    ScopeId::Global => "Global".to_string(),
                    other => other.to_string(),
                });

            let mut scope = Scope::new(
                id,
                name,
                place.observation_threshold.unwrap_or(DEFAULT_THRESHOLD),
            );
            if let Some(col) = &place.col {
                scope = scope.with_key(col.clone());
            }
            if let Some(text) = &place.first_text {
                scope = scope.with_first_text(text.clone());
            }

            debug!(key = %scope.key, name = %scope.name, threshold = scope.threshold, "Configured scope");
            scopes.push(scope);
        }

        Ok(ScopeHierarchy::validate(scopes)?)
    }
}

/// Data root resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `./data`
pub fn resolve_data_root(cli_arg: Option<&Path>, env_var_name: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    PathBuf::from(DEFAULT_DATA_DIR)
}

/// File locations of one analysis
#[derive(Debug, Clone)]
pub struct AnalysisPaths {
    pub folder: PathBuf,
}

impl AnalysisPaths {
    pub fn new(data_root: &Path, analysis: &str) -> Self {
        Self {
            folder: data_root.join(analysis),
        }
    }

    /// First existing config file, in YAML-then-TOML order
    pub fn config_file(&self) -> Result<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.folder.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| {
                Error::Config(format!(
                    "No config file found in {} (expected one of: {})",
                    self.folder.display(),
                    CONFIG_FILE_NAMES.join(", ")
                ))
            })
    }

    pub fn export_file(&self, config: &ProjectConfig) -> PathBuf {
        self.folder.join(&config.file)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.folder.join("output").join("current")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: City Nature Challenge 2024 Wien
file: observations.csv
project: city-nature-challenge-2024-wien
locale: de
places:
  - id: 6744
    col: wien
    name: Wien
    observation_threshold: 10
    first_text: Erstnachweis für Wien!
  - id: "8057,9853"
    col: at
  - id: global
    observation_threshold: 3
"#;

    #[test]
    fn test_yaml_config() {
        let config = ProjectConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.locale, "de");
        assert_eq!(config.root_header_level, 1);
        assert_eq!(config.context_query(), "project_id=city-nature-challenge-2024-wien");
        assert_eq!(config.analysis, AnalysisSettings::default());
        assert_eq!(
            config.place_ids().unwrap(),
            vec![
                ScopeId::Places(vec![6744]),
                ScopeId::Places(vec![8057, 9853]),
                ScopeId::Global
            ]
        );
    }

    #[test]
    fn test_scope_hierarchy_defaults_and_names() {
        let config = ProjectConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.unnamed_places().unwrap(), vec![ScopeId::Places(vec![8057, 9853])]);

        let mut names = HashMap::new();
        names.insert(ScopeId::Places(vec![8057, 9853]), "Österreich".to_string());
        let hierarchy = config.scope_hierarchy(&names).unwrap();

        let scopes: Vec<_> = hierarchy.iter().collect();
        assert_eq!(scopes[0].first_text, "Erstnachweis für Wien!");
        assert_eq!(scopes[1].name, "Österreich");
        assert_eq!(scopes[1].threshold, DEFAULT_THRESHOLD);
        assert_eq!(scopes[2].key, "global");
        assert_eq!(scopes[2].name, "Global");
        assert_eq!(scopes[2].threshold, 3);
    }

    #[test]
    fn test_unresolved_name_falls_back_to_id() {
        let config = ProjectConfig::from_yaml(YAML).unwrap();
        let hierarchy = config.scope_hierarchy(&HashMap::new()).unwrap();
        assert_eq!(hierarchy.get("at").unwrap().name, "8057,9853");
    }

    #[test]
    fn test_invalid_hierarchy_is_config_error() {
        let yaml = "name: x\nfile: y.csv\nplaces:\n  - id: 6744\n";
        let config = ProjectConfig::from_yaml(yaml).unwrap();
        let err = config.scope_hierarchy(&HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_invalid_place_id_text() {
        let yaml = "name: x\nfile: y.csv\nplaces:\n  - id: vienna\n";
        let config = ProjectConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.place_ids(), Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
name = "Bioblitz"
file = "export.csv"
root_header_level = 2

[analysis]
workers = 8
timeout_secs = 600

[[places]]
id = [1, 2]
col = "region"

[[places]]
id = "global"
"#;
        let config = ProjectConfig::from_toml(toml).unwrap();
        assert_eq!(config.root_header_level, 2);
        assert_eq!(config.analysis.workers, 8);
        assert_eq!(config.analysis.timeout_secs, Some(600));
        assert_eq!(config.analysis.requests_per_minute, 60);
        assert_eq!(config.context_query(), "");
        assert_eq!(config.places[0].id, PlaceIdValue::List(vec![1, 2]));
    }

    #[test]
    fn test_analysis_paths() {
        let paths = AnalysisPaths::new(Path::new("data"), "wien-2024");
        assert_eq!(paths.output_dir(), PathBuf::from("data/wien-2024/output/current"));
        assert!(paths.config_file().is_err());
    }
}
