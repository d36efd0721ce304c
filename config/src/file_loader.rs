//! # Configuration File Loading
//!
//! Loads configuration from TOML or YAML files.
//!
//! Supports automatic format detection based on file extension.

use crate::config::PermsSyncConfig;
use std::path::Path;

/// Configuration file loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(String),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(String),

    #[error("Config file has no extension")]
    NoExtension,

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String)
}

/// Load configuration from TOML file.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_toml;
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_toml(Path::new("perms-syncer.toml"))?;
///     println!("Providers: {}", config.providers.len());
///     Ok(())
/// }
/// ```
pub fn load_from_toml(path: &Path) -> Result<PermsSyncConfig, ConfigFileError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|_e| ConfigFileError::FileNotFound(path.display().to_string()))?;

    toml::from_str(&contents).map_err(|e| ConfigFileError::TomlParse(e.to_string()))
}

/// Load configuration from YAML file.
pub fn load_from_yaml(path: &Path) -> Result<PermsSyncConfig, ConfigFileError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|_e| ConfigFileError::FileNotFound(path.display().to_string()))?;

    serde_yaml::from_str(&contents).map_err(|e| ConfigFileError::YamlParse(e.to_string()))
}

/// Load configuration from file with auto-detection.
///
/// ## Supported Formats
/// - `.toml`: TOML format
/// - `.yaml`: YAML format
/// - `.yml`: YAML format
pub fn load_from_file(path: &Path) -> Result<PermsSyncConfig, ConfigFileError> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or(ConfigFileError::NoExtension)?;

    match extension.to_lowercase().as_str() {
        "toml" => load_from_toml(path),
        "yaml" | "yml" => load_from_yaml(path),
        other => Err(ConfigFileError::UnsupportedFormat(other.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perms-syncer.toml");

        let toml_content = r#"
allow_access_by_default = false

[database]
host = "dbhost"
port = 5433

[syncer]
user_sync_concurrency = 4

[scheduler]
interval_seconds = 30
sync_oldest_users = 25

[[providers]]
kind = "github"
id = "1"
url = "https://github.com/"
token = "ghp_test"

[[providers]]
kind = "gitlab"
id = "2"
url = "https://gitlab.example.com/"
token = "glpat_test"
authorization = false
"#;
        fs::write(&path, toml_content).unwrap();

        let config = load_from_toml(&path).unwrap();
        assert!(!config.allow_access_by_default);
        assert_eq!(config.database.host, "dbhost");
        assert_eq!(config.database.port, 5433);
        assert_eq!(config.syncer.user_sync_concurrency, 4);
        assert_eq!(config.syncer.repo_sync_concurrency, 1);
        assert_eq!(config.scheduler.interval_seconds, 30);
        assert_eq!(config.scheduler.sync_oldest_users, 25);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].urn(), "extsvc:github:1");
        assert!(!config.providers[1].authorization);
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perms-syncer.yaml");

        let yaml_content = r#"
worker:
  num_handlers: 3
  stall_after_seconds: 120
api:
  port: 9999
observability:
  logging_level: debug
providers:
  - kind: gitlab
    id: main
    url: https://gitlab.com/
    token: glpat_test
"#;
        fs::write(&path, yaml_content).unwrap();

        let config = load_from_yaml(&path).unwrap();
        assert_eq!(config.worker.num_handlers, 3);
        assert_eq!(config.worker.stall_after_seconds, 120);
        assert_eq!(config.api.port, 9999);
        assert_eq!(config.observability.logging_level, "debug");
        assert_eq!(config.providers[0].kind, "gitlab");
    }

    #[test]
    fn test_load_from_file_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{}").unwrap();

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigFileError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_load_from_file_no_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "").unwrap();

        let result = load_from_file(&path);
        assert!(matches!(result, Err(ConfigFileError::NoExtension)));
    }

    #[test]
    fn test_load_from_file_missing() {
        let result = load_from_file(Path::new("/nonexistent/perms-syncer.yml"));
        assert!(matches!(result, Err(ConfigFileError::FileNotFound(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[syncer\nuser_sync_concurrency = ").unwrap();

        assert!(matches!(
            load_from_file(&path),
            Err(ConfigFileError::TomlParse(_))
        ));
    }
}
