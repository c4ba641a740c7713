//! Configuration parser for loading desired-state documents.
//!
//! This module handles loading documents from YAML or JSON files and
//! environment variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use super::spec::{Document, StateBackend};

/// Configuration parser for loading desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML or JSON file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Document> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Document> {
        debug!("Parsing YAML configuration");

        let document: Document = serde_yaml::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed configuration with {} resource blocks",
            document.block_count()
        );
        Ok(document)
    }

    /// Parses a document from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<Document> {
        debug!("Parsing JSON configuration");

        let document: Document = serde_json::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("JSON parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed configuration with {} resource blocks",
            document.block_count()
        );
        Ok(document)
    }

    /// Loads a document with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGE_<SECTION>_<KEY>` (e.g., `CONVERGE_STATE_BUCKET`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Document> {
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document);
        Ok(document)
    }

    /// Applies environment variable overrides to the document.
    pub fn apply_env_overrides(document: &mut Document) {
        if let Ok(workspace) = std::env::var("CONVERGE_WORKSPACE") {
            debug!("Overriding state.workspace from environment");
            document.state.workspace = workspace;
        }

        if let Ok(backend) = std::env::var("CONVERGE_STATE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "local" => document.state.backend = StateBackend::Local,
                "s3" => document.state.backend = StateBackend::S3,
                other => warn!("Ignoring unknown CONVERGE_STATE_BACKEND value: {other}"),
            }
        }

        if let Ok(path) = std::env::var("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            document.state.path = Some(path);
        }

        if let Ok(bucket) = std::env::var("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            document.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            document.state.prefix = Some(prefix);
        }

        if let Ok(region) = std::env::var("CONVERGE_STATE_REGION") {
            debug!("Overriding state.region from environment");
            document.state.region = Some(region);
        }

        if let Ok(parallelism) = std::env::var("CONVERGE_PARALLELISM") {
            match parallelism.parse() {
                Ok(value) => {
                    debug!("Overriding settings.parallelism from environment");
                    document.settings.parallelism = value;
                }
                Err(_) => warn!("Ignoring non-numeric CONVERGE_PARALLELISM: {parallelism}"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml", "converge.json"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_document() {
        let yaml = r"
resources:
  - type: local_file
    name: readme
    attributes:
      content: hello
";
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(document.resources.len(), 1);
        assert_eq!(document.resources[0].resource_type, "local_file");
        assert_eq!(document.settings.parallelism, 10);
        assert_eq!(document.state.workspace, "default");
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
settings:
  parallelism: 4
  lock_ttl_secs: 60
  refresh: false
state:
  backend: s3
  bucket: team-state
  prefix: infra/prod
  workspace: prod
providers:
  local:
    root: ./out
    immutable:
      local_file: [path]
variables:
  names: [alpha, beta]
resources:
  - type: local_dir
    name: root
    attributes:
      path: out
  - type: local_file
    name: item
    count: 2
    depends_on: [local_dir.root]
    lifecycle:
      create_before_destroy: true
      ignore_changes: [tags]
    attributes:
      path: "${local_dir.root.path}/${var.names[count.index]}"
outputs:
  dir: "${local_dir.root.id}"
"#;
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(document.settings.parallelism, 4);
        assert!(!document.settings.refresh);
        assert_eq!(document.state.backend, StateBackend::S3);
        assert_eq!(document.state.workspace, "prod");
        assert_eq!(document.resources[1].count, Some(2));
        assert!(document.resources[1].lifecycle.create_before_destroy);
        assert_eq!(
            document.providers["local"].immutable["local_file"],
            vec![String::from("path")]
        );
        assert_eq!(document.outputs.len(), 1);
    }

    #[test]
    fn test_load_json_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("converge.json");
        std::fs::write(
            &path,
            r#"{"resources": [{"type": "local_file", "name": "a", "attributes": {"x": 1}}]}"#,
        )
        .expect("write");

        let document = ConfigParser::new().load_file(&path).unwrap();
        assert_eq!(document.resources[0].attributes["x"], serde_json::json!(1));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigParser::new().load_file("/definitely/not/here.yaml");
        assert!(matches!(
            result,
            Err(ConvergeError::Config(ConfigError::FileNotFound { .. }))
        ));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("converge.yml"), "resources: []").expect("write");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("converge.yml"));
    }

    #[test]
    fn test_invalid_yaml_reports_location() {
        let err = ConfigParser::new()
            .parse_yaml("resources: [", Some(Path::new("bad.yaml")))
            .unwrap_err();
        match err {
            ConvergeError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("bad.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
