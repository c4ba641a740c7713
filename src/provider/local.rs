//! Built-in provider that realises resources as JSON documents on disk.
//!
//! Each object is stored at `<root>/<type>/<id>.json`. Attributes listed as
//! immutable for a type force replacement when they change.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::expr::Attributes;

use super::traits::{CapabilityTable, Provider, ProviderOutput};

/// Provider name.
pub const LOCAL_PROVIDER: &str = "local";

/// Default object directory.
pub const DEFAULT_LOCAL_ROOT: &str = ".converge/objects";

/// File-backed provider.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
    immutable: BTreeMap<String, Vec<String>>,
}

impl LocalProvider {
    /// Creates a provider storing objects under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            immutable: BTreeMap::new(),
        }
    }

    /// Creates a provider from its document configuration.
    ///
    /// A relative `root` is resolved against `base_dir`.
    #[must_use]
    pub fn from_config(config: Option<&ProviderConfig>, base_dir: &Path) -> Self {
        let root = config
            .and_then(|c| c.root.as_deref())
            .unwrap_or(DEFAULT_LOCAL_ROOT);

        Self {
            root: base_dir.join(root),
            immutable: config.map(|c| c.immutable.clone()).unwrap_or_default(),
        }
    }

    /// Marks attribute paths of `resource_type` as replace-only.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, resource_type: &str, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable
            .entry(resource_type.to_string())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        self
    }

    /// Returns the object directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, resource_type: &str, external_id: &str) -> PathBuf {
        self.root.join(resource_type).join(format!("{external_id}.json"))
    }

    async fn write_object(
        &self,
        operation: &str,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<()> {
        let dir = self.root.join(resource_type);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::failed(operation, format!("{}: {e}", dir.display())))?;

        let content = serde_json::to_string_pretty(attributes)
            .map_err(|e| ProviderError::failed(operation, e.to_string()))?;

        let path = self.object_path(resource_type, external_id);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| ProviderError::failed(operation, format!("{}: {e}", temp_path.display())))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| ProviderError::failed(operation, format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    fn capabilities(&self, resource_type: &str) -> CapabilityTable {
        self.immutable
            .get(resource_type)
            .map_or_else(CapabilityTable::in_place, |paths| {
                CapabilityTable::requires_replace(paths.iter().cloned())
            })
    }

    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderOutput> {
        let external_id = Uuid::new_v4().to_string();
        self.write_object("create", resource_type, &external_id, attributes)
            .await?;
        debug!("Created {resource_type} object {external_id}");
        Ok(ProviderOutput::new(external_id, attributes.clone()))
    }

    async fn read(&self, resource_type: &str, external_id: &str) -> ProviderResult<ProviderOutput> {
        let path = self.object_path(resource_type, external_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProviderError::not_found(external_id));
            }
            Err(e) => return Err(ProviderError::failed("read", format!("{}: {e}", path.display()))),
        };

        let attributes: Attributes = serde_json::from_str(&content)
            .map_err(|e| ProviderError::failed("read", format!("{}: {e}", path.display())))?;
        Ok(ProviderOutput::new(external_id, attributes))
    }

    async fn update(
        &self,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderOutput> {
        if !self.object_path(resource_type, external_id).exists() {
            return Err(ProviderError::not_found(external_id));
        }
        self.write_object("update", resource_type, external_id, attributes)
            .await?;
        debug!("Updated {resource_type} object {external_id}");
        Ok(ProviderOutput::new(external_id, attributes.clone()))
    }

    async fn destroy(&self, resource_type: &str, external_id: &str) -> ProviderResult<()> {
        let path = self.object_path(resource_type, external_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Destroyed {resource_type} object {external_id}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ProviderError::not_found(external_id)),
            Err(e) => Err(ProviderError::failed("destroy", format!("{}: {e}", path.display()))),
        }
    }
}
