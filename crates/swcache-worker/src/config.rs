//! Cache configuration

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ServiceWorkerError;

fn default_manifest() -> Vec<String> {
    vec!["./".to_string()]
}

/// Configuration for one deployed version of the app.
///
/// Bumping `version` is the only way to invalidate every client's cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Application name, the bucket name prefix.
    pub app_name: String,

    /// Version string, the bucket name suffix.
    pub version: String,

    /// Deployment root. Relative manifest entries resolve against it, so it
    /// should end with `/`.
    pub base_url: Url,

    /// Assets fetched at install, relative paths or absolute URLs.
    #[serde(default = "default_manifest")]
    pub manifest: Vec<String>,
}

impl CacheConfig {
    /// Config with the default manifest (`["./"]`).
    pub fn new(app_name: impl Into<String>, version: impl Into<String>, base_url: Url) -> Self {
        Self {
            app_name: app_name.into(),
            version: version.into(),
            base_url,
            manifest: default_manifest(),
        }
    }

    /// Replace the manifest.
    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Name of the bucket this version owns: `{app_name}-{version}`.
    pub fn bucket_name(&self) -> String {
        format!("{}-{}", self.app_name, self.version)
    }

    /// Resolve every manifest entry to an absolute URL, in manifest order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        self.manifest
            .iter()
            .map(|entry| {
                self.base_url.join(entry).map_err(|e| {
                    ServiceWorkerError::config(format!("bad manifest entry {:?}: {}", entry, e))
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.app_name.trim().is_empty() {
            return Err(ServiceWorkerError::config("app_name is empty"));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::config("version is empty"));
        }
        if self.base_url.cannot_be_a_base() {
            return Err(ServiceWorkerError::config(format!(
                "base_url {} cannot be a base",
                self.base_url
            )));
        }
        self.manifest_urls()?;
        Ok(())
    }
}
