//! Shell Manifest (`modshell.toml`)
//!
//! All static loader configuration lives in one TOML file. Every section is
//! optional.
//!
//! ```toml
//! [loader]
//! timeout_ms = 10000
//! retries = 3
//! retry_delay_ms = 1000
//! max_concurrency = 4
//!
//! [resolver]
//! extensions = [".js", ".mjs"]
//!
//! [resolver.overrides]
//! app = "core/app"
//!
//! [resolver.categories]
//! errorHandler = "core"
//! uiRegistry = "core"
//!
//! [dependencies]
//! critical = ["core/errorHandler", "core/uiRegistry"]
//!
//! [dependencies.modules]
//! "core/uiRegistry" = ["core/errorHandler"]
//!
//! [exports."core/uiRegistry"]
//! members = ["register", "show"]
//! async = ["show"]
//!
//! [recovery]
//! timeout_factor = 2.0
//! retries = 2
//!
//! [catalog."core/errorHandler"]
//! members = ["report"]
//! fail_attempts = 1
//! delay_ms = 20
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::deps::DependencyTable;
use super::engine::{LoaderConfig, RecoveryPolicy};
use super::fallback::{ExpectedExports, FallbackSynthesizer};
use super::fetch::{CatalogEntry, CatalogFetcher};
use super::path::{CanonicalId, PathResolver};
use super::retry::{RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT};

/// Default manifest file name.
pub const MANIFEST_FILE: &str = "modshell.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid manifest value: {0}")]
    Invalid(String),
}

/// The whole manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShellManifest {
    #[serde(default)]
    pub loader: LoaderSettings,

    #[serde(default)]
    pub resolver: ResolverSettings,

    #[serde(default)]
    pub dependencies: DependencySettings,

    /// Expected exports per canonical id.
    #[serde(default)]
    pub exports: BTreeMap<String, ExpectedExports>,

    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Simulated modules for the catalog fetcher.
    #[serde(default)]
    pub catalog: BTreeMap<String, CatalogEntry>,
}

/// The `[loader]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// The `[resolver]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSettings {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default)]
    pub overrides: BTreeMap<String, String>,

    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            overrides: BTreeMap::new(),
            categories: BTreeMap::new(),
        }
    }
}

/// The `[dependencies]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencySettings {
    #[serde(default)]
    pub critical: Vec<String>,

    #[serde(default)]
    pub modules: BTreeMap<String, Vec<String>>,
}

/// The `[recovery]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,

    #[serde(default = "default_recovery_retries")]
    pub retries: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            timeout_factor: default_timeout_factor(),
            retries: default_recovery_retries(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_retries() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_max_concurrency() -> usize {
    4
}

fn default_extensions() -> Vec<String> {
    vec![".js".to_string(), ".mjs".to_string()]
}

fn default_timeout_factor() -> f64 {
    2.0
}

fn default_recovery_retries() -> u32 {
    2
}

impl ShellManifest {
    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml(&content)
    }

    /// Parse and validate manifest content.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.loader.retries == 0 {
            return Err(ConfigError::Invalid("loader.retries must be at least 1".into()));
        }
        if self.loader.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "loader.max_concurrency must be at least 1".into(),
            ));
        }
        if self.loader.timeout_ms == 0 {
            return Err(ConfigError::Invalid("loader.timeout_ms must be positive".into()));
        }
        if !(self.recovery.timeout_factor.is_finite() && self.recovery.timeout_factor > 0.0) {
            return Err(ConfigError::Invalid(
                "recovery.timeout_factor must be a positive number".into(),
            ));
        }
        // Override targets must already be canonical
        let resolver = self.path_resolver();
        for (reference, target) in &self.resolver.overrides {
            let resolved = resolver.resolve(target);
            if resolved.as_str() != target {
                return Err(ConfigError::Invalid(format!(
                    "override '{}' targets '{}', which resolves to '{}'",
                    reference, target, resolved
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.dependencies.critical.iter().find(|id| !seen.insert(*id)) {
            return Err(ConfigError::Invalid(format!(
                "'{}' appears twice in dependencies.critical",
                dup
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.loader.timeout_ms),
            attempts: self.loader.retries,
            delay: Duration::from_millis(self.loader.retry_delay_ms),
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            policy: self.retry_policy(),
            max_concurrency: self.loader.max_concurrency,
            recovery: RecoveryPolicy {
                timeout_factor: self.recovery.timeout_factor,
                attempts: self.recovery.retries,
            },
        }
    }

    pub fn path_resolver(&self) -> PathResolver {
        let resolver = PathResolver::new().with_extensions(self.resolver.extensions.iter().cloned());
        let resolver = self
            .resolver
            .overrides
            .iter()
            .fold(resolver, |r, (reference, id)| r.with_override(reference.clone(), id.as_str()));
        self.resolver
            .categories
            .iter()
            .fold(resolver, |r, (name, category)| r.with_category(name.clone(), category.clone()))
    }

    pub fn dependency_table(&self) -> DependencyTable {
        let table = DependencyTable::new().with_critical(self.dependencies.critical.iter().map(String::as_str));
        self.dependencies
            .modules
            .iter()
            .fold(table, |t, (id, deps)| t.with_dependencies(id.as_str(), deps.iter().map(String::as_str)))
    }

    pub fn fallback_synthesizer(&self) -> FallbackSynthesizer {
        FallbackSynthesizer::new(
            self.exports
                .iter()
                .map(|(id, exports)| (CanonicalId::from(id.as_str()), exports.clone()))
                .collect(),
        )
    }

    pub fn catalog_fetcher(&self) -> CatalogFetcher {
        CatalogFetcher::new(
            self.catalog
                .iter()
                .map(|(id, entry)| (CanonicalId::from(id.as_str()), entry.clone())),
        )
    }
}
