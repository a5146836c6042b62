//! Registry configuration via `trellis.toml`
//!
//! A registry is configured from a small TOML file. Missing keys fall back to
//! their defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use trellis_concurrency::ConcurrencyConfig;
use trellis_core::{Error, Result};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "trellis.toml";

/// Registry configuration loaded from `trellis.toml`.
///
/// # Example
///
/// ```toml
/// default_url = "memory://"
/// versions_collection = "versions"
/// lock_timeout_ms = 1000
/// max_archive_retries = 64
/// max_populate_depth = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrellisConfig {
    /// Driver URL for collections that do not name one.
    #[serde(default = "default_url")]
    pub default_url: String,
    /// Name of the shared version-history collection.
    #[serde(default = "default_versions_collection")]
    pub versions_collection: String,
    /// Lock validity window in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Version-archive retry bound; `0` means unbounded.
    #[serde(default = "default_max_archive_retries")]
    pub max_archive_retries: u32,
    /// Ceiling on deep-population recursion.
    #[serde(default = "default_max_populate_depth")]
    pub max_populate_depth: usize,
}

fn default_url() -> String {
    "memory://".to_string()
}

fn default_versions_collection() -> String {
    "versions".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_max_archive_retries() -> u32 {
    64
}

fn default_max_populate_depth() -> usize {
    16
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            default_url: default_url(),
            versions_collection: default_versions_collection(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_archive_retries: default_max_archive_retries(),
            max_populate_depth: default_max_populate_depth(),
        }
    }
}

impl TrellisConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty URL or collection name, a zero
    /// lock timeout or a zero populate depth.
    pub fn validate(&self) -> Result<()> {
        if !self.default_url.contains("://") {
            return Err(Error::Config(format!(
                "invalid default_url '{}' in {}: expected scheme://location",
                self.default_url, CONFIG_FILE_NAME
            )));
        }
        if self.versions_collection.is_empty() {
            return Err(Error::Config(format!(
                "versions_collection must not be empty in {}",
                CONFIG_FILE_NAME
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "lock_timeout_ms must be positive in {}",
                CONFIG_FILE_NAME
            )));
        }
        if self.max_populate_depth == 0 {
            return Err(Error::Config(format!(
                "max_populate_depth must be positive in {}",
                CONFIG_FILE_NAME
            )));
        }
        Ok(())
    }

    /// Default lock timeout as a `Duration`.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Controller settings derived from this config.
    pub fn concurrency(&self) -> ConcurrencyConfig {
        ConcurrencyConfig::default()
            .with_lock_timeout(self.lock_timeout())
            .with_max_archive_retries(match self.max_archive_retries {
                0 => None,
                n => Some(n),
            })
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Trellis configuration
#
# Driver URL for collections that do not name their own (default: "memory://")
default_url = "memory://"

# Collection holding archived versions of versioned documents
versions_collection = "versions"

# Lock validity window in milliseconds; expired locks may be taken over
lock_timeout_ms = 1000

# Retries when two writers archive the same version number (0 = unbounded)
max_archive_retries = 64

# Maximum deep-population recursion
max_populate_depth = 16
"#
    }

    /// Parse and validate a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TrellisConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
