//! ---
//! kvr_section: "01-core-functionality"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Shared primitives and utilities for the reconciler."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

fn default_max_changes() -> usize {
    50
}

fn default_min_principals() -> usize {
    1
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("target/kvr")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "KVR_CONFIG";

    /// Default locations inspected when neither a flag nor `KVR_CONFIG` names a file.
    pub const DEFAULT_CANDIDATES: [&'static str; 2] = ["kvr.toml", "configs/kvr.toml"];

    /// Load configuration from disk, respecting the `KVR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `KVR_CONFIG` path must exist. Otherwise the first existing
    /// candidate wins, and when none exist the defaults are returned.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    /// Load a configuration file that must exist.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.reconcile.validate()?;
        self.authorization.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Limits applied to a computed plan before anything is executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Upper bound on ADD + MODIFY + REMOVE operations in a single run.
    #[serde(default = "default_max_changes")]
    pub max_changes: usize,
    /// Minimum number of principals every vault touched by a removal must keep.
    #[serde(default = "default_min_principals")]
    pub min_principals_per_vault: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_changes: default_max_changes(),
            min_principals_per_vault: default_min_principals(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_changes == 0 {
            return Err(anyhow!(
                "reconcile.max_changes must be at least 1 (use `plan` for a read-only run)"
            ));
        }
        Ok(())
    }
}

/// Controls which role assignments count as sufficient access at a scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationConfig {
    /// Role definition ids (GUIDs or full resource ids) accepted at a scope.
    /// Empty means any assignment is accepted.
    #[serde(default)]
    pub required_role_definitions: Vec<String>,
}

impl AuthorizationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(blank) = self
            .required_role_definitions
            .iter()
            .position(|id| id.trim().is_empty())
        {
            return Err(anyhow!(
                "authorization.required_role_definitions[{}] is empty",
                blank
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file; stderr only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where plan reports, removal artifacts and the audit log are written.
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}
