//! TOML config file loading, merged with CLI-supplied overrides, into the
//! [`archiver_types::RuntimeOptions`] an orchestrator run needs.
//!
//! Precedence is CLI flag > config file value > built-in default, an
//! other-takes-precedence merge generalized from a two-value merge into
//! an overrides-over-file merge to accommodate the larger set of optional
//! run flags this CLI exposes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archiver_retry::RetryConfig;
use archiver_types::RuntimeOptions;
use serde::{Deserialize, Serialize};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "archiver.toml";

/// Which depositor backend a run targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepositorKind {
    /// DOI-repository backend (Zenodo-shaped).
    Doi,
    /// Path-addressed filesystem/object backend.
    #[default]
    Path,
    /// Object-store-plus-metadata-database backend.
    ObjectStore,
}

impl std::fmt::Display for DepositorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepositorKind::Doi => write!(f, "doi"),
            DepositorKind::Path => write!(f, "path"),
            DepositorKind::ObjectStore => write!(f, "object-store"),
        }
    }
}

impl std::str::FromStr for DepositorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "doi" | "zenodo" => Ok(DepositorKind::Doi),
            "path" | "file" | "fsspec" => Ok(DepositorKind::Path),
            "object-store" | "object_store" | "objectstore" => Ok(DepositorKind::ObjectStore),
            other => anyhow::bail!("unknown depositor kind: {other}"),
        }
    }
}

/// The `[run]` table of `archiver.toml`. Every field is optional so a
/// config file can set only the knobs an operator cares about; the rest
/// fall through to CLI flags or built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub sandbox: Option<bool>,
    pub initialize: Option<bool>,
    pub auto_publish: Option<bool>,
    pub clobber_unchanged: Option<bool>,
    pub refresh_metadata: Option<bool>,
    pub max_concurrent: Option<usize>,
    pub depositor: Option<DepositorKind>,
    pub deposition_path: Option<String>,
    pub only_years: Option<Vec<i32>>,
    pub summary_file: Option<String>,
}

/// Full `archiver.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub run: RunSection,
    /// Overrides for the shared HTTP retry policy (C1). Absent means use
    /// [`RetryConfig::default`].
    pub retry: Option<RetryConfig>,
}

/// CLI-supplied overrides, one per flag on the `run` subcommand. `None`
/// means "not passed on the command line"; a config file value or
/// built-in default applies instead.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub sandbox: Option<bool>,
    pub initialize: Option<bool>,
    pub auto_publish: Option<bool>,
    pub clobber_unchanged: Option<bool>,
    pub refresh_metadata: Option<bool>,
    pub max_concurrent: Option<usize>,
    pub depositor: Option<DepositorKind>,
    pub deposition_path: Option<String>,
    pub only_years: Option<Vec<i32>>,
    pub summary_file: Option<String>,
}

/// The fully resolved knobs for one orchestrator run.
#[derive(Debug, Clone)]
pub struct ResolvedRunConfig {
    pub options: RuntimeOptions,
    pub depositor: DepositorKind,
    pub summary_file: Option<PathBuf>,
    pub retry: RetryConfig,
}

/// Merge `overrides` over `file`, filling in the built-in defaults from
/// [`RuntimeOptions::default`] for anything still unset.
pub fn resolve(file: &FileConfig, overrides: &RunOverrides) -> ResolvedRunConfig {
    let run = &file.run;
    let defaults = RuntimeOptions::default();

    let options = RuntimeOptions {
        sandbox: overrides.sandbox.or(run.sandbox).unwrap_or(defaults.sandbox),
        initialize: overrides.initialize.or(run.initialize).unwrap_or(defaults.initialize),
        auto_publish: overrides.auto_publish.or(run.auto_publish).unwrap_or(defaults.auto_publish),
        clobber_unchanged: overrides
            .clobber_unchanged
            .or(run.clobber_unchanged)
            .unwrap_or(defaults.clobber_unchanged),
        refresh_metadata: overrides
            .refresh_metadata
            .or(run.refresh_metadata)
            .unwrap_or(defaults.refresh_metadata),
        max_concurrent: overrides.max_concurrent.or(run.max_concurrent).unwrap_or(defaults.max_concurrent),
        only_years: overrides.only_years.clone().or_else(|| run.only_years.clone()),
        deposition_path: overrides.deposition_path.clone().or_else(|| run.deposition_path.clone()),
    };

    let depositor = overrides.depositor.or(run.depositor).unwrap_or_default();
    let summary_file = overrides
        .summary_file
        .clone()
        .or_else(|| run.summary_file.clone())
        .map(PathBuf::from);
    let retry = file.retry.clone().unwrap_or_default();

    ResolvedRunConfig { options, depositor, summary_file, retry }
}

/// Path to the config file inside `dir`.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Load config from a specific file path, returning defaults if the file
/// does not exist.
pub fn load_config_from_file(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Load config by looking for `archiver.toml` in `dir`.
pub fn load_config(dir: &Path) -> Result<FileConfig> {
    load_config_from_file(&config_path(dir))
}

/// Walk up from `start_dir` looking for a config file in each ancestor
/// directory, stopping at the filesystem root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        current = current.parent()?;
    }
}
