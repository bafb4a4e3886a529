//! Persisted run state: the dataset id -> DOI mapping file and the
//! per-run summary JSON consumed by notification tooling.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archiver_types::RunSummary;
use serde::{Deserialize, Serialize};

/// Default name of the dataset-DOI mapping file.
pub const DOI_FILE: &str = "dataset_doi.yaml";

/// One dataset's known DOIs in each environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoiEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_doi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_doi: Option<String>,
}

/// Dataset id -> concept DOI pair, persisted as a YAML file
/// (`dataset_doi.yaml`) the Zenodo depositor reads to find the deposition
/// it should update instead of creating a new one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoiMap(pub BTreeMap<String, DoiEntry>);

impl DoiMap {
    pub fn get(&self, dataset_id: &str, sandbox: bool) -> Option<&str> {
        let entry = self.0.get(dataset_id)?;
        let doi = if sandbox { &entry.sandbox_doi } else { &entry.production_doi };
        doi.as_deref()
    }

    /// Record a DOI for a dataset, creating the entry if absent.
    pub fn set(&mut self, dataset_id: &str, sandbox: bool, doi: String) {
        let entry = self.0.entry(dataset_id.to_string()).or_default();
        if sandbox {
            entry.sandbox_doi = Some(doi);
        } else {
            entry.production_doi = Some(doi);
        }
    }
}

/// Atomic (temp-file-then-rename) YAML persistence for a [`DoiMap`].
#[derive(Debug, Clone)]
pub struct DoiStore {
    path: PathBuf,
}

impl DoiStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store rooted at `dir/dataset_doi.yaml`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DOI_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the map, returning an empty one if the file does not exist yet.
    pub fn load(&self) -> Result<DoiMap> {
        if !self.path.exists() {
            return Ok(DoiMap::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read DOI map {}", self.path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse DOI map {}", self.path.display()))
    }

    pub fn save(&self, map: &DoiMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(map).context("failed to serialize DOI map to YAML")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, yaml)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename {} into place", self.path.display()))?;
        Ok(())
    }

    /// Record `doi` for `dataset_id`, loading and re-saving the whole map.
    pub fn record(&self, dataset_id: &str, sandbox: bool, doi: String) -> Result<()> {
        let mut map = self.load()?;
        map.set(dataset_id, sandbox, doi);
        self.save(&map)
    }
}

/// Write a [`RunSummary`] as pretty JSON to `path`, atomically.
pub fn write_run_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summary).context("failed to serialize run summary")?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, json).with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("failed to rename {} into place", path.display()))?;
    Ok(())
}

/// Append one dataset's summary into a multi-dataset run-summary JSON
/// array, for CLI invocations covering several `--datasets` at once.
pub fn write_run_summaries(path: &Path, summaries: &[RunSummary]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summaries).context("failed to serialize run summaries")?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, json).with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("failed to rename {} into place", path.display()))?;
    Ok(())
}
