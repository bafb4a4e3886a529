//! Shared data model for the archival pipeline: partitions, resources,
//! manifests, diffs, and the per-run summary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A scalar or list-of-scalars value attached to a partition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionValue {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<PartitionValue>),
}

impl std::fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionValue::String(s) => write!(f, "{s}"),
            PartitionValue::Int(n) => write!(f, "{n}"),
            PartitionValue::Bool(b) => write!(f, "{b}"),
            PartitionValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

/// Keys must not contain `/`; enforced by [`Partitions::insert`].
pub type Partitions = BTreeMap<String, PartitionValue>;

/// Validate that a partition key is acceptable (no path separators).
pub fn validate_partition_key(key: &str) -> Result<(), String> {
    if key.contains('/') {
        Err(format!("partition key {key:?} must not contain '/'"))
    } else {
        Ok(())
    }
}

/// A downloaded artifact ready to upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub local_path: PathBuf,
    pub partitions: Partitions,
    /// Inner file names, for validators that check ZIP interior structure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Vec<String>>,
}

impl ResourceInfo {
    pub fn new(local_path: impl Into<PathBuf>, partitions: Partitions) -> Self {
        Self {
            local_path: local_path.into(),
            partitions,
            layout: None,
        }
    }

    pub fn with_layout(mut self, layout: Vec<String>) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// A file-level entry in a Frictionless manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub path: String,
    #[serde(rename = "remote_url", skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    pub title: String,
    pub mediatype: String,
    pub format: String,
    pub bytes: u64,
    pub hash: String,
    pub parts: Partitions,
}

/// Dataset-level metadata plus the file set, serialized as `datapackage.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPackage {
    pub name: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub contributors: Vec<Contributor>,
    pub created: String,
    pub version: String,
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// The three-way classification shared by file diffs and deposition
/// changes: a deposition action is just a file diff without a size delta
/// yet computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDiff {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<PartitionValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<PartitionValue>,
    pub diff_type: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDiff {
    pub name: String,
    pub diff_type: ChangeKind,
    pub size_diff: i64,
    #[serde(default)]
    pub partition_changes: Vec<PartitionDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationTestResult {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub ignore_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub dataset_name: String,
    pub validation_tests: Vec<ValidationTestResult>,
    pub file_changes: Vec<FileDiff>,
    pub version: String,
    pub previous_version: String,
    pub date: String,
    pub previous_version_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_url: Option<String>,
}

impl RunSummary {
    /// `true` iff every validation test passed or was marked
    /// `ignore_failure`.
    pub fn success(&self) -> bool {
        self.validation_tests
            .iter()
            .all(|test| test.success || test.ignore_failure)
    }

    pub fn datapackage_changed(&self) -> bool {
        !self.file_changes.is_empty()
    }
}

/// Operator-supplied knobs for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    pub sandbox: bool,
    pub initialize: bool,
    pub auto_publish: bool,
    pub clobber_unchanged: bool,
    pub refresh_metadata: bool,
    pub max_concurrent: usize,
    #[serde(default)]
    pub only_years: Option<Vec<i32>>,
    #[serde(default)]
    pub deposition_path: Option<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            sandbox: true,
            initialize: false,
            auto_publish: false,
            clobber_unchanged: false,
            refresh_metadata: false,
            max_concurrent: 5,
            only_years: None,
            deposition_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_with_slash_is_rejected() {
        assert!(validate_partition_key("year/quarter").is_err());
        assert!(validate_partition_key("year").is_ok());
    }

    #[test]
    fn run_summary_success_ignores_flagged_failures() {
        let summary = RunSummary {
            dataset_name: "ferc1".into(),
            validation_tests: vec![
                ValidationTestResult {
                    name: "missing_files".into(),
                    description: "no file deleted".into(),
                    ignore_failure: false,
                    resource_name: None,
                    success: true,
                    note: None,
                },
                ValidationTestResult {
                    name: "dataset_specific".into(),
                    description: "flaky check".into(),
                    ignore_failure: true,
                    resource_name: None,
                    success: false,
                    note: Some("known flaky upstream quirk".into()),
                },
            ],
            file_changes: vec![],
            version: "2.0.0".into(),
            previous_version: "1.0.0".into(),
            date: "2024-01-01T00:00:00Z".into(),
            previous_version_date: "2023-01-01T00:00:00Z".into(),
            record_url: None,
        };
        assert!(summary.success());
    }

    #[test]
    fn run_summary_fails_on_unignored_failure() {
        let summary = RunSummary {
            dataset_name: "ferc1".into(),
            validation_tests: vec![ValidationTestResult {
                name: "missing_files".into(),
                description: "no file deleted".into(),
                ignore_failure: false,
                resource_name: None,
                success: false,
                note: Some("c.zip missing".into()),
            }],
            file_changes: vec![],
            version: "2.0.0".into(),
            previous_version: "1.0.0".into(),
            date: "2024-01-01T00:00:00Z".into(),
            previous_version_date: "2023-01-01T00:00:00Z".into(),
            record_url: None,
        };
        assert!(!summary.success());
    }

    #[test]
    fn partition_value_serializes_untagged() {
        let value = PartitionValue::Int(2021);
        assert_eq!(serde_json::to_string(&value).unwrap(), "2021");
        let value = PartitionValue::String("XBRL".into());
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"XBRL\"");
    }
}
