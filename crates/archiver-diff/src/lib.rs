//! Compare manifests across versions and run the standard validation
//! tests that decide whether a run may publish.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use archiver_types::{
    ChangeKind, DataPackage, FileDiff, PartitionDiff, PartitionValue, Partitions, Resource,
    RunSummary, ValidationTestResult,
};

/// Symmetric-difference plus per-key value comparison between two
/// partition maps.
pub fn process_partition_diffs(baseline: &Partitions, new: &Partitions) -> Vec<PartitionDiff> {
    let all_keys: HashSet<&String> = baseline.keys().chain(new.keys()).collect();
    let mut diffs = Vec::new();

    for key in all_keys {
        match (baseline.get(key), new.get(key)) {
            (None, Some(new_val)) => diffs.push(PartitionDiff {
                key: key.clone(),
                value: Some(new_val.clone()),
                previous_value: None,
                diff_type: ChangeKind::Create,
            }),
            (Some(old_val), None) => diffs.push(PartitionDiff {
                key: key.clone(),
                value: None,
                previous_value: Some(old_val.clone()),
                diff_type: ChangeKind::Delete,
            }),
            (Some(old_val), Some(new_val)) if !partition_values_equal(old_val, new_val) => {
                diffs.push(PartitionDiff {
                    key: key.clone(),
                    value: Some(new_val.clone()),
                    previous_value: Some(old_val.clone()),
                    diff_type: ChangeKind::Update,
                })
            }
            _ => {}
        }
    }

    diffs
}

fn partition_values_equal(a: &PartitionValue, b: &PartitionValue) -> bool {
    // PartitionValue has no derived Eq (floats are not in the scalar set,
    // but lists of scalars compare structurally via PartialEq).
    a == b
}

/// Classify every file name across `baseline` and `new` resource maps into
/// CREATE / UPDATE / DELETE diffs. Unchanged files are omitted (`NO_OP`).
pub fn process_resource_diffs(
    baseline: &HashMap<String, Resource>,
    new: &HashMap<String, Resource>,
) -> Vec<FileDiff> {
    let baseline_names: HashSet<&String> = baseline.keys().collect();
    let new_names: HashSet<&String> = new.keys().collect();

    let mut diffs = Vec::new();

    for name in new_names.difference(&baseline_names) {
        diffs.push(FileDiff {
            name: (*name).clone(),
            diff_type: ChangeKind::Create,
            size_diff: new[*name].bytes as i64,
            partition_changes: Vec::new(),
        });
    }

    for name in baseline_names.difference(&new_names) {
        diffs.push(FileDiff {
            name: (*name).clone(),
            diff_type: ChangeKind::Delete,
            size_diff: -(baseline[*name].bytes as i64),
            partition_changes: Vec::new(),
        });
    }

    for name in baseline_names.intersection(&new_names) {
        let old = &baseline[*name];
        let current = &new[*name];
        let partition_changes = process_partition_diffs(&old.parts, &current.parts);
        let file_changed = old.hash != current.hash;

        if file_changed || !partition_changes.is_empty() {
            diffs.push(FileDiff {
                name: (*name).clone(),
                diff_type: ChangeKind::Update,
                size_diff: current.bytes as i64 - old.bytes as i64,
                partition_changes,
            });
        }
    }

    diffs
}

/// Result of checking a single local file's type/non-emptiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileValidation {
    pub valid_type: bool,
    pub not_empty: bool,
}

impl FileValidation {
    /// ZIPs and `.xlsx` (a ZIP under the hood) must satisfy ZIP magic; any
    /// file must be non-empty.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let valid_type = if extension == "zip" || extension == "xlsx" {
            is_zip_magic(path)?
        } else {
            true
        };

        let not_empty = std::fs::metadata(path)?.len() > 0;

        Ok(Self { valid_type, not_empty })
    }
}

fn is_zip_magic(path: &Path) -> std::io::Result<bool> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 4];
    let read = file.read(&mut magic)?;
    if read < 4 {
        return Ok(false);
    }
    // PK\x03\x04 (local file header) or PK\x05\x06 (empty archive).
    Ok(magic[0] == b'P' && magic[1] == b'K' && (magic[2] == 3 || magic[2] == 5))
}

/// The always-on missing-files test: every name published previously must
/// still be present in the new resource set.
pub fn missing_files_test(previous_names: &HashSet<String>, new_names: &HashSet<String>) -> ValidationTestResult {
    let missing: Vec<&String> = previous_names.difference(new_names).collect();
    let success = missing.is_empty();
    ValidationTestResult {
        name: "missing_files".to_string(),
        description: "Previously published files must still be present in the new archive.".to_string(),
        ignore_failure: false,
        resource_name: None,
        success,
        note: if success {
            None
        } else {
            Some(format!(
                "missing previously published files: {}",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ))
        },
    }
}

/// One file-type test per resource, run against its local file.
pub fn file_type_tests(local_files: &HashMap<String, &Path>) -> std::io::Result<Vec<ValidationTestResult>> {
    let mut tests = Vec::with_capacity(local_files.len());
    for (name, path) in local_files {
        let validation = FileValidation::from_path(path)?;
        let success = validation.valid_type && validation.not_empty;
        tests.push(ValidationTestResult {
            name: "file_type".to_string(),
            description: "Downloaded file must have a valid type and non-zero size.".to_string(),
            ignore_failure: false,
            resource_name: Some(name.clone()),
            success,
            note: if success {
                None
            } else if !validation.valid_type {
                Some(format!("{name} failed ZIP magic check"))
            } else {
                Some(format!("{name} is empty"))
            },
        });
    }
    tests
        .sort_by(|a, b| a.resource_name.cmp(&b.resource_name));
    Ok(tests)
}

/// Build a [`RunSummary`] from the old/new datapackages and the collected
/// validation test results.
pub fn create_summary(
    dataset_name: &str,
    baseline: Option<&DataPackage>,
    new: &DataPackage,
    validation_tests: Vec<ValidationTestResult>,
    record_url: Option<String>,
) -> RunSummary {
    let baseline_resources: HashMap<String, Resource> = baseline
        .map(|pkg| pkg.resources.iter().map(|r| (r.name.clone(), r.clone())).collect())
        .unwrap_or_default();
    let new_resources: HashMap<String, Resource> =
        new.resources.iter().map(|r| (r.name.clone(), r.clone())).collect();

    let file_changes = process_resource_diffs(&baseline_resources, &new_resources);

    let (previous_version, previous_version_date) = baseline
        .map(|pkg| (pkg.version.clone(), pkg.created.clone()))
        .unwrap_or_default();

    RunSummary {
        dataset_name: dataset_name.to_string(),
        validation_tests,
        file_changes,
        version: new.version.clone(),
        previous_version,
        date: new.created.clone(),
        previous_version_date,
        record_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archiver_types::Partitions;

    fn resource(name: &str, bytes: u64, hash: &str, parts: Partitions) -> Resource {
        Resource {
            name: name.to_string(),
            path: name.to_string(),
            remote_url: None,
            title: name.to_string(),
            mediatype: "application/zip".to_string(),
            format: "zip".to_string(),
            bytes,
            hash: hash.to_string(),
            parts,
        }
    }

    #[test]
    fn create_update_delete_classification() {
        let mut baseline = HashMap::new();
        baseline.insert("a.zip".to_string(), resource("a.zip", 100, "hash-a", Partitions::new()));
        baseline.insert("b.zip".to_string(), resource("b.zip", 50, "hash-b", Partitions::new()));

        let mut new = HashMap::new();
        new.insert("a.zip".to_string(), resource("a.zip", 100, "hash-a", Partitions::new())); // unchanged
        new.insert("b.zip".to_string(), resource("b.zip", 80, "hash-b2", Partitions::new())); // updated
        new.insert("c.zip".to_string(), resource("c.zip", 10, "hash-c", Partitions::new())); // created

        let diffs = process_resource_diffs(&baseline, &new);
        assert_eq!(diffs.len(), 2); // a.zip is NO_OP, omitted

        let create = diffs.iter().find(|d| d.name == "c.zip").unwrap();
        assert_eq!(create.diff_type, ChangeKind::Create);
        assert_eq!(create.size_diff, 10);

        let update = diffs.iter().find(|d| d.name == "b.zip").unwrap();
        assert_eq!(update.diff_type, ChangeKind::Update);
        assert_eq!(update.size_diff, 30);
    }

    #[test]
    fn deletion_is_recorded_with_negative_size_diff() {
        let mut baseline = HashMap::new();
        baseline.insert("c.zip".to_string(), resource("c.zip", 10, "hash-c", Partitions::new()));
        let new = HashMap::new();

        let diffs = process_resource_diffs(&baseline, &new);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].diff_type, ChangeKind::Delete);
        assert_eq!(diffs[0].size_diff, -10);
    }

    #[test]
    fn partition_only_change_is_update_with_zero_size_diff() {
        let mut old_parts = Partitions::new();
        old_parts.insert("year".to_string(), PartitionValue::Int(2020));
        let mut new_parts = Partitions::new();
        new_parts.insert("year".to_string(), PartitionValue::Int(2021));

        let mut baseline = HashMap::new();
        baseline.insert("a.zip".to_string(), resource("a.zip", 100, "hash-a", old_parts));
        let mut new = HashMap::new();
        new.insert("a.zip".to_string(), resource("a.zip", 100, "hash-a", new_parts));

        let diffs = process_resource_diffs(&baseline, &new);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].diff_type, ChangeKind::Update);
        assert_eq!(diffs[0].size_diff, 0);
        assert_eq!(diffs[0].partition_changes.len(), 1);
        assert_eq!(diffs[0].partition_changes[0].diff_type, ChangeKind::Update);
    }

    #[test]
    fn unchanged_file_produces_no_diff() {
        let mut baseline = HashMap::new();
        baseline.insert("a.zip".to_string(), resource("a.zip", 100, "hash-a", Partitions::new()));
        let new = baseline.clone();

        let diffs = process_resource_diffs(&baseline, &new);
        assert!(diffs.is_empty());
    }

    #[test]
    fn missing_files_test_fails_on_silent_deletion() {
        let previous: HashSet<String> = ["a.zip", "b.zip", "c.zip"].iter().map(|s| s.to_string()).collect();
        let new: HashSet<String> = ["a.zip", "b.zip"].iter().map(|s| s.to_string()).collect();

        let result = missing_files_test(&previous, &new);
        assert!(!result.success);
        assert!(result.note.unwrap().contains("c.zip"));
    }

    #[test]
    fn missing_files_test_passes_when_superset() {
        let previous: HashSet<String> = ["a.zip"].iter().map(|s| s.to_string()).collect();
        let new: HashSet<String> = ["a.zip", "b.zip"].iter().map(|s| s.to_string()).collect();

        let result = missing_files_test(&previous, &new);
        assert!(result.success);
    }

    #[test]
    fn file_validation_detects_invalid_zip_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.zip");
        std::fs::write(&path, b"not a zip file").unwrap();

        let validation = FileValidation::from_path(&path).unwrap();
        assert!(!validation.valid_type);
        assert!(validation.not_empty);
    }

    #[test]
    fn file_validation_accepts_non_zip_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, b"a,b,c").unwrap();

        let validation = FileValidation::from_path(&path).unwrap();
        assert!(validation.valid_type);
        assert!(validation.not_empty);
    }
}
