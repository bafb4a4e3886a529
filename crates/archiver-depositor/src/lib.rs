//! The draft/published deposition protocol shared by every depositor
//! backend, plus the checksum-verified upload retry loop that sits on top
//! of it.
//!
//! A depositor backend only needs to implement [`PublishedDeposition`] and
//! [`DraftDeposition`] for its remote repository; everything else in this
//! module (change classification, the upload-verify-retry loop, the
//! publish-or-keep decision) is shared.

pub mod backends;

use std::path::Path;

use anyhow::{Context, Result};
use archiver_types::{ChangeKind, DataPackage, Partitions, ResourceInfo, RunSummary};

/// A single change to make to a deposition, as decided by
/// [`DraftDeposition::generate_change`].
#[derive(Debug, Clone)]
pub struct DepositionChange {
    pub action: ChangeKind,
    pub name: String,
    /// Local path to upload from. Required for CREATE/UPDATE, unused for
    /// DELETE/NO_OP.
    pub resource: Option<std::path::PathBuf>,
}

/// A deposition that has already been published: read-only, but able to
/// open a new draft to build the next version.
pub trait PublishedDeposition {
    fn open_draft(&self) -> Result<Box<dyn DraftDeposition>>;
    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>>;
    fn list_files(&self) -> Result<Vec<String>>;
    fn deposition_link(&self) -> String;

    /// The durable identifier worth persisting for this deposition, if the
    /// backend has one (e.g. Zenodo's DOI). Backends with no such concept
    /// (path-addressed, object-store) keep the default `None`.
    fn record_doi(&self) -> Option<String> {
        None
    }
}

/// An editable deposition in progress. All mutating methods act on `self`
/// in place and report whether the remote side actually changed, avoiding
/// a clone of backend state on every call.
pub trait DraftDeposition {
    fn create_file(&mut self, filename: &str, data: &[u8]) -> Result<()>;
    fn delete_file(&mut self, filename: &str) -> Result<()>;
    /// Checksum of `filename` as currently recorded by the remote deposition,
    /// if the file exists there.
    fn get_checksum(&self, filename: &str) -> Option<String>;
    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>>;
    fn list_files(&self) -> Result<Vec<String>>;
    fn deposition_link(&self) -> String;

    /// Decide what, if anything, needs to change for `filename` given the
    /// freshly downloaded `resource`. Returns `None` for NO_OP.
    fn generate_change(&self, filename: &str, resource: &ResourceInfo) -> Result<Option<DepositionChange>>;

    /// Publish this draft, consuming it and returning the new published
    /// version.
    fn publish(self: Box<Self>) -> Result<Box<dyn PublishedDeposition>>;

    fn cleanup_after_error(&mut self) -> Result<()>;

    /// Delete this draft outright because nothing in it is worth keeping.
    fn delete_deposition(&mut self) -> Result<()>;

    fn generate_datapackage(&self, partitions_in_deposition: &std::collections::HashMap<String, Partitions>) -> Result<DataPackage>;
}

/// Upload `change.resource` (or delete `change.name`), retrying the upload
/// up to `checksum_retry_count` times if the remote checksum doesn't match
/// the local file after upload.
pub fn apply_change(draft: &mut dyn DraftDeposition, change: &DepositionChange, checksum_retry_count: u32) -> Result<()> {
    if matches!(change.action, ChangeKind::Delete | ChangeKind::Update) {
        draft.delete_file(&change.name)?;
    }

    if matches!(change.action, ChangeKind::Create | ChangeKind::Update) {
        let path = change
            .resource
            .as_deref()
            .context("a CREATE/UPDATE change must carry a local resource path")?;
        upload_with_checksum_retry(draft, &change.name, path, checksum_retry_count)?;
    }

    Ok(())
}

fn upload_with_checksum_retry(draft: &mut dyn DraftDeposition, name: &str, path: &Path, checksum_retry_count: u32) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let expected_checksum = format!("{:x}", md5::compute(&bytes));

    for attempt in 1..=checksum_retry_count {
        draft.create_file(name, &bytes)?;
        if draft.get_checksum(name).as_deref() == Some(expected_checksum.as_str()) {
            return Ok(());
        }
        if attempt < checksum_retry_count {
            draft.delete_file(name)?;
        }
    }

    anyhow::bail!("upload of {name} persistently failed; could not get checksums to match after {checksum_retry_count} attempts")
}

/// Apply `generate_change` then `apply_change` for a single downloaded
/// resource.
pub fn add_resource(draft: &mut dyn DraftDeposition, name: &str, resource: &ResourceInfo, checksum_retry_count: u32) -> Result<()> {
    if let Some(change) = draft.generate_change(name, resource)? {
        apply_change(draft, &change, checksum_retry_count)?;
    }
    Ok(())
}

/// What happened when [`publish_if_valid`] decided a draft's fate.
#[derive(Debug)]
pub enum PublishOutcome {
    Published(Box<dyn PublishedDeposition>),
    KeptInvalid,
    KeptNoChanges,
    DeletedNoChanges,
    KeptAutoPublishDisabled,
}

/// Check that a run validated successfully and has real changes, then
/// publish — or keep/delete the draft instead, per `clobber_unchanged` and
/// `auto_publish`.
pub fn publish_if_valid(
    draft: Box<dyn DraftDeposition>,
    run_summary: &RunSummary,
    clobber_unchanged: bool,
    auto_publish: bool,
) -> Result<PublishOutcome> {
    if !run_summary.success() {
        return Ok(PublishOutcome::KeptInvalid);
    }

    if run_summary.file_changes.is_empty() && !run_summary.datapackage_changed() {
        if clobber_unchanged {
            let mut draft = draft;
            draft.delete_deposition()?;
            return Ok(PublishOutcome::DeletedNoChanges);
        }
        return Ok(PublishOutcome::KeptNoChanges);
    }

    if !auto_publish {
        return Ok(PublishOutcome::KeptAutoPublishDisabled);
    }

    Ok(PublishOutcome::Published(draft.publish()?))
}

/// Generate a fresh `datapackage.json` for the draft's current state and
/// upload it, returning the datapackage that was uploaded.
pub fn attach_datapackage(
    draft: &mut dyn DraftDeposition,
    partitions_in_deposition: &std::collections::HashMap<String, Partitions>,
) -> Result<DataPackage> {
    let datapackage = draft.generate_datapackage(partitions_in_deposition)?;
    let json = archiver_manifest::to_pretty_json(&datapackage).context("failed to serialize datapackage.json")?;
    draft.create_file("datapackage.json", json.as_bytes())?;
    Ok(datapackage)
}
