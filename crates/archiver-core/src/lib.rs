//! Per-dataset archive orchestration.
//!
//! [`orchestrate_run`] wires a [`archiver_downloader::DatasetDownloader`]'s
//! output through the depositor change protocol
//! ([`archiver_depositor`]), the manifest/diff validators
//! ([`archiver_manifest`], [`archiver_diff`]), and the publish-or-keep
//! policy as a single linear, synchronous algorithm.

pub mod fixtures;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use archiver_depositor::{DraftDeposition, PublishOutcome, PublishedDeposition, add_resource, attach_datapackage, publish_if_valid};
use archiver_diff::{create_summary, file_type_tests, missing_files_test};
use archiver_downloader::{DatasetDownloader, DownloaderContext, download_all_resources};
use archiver_types::{DataPackage, Partitions, ResourceInfo, RunSummary};

/// How `orchestrate_run` should obtain the deposition to write into: a
/// brand-new one (the `--initialize` flag) or an existing published one
/// to open a fresh draft version of.
pub enum DepositionHandle {
    Initialize(Box<dyn DraftDeposition>),
    Existing(Box<dyn PublishedDeposition>),
}

/// The baseline datapackage, the open draft to write into, and the link
/// to report in the run summary — everything [`orchestrate_run`] needs
/// before it starts downloading.
pub struct OpenedDeposition {
    pub baseline_datapackage: Option<DataPackage>,
    pub draft: Box<dyn DraftDeposition>,
    pub deposition_link: String,
}

/// Resolve a [`DepositionHandle`] into an [`OpenedDeposition`]: for a fresh
/// deposition there is no baseline; for an existing one, fetch and parse
/// its published `datapackage.json` (if any) before opening the draft.
pub fn open_deposition(handle: DepositionHandle) -> Result<OpenedDeposition> {
    match handle {
        DepositionHandle::Initialize(draft) => Ok(OpenedDeposition {
            baseline_datapackage: None,
            deposition_link: draft.deposition_link(),
            draft,
        }),
        DepositionHandle::Existing(published) => {
            let baseline_datapackage = published
                .get_file("datapackage.json")
                .context("failed to fetch previous datapackage.json")?
                .map(|bytes| serde_json::from_slice::<DataPackage>(&bytes))
                .transpose()
                .context("failed to parse previous datapackage.json")?;
            let deposition_link = published.deposition_link();
            let draft = published.open_draft().context("failed to open a new draft version")?;
            Ok(OpenedDeposition { baseline_datapackage, draft, deposition_link })
        }
    }
}

/// Tunables that don't belong on [`archiver_types::RuntimeOptions`] because
/// they're fixed protocol constants rather than operator-facing knobs.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorTuning {
    pub checksum_retry_count: u32,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self { checksum_retry_count: 7 }
    }
}

/// Outcome of one dataset's full archive run.
pub struct OrchestrationResult {
    pub summary: RunSummary,
    pub outcome: PublishOutcome,
}

/// Run the full per-dataset archive algorithm:
///
/// 1. resolve the baseline datapackage and open a draft (done by the
///    caller via [`open_deposition`], passed in as `opened`)
/// 2. download every resource the downloader yields, bounded-parallel
/// 3. upload each as a create/update/no-op change
/// 4. delete any file in the draft that wasn't produced by this run
/// 5. attach a fresh `datapackage.json`
/// 6. run validations (always-on missing-files and file-type tests plus
///    the downloader's own hook) and build the run summary
/// 7. publish, keep, or delete the draft per `clobber_unchanged` /
///    `auto_publish`
pub fn orchestrate_run(
    dataset_id: &str,
    downloader: &dyn DatasetDownloader,
    opened: OpenedDeposition,
    options: &archiver_types::RuntimeOptions,
    tuning: OrchestratorTuning,
) -> Result<OrchestrationResult> {
    let OpenedDeposition { baseline_datapackage, mut draft, deposition_link } = opened;

    let context = Arc::new(DownloaderContext::new(options.only_years.clone()).context("failed to set up downloader context")?);
    let tasks = downloader.get_resources(&context).context("downloader failed to enumerate resources")?;
    let concurrency = options.max_concurrent.min(downloader.concurrency_limit()).max(1);
    let resources = download_all_resources(tasks, &context, concurrency).context("failed to download resources")?;

    for (name, resource) in &resources {
        add_resource(draft.as_mut(), name, resource, tuning.checksum_retry_count)
            .with_context(|| format!("failed to upload {name}"))?;
    }

    delete_orphaned_files(draft.as_mut(), &resources)?;

    let partitions_in_deposition = partitions_by_name(&resources);
    let new_datapackage = attach_datapackage(draft.as_mut(), &partitions_in_deposition).context("failed to attach datapackage.json")?;

    let mut validation_tests = vec![missing_files_test(&resource_names(baseline_datapackage.as_ref()), &resource_names(Some(&new_datapackage)))];
    let local_files: HashMap<String, &std::path::Path> = resources.iter().map(|(name, info)| (name.clone(), info.local_path.as_path())).collect();
    validation_tests.extend(file_type_tests(&local_files).context("failed to run file-type validation")?);
    validation_tests.extend(downloader.dataset_validate_archive(baseline_datapackage.as_ref(), &new_datapackage, &resources));

    let summary = create_summary(dataset_id, baseline_datapackage.as_ref(), &new_datapackage, validation_tests, Some(deposition_link));

    let outcome = publish_if_valid(draft, &summary, options.clobber_unchanged, options.auto_publish).context("failed to apply publish policy")?;

    Ok(OrchestrationResult { summary, outcome })
}

fn delete_orphaned_files(draft: &mut dyn DraftDeposition, resources: &HashMap<String, ResourceInfo>) -> Result<()> {
    for filename in draft.list_files().context("failed to list files already in the draft")? {
        if filename != "datapackage.json" && !resources.contains_key(&filename) {
            draft.delete_file(&filename).with_context(|| format!("failed to delete orphaned file {filename}"))?;
        }
    }
    Ok(())
}

fn partitions_by_name(resources: &HashMap<String, ResourceInfo>) -> HashMap<String, Partitions> {
    resources.iter().map(|(name, info)| (name.clone(), info.partitions.clone())).collect()
}

fn resource_names(datapackage: Option<&DataPackage>) -> HashSet<String> {
    datapackage.map(|pkg| pkg.resources.iter().map(|r| r.name.clone()).collect()).unwrap_or_default()
}
