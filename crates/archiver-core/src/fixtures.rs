//! Fixture downloaders used only by this crate's own integration tests.
//!
//! These are not ported from any single source file — the upstream
//! archiver's per-dataset scraping logic is explicitly out of scope for
//! this crate (see `archiver-downloader`'s grounding notes) — but they
//! implement [`DatasetDownloader`] in exactly the shape a real one would.

use anyhow::Result;
use archiver_downloader::{DatasetDownloader, DownloaderContext, ResourceTask};
use archiver_types::{Partitions, ResourceInfo};

/// A downloader that "downloads" a fixed, in-memory set of files by
/// writing them straight to the downloader context's scratch directory —
/// useful for exercising the orchestrator without a network.
pub struct StaticFileDownloader {
    dataset_id: String,
    files: Vec<(&'static str, Vec<u8>)>,
}

impl StaticFileDownloader {
    pub fn new(dataset_id: impl Into<String>, files: Vec<(&'static str, Vec<u8>)>) -> Self {
        Self { dataset_id: dataset_id.into(), files }
    }
}

impl DatasetDownloader for StaticFileDownloader {
    fn name(&self) -> &str {
        &self.dataset_id
    }

    fn concurrency_limit(&self) -> usize {
        self.files.len().max(1)
    }

    fn get_resources(&self, _context: &DownloaderContext) -> Result<Vec<ResourceTask>> {
        Ok(self
            .files
            .iter()
            .cloned()
            .map(|(name, blob)| -> ResourceTask {
                Box::new(move |context: &DownloaderContext| {
                    let path = context.download_directory().join(name);
                    std::fs::write(&path, &blob)?;
                    Ok(ResourceInfo::new(path, Partitions::new()))
                })
            })
            .collect())
    }
}

/// A downloader whose resources carry a `year` partition, used to test
/// `only_years` filtering end to end.
pub struct YearlyFileDownloader {
    dataset_id: String,
    years: Vec<i32>,
}

impl YearlyFileDownloader {
    pub fn new(dataset_id: impl Into<String>, years: Vec<i32>) -> Self {
        Self { dataset_id: dataset_id.into(), years }
    }
}

impl DatasetDownloader for YearlyFileDownloader {
    fn name(&self) -> &str {
        &self.dataset_id
    }

    fn get_resources(&self, context: &DownloaderContext) -> Result<Vec<ResourceTask>> {
        Ok(self
            .years
            .iter()
            .copied()
            .filter(|year| context.valid_year(*year))
            .map(|year| -> ResourceTask {
                Box::new(move |context: &DownloaderContext| {
                    let path = context.download_directory().join(format!("{year}.csv"));
                    std::fs::write(&path, format!("year,{year}"))?;
                    let mut parts = Partitions::new();
                    parts.insert("year".to_string(), archiver_types::PartitionValue::Int(year as i64));
                    Ok(ResourceInfo::new(path, parts))
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_downloader_yields_one_task_per_file() {
        let downloader = StaticFileDownloader::new("ferc1", vec![("a.csv", b"a".to_vec()), ("b.csv", b"b".to_vec())]);
        let context = DownloaderContext::new(None).unwrap();
        let tasks = downloader.get_resources(&context).unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn yearly_downloader_respects_only_years() {
        let downloader = YearlyFileDownloader::new("epacems", vec![2019, 2020, 2021]);
        let context = DownloaderContext::new(Some(vec![2020])).unwrap();
        let tasks = downloader.get_resources(&context).unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
