//! Base facilities a dataset downloader is built on.
//!
//! A downloader implements [`DatasetDownloader`]: it names itself, picks a
//! concurrency limit, and yields a list of deferred per-resource downloads
//! (`get_resources`). Everything else — retried HTTP GETs, hyperlink
//! scraping, stable ZIP assembly, and running the deferred downloads with
//! bounded parallelism — is provided by [`DownloaderContext`] and
//! [`download_all_resources`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, bail};
use archiver_retry::{CancellationToken, ErrorClass, RetryConfig, classify_status, classify_transport_error, retry};
use archiver_storage::{FileStorage, StorageBackend};
use archiver_types::ResourceInfo;
use regex::Regex;
use serde::de::DeserializeOwned;

/// Per-request overrides for the HTTP helpers: extra headers, verb, and an
/// optional request body — the explicit-options-struct replacement for
/// config-by-kwargs, in the same builder style as
/// `archiver_storage::CloudStorageConfig`. Lets a dataset downloader pass
/// a per-source API key (e.g. `EPACEMS_API_KEY`) as a header, or reach a
/// POST-based JSON endpoint.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    headers: Vec<(String, String)>,
    post: bool,
    data: Option<Vec<u8>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an extra header to the request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Issue the request as a POST carrying `data` as the request body,
    /// instead of the default GET.
    pub fn with_post_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.post = true;
        self.data = Some(data.into());
        self
    }
}

/// One deferred resource download: given a [`DownloaderContext`], produce
/// the downloaded [`ResourceInfo`]. A synchronous closure standing in for
/// what an `async` implementation would yield as a future.
pub type ResourceTask = Box<dyn FnOnce(&DownloaderContext) -> Result<ResourceInfo> + Send>;

/// A single data source's downloader: implement this once per dataset to
/// describe how to fetch and package its resources.
pub trait DatasetDownloader {
    /// Short, stable identifier for this dataset (e.g. `"ferc1"`).
    fn name(&self) -> &str;

    /// How many resources to download at once. Defaults to 5, a
    /// reasonable per-dataset concurrency for most upstream hosts.
    fn concurrency_limit(&self) -> usize {
        5
    }

    /// Produce the list of deferred downloads that make up this dataset's
    /// archive for the current run.
    fn get_resources(&self, context: &DownloaderContext) -> Result<Vec<ResourceTask>>;

    /// Hook for dataset-specific validation, run in addition to the
    /// always-on missing-files test. Default: no extra tests.
    fn dataset_validate_archive(
        &self,
        _baseline: Option<&archiver_types::DataPackage>,
        _new: &archiver_types::DataPackage,
        _resources: &std::collections::HashMap<String, ResourceInfo>,
    ) -> Vec<archiver_types::ValidationTestResult> {
        Vec::new()
    }
}

/// Shared facilities available to every resource task: an HTTP client,
/// retry policy, cancellation flag, a scratch directory, and the run's
/// `only_years` filter.
pub struct DownloaderContext {
    client: reqwest::blocking::Client,
    retry_config: RetryConfig,
    zipfile_retry_config: RetryConfig,
    cancel: CancellationToken,
    download_directory: tempfile::TempDir,
    only_years: Option<Vec<i32>>,
}

impl DownloaderContext {
    /// Build a context with a fresh temp directory and a shared
    /// connection-pooling HTTP client.
    pub fn new(only_years: Option<Vec<i32>>) -> Result<Self> {
        Self::with_cancellation(only_years, CancellationToken::new())
    }

    pub fn with_cancellation(only_years: Option<Vec<i32>>, cancel: CancellationToken) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("archiver/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        let download_directory = tempfile::tempdir().context("failed to create scratch directory")?;

        Ok(Self {
            client,
            retry_config: RetryConfig::default(),
            zipfile_retry_config: RetryConfig::zipfile(),
            cancel,
            download_directory,
            only_years,
        })
    }

    pub fn download_directory(&self) -> &Path {
        self.download_directory.path()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A year passes the filter if `only_years` is empty/absent, or the
    /// year is in it.
    pub fn valid_year(&self, year: i32) -> bool {
        self.only_years.as_ref().is_none_or(|years| years.is_empty() || years.contains(&year))
    }

    /// Issue a request to `url` (GET by default, or POST with a body per
    /// `options`) and return the response body, retrying transport errors
    /// and 5xx/429 responses.
    pub fn download_file(&self, url: &str, options: &RequestOptions) -> Result<Vec<u8>> {
        retry(
            &self.retry_config,
            &self.cancel,
            classify_download_error,
            |_attempt| -> Result<Vec<u8>, DownloadError> {
                let mut request = if options.post { self.client.post(url) } else { self.client.get(url) };
                for (name, value) in &options.headers {
                    request = request.header(name, value);
                }
                if options.post
                    && let Some(data) = &options.data
                {
                    request = request.body(data.clone());
                }
                let response = request.send().map_err(DownloadError::Transport)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(DownloadError::Status(status));
                }
                response.bytes().map(|b| b.to_vec()).map_err(DownloadError::Transport)
            },
        )
        .map_err(|err| anyhow::anyhow!("failed to download {url}: {err}"))
    }

    /// Fetch `url` and write the body to `path`, atomically (temp-file then
    /// rename via `archiver_storage::FileStorage::write`) so a crash
    /// mid-write never leaves a partial file at `path`.
    pub fn download_to_path(&self, url: &str, path: &Path, options: &RequestOptions) -> Result<()> {
        let bytes = self.download_file(url, options)?;
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let filename = path
            .file_name()
            .with_context(|| format!("download destination {} has no file name", path.display()))?
            .to_string_lossy()
            .into_owned();
        FileStorage::new(parent.to_path_buf())
            .write(&filename, &bytes)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Download `url` to `path`, retrying the whole download up to the
    /// zipfile retry default (5) if the result isn't a valid ZIP (a common
    /// symptom of a truncated or HTML-error-page response from a flaky
    /// host). Each invalid download is deleted before the next attempt.
    pub fn download_zipfile(&self, url: &str, path: &Path, options: &RequestOptions) -> Result<()> {
        self.download_zipfile_with_retries(url, path, options, self.zipfile_retry_config.max_attempts)
    }

    /// As [`Self::download_zipfile`], with an explicit retry count in place
    /// of the zipfile-retry default.
    pub fn download_zipfile_with_retries(&self, url: &str, path: &Path, options: &RequestOptions, retries: u32) -> Result<()> {
        for _ in 0..retries.max(1) {
            self.download_to_path(url, path, options)?;
            if is_zipfile(path) {
                return Ok(());
            }
            let _ = std::fs::remove_file(path);
        }
        bail!("failed to download a valid zipfile from {url}")
    }

    /// Parse `url`'s response body for hyperlinks, optionally filtered by
    /// `pattern`. Warns (does not fail) when no links survive the filter.
    pub fn get_hyperlinks(&self, url: &str, pattern: Option<&Regex>, options: &RequestOptions) -> Result<BTreeSet<String>> {
        let bytes = self.download_file(url, options)?;
        let text = String::from_utf8_lossy(&bytes);
        let hyperlinks = archiver_links::extract_hyperlinks(&text, pattern);

        if hyperlinks.is_empty() {
            eprintln!(
                "warning: no hyperlinks matching {pattern:?} found at {url}; the filter pattern or the page structure may have changed"
            );
        }

        Ok(hyperlinks)
    }

    /// Fetch `url` (GET by default, or POST per `options`) and deserialize
    /// the JSON body as `T`.
    pub fn get_json<T: DeserializeOwned>(&self, url: &str, options: &RequestOptions) -> Result<T> {
        let bytes = self.download_file(url, options)?;
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse JSON from {url}"))
    }

    /// Append `blob` as `filename` into the ZIP at `zip_path`.
    pub fn add_to_archive(&self, zip_path: &Path, filename: &str, blob: &[u8]) -> Result<()> {
        archiver_zip::add_to_archive(zip_path, filename, blob)
            .with_context(|| format!("failed to add {filename} to {}", zip_path.display()))
    }

    /// Download `url` into a scratch file, add it to `zip_path` under
    /// `filename`, then remove the scratch file. The common case for a
    /// downloader that fetches one upstream file per archive entry.
    pub fn download_add_to_archive_and_unlink(&self, url: &str, zip_path: &Path, filename: &str, options: &RequestOptions) -> Result<()> {
        let scratch = self.download_directory.path().join(sanitize_scratch_name(filename));
        self.download_to_path(url, &scratch, options)?;
        let blob = std::fs::read(&scratch).with_context(|| format!("failed to read {}", scratch.display()))?;
        self.add_to_archive(zip_path, filename, &blob)?;
        std::fs::remove_file(&scratch).with_context(|| format!("failed to remove scratch file {}", scratch.display()))?;
        Ok(())
    }
}

fn sanitize_scratch_name(filename: &str) -> String {
    filename.replace(['/', '\\'], "_")
}

fn is_zipfile(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else { return false };
    use std::io::Read;
    let mut magic = [0u8; 4];
    match file.read(&mut magic) {
        Ok(n) if n == 4 => magic[0] == b'P' && magic[1] == b'K' && (magic[2] == 3 || magic[2] == 5),
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("HTTP status {0}")]
    Status(reqwest::StatusCode),
}

fn classify_download_error(err: &DownloadError) -> ErrorClass {
    match err {
        DownloadError::Transport(e) => classify_transport_error(e),
        DownloadError::Status(status) => classify_status(*status),
    }
}

/// One resource task's outcome, keyed after the fact by its downloaded
/// file's name.
struct TaskOutcome {
    result: Result<ResourceInfo>,
}

/// Run every task `get_resources` produced with bounded parallelism,
/// splitting the task list into chunks of `max_concurrent` and spawning one
/// thread per task in a chunk before moving to the next — except a failing
/// resource is recorded and its siblings in the same chunk still run to
/// completion, since one bad upstream link shouldn't sink an entire
/// archive's worth of otherwise-healthy downloads. Returns the
/// successfully downloaded resources keyed by file name, and errors if any
/// task failed.
pub fn download_all_resources(
    tasks: Vec<ResourceTask>,
    context: &Arc<DownloaderContext>,
    max_concurrent: usize,
) -> Result<std::collections::HashMap<String, ResourceInfo>> {
    let max_concurrent = max_concurrent.max(1).min(tasks.len().max(1));
    let outcomes: Arc<Mutex<Vec<TaskOutcome>>> = Arc::new(Mutex::new(Vec::with_capacity(tasks.len())));

    for chunk in chunk_tasks(tasks, max_concurrent) {
        let mut handles = Vec::with_capacity(chunk.len());
        for task in chunk {
            let context = Arc::clone(context);
            handles.push(thread::spawn(move || {
                let result = task(&context);
                TaskOutcome { result }
            }));
        }
        for handle in handles {
            let outcome = handle.join().expect("resource download thread panicked");
            outcomes.lock().expect("outcomes mutex poisoned").push(outcome);
        }
    }

    let outcomes = Arc::try_unwrap(outcomes).expect("all threads joined").into_inner().expect("mutex not poisoned");

    let mut resources = std::collections::HashMap::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(resource_info) => {
                let name = resource_info
                    .local_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| resource_info.local_path.display().to_string());
                resources.insert(name, resource_info);
            }
            Err(err) => failures.push(err),
        }
    }

    if !failures.is_empty() {
        let messages: Vec<String> = failures.iter().map(ToString::to_string).collect();
        bail!("{} of {} resource downloads failed: {}", messages.len(), resources.len() + messages.len(), messages.join("; "));
    }

    Ok(resources)
}

fn chunk_tasks(tasks: Vec<ResourceTask>, max_concurrent: usize) -> Vec<Vec<ResourceTask>> {
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(max_concurrent);
    for task in tasks {
        current.push(task);
        if current.len() == max_concurrent {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Convenience used by dataset downloaders that filter a list of candidate
/// years down to the ones this run cares about.
pub fn only_years(candidates: impl IntoIterator<Item = i32>, only_years: &Option<Vec<i32>>) -> Vec<i32> {
    candidates
        .into_iter()
        .filter(|year| only_years.as_ref().is_none_or(|years| years.is_empty() || years.contains(year)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use archiver_types::Partitions;
    use std::sync::mpsc;

    fn context() -> Arc<DownloaderContext> {
        Arc::new(DownloaderContext::new(None).unwrap())
    }

    #[test]
    fn valid_year_passes_everything_when_unfiltered() {
        let ctx = DownloaderContext::new(None).unwrap();
        assert!(ctx.valid_year(1999));
        assert!(ctx.valid_year(2024));
    }

    #[test]
    fn valid_year_filters_to_requested_years() {
        let ctx = DownloaderContext::new(Some(vec![2020, 2021])).unwrap();
        assert!(ctx.valid_year(2020));
        assert!(!ctx.valid_year(2019));
    }

    #[test]
    fn only_years_filters_candidate_list() {
        let filter = Some(vec![2021]);
        let years = only_years([2019, 2020, 2021, 2022], &filter);
        assert_eq!(years, vec![2021]);
    }

    #[test]
    fn only_years_passes_all_when_absent() {
        let years = only_years([2019, 2020], &None);
        assert_eq!(years, vec![2019, 2020]);
    }

    #[test]
    fn add_to_archive_then_get_hyperlinks_style_helpers_compose() {
        let ctx = context();
        let zip_path = ctx.download_directory().join("out.zip");
        ctx.add_to_archive(&zip_path, "a.csv", b"a,b,c").unwrap();
        assert!(zip_path.exists());
    }

    #[test]
    fn download_all_resources_collects_successes_keyed_by_filename() {
        let ctx = context();
        let dir = ctx.download_directory().to_path_buf();

        let (tx, rx) = mpsc::channel::<()>();
        let tx = Arc::new(Mutex::new(tx));
        drop(rx); // we only care that tasks actually ran, not ordering

        let task_a: ResourceTask = Box::new({
            let dir = dir.clone();
            let tx = Arc::clone(&tx);
            move |_ctx| {
                let path = dir.join("a.zip");
                std::fs::write(&path, b"data-a").unwrap();
                let _ = tx.lock().unwrap().send(());
                Ok(ResourceInfo::new(path, Partitions::new()))
            }
        });
        let task_b: ResourceTask = Box::new(move |_ctx| {
            let path = dir.join("b.zip");
            std::fs::write(&path, b"data-b").unwrap();
            Ok(ResourceInfo::new(path, Partitions::new()))
        });

        let resources = download_all_resources(vec![task_a, task_b], &ctx, 2).unwrap();
        assert_eq!(resources.len(), 2);
        assert!(resources.contains_key("a.zip"));
        assert!(resources.contains_key("b.zip"));
    }

    #[test]
    fn download_all_resources_reports_failures_but_keeps_siblings() {
        let ctx = context();
        let dir = ctx.download_directory().to_path_buf();

        let ok_task: ResourceTask = Box::new(move |_ctx| {
            let path = dir.join("ok.zip");
            std::fs::write(&path, b"data").unwrap();
            Ok(ResourceInfo::new(path, Partitions::new()))
        });
        let failing_task: ResourceTask = Box::new(|_ctx| anyhow::bail!("upstream host returned 500"));

        let err = download_all_resources(vec![ok_task, failing_task], &ctx, 2).unwrap_err();
        assert!(err.to_string().contains("1 of 2 resource downloads failed"));
    }

    #[test]
    fn download_file_fetches_body_over_real_http() {
        use tiny_http::{Response, Server};

        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            req.respond(Response::from_string("hello from the archive")).expect("respond");
        });

        let ctx = context();
        let body = ctx.download_file(&addr, &RequestOptions::default()).unwrap();
        assert_eq!(body, b"hello from the archive");
        handle.join().unwrap();
    }

    #[test]
    fn download_file_sends_configured_headers_and_post_body() {
        use tiny_http::{Response, Server};

        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            assert_eq!(req.method(), &tiny_http::Method::Post);
            assert!(req.headers().iter().any(|h| h.to_string().eq_ignore_ascii_case("x-api-key: secret-token")));
            req.respond(Response::from_string("ok")).expect("respond");
        });

        let ctx = context();
        let options = RequestOptions::new().with_header("X-Api-Key", "secret-token").with_post_data(b"query=1".to_vec());
        let body = ctx.download_file(&addr, &options).unwrap();
        assert_eq!(body, b"ok");
        handle.join().unwrap();
    }

    #[test]
    fn get_json_parses_response_body() {
        use tiny_http::{Response, Server};

        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            req.respond(Response::from_string(r#"{"year": 2021}"#)).expect("respond");
        });

        #[derive(serde::Deserialize)]
        struct Payload {
            year: i32,
        }

        let ctx = context();
        let payload: Payload = ctx.get_json(&addr, &RequestOptions::default()).unwrap();
        assert_eq!(payload.year, 2021);
        handle.join().unwrap();
    }

    #[test]
    fn download_zipfile_deletes_invalid_download_before_retrying() {
        let ctx = context();
        let dir = ctx.download_directory().to_path_buf();
        let path = dir.join("marker.zip");
        std::fs::write(&path, b"leftover from a previous attempt").unwrap();

        use tiny_http::{Response, Server};
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            // First response is not a valid zip; the retry loop must delete
            // the bad download before trying again rather than leaving the
            // stale "leftover" bytes in place.
            let req = server.recv().expect("request");
            req.respond(Response::from_string("not a zip")).expect("respond");
            let req = server.recv().expect("request");
            req.respond(Response::from_string("PK\x03\x04")).expect("respond");
        });

        ctx.download_zipfile_with_retries(&addr, &path, &RequestOptions::default(), 2).unwrap();
        assert!(is_zipfile(&path));
        handle.join().unwrap();
    }

    #[test]
    fn download_all_resources_runs_more_tasks_than_the_concurrency_limit() {
        let ctx = context();
        let dir = ctx.download_directory().to_path_buf();

        let tasks: Vec<ResourceTask> = (0..7)
            .map(|i| {
                let dir = dir.clone();
                let task: ResourceTask = Box::new(move |_ctx| {
                    let path = dir.join(format!("{i}.txt"));
                    std::fs::write(&path, format!("{i}")).unwrap();
                    Ok(ResourceInfo::new(path, Partitions::new()))
                });
                task
            })
            .collect();

        let resources = download_all_resources(tasks, &ctx, 3).unwrap();
        assert_eq!(resources.len(), 7);
    }
}
