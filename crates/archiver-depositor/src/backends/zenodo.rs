//! DOI-repository backend modeled on Zenodo's deposit API.
//!
//! A deposition is addressed by a concept DOI, which always resolves to
//! the latest version's record. Publishing a new version bumps the major
//! version number — every archive refresh is treated as a new major
//! snapshot, never a minor/patch release. Uploads prefer the
//! bucket API (large-file friendly, single PUT) and fall back to the files
//! API only when a deposition has no bucket link yet.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use archiver_retry::{classify_status, classify_transport_error, retry, CancellationToken, ErrorClass, RetryConfig};
use archiver_types::{ChangeKind, DataPackage, Partitions, Resource, ResourceInfo};
use serde::{Deserialize, Serialize};

use crate::{DepositionChange, DraftDeposition, PublishedDeposition};

const PRODUCTION_API_ROOT: &str = "https://zenodo.org/api";
const SANDBOX_API_ROOT: &str = "https://sandbox.zenodo.org/api";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositionMetadata {
    pub title: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub upload_type: String,
    pub license: String,
    #[serde(default)]
    pub creators: Vec<DepositionCreator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositionCreator {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositionFileLinks {
    #[serde(rename = "self")]
    pub self_: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositionFile {
    pub id: String,
    pub filename: String,
    pub checksum: String,
    #[serde(default)]
    pub filesize: u64,
    pub links: DepositionFileLinks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepositionLinks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<String>,
    #[serde(default)]
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<String>,
    #[serde(rename = "latest_draft", skip_serializing_if = "Option::is_none")]
    pub latest_draft: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposition {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    pub metadata: DepositionMetadata,
    pub links: DepositionLinks,
    #[serde(default)]
    pub files: Vec<DepositionFile>,
}

impl Deposition {
    fn files_map(&self) -> HashMap<&str, &DepositionFile> {
        self.files.iter().map(|f| (f.filename.as_str(), f)).collect()
    }
}

#[derive(Debug, Deserialize)]
struct RecordStub {
    id: u64,
}

/// One entry of a Zenodo validation-error response body, e.g.
/// `{"field": "metadata.title", "message": "This field is required."}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZenodoFieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ZenodoFieldError>,
}

#[derive(Debug, thiserror::Error)]
pub enum ZenodoError {
    #[error("zenodo returned HTTP {status}: {message}")]
    Api { status: u16, message: String, errors: Vec<ZenodoFieldError> },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

fn classify_zenodo_error(err: &ZenodoError) -> ErrorClass {
    match err {
        ZenodoError::Transport(e) => classify_transport_error(e),
        ZenodoError::Api { status, .. } => classify_status(reqwest::StatusCode::from_u16(*status).unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

/// Thin wrapper around the Zenodo REST API. Holds no deposition state —
/// that lives in [`ZenodoDraft`]/[`ZenodoPublished`].
#[derive(Debug, Clone)]
pub struct ZenodoApiClient {
    http: reqwest::blocking::Client,
    sandbox: bool,
    upload_token: String,
    publish_token: String,
    retry_config: RetryConfig,
}

impl ZenodoApiClient {
    /// Build a client for the sandbox or production API, reading upload and
    /// publish tokens from environment variables (`ZENODO_SANDBOX_TOKEN_UPLOAD`
    /// / `ZENODO_SANDBOX_TOKEN_PUBLISH` for sandbox, `ZENODO_TOKEN_UPLOAD` /
    /// `ZENODO_TOKEN_PUBLISH` for production).
    pub fn new(sandbox: bool) -> Result<Self> {
        let (upload_var, publish_var) = if sandbox {
            ("ZENODO_SANDBOX_TOKEN_UPLOAD", "ZENODO_SANDBOX_TOKEN_PUBLISH")
        } else {
            ("ZENODO_TOKEN_UPLOAD", "ZENODO_TOKEN_PUBLISH")
        };

        let upload_token = std::env::var(upload_var).with_context(|| format!("missing environment variable {upload_var}"))?;
        let publish_token = std::env::var(publish_var).with_context(|| format!("missing environment variable {publish_var}"))?;

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(3600))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            sandbox,
            upload_token,
            publish_token,
            retry_config: RetryConfig::default(),
        })
    }

    fn api_root(&self) -> &'static str {
        if self.sandbox { SANDBOX_API_ROOT } else { PRODUCTION_API_ROOT }
    }

    fn with_retry<T>(&self, mut attempt: impl FnMut() -> Result<T, ZenodoError>) -> Result<T> {
        let cancel = CancellationToken::new();
        retry(&self.retry_config, &cancel, classify_zenodo_error, |_attempt_n| attempt())
            .map_err(|e| anyhow::anyhow!("zenodo request failed: {e}"))
    }

    fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, ZenodoError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        let body = response.text().unwrap_or_default();

        if is_json {
            if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body) {
                return Err(ZenodoError::Api {
                    status: status.as_u16(),
                    message: parsed.message.unwrap_or_default(),
                    errors: parsed.errors,
                });
            }
        }
        Err(ZenodoError::Api { status: status.as_u16(), message: body, errors: Vec::new() })
    }

    pub fn get_deposition_by_id(&self, id: u64) -> Result<Deposition> {
        let url = format!("{}/deposit/depositions/{id}", self.api_root());
        self.with_retry(|| {
            let response = self.http.get(&url).bearer_auth(&self.upload_token).send()?;
            let response = Self::check_status(response)?;
            response.json::<Deposition>().map_err(ZenodoError::Transport)
        })
    }

    /// Resolve a concept DOI (e.g. `10.5281/zenodo.1234`) to its latest
    /// deposition by splitting the DOI on `.` and treating the third
    /// segment as the concept record id.
    pub fn get_deposition_by_concept_doi(&self, concept_doi: &str) -> Result<Deposition> {
        let concept_rec_id = concept_doi
            .split('.')
            .nth(2)
            .with_context(|| format!("malformed concept DOI: {concept_doi}"))?;
        let url = format!("{}/records/{concept_rec_id}", self.api_root());
        let record: RecordStub = self.with_retry(|| {
            let response = self.http.get(&url).bearer_auth(&self.upload_token).send()?;
            let response = Self::check_status(response)?;
            response.json().map_err(ZenodoError::Transport)
        })?;
        self.get_deposition_by_id(record.id)
    }

    pub fn create_new_deposition(&self, dataset_id: &str) -> Result<Deposition> {
        let metadata = metadata_from_dataset(dataset_id, "1.0.0");
        if metadata.keywords.is_empty() {
            anyhow::bail!("new dataset {dataset_id} is missing keywords and cannot be archived");
        }

        let url = format!("{}/deposit/depositions", self.api_root());
        let payload = serde_json::json!({ "metadata": metadata });
        self.with_retry(|| {
            let response = self.http.post(&url).bearer_auth(&self.upload_token).json(&payload).send()?;
            let response = Self::check_status(response)?;
            response.json::<Deposition>().map_err(ZenodoError::Transport)
        })
    }

    /// Open a new draft version of `deposition`, bumping its major version
    /// number. When `refresh_metadata` is set, metadata is regenerated from
    /// the dataset's static catalog rather than carried over from the prior
    /// version.
    pub fn get_new_version(&self, deposition: &Deposition, dataset_id: &str, refresh_metadata: bool) -> Result<Deposition> {
        let url = format!("{}/records/{}/versions", self.api_root(), deposition.id);
        let record: RecordStub = self.with_retry(|| {
            let response = self.http.post(&url).bearer_auth(&self.upload_token).send()?;
            let response = Self::check_status(response)?;
            response.json().map_err(ZenodoError::Transport)
        })?;

        let new_draft = self.get_deposition_by_id(record.id)?;

        let base_version = semver_major_only(&deposition.metadata.version);
        let next_version = base_version.checked_add(1).context("version number overflow")?;

        let mut metadata = if refresh_metadata {
            metadata_from_dataset(dataset_id, &deposition.metadata.version)
        } else {
            new_draft.metadata.clone()
        };
        metadata.version = format!("{next_version}.0.0");

        let update_url = new_draft.links.latest_draft.clone().unwrap_or(format!("{}/deposit/depositions/{}", self.api_root(), new_draft.id));
        let payload = serde_json::json!({ "metadata": metadata });
        self.with_retry(|| {
            let response = self.http.put(&update_url).bearer_auth(&self.upload_token).json(&payload).send()?;
            let response = Self::check_status(response)?;
            response.json::<Deposition>().map_err(ZenodoError::Transport)
        })
    }

    /// Upload `data` as `filename`, preferring the bucket API and falling
    /// back to the files API when no bucket link is present, then refetch
    /// the deposition so its `files` list reflects the upload.
    pub fn create_file(&self, deposition: &Deposition, filename: &str, data: &[u8]) -> Result<Deposition> {
        if let Some(bucket) = &deposition.links.bucket {
            let url = format!("{bucket}/{filename}");
            self.with_retry(|| {
                let response = self.http.put(&url).bearer_auth(&self.upload_token).body(data.to_vec()).send()?;
                Self::check_status(response)?;
                Ok(())
            })?;
        } else if let Some(files_url) = &deposition.links.files {
            self.with_retry(|| {
                let form = reqwest::blocking::multipart::Form::new()
                    .text("name", filename.to_string())
                    .part("file", reqwest::blocking::multipart::Part::bytes(data.to_vec()).file_name(filename.to_string()));
                let response = self.http.post(files_url).bearer_auth(&self.upload_token).multipart(form).send()?;
                Self::check_status(response)?;
                Ok(())
            })?;
        } else {
            anyhow::bail!("no bucket or files link available for deposition {}", deposition.id);
        }

        self.get_deposition_by_id(deposition.id)
    }

    pub fn delete_file(&self, deposition: &Deposition, filename: &str) -> Result<Deposition> {
        let Some(file) = deposition.files_map().get(filename).copied() else {
            return Ok(deposition.clone());
        };
        let url = file.links.self_.clone();
        self.with_retry(|| {
            let response = self.http.delete(&url).bearer_auth(&self.upload_token).send()?;
            Self::check_status(response)?;
            Ok(())
        })?;
        self.get_deposition_by_id(deposition.id)
    }

    pub fn publish(&self, deposition: &Deposition) -> Result<Deposition> {
        let url = deposition
            .links
            .publish
            .clone()
            .with_context(|| format!("deposition {} has no publish link", deposition.id))?;
        self.with_retry(|| {
            let response = self.http.post(&url).bearer_auth(&self.publish_token).send()?;
            let response = Self::check_status(response)?;
            response.json::<Deposition>().map_err(ZenodoError::Transport)
        })
    }
}

fn semver_major_only(version: &str) -> u64 {
    semver::Version::parse(version).map(|v| v.major).unwrap_or(0)
}

fn metadata_from_dataset(dataset_id: &str, version: &str) -> DepositionMetadata {
    let info = archiver_manifest::dataset_metadata(dataset_id);
    DepositionMetadata {
        title: info.title.to_string(),
        description: info.description.to_string(),
        version: version.to_string(),
        keywords: info.keywords.iter().map(|s| s.to_string()).collect(),
        upload_type: "dataset".to_string(),
        license: info.license.to_string(),
        creators: vec![DepositionCreator { name: "Archive Maintainers".to_string() }],
    }
}

/// A published Zenodo deposition: read-only, opens a new draft version.
pub struct ZenodoPublished {
    client: ZenodoApiClient,
    dataset_id: String,
    deposition: Deposition,
    refresh_metadata: bool,
}

impl ZenodoPublished {
    pub fn from_concept_doi(client: ZenodoApiClient, dataset_id: impl Into<String>, concept_doi: &str, refresh_metadata: bool) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let deposition = client.get_deposition_by_concept_doi(concept_doi)?;
        Ok(Self { client, dataset_id, deposition, refresh_metadata })
    }
}

impl PublishedDeposition for ZenodoPublished {
    fn open_draft(&self) -> Result<Box<dyn DraftDeposition>> {
        let deposition = self.client.get_new_version(&self.deposition, &self.dataset_id, self.refresh_metadata)?;
        Ok(Box::new(ZenodoDraft {
            client: self.client.clone(),
            dataset_id: self.dataset_id.clone(),
            deposition,
        }))
    }

    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        get_file_from_deposition(&self.client, &self.deposition, filename)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.deposition.files.iter().map(|f| f.filename.clone()).collect())
    }

    fn deposition_link(&self) -> String {
        self.deposition.links.html.clone()
    }

    fn record_doi(&self) -> Option<String> {
        self.deposition.doi.clone()
    }
}

/// A draft Zenodo deposition in progress.
pub struct ZenodoDraft {
    client: ZenodoApiClient,
    dataset_id: String,
    deposition: Deposition,
}

impl ZenodoDraft {
    pub fn new_from_scratch(client: ZenodoApiClient, dataset_id: impl Into<String>) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let deposition = client.create_new_deposition(&dataset_id)?;
        Ok(Self { client, dataset_id, deposition })
    }

    pub fn deposition(&self) -> &Deposition {
        &self.deposition
    }
}

fn get_file_from_deposition(client: &ZenodoApiClient, deposition: &Deposition, filename: &str) -> Result<Option<Vec<u8>>> {
    let Some(file) = deposition.files_map().get(filename).copied() else {
        return Ok(None);
    };
    let url = file.links.self_.clone();
    let bytes = client.with_retry(|| {
        let response = client.http.get(&url).bearer_auth(&client.upload_token).send()?;
        let mut response = ZenodoApiClient::check_status(response)?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut response, &mut buf)
            .map_err(|e| ZenodoError::Api { status: 0, message: e.to_string(), errors: Vec::new() })?;
        Ok(buf)
    })?;
    Ok(Some(bytes))
}

impl DraftDeposition for ZenodoDraft {
    fn create_file(&mut self, filename: &str, data: &[u8]) -> Result<()> {
        self.deposition = self.client.create_file(&self.deposition, filename, data)?;
        Ok(())
    }

    fn delete_file(&mut self, filename: &str) -> Result<()> {
        self.deposition = self.client.delete_file(&self.deposition, filename)?;
        Ok(())
    }

    fn get_checksum(&self, filename: &str) -> Option<String> {
        self.deposition.files_map().get(filename).map(|f| f.checksum.clone())
    }

    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        get_file_from_deposition(&self.client, &self.deposition, filename)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.deposition.files.iter().map(|f| f.filename.clone()).collect())
    }

    fn deposition_link(&self) -> String {
        self.deposition.links.html.clone()
    }

    fn generate_change(&self, filename: &str, resource: &ResourceInfo) -> Result<Option<DepositionChange>> {
        let local_bytes = std::fs::read(&resource.local_path).with_context(|| format!("failed to read {}", resource.local_path.display()))?;
        let local_checksum = format!("{:x}", md5::compute(&local_bytes));

        let action = match self.deposition.files_map().get(filename) {
            Some(file) if file.checksum == local_checksum => return Ok(None),
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Create,
        };

        Ok(Some(DepositionChange {
            action,
            name: filename.to_string(),
            resource: Some(resource.local_path.clone()),
        }))
    }

    fn publish(self: Box<Self>) -> Result<Box<dyn PublishedDeposition>> {
        let published = self.client.publish(&self.deposition)?;
        Ok(Box::new(ZenodoPublished {
            client: self.client,
            dataset_id: self.dataset_id,
            deposition: published,
            refresh_metadata: false,
        }))
    }

    fn cleanup_after_error(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete_deposition(&mut self) -> Result<()> {
        let url = format!("{}/deposit/depositions/{}", self.client.api_root(), self.deposition.id);
        self.client.with_retry(|| {
            let response = self.client.http.delete(&url).bearer_auth(&self.client.upload_token).send()?;
            ZenodoApiClient::check_status(response)?;
            Ok(())
        })
    }

    fn generate_datapackage(&self, partitions_in_deposition: &HashMap<String, Partitions>) -> Result<DataPackage> {
        let mut resources = Vec::new();
        for file in &self.deposition.files {
            if file.filename == "datapackage.json" {
                continue;
            }
            let parts = partitions_in_deposition.get(&file.filename).cloned().unwrap_or_default();
            resources.push(Resource {
                name: file.filename.clone(),
                path: file.filename.clone(),
                remote_url: Some(file.links.self_.clone()),
                title: file.filename.clone(),
                mediatype: archiver_manifest::media_type_for_extension(
                    std::path::Path::new(&file.filename).extension().and_then(|e| e.to_str()).unwrap_or(""),
                )
                .to_string(),
                format: std::path::Path::new(&file.filename).extension().and_then(|e| e.to_str()).unwrap_or("").to_string(),
                bytes: file.filesize,
                hash: file.checksum.clone(),
                parts,
            });
        }
        resources.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(archiver_manifest::build_datapackage(&self.dataset_id, resources, self.deposition.metadata.version.clone(), chrono::Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_major_only_parses_major_version() {
        assert_eq!(semver_major_only("3.0.0"), 3);
        assert_eq!(semver_major_only("not-a-version"), 0);
    }

    #[test]
    fn concept_doi_splits_to_record_id() {
        let doi = "10.5281/zenodo.1234567";
        let rec_id = doi.split('.').nth(2).unwrap();
        assert_eq!(rec_id, "1234567");
    }

    #[test]
    fn metadata_from_dataset_uses_known_fixture() {
        let metadata = metadata_from_dataset("ferc1", "2.0.0");
        assert_eq!(metadata.title, "FERC Form 1");
        assert!(!metadata.keywords.is_empty());
    }

    #[test]
    fn a_json_validation_error_body_is_parsed_into_field_errors() {
        let body = r#"{"status": 400, "message": "Validation error.", "errors": [{"field": "metadata.title", "message": "This field is required."}]}"#;
        let parsed: ErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.message.as_deref(), Some("Validation error."));
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].field, "metadata.title");
    }

    #[test]
    fn a_non_json_error_body_falls_back_to_plain_message() {
        let err = ZenodoError::Api { status: 502, message: "Bad Gateway".to_string(), errors: Vec::new() };
        assert!(err.to_string().contains("Bad Gateway"));
        assert!(matches!(classify_zenodo_error(&err), ErrorClass::Retryable));
    }
}
