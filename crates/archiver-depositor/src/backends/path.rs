//! Path-addressed filesystem backend: a deposition is just a directory,
//! one file per resource plus `datapackage.json`. No publish step exists —
//! publishing a draft only clears its "draft" bookkeeping, since every
//! write already lands on the final path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use archiver_storage::{FileStorage, StorageBackend};
use archiver_types::{ChangeKind, DataPackage, Partitions, Resource, ResourceInfo};

use crate::{DepositionChange, DraftDeposition, PublishedDeposition};

/// A deposition addressed by a plain directory path (local disk, or
/// anything [`archiver_storage::StorageBackend`] fronts).
pub struct PathDeposition {
    storage: Arc<dyn StorageBackend>,
    dataset_id: String,
}

impl PathDeposition {
    pub fn new(storage: Arc<dyn StorageBackend>, dataset_id: impl Into<String>) -> Self {
        Self { storage, dataset_id: dataset_id.into() }
    }

    /// Build a deposition rooted at `base_path/dataset_id` on local disk.
    pub fn local(base_path: impl Into<PathBuf>, dataset_id: impl Into<String>) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let storage = FileStorage::new(base_path.into().join(&dataset_id));
        storage.ensure_base_dir()?;
        Ok(Self::new(Arc::new(storage), dataset_id))
    }

    fn file_list(&self) -> Result<Vec<String>> {
        let mut files = self.storage.list("")?;
        files.retain(|f| f != "datapackage.json");
        files.sort();
        Ok(files)
    }
}

impl PublishedDeposition for PathDeposition {
    fn open_draft(&self) -> Result<Box<dyn DraftDeposition>> {
        Ok(Box::new(PathDeposition::new(Arc::clone(&self.storage), self.dataset_id.clone())))
    }

    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        if self.storage.exists(filename)? {
            Ok(Some(self.storage.read(filename)?))
        } else {
            Ok(None)
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.file_list()
    }

    fn deposition_link(&self) -> String {
        format!("file://{}", self.storage.base_path())
    }
}

impl DraftDeposition for PathDeposition {
    fn create_file(&mut self, filename: &str, data: &[u8]) -> Result<()> {
        self.storage.write(filename, data)
    }

    fn delete_file(&mut self, filename: &str) -> Result<()> {
        self.storage.delete(filename)
    }

    fn get_checksum(&self, filename: &str) -> Option<String> {
        let bytes = self.storage.read(filename).ok()?;
        Some(format!("{:x}", md5::compute(bytes)))
    }

    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        PublishedDeposition::get_file(self, filename)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.file_list()
    }

    fn deposition_link(&self) -> String {
        PublishedDeposition::deposition_link(self)
    }

    fn generate_change(&self, filename: &str, resource: &ResourceInfo) -> Result<Option<DepositionChange>> {
        let local_checksum = {
            let bytes = std::fs::read(&resource.local_path).with_context(|| format!("failed to read {}", resource.local_path.display()))?;
            format!("{:x}", md5::compute(bytes))
        };

        let action = if self.storage.exists(filename)? {
            if self.get_checksum(filename).as_deref() == Some(local_checksum.as_str()) {
                return Ok(None);
            }
            ChangeKind::Update
        } else {
            ChangeKind::Create
        };

        Ok(Some(DepositionChange {
            action,
            name: filename.to_string(),
            resource: Some(resource.local_path.clone()),
        }))
    }

    fn publish(self: Box<Self>) -> Result<Box<dyn PublishedDeposition>> {
        Ok(self)
    }

    fn cleanup_after_error(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete_deposition(&mut self) -> Result<()> {
        for file in self.file_list()? {
            self.storage.delete(&file)?;
        }
        self.storage.delete("datapackage.json")
    }

    fn generate_datapackage(&self, partitions_in_deposition: &HashMap<String, Partitions>) -> Result<DataPackage> {
        let mut resources = Vec::new();
        for filename in self.file_list()? {
            let bytes = self.storage.read(&filename)?;
            let extension = std::path::Path::new(&filename).extension().and_then(|e| e.to_str()).unwrap_or("");
            resources.push(Resource {
                name: filename.clone(),
                path: filename.clone(),
                remote_url: Some(format!("file://{}/{}", self.storage.base_path(), filename)),
                title: filename.clone(),
                mediatype: archiver_manifest::media_type_for_extension(extension).to_string(),
                format: extension.to_string(),
                bytes: bytes.len() as u64,
                hash: format!("{:x}", md5::compute(&bytes)),
                parts: partitions_in_deposition.get(&filename).cloned().unwrap_or_default(),
            });
        }

        Ok(archiver_manifest::build_datapackage(&self.dataset_id, resources, "0.1.0".to_string(), chrono::Utc::now()))
    }
}
