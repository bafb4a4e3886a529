//! Object-store-plus-metadata-database backend.
//!
//! Writes each file as an object under `<dataset_id>/<key>` and, for ZIP
//! entries, also unpacks the archive's inner files to `<dataset_id>/<stem>/…`
//! so a query engine can address individual members without opening the
//! ZIP. The spec's "plus metadata database" half — a tabular row per file
//! written to an external relational store via IAM auth, so a catalog can
//! list depositions without re-listing the bucket — has no local
//! equivalent to stand in for a real database and is not implemented; this
//! backend is intentionally minimal and does not implement versioning, so
//! `open_draft`/`publish` are identity operations over the same storage.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use archiver_storage::{FileStorage, StorageBackend};
use archiver_types::{ChangeKind, DataPackage, Partitions, Resource, ResourceInfo};
use zip::ZipArchive;

use crate::{DepositionChange, DraftDeposition, PublishedDeposition};

/// An object-store-addressed deposition: every file lives at
/// `<dataset_id>/<filename>` in the backing store, with ZIP members also
/// unpacked under `<dataset_id>/<stem>/<inner_name>`.
pub struct ObjectStoreDeposition {
    storage: Arc<dyn StorageBackend>,
    dataset_id: String,
}

impl ObjectStoreDeposition {
    pub fn new(storage: Arc<dyn StorageBackend>, dataset_id: impl Into<String>) -> Self {
        Self { storage, dataset_id: dataset_id.into() }
    }

    /// Build a deposition backed by a local directory standing in for the
    /// object store (see [`archiver_storage::build_storage_backend`] for
    /// wiring a real bucket once cloud backends land).
    pub fn local(base_path: impl Into<std::path::PathBuf>, dataset_id: impl Into<String>) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let storage = FileStorage::new(base_path.into());
        storage.ensure_base_dir()?;
        Ok(Self::new(Arc::new(storage), dataset_id))
    }

    fn key(&self, filename: &str) -> String {
        format!("{}/{}", self.dataset_id, filename)
    }

    fn unpacked_prefix(&self, filename: &str) -> String {
        let stem = Path::new(filename).file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
        format!("{}/{}", self.dataset_id, stem)
    }

    fn file_list(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/", self.dataset_id);
        let mut files: Vec<String> = self
            .storage
            .list(&self.dataset_id)?
            .into_iter()
            .filter_map(|path| path.strip_prefix(&prefix).map(str::to_string))
            .filter(|name| !name.contains('/') && name != "datapackage.json")
            .collect();
        files.sort();
        Ok(files)
    }

    /// Unpack every member of a ZIP blob to `<dataset_id>/<stem>/<member>`,
    /// skipping directory entries.
    fn unpack_zip_members(&self, filename: &str, data: &[u8]) -> Result<()> {
        let Ok(mut archive) = ZipArchive::new(std::io::Cursor::new(data)) else {
            // Not a ZIP (or a `.xlsx`/other zip-shaped but unparsable file);
            // only whole-file storage applies.
            return Ok(());
        };

        let prefix = self.unpacked_prefix(filename);
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            let name = entry.name().to_string();
            self.storage.write(&format!("{prefix}/{name}"), &contents)?;
        }
        Ok(())
    }

    fn delete_unpacked_members(&self, filename: &str) -> Result<()> {
        let prefix = self.unpacked_prefix(filename);
        for member in self.storage.list(&prefix)? {
            self.storage.delete(&member)?;
        }
        Ok(())
    }
}

impl PublishedDeposition for ObjectStoreDeposition {
    fn open_draft(&self) -> Result<Box<dyn DraftDeposition>> {
        Ok(Box::new(ObjectStoreDeposition::new(Arc::clone(&self.storage), self.dataset_id.clone())))
    }

    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let key = self.key(filename);
        if self.storage.exists(&key)? {
            Ok(Some(self.storage.read(&key)?))
        } else {
            Ok(None)
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.file_list()
    }

    fn deposition_link(&self) -> String {
        format!("object-store://{}/{}", self.storage.bucket(), self.dataset_id)
    }
}

impl DraftDeposition for ObjectStoreDeposition {
    fn create_file(&mut self, filename: &str, data: &[u8]) -> Result<()> {
        self.storage.write(&self.key(filename), data)?;
        self.unpack_zip_members(filename, data)
    }

    fn delete_file(&mut self, filename: &str) -> Result<()> {
        self.storage.delete(&self.key(filename))?;
        self.delete_unpacked_members(filename)
    }

    fn get_checksum(&self, filename: &str) -> Option<String> {
        let bytes = self.storage.read(&self.key(filename)).ok()?;
        Some(format!("{:x}", md5::compute(bytes)))
    }

    fn get_file(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        PublishedDeposition::get_file(self, filename)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        PublishedDeposition::list_files(self)
    }

    fn deposition_link(&self) -> String {
        PublishedDeposition::deposition_link(self)
    }

    fn generate_change(&self, filename: &str, resource: &ResourceInfo) -> Result<Option<DepositionChange>> {
        let local_checksum = {
            let bytes = std::fs::read(&resource.local_path).with_context(|| format!("failed to read {}", resource.local_path.display()))?;
            format!("{:x}", md5::compute(bytes))
        };

        let action = if self.storage.exists(&self.key(filename))? {
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
            DraftDeposition::delete_file(self, &file)?;
        }
        self.storage.delete(&self.key("datapackage.json"))
    }

    fn generate_datapackage(&self, partitions_in_deposition: &HashMap<String, Partitions>) -> Result<DataPackage> {
        let mut resources = Vec::new();
        for filename in self.file_list()? {
            let bytes = self.storage.read(&self.key(&filename))?;
            let extension = Path::new(&filename).extension().and_then(|e| e.to_str()).unwrap_or("");
            resources.push(Resource {
                name: filename.clone(),
                path: filename.clone(),
                remote_url: Some(self.deposition_link() + "/" + &filename),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_deposition_has_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let deposition = ObjectStoreDeposition::local(dir.path(), "ferc1").unwrap();
        assert!(deposition.list_files().unwrap().is_empty());
    }

    #[test]
    fn create_file_is_addressed_under_dataset_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut deposition = ObjectStoreDeposition::local(dir.path(), "ferc1").unwrap();
        deposition.create_file("a.csv", b"a,b,c").unwrap();

        assert!(dir.path().join("ferc1").join("a.csv").exists());
        assert_eq!(deposition.list_files().unwrap(), vec!["a.csv".to_string()]);
    }

    #[test]
    fn create_file_unpacks_zip_members() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("src.zip");
        archiver_zip::add_to_archive(&zip_path, "inner.csv", b"x,y,z").unwrap();
        let zip_bytes = std::fs::read(&zip_path).unwrap();

        let mut deposition = ObjectStoreDeposition::local(dir.path(), "ferc1").unwrap();
        deposition.create_file("a.zip", &zip_bytes).unwrap();

        let unpacked = dir.path().join("ferc1").join("a").join("inner.csv");
        assert_eq!(std::fs::read(&unpacked).unwrap(), b"x,y,z");
    }

    #[test]
    fn delete_file_removes_unpacked_members_too() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("src.zip");
        archiver_zip::add_to_archive(&zip_path, "inner.csv", b"x,y,z").unwrap();
        let zip_bytes = std::fs::read(&zip_path).unwrap();

        let mut deposition = ObjectStoreDeposition::local(dir.path(), "ferc1").unwrap();
        deposition.create_file("a.zip", &zip_bytes).unwrap();
        deposition.delete_file("a.zip").unwrap();

        assert!(!dir.path().join("ferc1").join("a").join("inner.csv").exists());
        assert!(!dir.path().join("ferc1").join("a.zip").exists());
    }

    #[test]
    fn generate_change_detects_create_update_and_noop() {
        let dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let local_path = local_dir.path().join("a.csv");
        std::fs::write(&local_path, b"a,b,c").unwrap();

        let mut deposition = ObjectStoreDeposition::local(dir.path(), "ferc1").unwrap();
        let resource = ResourceInfo::new(local_path.clone(), Partitions::new());

        let change = deposition.generate_change("a.csv", &resource).unwrap().unwrap();
        assert_eq!(change.action, ChangeKind::Create);

        deposition.create_file("a.csv", b"a,b,c").unwrap();
        assert!(deposition.generate_change("a.csv", &resource).unwrap().is_none());

        std::fs::write(&local_path, b"x,y,z").unwrap();
        let resource = ResourceInfo::new(local_path, Partitions::new());
        let change = deposition.generate_change("a.csv", &resource).unwrap().unwrap();
        assert_eq!(change.action, ChangeKind::Update);
    }

    #[test]
    fn deposition_link_names_bucket_and_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let deposition = ObjectStoreDeposition::local(dir.path(), "ferc1").unwrap();
        assert_eq!(deposition.deposition_link(), "object-store://local/ferc1");
    }
}
