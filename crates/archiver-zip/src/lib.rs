//! Append entries to a ZIP archive whose bytes are a pure function of
//! entry names and payloads — never of wall-clock time or insertion
//! order relative to prior runs.
//!
//! Every entry gets the fixed ZIP-epoch timestamp (1980-01-01 00:00:00)
//! and deflate compression, so re-running a downloader against unchanged
//! upstream content reproduces byte-identical archives.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, thiserror::Error)]
pub enum ZipAppendError {
    #[error("entry {0:?} already exists in this archive")]
    DuplicateEntry(String),
    #[error("I/O error building archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Append `filename` with contents `blob` to the ZIP at `zip_path`,
/// creating the archive if it does not exist yet. Errors if `filename`
/// is already present in the archive.
pub fn add_to_archive(zip_path: &Path, filename: &str, blob: &[u8]) -> Result<(), ZipAppendError> {
    if existing_entry_names(zip_path)?.contains(filename) {
        return Err(ZipAppendError::DuplicateEntry(filename.to_string()));
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(zip_path)?;
    let is_new = file.metadata()?.len() == 0;

    let mut writer = if is_new {
        ZipWriter::new(file)
    } else {
        ZipWriter::new_append(file)?
    };

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    writer.start_file(filename, options)?;
    writer.write_all(blob)?;
    writer.finish()?;
    Ok(())
}

fn existing_entry_names(zip_path: &Path) -> Result<Vec<String>, ZipAppendError> {
    if !zip_path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(zip_path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }
    let archive = ZipArchive::new(file)?;
    Ok(archive.file_names().map(str::to_string).collect())
}
