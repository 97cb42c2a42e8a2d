//! Version archives
//!
//! A version's directory is captured as a deflated zip. Entries are written in
//! sorted order with a fixed timestamp, so the same tree always produces the
//! same bytes and the archive digest doubles as a change detector.

use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use zip::{result::ZipError, write::FileOptions, CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::deploy::IGNORED_ENTRIES;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Zip archive error: {0}")]
    Zip(#[from] ZipError),
}

/// Zip `src` into memory. Top-level entries named in `skip` and the usual
/// ignored entries are left out.
pub fn zip_dir(src: &Path, skip: &[&str]) -> Result<Vec<u8>, ArchiveError> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        add_dir(&mut writer, src, "", skip, options)?;
        writer.finish()?;
    }
    Ok(cursor.into_inner())
}

fn add_dir<W: Write + io::Seek>(
    writer: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &str,
    skip: &[&str],
    options: FileOptions,
) -> Result<(), ArchiveError> {
    let io_err = |source: io::Error| ArchiveError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .and_then(|it| it.collect::<io::Result<Vec<_>>>())
        .map_err(io_err)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_ENTRIES.contains(&name.as_str()) || (prefix.is_empty() && skip.contains(&name.as_str())) {
            continue;
        }
        let path = entry.path();
        let entry_name = format!("{}{}", prefix, name);
        let meta = fs::metadata(&path).map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;

        if meta.is_dir() {
            let dir_name = format!("{}/", entry_name);
            writer.add_directory(dir_name.as_str(), options)?;
            add_dir(writer, &path, &dir_name, skip, options)?;
        } else {
            let bytes = fs::read(&path).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
            writer.start_file(entry_name.as_str(), options)?;
            writer.write_all(&bytes).map_err(|source| ArchiveError::Io { path, source })?;
        }
    }
    Ok(())
}

/// `sha256:<hex>` of an archive
pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Unpack an archive into `target`, which must already exist
pub fn extract(bytes: &[u8], target: &Path) -> io::Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_to_io)?;
    archive.extract(target).map_err(zip_to_io)?;
    debug!(target = %target.display(), entries = archive.len(), "archive extracted");
    Ok(())
}

fn zip_to_io(e: ZipError) -> io::Error {
    match e {
        ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
