//! Snapshot packaging as gzip-compressed tar
//!
//! Entries are added in sorted order with deterministic headers, so the same
//! working directory always yields the same archive listing.

use crate::{Result, SnapError};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::Path;
use tar::{Builder, HeaderMode};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Pack every regular file under `source_dir` into `output_path`.
///
/// Paths inside the archive are relative to `source_dir`. A partial archive
/// is removed on failure.
pub fn build_archive(source_dir: &Path, output_path: &Path) -> Result<()> {
    let written = write_archive(source_dir, output_path);
    if written.is_err() {
        let _ = fs::remove_file(output_path);
    }
    written
}

fn write_archive(source_dir: &Path, output_path: &Path) -> Result<()> {
    if !source_dir.is_dir() {
        return Err(SnapError::ArchiveError(format!(
            "{} is not a directory",
            source_dir.display()
        )));
    }

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| archive_error("create", parent, e))?;
    }

    let file = File::create(output_path).map_err(|e| archive_error("create", output_path, e))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.mode(HeaderMode::Deterministic);

    let mut files = 0usize;
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| SnapError::ArchiveError(e.to_string()))?;
        if !entry.file_type().is_file() || entry.path() == output_path {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| SnapError::ArchiveError(e.to_string()))?;
        debug!(entry = %relative.display(), "Adding archive entry");
        builder
            .append_path_with_name(entry.path(), relative)
            .map_err(|e| archive_error("append", entry.path(), e))?;
        files += 1;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| archive_error("finish", output_path, e))?;
    encoder
        .finish()
        .map_err(|e| archive_error("compress", output_path, e))?;

    info!(archive = %output_path.display(), files, "Snapshot archive written");
    Ok(())
}

fn archive_error(action: &str, path: &Path, e: std::io::Error) -> SnapError {
    SnapError::ArchiveError(format!("Failed to {} {}: {}", action, path.display(), e))
}
