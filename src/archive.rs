//! Zip extraction and packaging.
//!
//! Both operations are blocking and are moved onto tokio's blocking pool.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{ExtractError, PackageError};

/// Extracts every entry of `archive` into `destination`.
///
/// Entries whose names would escape `destination` are skipped. Those skips
/// are reported as warnings by the unpacker, which are muted for the duration
/// of the unpack on the calling thread only. A single summary is logged after.
pub async fn extract_archive(archive: &Path, destination: &Path) -> Result<(), ExtractError> {
    let archive_path = archive.to_path_buf();
    let dest = destination.to_path_buf();

    let result = tokio::task::spawn_blocking(move || {
        with_quiet_diagnostics(|| unpack(&archive_path, &dest))
    })
    .await
    .unwrap_or_else(|e| Err(ZipError::Io(io::Error::other(e))));

    match result {
        Ok(summary) => {
            debug!(
                archive = %archive.display(),
                destination = %destination.display(),
                extracted = summary.extracted,
                skipped = summary.skipped,
                "Archive extracted"
            );
            Ok(())
        }
        Err(source) => Err(ExtractError {
            archive: archive.to_path_buf(),
            source,
        }),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct UnpackSummary {
    extracted: usize,
    skipped: usize,
}

/// Runs `f` with a no-op tracing subscriber as the thread's default.
///
/// The previous default is restored when `f` returns or unwinds. Other threads
/// and the global subscriber are unaffected.
fn with_quiet_diagnostics<T>(f: impl FnOnce() -> T) -> T {
    tracing::subscriber::with_default(tracing::subscriber::NoSubscriber::default(), f)
}

fn unpack(archive: &Path, destination: &Path) -> Result<UnpackSummary, ZipError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    std::fs::create_dir_all(destination)?;

    let mut summary = UnpackSummary::default();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            summary.skipped += 1;
            continue;
        };
        let out_path = destination.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        summary.extracted += 1;
    }

    Ok(summary)
}

/// Packs the regular files directly inside `dir` into a new zip at `archive`.
///
/// Subdirectories are not descended into. Entries are added in name order and
/// an existing file at `archive` is overwritten.
pub async fn create_archive_from_directory(dir: &Path, archive: &Path) -> Result<Vec<String>, PackageError> {
    let src = dir.to_path_buf();
    let dst = archive.to_path_buf();

    let result = tokio::task::spawn_blocking(move || pack(&src, &dst))
        .await
        .unwrap_or_else(|e| Err(ZipError::Io(io::Error::other(e))));

    result.map_err(|source| PackageError {
        dir: dir.to_path_buf(),
        archive: archive.to_path_buf(),
        source,
    })
}

fn pack(dir: &Path, archive: &Path) -> Result<Vec<String>, ZipError> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push((name, entry.path()));
    }
    files.sort();

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(File::create(archive)?);
    for (name, path) in &files {
        writer.start_file(name.as_str(), options)?;
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut writer)?;
    }
    writer.finish()?;

    Ok(files.into_iter().map(|(name, _)| name).collect())
}
