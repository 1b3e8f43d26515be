//! Gzip'd tarball extraction.
//!
//! Extraction runs on the blocking pool. Entries that would land outside the
//! destination (absolute paths, `..` components) are skipped rather than
//! written.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open archive {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create extraction directory {}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive {} is not a readable gzip tarball", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("extraction task failed: {0}")]
    Task(String),
}

/// What an extraction actually wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Entries written (files, directories, links).
    pub entries: usize,
    /// Regular files written.
    pub files: usize,
    /// Entries refused because they escaped the destination.
    pub skipped: usize,
}

pub async fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<ExtractSummary, ArchiveError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

fn extract_blocking(archive_path: &Path, dest: &Path) -> Result<ExtractSummary, ArchiveError> {
    let file = File::open(archive_path).map_err(|source| ArchiveError::Open {
        path: archive_path.to_path_buf(),
        source,
    })?;
    std::fs::create_dir_all(dest).map_err(|source| ArchiveError::Destination {
        path: dest.to_path_buf(),
        source,
    })?;

    let corrupt = |source: io::Error| ArchiveError::Corrupt {
        path: archive_path.to_path_buf(),
        source,
    };

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut summary = ExtractSummary::default();

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let is_file = entry.header().entry_type().is_file();

        if entry.unpack_in(dest).map_err(corrupt)? {
            summary.entries += 1;
            if is_file {
                summary.files += 1;
            }
        } else {
            summary.skipped += 1;
        }
    }

    if summary.skipped > 0 {
        tracing::warn!(
            archive = %archive_path.display(),
            skipped = summary.skipped,
            "Skipped archive entries outside the extraction root"
        );
    }

    Ok(summary)
}

/// Count regular files below `root`, recursively.
pub fn count_files(root: &Path) -> io::Result<usize> {
    let mut count = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                count += 1;
            }
        }
    }

    Ok(count)
}
