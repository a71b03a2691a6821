//! Downstream ingestion contract.
//!
//! The engine hands every committed (archive, metadata) pair to a sink.
//! [`DirectorySink`] is the filesystem implementation: archives are moved
//! into an outbox directory for the upload pipeline to pick up.

use crate::metadata::MetadataRecord;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive {0} has no file name")]
    NoFileName(PathBuf),
}

/// Receives committed archives. Called only after a reap fully succeeds.
pub trait IngestSink {
    fn deliver(&self, archive: &Path, metadata: &MetadataRecord) -> Result<PathBuf, SinkError>;
}

/// Moves archives into an output directory. Rename first; falls back to
/// copy + remove when the workspace and outbox are on different filesystems.
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: PathBuf) -> Result<DirectorySink, SinkError> {
        fs::create_dir_all(&root)?;
        Ok(DirectorySink { root })
    }
}

impl IngestSink for DirectorySink {
    fn deliver(&self, archive: &Path, metadata: &MetadataRecord) -> Result<PathBuf, SinkError> {
        let name = archive
            .file_name()
            .ok_or_else(|| SinkError::NoFileName(archive.to_path_buf()))?;
        let dest = self.root.join(name);
        if fs::rename(archive, &dest).is_err() {
            fs::copy(archive, &dest)?;
            fs::remove_file(archive)?;
        }
        info!(
            archive = %dest.display(),
            subject = metadata.get_str(crate::metadata::KEY_SUBJECT_CODE).unwrap_or("-"),
            "archive delivered"
        );
        Ok(dest)
    }
}
