//! Filesystem backend: watches a directory tree an imaging console writes
//! into. An item is a leaf directory (no subdirectories, at least one file);
//! its state is the (mtime, file count, total size) triple, which stops
//! changing once the console has finished writing the series.

use crate::backend::{Backend, QueryError, ReapError, ReapOutcome, ReapedArchive, Snapshot};
use crate::metadata::MetadataRecord;
use crate::{archive, metadata};
use chrono::{DateTime, Utc};
use reaper_dicom::{DataSet, ReadMode};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SIDECAR_NAME: &str = "metadata.json";

/// Observed shape of one leaf directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FsState {
    pub mod_time: DateTime<Utc>,
    pub file_cnt: usize,
    pub size: u64,
}

impl fmt::Display for FsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {} files, {}]",
            self.mod_time.format("%Y-%m-%d %H:%M:%S"),
            self.file_cnt,
            hrsize(self.size)
        )
    }
}

pub struct FsBackend {
    root: PathBuf,
    name: String,
}

impl FsBackend {
    pub fn new(root: PathBuf) -> std::io::Result<FsBackend> {
        fs::create_dir_all(&root)?;
        let name = root
            .to_string_lossy()
            .trim_matches('/')
            .replace('/', "_");
        Ok(FsBackend { root, name })
    }

    /// Inspect one directory: `Some(state)` if it qualifies as an item
    /// (a leaf with at least one file), `None` otherwise. Unreadable
    /// directories are skipped for this cycle.
    fn inspect(&self, dir: &Path) -> Option<FsState> {
        let mut file_cnt = 0;
        let mut size = 0;
        for entry in fs::read_dir(dir).ok()? {
            let entry = entry.ok()?;
            let meta = entry.metadata().ok()?;
            if meta.is_dir() {
                return None; // not a leaf
            }
            file_cnt += 1;
            size += meta.len();
        }
        if file_cnt == 0 {
            return None;
        }
        let mod_time = fs::metadata(dir).ok()?.modified().ok()?;
        Some(FsState {
            mod_time: DateTime::<Utc>::from(mod_time),
            file_cnt,
            size,
        })
    }
}

impl Backend for FsBackend {
    type State = FsState;

    fn name(&self) -> &str {
        &self.name
    }

    fn query(&mut self) -> Result<Snapshot<FsState>, QueryError> {
        let mut snapshot = Snapshot::new();
        let walker = WalkDir::new(&self.root).min_depth(1).into_iter();
        for entry in walker.filter_entry(|e| !is_hidden(e.path())) {
            let entry = match entry {
                Ok(e) => e,
                Err(error) => {
                    // Skip what we cannot read this cycle; not a query failure.
                    debug!(%error, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(state) = self.inspect(entry.path()) {
                snapshot.insert(entry.path().to_string_lossy().into_owned(), state);
            }
        }
        Ok(snapshot)
    }

    fn reap(
        &mut self,
        id: &str,
        state: &FsState,
        workspace: &Path,
    ) -> Result<ReapOutcome, ReapError> {
        info!(item = %id, state = %state, "reaping");
        let item_dir = Path::new(id);
        let dir_name = item_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reap".to_string());
        let reap_dir = workspace.join(&dir_name);
        fs::create_dir(&reap_dir)?;

        let sidecar_path = workspace.join("METADATA.json");
        let mut reap_cnt = 0usize;
        let mut skipped = 0usize;
        for entry in fs::read_dir(item_dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.eq_ignore_ascii_case(SIDECAR_NAME) {
                // Seed metadata travels with the archive, not as a data file.
                move_file(&path, &sidecar_path)?;
                continue;
            }
            match DataSet::read_file(&path, ReadMode::HeaderOnly) {
                Ok(_) => {
                    fs::copy(&path, reap_dir.join(&file_name))?;
                    reap_cnt += 1;
                }
                Err(error) => {
                    debug!(file = %file_name, %error, "failed format validation; excluded");
                    skipped += 1;
                }
            }
        }
        info!(item = %id, files = reap_cnt, skipped, "reaped");

        if reap_cnt == 0 {
            warn!(item = %id, "no valid files; discarding");
            return Ok(ReapOutcome::Discarded);
        }

        let mut record = if sidecar_path.exists() {
            MetadataRecord::load_sidecar(&sidecar_path)?
        } else {
            MetadataRecord::default()
        };
        record.set(metadata::KEY_FILETYPE, reaper_dicom::FILETYPE);

        let archive_path = archive::create(&reap_dir, &dir_name, &record)?;
        fs::remove_dir_all(&reap_dir)?;
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{dir_name}.zip"));

        Ok(ReapOutcome::Complete(vec![ReapedArchive {
            name: archive_name,
            path: archive_path,
            metadata: record,
        }]))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Human-readable byte count for log lines.
pub fn hrsize(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = size as f64;
    for unit in UNITS {
        if value < 1000.0 {
            return if unit == "B" {
                format!("{size}B")
            } else {
                format!("{value:.1}{unit}")
            };
        }
        value /= 1024.0;
    }
    format!("{value:.1}EB")
}
