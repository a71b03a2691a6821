//! The backend contract the acquisition engine drives.
//!
//! A backend reports a [`Snapshot`] of item ids to opaque, comparable state
//! values; the engine only ever compares states for equality, so everything
//! backend-specific stays behind the associated type.

use crate::archive::ArchiveError;
use crate::metadata::{MetadataError, MetadataRecord};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Item id → backend state, as observed in one poll.
pub type Snapshot<S> = BTreeMap<String, S>;

/// One archive produced by a reap, with the metadata embedded in it.
#[derive(Debug)]
pub struct ReapedArchive {
    /// Archive file name (also the key in the per-reap outcome mapping).
    pub name: String,
    /// Location inside the reap workspace; the engine moves it downstream
    /// before the workspace is torn down.
    pub path: PathBuf,
    pub metadata: MetadataRecord,
}

/// What a reap attempt produced.
#[derive(Debug)]
pub enum ReapOutcome {
    /// The item was fully extracted; commit it and hand the archives on.
    Complete(Vec<ReapedArchive>),
    /// The extraction could not be completed (e.g. partial retrieval).
    /// The item stays eligible and is retried next cycle.
    Incomplete,
    /// The item was deliberately not extracted (filtered, empty). Terminal:
    /// no archives, no retry.
    Discarded,
}

/// A query failure is transient by definition: the engine logs it, leaves
/// every bit of persisted state untouched, and retries next cycle.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Scu(#[from] reaper_scu::ScuError),
}

#[derive(Debug, Error)]
pub enum ReapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Dicom(#[from] reaper_dicom::DicomError),

    #[error(transparent)]
    Scu(#[from] reaper_scu::ScuError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// One extraction backend: a source of items and the logic to pull them out.
pub trait Backend {
    /// Opaque item state. Equality is the engine's only window into it:
    /// two equal states mean "unchanged since last poll".
    type State: Clone + PartialEq + Display;

    /// Backend label for logs.
    fn name(&self) -> &str;

    /// Observe the source. An `Err` is a transient condition, distinct from
    /// an empty-but-valid snapshot.
    fn query(&mut self) -> Result<Snapshot<Self::State>, QueryError>;

    /// Extract one stable item into `workspace`. The workspace is exclusive
    /// to this attempt and is removed by the engine on every exit path.
    fn reap(
        &mut self,
        id: &str,
        state: &Self::State,
        workspace: &Path,
    ) -> Result<ReapOutcome, ReapError>;
}
