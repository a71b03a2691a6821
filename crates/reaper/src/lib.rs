//! Unattended ingestion daemon for scientific imaging instruments.
//!
//! The daemon watches an acquisition source, waits for each item (a series
//! of images) to stop changing, then extracts it, normalizes its metadata,
//! and hands a compressed archive to a downstream sink. Two sources are
//! supported: a directory tree the instrument console writes into
//! ([`fs_backend`]) and a query/retrieve network peer ([`net_backend`]).

pub mod archive;
pub mod backend;
pub mod config;
pub mod engine;
pub mod fs_backend;
pub mod metadata;
pub mod net_backend;
pub mod peripheral;
pub mod sink;

pub use backend::{Backend, ReapOutcome, ReapedArchive, Snapshot};
pub use config::ReaperConfig;
pub use engine::{Engine, EngineOptions};
pub use metadata::MetadataRecord;
