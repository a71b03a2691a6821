//! DICOM handling for the reaper: a minimal Part-10 codec plus the
//! identity/header normalizer and de-identification pass.
//!
//! The codec reads the two little-endian transfer syntaxes the instruments
//! emit, carries unrecognized elements through untouched, and writes mutated
//! datasets back atomically. Everything privacy-sensitive lives in
//! [`header`].

pub mod codec;
pub mod header;
pub mod tags;

pub use codec::{DataSet, Encoding, ReadMode};
pub use header::{DicomHeader, OpenOptions, FILETYPE};
pub use tags::Tag;

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DicomError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a DICOM file")]
    NotDicom,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("dataset was read header-only and cannot be written back")]
    Truncated,

    #[error("configuration error: {0}")]
    Config(String),
}
