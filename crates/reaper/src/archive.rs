//! Archive builder: one compressed container per acquisition, with the
//! metadata record embedded as `METADATA.json` alongside the data files.

use crate::metadata::MetadataRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const METADATA_ENTRY: &str = "METADATA.json";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("archive source {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Compress `source_dir` into `<parent>/<archive_name>.zip`.
///
/// Entries are stored under `archive_name/` with deterministic (sorted)
/// ordering, and the metadata record is embedded as
/// `archive_name/METADATA.json`. Returns the archive path.
pub fn create(
    source_dir: &Path,
    archive_name: &str,
    metadata: &MetadataRecord,
) -> Result<PathBuf, ArchiveError> {
    if !source_dir.is_dir() {
        return Err(ArchiveError::NotADirectory(source_dir.to_path_buf()));
    }
    let archive_path = source_dir
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{archive_name}.zip"));

    let mut entries: Vec<PathBuf> = WalkDir::new(source_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    entries.sort();

    let file = fs::File::create(&archive_path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(format!("{archive_name}/{METADATA_ENTRY}"), options)?;
    zip.write_all(&metadata.to_json_pretty()?)?;

    for path in &entries {
        let rel = path.strip_prefix(source_dir).unwrap_or(path);
        zip.start_file(format!("{archive_name}/{}", rel.display()), options)?;
        zip.write_all(&fs::read(path)?)?;
    }
    zip.finish()?;

    debug!(
        archive = %archive_path.display(),
        files = entries.len(),
        "archive created"
    );
    Ok(archive_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    #[test]
    fn embeds_metadata_and_files() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("series1_dicom");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("b.dcm"), b"bbb").unwrap();
        fs::write(src.join("a.dcm"), b"aaa").unwrap();

        let mut metadata = MetadataRecord::new("dicom");
        metadata.set("subject_code", "abc");

        let path = create(&src, "series1_dicom", &metadata).unwrap();
        assert_eq!(path, dir.path().join("series1_dicom.zip"));

        let mut zip = ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "series1_dicom/METADATA.json",
                "series1_dicom/a.dcm",
                "series1_dicom/b.dcm",
            ]
        );

        let mut body = String::new();
        zip.by_name("series1_dicom/METADATA.json")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        let parsed: MetadataRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.get_str("filetype"), Some("dicom"));
        assert_eq!(parsed.get_str("subject_code"), Some("abc"));
    }

    #[test]
    fn missing_source_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = create(
            &dir.path().join("nope"),
            "nope",
            &MetadataRecord::new("dicom"),
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::NotADirectory(_)));
    }
}
