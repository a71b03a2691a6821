//! Metadata records embedded in every archive.
//!
//! A record is an ordered mapping of recognized keys to JSON values, always
//! carrying `filetype`. The filesystem backend seeds records from sidecar
//! `metadata.json` files; the network backend derives them from a parsed
//! instrument header.

use chrono::{DateTime, FixedOffset};
use reaper_dicom::DicomHeader;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const KEY_FILETYPE: &str = "filetype";
pub const KEY_SESSION_UID: &str = "session_uid";
pub const KEY_SESSION_TIMESTAMP: &str = "session_timestamp";
pub const KEY_SUBJECT_CODE: &str = "subject_code";
pub const KEY_GROUP_ID: &str = "group_id";
pub const KEY_PROJECT_LABEL: &str = "project_label";
pub const KEY_ACQUISITION_UID: &str = "acquisition_uid";
pub const KEY_ACQUISITION_TIMESTAMP: &str = "acquisition_timestamp";
pub const KEY_ACQUISITION_LABEL: &str = "acquisition_label";
pub const KEY_SUBJECT_FIRSTNAME: &str = "subject_firstname";
pub const KEY_SUBJECT_LASTNAME: &str = "subject_lastname";
pub const KEY_SUBJECT_FIRSTNAME_HASH: &str = "subject_firstname_hash";
pub const KEY_SUBJECT_LASTNAME_HASH: &str = "subject_lastname_hash";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sidecar JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sidecar must be a JSON object")]
    NotAnObject,
}

/// Ordered key → value record, serialized as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord(BTreeMap<String, Value>);

impl MetadataRecord {
    pub fn new(filetype: &str) -> MetadataRecord {
        let mut record = MetadataRecord::default();
        record.set(KEY_FILETYPE, filetype);
        record
    }

    /// Build the record for one acquisition from its representative header.
    pub fn from_header(header: &DicomHeader) -> MetadataRecord {
        let mut record = MetadataRecord::new(reaper_dicom::FILETYPE);
        record.set_opt(KEY_SESSION_UID, header.session_uid.as_deref());
        record.set_timestamp(KEY_SESSION_TIMESTAMP, header.session_timestamp.as_ref());
        record.set_opt(KEY_SUBJECT_CODE, header.subject_code.as_deref());
        record.set_opt(KEY_GROUP_ID, header.group_id.as_deref());
        record.set_opt(KEY_PROJECT_LABEL, header.project_label.as_deref());
        record.set_opt(KEY_ACQUISITION_UID, header.acquisition_uid.as_deref());
        record.set_timestamp(
            KEY_ACQUISITION_TIMESTAMP,
            header.acquisition_timestamp.as_ref(),
        );
        record.set_opt(KEY_ACQUISITION_LABEL, header.acquisition_label.as_deref());
        record.set_opt(KEY_SUBJECT_FIRSTNAME, header.subject_firstname.as_deref());
        record.set_opt(KEY_SUBJECT_LASTNAME, header.subject_lastname.as_deref());
        record.set_opt(
            KEY_SUBJECT_FIRSTNAME_HASH,
            header.subject_firstname_hash.as_deref(),
        );
        record.set_opt(
            KEY_SUBJECT_LASTNAME_HASH,
            header.subject_lastname_hash.as_deref(),
        );
        record
    }

    /// Load a sidecar `metadata.json`, decoding date/time-valued strings into
    /// canonical RFC 3339 form.
    pub fn load_sidecar(path: &Path) -> Result<MetadataRecord, MetadataError> {
        let raw = fs::read_to_string(path)?;
        let mut value: Value = serde_json::from_str(&raw)?;
        decode_datetimes(&mut value);
        match value {
            Value::Object(map) => Ok(MetadataRecord(map.into_iter().collect())),
            _ => Err(MetadataError::NotAnObject),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn set_opt(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    pub fn set_timestamp(&mut self, key: &str, value: Option<&DateTime<FixedOffset>>) {
        if let Some(ts) = value {
            self.set(key, ts.to_rfc3339());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

/// Rewrite any string value that parses as a timestamp into RFC 3339. Works
/// recursively so nested sidecar structures are normalized too.
fn decode_datetimes(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(normalized) = normalize_datetime(s) {
                *s = normalized;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(decode_datetimes),
        Value::Object(map) => map.values_mut().for_each(decode_datetimes),
        _ => {}
    }
}

fn normalize_datetime(s: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.to_rfc3339());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc().to_rfc3339());
    }
    None
}
