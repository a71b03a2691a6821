//! Identity extraction, normalization, and de-identification.
//!
//! A [`DicomHeader`] is the canonical record the backends work with: subject
//! and session identity, localized timestamps, and acquisition grouping keys,
//! all derived from the raw instrument header. De-identification mutates the
//! source file in place (atomic write-back) and blanks the parsed name fields.

use crate::codec::{DataSet, ReadMode};
use crate::{tags, DicomError};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

pub const FILETYPE: &str = "dicom";

/// Vendor whose acquisition numbering is unreliable; series from this vendor
/// are never split by acquisition number.
const UNSPLIT_MANUFACTURER: &str = "SIEMENS";

const SCREENSHOT_IMAGE_TYPES: [&str; 2] = [
    "DERIVED\\SECONDARY\\SCREEN SAVE",
    "DERIVED\\SECONDARY\\VXTL STATE",
];

/// Age above which de-identified ages are encoded in years instead of months.
const AGE_MONTHS_CUTOVER: i32 = 360;

/// Birth dates before this year are treated as placeholder junk.
const MIN_PLAUSIBLE_BIRTH_YEAR: i32 = 1900;

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Parse the full identity record (required for de-identification).
    pub parse: bool,
    /// Blank name fields and fold the birth date into an age string,
    /// writing the mutated header back to the source file.
    pub deidentify: bool,
    pub timezone: Tz,
}

impl OpenOptions {
    pub fn peek(timezone: Tz) -> Self {
        OpenOptions {
            parse: false,
            deidentify: false,
            timezone,
        }
    }

    pub fn parsed(timezone: Tz, deidentify: bool) -> Self {
        OpenOptions {
            parse: true,
            deidentify,
            timezone,
        }
    }
}

/// Canonical identity record for one instrument file.
#[derive(Debug, Clone, Default)]
pub struct DicomHeader {
    pub patient_id: String,
    pub acquisition_number: Option<String>,
    pub series_uid: Option<String>,
    pub session_uid: Option<String>,
    pub session_timestamp: Option<DateTime<FixedOffset>>,
    pub subject_firstname: Option<String>,
    pub subject_lastname: Option<String>,
    pub subject_firstname_hash: Option<String>,
    pub subject_lastname_hash: Option<String>,
    pub subject_code: Option<String>,
    pub group_id: Option<String>,
    pub project_label: Option<String>,
    pub acquisition_uid: Option<String>,
    pub acquisition_timestamp: Option<DateTime<FixedOffset>>,
    pub acquisition_label: Option<String>,
}

impl DicomHeader {
    /// Read and normalize one file's header.
    ///
    /// With `parse` unset only the grouping keys (patient id, acquisition
    /// number, series uid) are populated; this is the cheap membership check
    /// used during splitting and filtering. Requesting `deidentify` without
    /// `parse` is a configuration error, never silently honored.
    pub fn open(path: &Path, opts: &OpenOptions) -> Result<DicomHeader, DicomError> {
        if opts.deidentify && !opts.parse {
            return Err(DicomError::Config(
                "cannot de-identify without parsing the full header".to_string(),
            ));
        }

        // Write-back needs every element; otherwise the header is enough.
        let mode = if opts.deidentify {
            ReadMode::Full
        } else {
            ReadMode::HeaderOnly
        };
        let mut ds = DataSet::read_file(path, mode)?;

        let mut header = DicomHeader {
            patient_id: ds.str_value(tags::PATIENT_ID).unwrap_or_default(),
            ..DicomHeader::default()
        };

        let manufacturer = ds.str_value(tags::MANUFACTURER).unwrap_or_default();
        header.acquisition_number = if manufacturer.to_uppercase() != UNSPLIT_MANUFACTURER {
            ds.str_value(tags::ACQUISITION_NUMBER)
        } else {
            None
        };

        if !opts.parse {
            header.series_uid = ds.str_value(tags::SERIES_INSTANCE_UID);
            return Ok(header);
        }

        let mut series_uid = ds.str_value(tags::SERIES_INSTANCE_UID);
        if let Some(image_type) = ds.str_value(tags::IMAGE_TYPE) {
            if is_screenshot(&image_type) {
                // Screenshots are logically separate from the primary image
                // data; remap them onto the preceding series uid.
                series_uid = series_uid.as_deref().and_then(decrement_uid_suffix);
            }
        }

        let session_timestamp = timestamp(
            ds.str_value(tags::STUDY_DATE).as_deref(),
            ds.str_value(tags::STUDY_TIME).as_deref(),
            opts.timezone,
        );
        let acquisition_timestamp = timestamp(
            ds.str_value(tags::ACQUISITION_DATE).as_deref(),
            ds.str_value(tags::ACQUISITION_TIME).as_deref(),
            opts.timezone,
        );

        let name = ds.str_value(tags::PATIENT_NAME).unwrap_or_default();
        let (firstname, lastname) = parse_patient_name(&name);
        header.subject_firstname_hash = firstname.as_deref().map(sha256_hex);
        header.subject_lastname_hash = lastname.as_deref().map(sha256_hex);
        header.subject_firstname = firstname;
        header.subject_lastname = lastname;

        let default_code = ds.str_value(tags::STUDY_ID).unwrap_or_default();
        let (code, group, project) = parse_patient_id(&header.patient_id, &default_code);
        header.subject_code = code;
        header.group_id = group;
        header.project_label = project;

        header.acquisition_uid = series_uid.as_ref().map(|uid| match &header.acquisition_number {
            Some(acq) => format!("{uid}_{acq}"),
            None => uid.clone(),
        });
        header.session_uid = ds.str_value(tags::STUDY_INSTANCE_UID);
        header.acquisition_timestamp = acquisition_timestamp.or(session_timestamp);
        header.session_timestamp = session_timestamp;
        header.acquisition_label = ds.str_value(tags::SERIES_DESCRIPTION);
        header.series_uid = series_uid;

        if opts.deidentify {
            header.subject_firstname = None;
            header.subject_lastname = None;
            deidentify_dataset(&mut ds, header.session_timestamp.as_ref());
            ds.save_atomic(path)?;
            debug!(path = %path.display(), "de-identified header written back");
        }

        Ok(header)
    }
}

/// Blank direct identifiers in the dataset: the birth date becomes an age
/// string when plausible, and the raw name is always removed.
fn deidentify_dataset(ds: &mut DataSet, session_timestamp: Option<&DateTime<FixedOffset>>) {
    if let Some(raw_dob) = ds.str_value(tags::PATIENT_BIRTH_DATE) {
        if let (Some(dob), Some(session)) = (parse_birth_date(&raw_dob), session_timestamp) {
            if let Some(age) = age_string(dob, session.date_naive()) {
                ds.put_str(tags::PATIENT_AGE, &age);
            }
        }
        ds.remove(tags::PATIENT_BIRTH_DATE);
    }
    ds.remove(tags::PATIENT_NAME);
}

/// Combine DICOM date + time values (time truncated to whole seconds) and
/// localize to the instrument timezone. Either field missing yields `None`.
pub fn timestamp(date: Option<&str>, time: Option<&str>, tz: Tz) -> Option<DateTime<FixedOffset>> {
    let (date, time) = (date?, time?);
    if time.len() < 6 {
        return None;
    }
    let naive =
        NaiveDateTime::parse_from_str(&format!("{date}{}", &time[..6]), "%Y%m%d%H%M%S").ok()?;
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.fixed_offset())
}

/// Split a patient name into (firstname, lastname), title-cased.
///
/// A caret means the protocol convention `Lastname^Firstname`; otherwise the
/// value is split at the last space as `Firstname Lastname`.
pub fn parse_patient_name(name: &str) -> (Option<String>, Option<String>) {
    let (first, last) = match name.split_once('^') {
        Some((last, first)) => (first, last),
        None => match name.rsplit_once(' ') {
            Some((first, last)) => (first, last),
            None => ("", name),
        },
    };
    (title_case(first.trim()), title_case(last.trim()))
}

/// Parse `subjectcode@group/project` out of a patient id.
///
/// The id is stripped of surrounding punctuation and whitespace and
/// lowercased. An absent subject code falls back to `default_code`.
pub fn parse_patient_id(
    patient_id: &str,
    default_code: &str,
) -> (Option<String>, Option<String>, Option<String>) {
    let cleaned = patient_id
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase();

    let (code, lab_info) = match cleaned.rfind('@') {
        Some(idx) => (&cleaned[..idx], &cleaned[idx + 1..]),
        None => ("", cleaned.as_str()),
    };
    let (group, project) = match lab_info.split_once('/') {
        Some((group, project)) => (group, project),
        None => (lab_info, ""),
    };

    let code = if code.is_empty() {
        default_code.to_string()
    } else {
        code.to_string()
    };
    (
        non_empty(code),
        non_empty(group.to_string()),
        non_empty(project.to_string()),
    )
}

/// Whether an ImageType value marks a vendor screenshot image.
pub fn is_screenshot(image_type: &str) -> bool {
    SCREENSHOT_IMAGE_TYPES.contains(&image_type)
}

/// Remap a dotted uid onto its predecessor: `1.2.3.10` -> `1.2.3.9`.
fn decrement_uid_suffix(uid: &str) -> Option<String> {
    let (front, back) = uid.rsplit_once('.')?;
    let n: u64 = back.parse().ok()?;
    Some(format!("{front}.{}", n.checked_sub(1)?))
}

/// Parse a `YYYYMMDD` birth date, rejecting implausible values.
fn parse_birth_date(dob: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(dob, "%Y%m%d")
        .ok()
        .filter(|d| d.year() >= MIN_PLAUSIBLE_BIRTH_YEAR)
}

/// Encode an age at session time: whole months under the cutover, whole
/// years from there up.
fn age_string(dob: NaiveDate, session: NaiveDate) -> Option<String> {
    let mut months = 12 * (session.year() - dob.year()) + session.month() as i32
        - dob.month() as i32;
    if session.day() < dob.day() {
        months -= 1;
    }
    if months < 0 {
        return None;
    }
    if months < AGE_MONTHS_CUTOVER {
        Some(format!("{months:03}M"))
    } else {
        Some(format!("{:03}Y", months / 12))
    }
}

fn title_case(value: &str) -> Option<String> {
    non_empty(
        value
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn sha256_hex(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataSet;
    use chrono::Timelike;
    use tempfile::TempDir;

    fn tz() -> Tz {
        "America/Los_Angeles".parse().unwrap()
    }

    fn write_sample(dir: &TempDir, name: &str, mutate: impl FnOnce(&mut DataSet)) -> std::path::PathBuf {
        let mut ds = DataSet::new_explicit();
        ds.put_str(tags::MANUFACTURER, "GE MEDICAL SYSTEMS");
        ds.put_str(tags::STUDY_DATE, "20200101");
        ds.put_str(tags::STUDY_TIME, "101530.25");
        ds.put_str(tags::PATIENT_NAME, "Doe^Jane");
        ds.put_str(tags::PATIENT_ID, "abc123@labX/projY");
        ds.put_str(tags::PATIENT_BIRTH_DATE, "19900101");
        ds.put_str(tags::STUDY_INSTANCE_UID, "1.2.3");
        ds.put_str(tags::SERIES_INSTANCE_UID, "1.2.3.10");
        ds.put_str(tags::STUDY_ID, "study9");
        ds.put_str(tags::ACQUISITION_NUMBER, "2");
        ds.put_str(tags::SERIES_DESCRIPTION, "t1_mprage");
        mutate(&mut ds);
        let path = dir.path().join(name);
        ds.save_atomic(&path).unwrap();
        path
    }

    #[test]
    fn name_parsing_both_conventions() {
        assert_eq!(
            parse_patient_name("Doe^Jane"),
            (Some("Jane".into()), Some("Doe".into()))
        );
        assert_eq!(
            parse_patient_name("Jane Doe"),
            (Some("Jane".into()), Some("Doe".into()))
        );
        assert_eq!(parse_patient_name(""), (None, None));
        assert_eq!(
            parse_patient_name("mary jane watson"),
            (Some("Mary Jane".into()), Some("Watson".into()))
        );
    }

    #[test]
    fn patient_id_parsing_case_normalized() {
        let (code, group, project) = parse_patient_id("abc123@labX/projY", "fallback");
        assert_eq!(code.as_deref(), Some("abc123"));
        assert_eq!(group.as_deref(), Some("labx"));
        assert_eq!(project.as_deref(), Some("projy"));
    }

    #[test]
    fn patient_id_missing_code_falls_back() {
        let (code, group, project) = parse_patient_id("labx/projy", "study9");
        assert_eq!(code.as_deref(), Some("study9"));
        assert_eq!(group.as_deref(), Some("labx"));
        assert_eq!(project.as_deref(), Some("projy"));
    }

    #[test]
    fn patient_id_strips_surrounding_punctuation() {
        let (code, group, _) = parse_patient_id("  .abc@lab/. ", "d");
        assert_eq!(code.as_deref(), Some("abc"));
        assert_eq!(group.as_deref(), Some("lab"));
    }

    #[test]
    fn timestamp_truncates_to_whole_seconds() {
        let ts = timestamp(Some("20200101"), Some("101530.25"), tz()).unwrap();
        assert_eq!(ts.hour(), 10);
        assert_eq!(ts.second(), 30);
        assert_eq!(ts.nanosecond(), 0);
        assert!(timestamp(Some("20200101"), None, tz()).is_none());
        assert!(timestamp(None, Some("101530"), tz()).is_none());
    }

    #[test]
    fn age_encoding_cutover() {
        let dob = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap();
        let session = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        // 360 whole months: encoded as years.
        assert_eq!(age_string(dob, session).as_deref(), Some("030Y"));

        let young = NaiveDate::from_ymd_opt(2019, 6, 15).unwrap();
        assert_eq!(age_string(young, session).as_deref(), Some("006M"));

        // Day-of-month not yet reached: one month fewer.
        let session_early = NaiveDate::from_ymd_opt(2019, 12, 31).unwrap();
        assert_eq!(age_string(dob, session_early).as_deref(), Some("359M"));
    }

    #[test]
    fn screenshot_remaps_series_uid() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, "shot.dcm", |ds| {
            ds.put_str(tags::IMAGE_TYPE, "DERIVED\\SECONDARY\\SCREEN SAVE");
        });
        let header = DicomHeader::open(&path, &OpenOptions::parsed(tz(), false)).unwrap();
        assert_eq!(header.series_uid.as_deref(), Some("1.2.3.9"));
        assert_eq!(header.acquisition_uid.as_deref(), Some("1.2.3.9_2"));
    }

    #[test]
    fn parse_populates_identity() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, "a.dcm", |_| {});
        let header = DicomHeader::open(&path, &OpenOptions::parsed(tz(), false)).unwrap();
        assert_eq!(header.subject_code.as_deref(), Some("abc123"));
        assert_eq!(header.group_id.as_deref(), Some("labx"));
        assert_eq!(header.project_label.as_deref(), Some("projy"));
        assert_eq!(header.subject_firstname.as_deref(), Some("Jane"));
        assert_eq!(header.subject_lastname.as_deref(), Some("Doe"));
        assert_eq!(header.acquisition_label.as_deref(), Some("t1_mprage"));
        assert_eq!(header.session_uid.as_deref(), Some("1.2.3"));
        assert!(header.session_timestamp.is_some());
        // No acquisition date/time: falls back to the session timestamp.
        assert_eq!(header.acquisition_timestamp, header.session_timestamp);
    }

    #[test]
    fn siemens_never_splits_by_acquisition_number() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, "s.dcm", |ds| {
            ds.put_str(tags::MANUFACTURER, "Siemens");
        });
        let header = DicomHeader::open(&path, &OpenOptions::peek(tz())).unwrap();
        assert_eq!(header.acquisition_number, None);
    }

    #[test]
    fn deidentify_blanks_name_and_encodes_age() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, "d.dcm", |_| {});
        let header = DicomHeader::open(&path, &OpenOptions::parsed(tz(), true)).unwrap();
        assert!(header.subject_firstname.is_none());
        assert!(header.subject_lastname.is_none());
        // Hashes survive blanking for irreversible linkage.
        assert!(header.subject_firstname_hash.is_some());

        let ds = DataSet::read_file(&path, ReadMode::Full).unwrap();
        assert!(ds.str_value(tags::PATIENT_NAME).is_none());
        assert!(ds.str_value(tags::PATIENT_BIRTH_DATE).is_none());
        assert_eq!(ds.str_value(tags::PATIENT_AGE).as_deref(), Some("030Y"));
    }

    #[test]
    fn deidentify_requires_full_parse() {
        let opts = OpenOptions {
            parse: false,
            deidentify: true,
            timezone: tz(),
        };
        let err = DicomHeader::open(Path::new("/nonexistent"), &opts).unwrap_err();
        assert!(matches!(err, DicomError::Config(_)));
    }

    #[test]
    fn implausible_birth_date_is_dropped_without_age() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir, "old.dcm", |ds| {
            ds.put_str(tags::PATIENT_BIRTH_DATE, "18501225");
        });
        DicomHeader::open(&path, &OpenOptions::parsed(tz(), true)).unwrap();
        let ds = DataSet::read_file(&path, ReadMode::Full).unwrap();
        assert!(ds.str_value(tags::PATIENT_BIRTH_DATE).is_none());
        assert!(ds.str_value(tags::PATIENT_AGE).is_none());
    }
}
