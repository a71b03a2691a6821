//! Network backend: drives a query/retrieve peer.
//!
//! A poll is one series-level find; an item's state is the declared image
//! count plus the declared patient id. Reaping moves the series into the
//! workspace, verifies the transfer, splits it into acquisitions, optionally
//! de-identifies every file, and emits one archive per acquisition.

use crate::backend::{Backend, QueryError, ReapError, ReapOutcome, ReapedArchive, Snapshot};
use crate::metadata::MetadataRecord;
use crate::peripheral::{self, PeripheralReaper};
use crate::archive;
use chrono_tz::Tz;
use filetime::FileTime;
use reaper_dicom::{DicomHeader, OpenOptions};
use reaper_scu::{Scu, SeriesQuery};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Declared shape of one series, as reported by the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct NetState {
    pub images: u32,
    pub patient_id: String,
}

impl fmt::Display for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} images, patient {})", self.images, self.patient_id)
    }
}

/// Filtering and de-identification policy for the network backend.
#[derive(Debug, Clone)]
pub struct NetPolicy {
    pub anonymize: bool,
    pub timezone: Tz,
    /// Patient ids must match to be reaped.
    pub whitelist: Regex,
    /// Exact exclusions, compared case- and slash-insensitively.
    pub blacklist: Vec<String>,
}

/// Compile a `*`-glob whitelist into an anchored regex.
pub fn compile_whitelist(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$"))
}

pub struct NetBackend<S: Scu> {
    scu: S,
    name: String,
    policy: NetPolicy,
    peripherals: Vec<Box<dyn PeripheralReaper>>,
}

impl<S: Scu> NetBackend<S> {
    pub fn new(scu: S, name: String, policy: NetPolicy) -> NetBackend<S> {
        NetBackend {
            scu,
            name,
            policy: NetPolicy {
                blacklist: policy
                    .blacklist
                    .iter()
                    .map(|entry| entry.to_lowercase())
                    .collect(),
                ..policy
            },
            peripherals: Vec::new(),
        }
    }

    pub fn register_peripheral(&mut self, plugin: Box<dyn PeripheralReaper>) {
        self.peripherals.push(plugin);
    }

    fn is_desired_patient_id(&self, patient_id: &str) -> bool {
        if !self.policy.whitelist.is_match(patient_id) {
            info!(patient = %patient_id, "ignoring (non-matching patient id)");
            return false;
        }
        if self
            .policy
            .blacklist
            .contains(&patient_id.trim_matches('/').to_lowercase())
        {
            info!(patient = %patient_id, "discarding (blacklisted patient id)");
            return false;
        }
        true
    }

    /// Group retrieved files by acquisition number and build one archive per
    /// group. Files that fail to parse are excluded, logged, and counted
    /// against nothing — they never abort the batch.
    fn split_into_acquisitions(
        &self,
        id: &str,
        workspace: &Path,
        filepaths: &[PathBuf],
    ) -> Result<Vec<ReapedArchive>, ReapError> {
        info!(series = %id, "inspecting");
        let mut groups: BTreeMap<Option<String>, Vec<PathBuf>> = BTreeMap::new();
        for path in filepaths {
            match DicomHeader::open(path, &OpenOptions::peek(self.policy.timezone)) {
                Ok(peek) => groups
                    .entry(peek.acquisition_number)
                    .or_default()
                    .push(path.clone()),
                Err(error) => {
                    warn!(file = %path.display(), %error, "unparseable file; excluded")
                }
            }
        }

        info!(series = %id, anonymize = self.policy.anonymize, "compressing");
        let mut archives = Vec::new();
        for (acq_no, paths) in &groups {
            let name_prefix = match acq_no {
                Some(n) => format!("{id}_{n}"),
                None => id.to_string(),
            };
            let dir_name = format!("{name_prefix}_{}", reaper_dicom::FILETYPE);
            let arcdir = workspace.join(&dir_name);
            fs::create_dir(&arcdir)?;

            let mut representative: Option<DicomHeader> = None;
            for path in paths {
                let header = DicomHeader::open(
                    path,
                    &OpenOptions::parsed(self.policy.timezone, self.policy.anonymize),
                )?;
                if let Some(ts) = &header.acquisition_timestamp {
                    // Archival fidelity: the file carries its acquisition time.
                    filetime::set_file_mtime(path, FileTime::from_unix_time(ts.timestamp(), 0))?;
                }
                let mut file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "instance".to_string());
                if let Some(rest) = file_name.strip_prefix("(none)") {
                    file_name = format!("NA{rest}");
                }
                fs::rename(path, arcdir.join(format!("{file_name}.dcm")))?;
                representative = Some(header);
            }

            let Some(header) = representative else {
                fs::remove_dir_all(&arcdir)?;
                continue;
            };

            let record = MetadataRecord::from_header(&header);
            let log_label = match acq_no {
                Some(n) => format!("{id}.{n}"),
                None => id.to_string(),
            };
            peripheral::run_all(&self.peripherals, workspace, &header, &name_prefix, &log_label);

            let archive_path = archive::create(&arcdir, &dir_name, &record)?;
            fs::remove_dir_all(&arcdir)?;
            archives.push(ReapedArchive {
                name: format!("{dir_name}.zip"),
                path: archive_path,
                metadata: record,
            });
        }
        Ok(archives)
    }
}

impl<S: Scu> Backend for NetBackend<S> {
    type State = NetState;

    fn name(&self) -> &str {
        &self.name
    }

    fn query(&mut self) -> Result<Snapshot<NetState>, QueryError> {
        let records = self.scu.find_series(&SeriesQuery::all_series())?;
        let mut snapshot = Snapshot::new();
        for record in records {
            snapshot.insert(
                record.series_uid,
                NetState {
                    images: record.image_count,
                    patient_id: record.patient_id,
                },
            );
        }
        Ok(snapshot)
    }

    fn reap(
        &mut self,
        id: &str,
        state: &NetState,
        workspace: &Path,
    ) -> Result<ReapOutcome, ReapError> {
        if state.images == 0 {
            info!(series = %id, "ignoring (zero images)");
            return Ok(ReapOutcome::Discarded);
        }
        if !state.patient_id.is_empty() && !self.is_desired_patient_id(&state.patient_id) {
            return Ok(ReapOutcome::Discarded);
        }

        info!(series = %id, state = %state, "reaping");
        let transferred = self.scu.move_series(id, workspace)?;
        let mut filepaths: Vec<PathBuf> = fs::read_dir(workspace)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        filepaths.sort();
        info!(series = %id, images = transferred, "reaped");

        if let Some(first) = filepaths.first() {
            // The query-time patient id may be stale; trust the data.
            let peek = DicomHeader::open(first, &OpenOptions::peek(self.policy.timezone))?;
            if !self.is_desired_patient_id(&peek.patient_id) {
                return Ok(ReapOutcome::Discarded);
            }
        }

        if transferred != state.images as usize {
            warn!(
                series = %id,
                declared = state.images,
                transferred,
                "partial retrieval; will retry"
            );
            return Ok(ReapOutcome::Incomplete);
        }

        let archives = self.split_into_acquisitions(id, workspace, &filepaths)?;
        Ok(ReapOutcome::Complete(archives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reaper_dicom::{tags, DataSet};
    use reaper_scu::{ScuError, SeriesRecord};
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Scripted peer: reports `records` on find; on move, writes `deliver`
    /// synthesized files but claims `deliver` transferred.
    struct MockScu {
        records: Vec<SeriesRecord>,
        deliver: u32,
        patient_id: String,
        manufacturer: String,
        acq_numbers: Vec<&'static str>,
        moves: Cell<u32>,
    }

    impl MockScu {
        fn new(records: Vec<SeriesRecord>, deliver: u32, patient_id: &str) -> MockScu {
            MockScu {
                records,
                deliver,
                patient_id: patient_id.to_string(),
                manufacturer: "GE MEDICAL SYSTEMS".to_string(),
                acq_numbers: vec!["1"],
                moves: Cell::new(0),
            }
        }
    }

    impl Scu for MockScu {
        fn find_series(&self, _query: &SeriesQuery) -> Result<Vec<SeriesRecord>, ScuError> {
            Ok(self.records.clone())
        }

        fn move_series(&self, series_uid: &str, dest: &Path) -> Result<usize, ScuError> {
            self.moves.set(self.moves.get() + 1);
            for i in 0..self.deliver {
                let mut ds = DataSet::new_explicit();
                ds.put_str(tags::MANUFACTURER, &self.manufacturer);
                ds.put_str(tags::STUDY_DATE, "20200101");
                ds.put_str(tags::STUDY_TIME, "101530");
                ds.put_str(tags::PATIENT_NAME, "Doe^Jane");
                ds.put_str(tags::PATIENT_ID, &self.patient_id);
                ds.put_str(tags::STUDY_INSTANCE_UID, "1.2.3");
                ds.put_str(tags::SERIES_INSTANCE_UID, series_uid);
                ds.put_str(
                    tags::ACQUISITION_NUMBER,
                    self.acq_numbers[i as usize % self.acq_numbers.len()],
                );
                ds.save_atomic(&dest.join(format!("img{i:03}")))
                    .map_err(|e| ScuError::Parse {
                        tool: "mock",
                        detail: e.to_string(),
                    })?;
            }
            Ok(self.deliver as usize)
        }
    }

    fn policy(anonymize: bool, whitelist: &str) -> NetPolicy {
        NetPolicy {
            anonymize,
            timezone: "UTC".parse().unwrap(),
            whitelist: compile_whitelist(whitelist).unwrap(),
            blacklist: vec!["discard".to_string()],
        }
    }

    fn record(uid: &str, images: u32, patient: &str) -> SeriesRecord {
        SeriesRecord {
            series_uid: uid.to_string(),
            image_count: images,
            patient_id: patient.to_string(),
        }
    }

    #[test]
    fn query_maps_series_to_state() {
        let scu = MockScu::new(vec![record("1.2", 5, "p@a/b")], 0, "p@a/b");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let snapshot = backend.query().unwrap();
        assert_eq!(
            snapshot["1.2"],
            NetState {
                images: 5,
                patient_id: "p@a/b".to_string()
            }
        );
    }

    #[test]
    fn zero_image_series_yields_no_outcome() {
        let scu = MockScu::new(vec![], 0, "p");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 0,
            patient_id: "p".into(),
        };
        assert!(matches!(
            backend.reap("1.2", &state, ws.path()).unwrap(),
            ReapOutcome::Discarded
        ));
        assert_eq!(backend.scu.moves.get(), 0);
    }

    #[test]
    fn filtered_patient_is_discarded_before_transfer() {
        let scu = MockScu::new(vec![], 5, "other@lab/proj");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "abc*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 5,
            patient_id: "other@lab/proj".into(),
        };
        assert!(matches!(
            backend.reap("1.2", &state, ws.path()).unwrap(),
            ReapOutcome::Discarded
        ));
        assert_eq!(backend.scu.moves.get(), 0);
    }

    #[test]
    fn blacklist_is_case_and_slash_insensitive() {
        let scu = MockScu::new(vec![], 0, "p");
        let backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        assert!(!backend.is_desired_patient_id("/Discard/"));
        assert!(backend.is_desired_patient_id("keepme"));
    }

    #[test]
    fn successful_reap_normalizes_identity() {
        let scu = MockScu::new(vec![], 5, "abc123@labX/projY");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 5,
            patient_id: "abc123@labX/projY".into(),
        };
        let outcome = backend.reap("1.2.3.4", &state, ws.path()).unwrap();
        let archives = match outcome {
            ReapOutcome::Complete(a) => a,
            other => panic!("expected Complete, got {other:?}"),
        };
        assert_eq!(archives.len(), 1);
        let record = &archives[0].metadata;
        assert_eq!(record.get_str("subject_code"), Some("abc123"));
        assert_eq!(record.get_str("group_id"), Some("labx"));
        assert_eq!(record.get_str("project_label"), Some("projy"));
        assert!(archives[0].path.exists());
    }

    #[test]
    fn partial_retrieval_is_a_failure_with_no_archive() {
        let scu = MockScu::new(vec![], 3, "abc@lab/proj");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 5,
            patient_id: "abc@lab/proj".into(),
        };
        assert!(matches!(
            backend.reap("1.2", &state, ws.path()).unwrap(),
            ReapOutcome::Incomplete
        ));
        let zips = fs::read_dir(ws.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "zip").unwrap_or(false))
            .count();
        assert_eq!(zips, 0);
    }

    #[test]
    fn stale_query_patient_id_is_rechecked_post_transfer() {
        // Query-time id passes the filter; the retrieved data says otherwise.
        let scu = MockScu::new(vec![], 5, "discard");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 5,
            patient_id: "abc@lab/proj".into(),
        };
        assert!(matches!(
            backend.reap("1.2", &state, ws.path()).unwrap(),
            ReapOutcome::Discarded
        ));
    }

    #[test]
    fn acquisitions_split_into_separate_archives() {
        let mut scu = MockScu::new(vec![], 4, "abc@lab/proj");
        scu.acq_numbers = vec!["1", "2"];
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 4,
            patient_id: "abc@lab/proj".into(),
        };
        let outcome = backend.reap("1.9", &state, ws.path()).unwrap();
        let archives = match outcome {
            ReapOutcome::Complete(a) => a,
            other => panic!("expected Complete, got {other:?}"),
        };
        let mut names: Vec<&str> = archives.iter().map(|a| a.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["1.9_1_dicom.zip", "1.9_2_dicom.zip"]);
    }

    #[test]
    fn siemens_series_is_never_split() {
        let mut scu = MockScu::new(vec![], 4, "abc@lab/proj");
        scu.acq_numbers = vec!["1", "2"];
        scu.manufacturer = "SIEMENS".to_string();
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(false, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 4,
            patient_id: "abc@lab/proj".into(),
        };
        let outcome = backend.reap("1.9", &state, ws.path()).unwrap();
        let archives = match outcome {
            ReapOutcome::Complete(a) => a,
            other => panic!("expected Complete, got {other:?}"),
        };
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].name, "1.9_dicom.zip");
    }

    #[test]
    fn anonymized_reap_blanks_names_but_keeps_hashes() {
        let scu = MockScu::new(vec![], 2, "abc@lab/proj");
        let mut backend = NetBackend::new(scu, "scanner".into(), policy(true, "*"));
        let ws = TempDir::new().unwrap();
        let state = NetState {
            images: 2,
            patient_id: "abc@lab/proj".into(),
        };
        let outcome = backend.reap("1.2", &state, ws.path()).unwrap();
        let archives = match outcome {
            ReapOutcome::Complete(a) => a,
            other => panic!("expected Complete, got {other:?}"),
        };
        let record = &archives[0].metadata;
        assert!(record.get_str("subject_firstname").is_none());
        assert!(record.get_str("subject_lastname").is_none());
        assert!(record.get_str("subject_firstname_hash").is_some());
    }

    #[test]
    fn whitelist_glob_is_anchored() {
        let re = compile_whitelist("abc*").unwrap();
        assert!(re.is_match("abc123@lab/proj"));
        assert!(!re.is_match("xabc123"));
        assert!(compile_whitelist("*").unwrap().is_match("anything"));
    }
}
