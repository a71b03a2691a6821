//! Query/retrieve collaborator for the network backend.
//!
//! The [`Scu`] trait is the contract the backend consumes: series-level
//! `find`, series `move` into a destination directory. A zero-match find is
//! `Ok(vec![])`; a communication failure is `Err(..)` — the two are never
//! conflated.
//!
//! [`DcmtkScu`] is the concrete client. It shells out to the DCMTK
//! `findscu`/`movescu` tools rather than speaking DIMSE itself; response
//! parsing from tool output is a pure function so it can be tested without a
//! peer on the network.

use regex::Regex;
use std::io;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScuError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    Failed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("unparseable {tool} output: {detail}")]
    Parse { tool: &'static str, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Series-level query. Empty fields match everything, per protocol
/// convention; each key is also returned in the responses.
#[derive(Debug, Clone, Default)]
pub struct SeriesQuery {
    pub study_uid: String,
    pub series_uid: String,
    pub study_id: String,
    pub series_number: String,
    pub series_date: String,
    pub series_time: String,
    pub image_count: String,
    pub patient_id: String,
    pub operators_name: String,
    pub accession_number: String,
}

impl SeriesQuery {
    /// Match every series the instrument holds.
    pub fn all_series() -> SeriesQuery {
        SeriesQuery::default()
    }

    /// Match one series by uid.
    pub fn for_series(series_uid: &str) -> SeriesQuery {
        SeriesQuery {
            series_uid: series_uid.to_string(),
            ..SeriesQuery::default()
        }
    }

    /// Tag/value pairs in wire order.
    fn keys(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("0020,000d", &self.study_uid),
            ("0020,000e", &self.series_uid),
            ("0020,0010", &self.study_id),
            ("0020,0011", &self.series_number),
            ("0008,0021", &self.series_date),
            ("0008,0031", &self.series_time),
            ("0020,1209", &self.image_count),
            ("0010,0020", &self.patient_id),
            ("0008,1070", &self.operators_name),
            ("0008,0050", &self.accession_number),
        ]
    }
}

/// One matched series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
    pub series_uid: String,
    pub image_count: u32,
    pub patient_id: String,
}

/// The find/move interface the network backend consumes.
pub trait Scu {
    /// Series-level C-FIND. `Ok(vec![])` means the instrument matched
    /// nothing; `Err` means the query itself failed.
    fn find_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRecord>, ScuError>;

    /// C-MOVE one series into `dest`, returning the transferred file count.
    fn move_series(&self, series_uid: &str, dest: &Path) -> Result<usize, ScuError>;
}

/// DCMTK-backed client.
#[derive(Debug, Clone)]
pub struct DcmtkScu {
    pub host: String,
    pub port: u16,
    /// Local port the instrument connects back to for C-MOVE transfers.
    pub return_port: u16,
    /// Our application entity title.
    pub aet: String,
    /// The instrument's application entity title.
    pub aec: String,
}

impl Scu for DcmtkScu {
    fn find_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRecord>, ScuError> {
        let mut cmd = Command::new("findscu");
        cmd.arg("-S")
            .arg("-v")
            .args(["--aetitle", &self.aet])
            .args(["--call", &self.aec])
            .args(["-k", "0008,0052=SERIES"]);
        for (tag, value) in query.keys() {
            cmd.args(["-k", &format!("{tag}={value}")]);
        }
        cmd.arg(&self.host).arg(self.port.to_string());

        let output = cmd.output().map_err(|source| ScuError::Spawn {
            tool: "findscu",
            source,
        })?;
        if !output.status.success() {
            return Err(ScuError::Failed {
                tool: "findscu",
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        // findscu dumps responses through its logger on stderr.
        let text = String::from_utf8_lossy(&output.stderr);
        let records = parse_find_responses(&text);
        debug!(matches = records.len(), "series find complete");
        Ok(records)
    }

    fn move_series(&self, series_uid: &str, dest: &Path) -> Result<usize, ScuError> {
        let output = Command::new("movescu")
            .arg("-S")
            .args(["--aetitle", &self.aet])
            .args(["--call", &self.aec])
            .args(["--move", &self.aet])
            .args(["--port", &self.return_port.to_string()])
            .args(["--output-directory", &dest.display().to_string()])
            .args(["-k", "0008,0052=SERIES"])
            .args(["-k", "0020,000d="])
            .args(["-k", &format!("0020,000e={series_uid}")])
            .arg(&self.host)
            .arg(self.port.to_string())
            .output()
            .map_err(|source| ScuError::Spawn {
                tool: "movescu",
                source,
            })?;
        if !output.status.success() {
            return Err(ScuError::Failed {
                tool: "movescu",
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        // The tool writes one file per transferred instance into dest.
        let mut count = 0;
        for entry in std::fs::read_dir(dest)? {
            if entry?.file_type()?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Parse the series records out of findscu's response dump.
///
/// Responses look like:
///
/// ```text
/// I: Find Response: 1 (Pending)
/// I: (0020,000e) UI [1.2.840.113619.2.5.999]     #  24, 1 SeriesInstanceUID
/// I: (0020,1209) IS [11]                         #   2, 1 NumberOfSeriesRelatedInstances
/// I: (0010,0020) LO [abc123@lab/proj]            #  16, 1 PatientID
/// ```
pub fn parse_find_responses(text: &str) -> Vec<SeriesRecord> {
    let element =
        Regex::new(r"\(([0-9a-fA-F]{4}),([0-9a-fA-F]{4})\)\s+[A-Z]{2}\s+\[([^\]]*)\]").expect("static regex");

    let mut records = Vec::new();
    let mut current: Option<SeriesRecord> = None;

    for line in text.lines() {
        if line.contains("Find Response:") {
            if let Some(record) = current.take() {
                if !record.series_uid.is_empty() {
                    records.push(record);
                }
            }
            current = Some(SeriesRecord {
                series_uid: String::new(),
                image_count: 0,
                patient_id: String::new(),
            });
            continue;
        }
        let Some(record) = current.as_mut() else {
            continue;
        };
        if let Some(caps) = element.captures(line) {
            let group = caps[1].to_lowercase();
            let elem = caps[2].to_lowercase();
            let value = caps[3].trim();
            match (group.as_str(), elem.as_str()) {
                ("0020", "000e") => record.series_uid = value.to_string(),
                ("0020", "1209") => record.image_count = value.parse().unwrap_or(0),
                ("0010", "0020") => record.patient_id = value.to_string(),
                _ => {}
            }
        }
    }
    if let Some(record) = current {
        if !record.series_uid.is_empty() {
            records.push(record);
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIND_DUMP: &str = "\
I: Requesting Association
I: Association Accepted
I: Find Response: 1 (Pending)
I: (0008,0052) CS [SERIES]        #   6, 1 QueryRetrieveLevel
I: (0020,000e) UI [1.2.840.1.1]   #  12, 1 SeriesInstanceUID
I: (0020,1209) IS [11]            #   2, 1 NumberOfSeriesRelatedInstances
I: (0010,0020) LO [abc123@lab/proj] #  16, 1 PatientID
I: Find Response: 2 (Pending)
I: (0020,000e) UI [1.2.840.1.2]   #  12, 1 SeriesInstanceUID
I: (0020,1209) IS [0]             #   2, 1 NumberOfSeriesRelatedInstances
I: (0010,0020) LO [discard]       #   8, 1 PatientID
I: Received Final Find Response (Success)
";

    #[test]
    fn parses_multiple_responses() {
        let records = parse_find_responses(FIND_DUMP);
        assert_eq!(
            records,
            vec![
                SeriesRecord {
                    series_uid: "1.2.840.1.1".into(),
                    image_count: 11,
                    patient_id: "abc123@lab/proj".into(),
                },
                SeriesRecord {
                    series_uid: "1.2.840.1.2".into(),
                    image_count: 0,
                    patient_id: "discard".into(),
                },
            ]
        );
    }

    #[test]
    fn zero_matches_is_empty_not_error() {
        let records = parse_find_responses("I: Received Final Find Response (Success)\n");
        assert!(records.is_empty());
    }

    #[test]
    fn response_without_series_uid_is_dropped() {
        let text = "I: Find Response: 1 (Pending)\nI: (0010,0020) LO [p]  # 2, 1 PatientID\n";
        assert!(parse_find_responses(text).is_empty());
    }

    #[test]
    fn query_keys_cover_the_series_query_contract() {
        let keys = SeriesQuery::all_series();
        let tags: Vec<&str> = keys.keys().iter().map(|(t, _)| *t).collect();
        assert!(tags.contains(&"0020,000e"));
        assert!(tags.contains(&"0020,1209"));
        assert!(tags.contains(&"0010,0020"));
        assert!(tags.contains(&"0008,0050"));
        assert_eq!(tags.len(), 10);
    }
}
