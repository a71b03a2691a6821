//! Binary DICOM Part-10 reader/writer.
//!
//! Supports the two transfer syntaxes the instruments emit: explicit and
//! implicit VR little endian. Elements the reaper does not recognize are
//! carried as opaque bytes so a read/mutate/write cycle leaves them intact.
//! Undefined-length values (sequences, encapsulated pixel data) are captured
//! with their item framing and re-emitted verbatim.

use crate::tags::{self, Tag};
use crate::DicomError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

/// Implicit VR little endian.
pub const TS_IMPLICIT_LE: &str = "1.2.840.10008.1.2";
/// Explicit VR little endian.
pub const TS_EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

const ITEM: (u16, u16) = (0xFFFE, 0xE000);
const ITEM_DELIMITER: (u16, u16) = (0xFFFE, 0xE00D);
const SEQUENCE_DELIMITER: (u16, u16) = (0xFFFE, 0xE0DD);

/// VRs encoded with a 2-byte reserved field and 32-bit length.
fn is_long_vr(vr: &[u8; 2]) -> bool {
    matches!(vr, b"OB" | b"OW" | b"OF" | b"OD" | b"OL" | b"SQ" | b"UC" | b"UR" | b"UT" | b"UN")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    ExplicitLe,
    ImplicitLe,
}

/// How much of the file to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Stop before PixelData. Cheap, but the dataset cannot be written back.
    HeaderOnly,
    /// Read every element, including pixel data.
    Full,
}

#[derive(Debug, Clone)]
pub enum Value {
    Bytes(Vec<u8>),
    /// Raw body of an undefined-length value, item framing included,
    /// sequence delimiter excluded.
    Undefined(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: Tag,
    pub vr: [u8; 2],
    pub value: Value,
}

/// An in-memory DICOM dataset: file meta group plus main dataset elements,
/// kept in tag order.
#[derive(Debug, Clone)]
pub struct DataSet {
    meta: Vec<Element>,
    encoding: Encoding,
    elements: Vec<Element>,
    truncated: bool,
}

impl DataSet {
    /// Read a DICOM file from disk.
    pub fn read_file(path: &Path, mode: ReadMode) -> Result<DataSet, DicomError> {
        let buf = fs::read(path)?;
        Self::read_bytes(&buf, mode)
    }

    /// Parse a DICOM stream.
    pub fn read_bytes(buf: &[u8], mode: ReadMode) -> Result<DataSet, DicomError> {
        if buf.len() < PREAMBLE_LEN + 4 || &buf[PREAMBLE_LEN..PREAMBLE_LEN + 4] != MAGIC {
            return Err(DicomError::NotDicom);
        }
        let mut cur = Cursor::new(buf);
        cur.set_position((PREAMBLE_LEN + 4) as u64);

        let meta = read_meta_group(&mut cur)?;
        let ts = meta
            .iter()
            .find(|e| e.tag == tags::TRANSFER_SYNTAX_UID)
            .map(|e| string_from_bytes(value_bytes(&e.value)))
            .unwrap_or_else(|| TS_EXPLICIT_LE.to_string());
        let encoding = match ts.as_str() {
            TS_EXPLICIT_LE => Encoding::ExplicitLe,
            TS_IMPLICIT_LE => Encoding::ImplicitLe,
            other => return Err(DicomError::UnsupportedTransferSyntax(other.to_string())),
        };

        let mut elements = Vec::new();
        let mut truncated = false;
        while (cur.position() as usize) < buf.len() {
            let element = read_element(&mut cur, encoding)?;
            if mode == ReadMode::HeaderOnly && element.tag >= tags::PIXEL_DATA {
                truncated = true;
                break;
            }
            elements.push(element);
        }

        Ok(DataSet {
            meta,
            encoding,
            elements,
            truncated,
        })
    }

    /// Whether the read stopped before pixel data. A truncated dataset can be
    /// inspected but never written back.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// String value of an element, trailing pad characters stripped.
    pub fn str_value(&self, tag: Tag) -> Option<String> {
        self.elements
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| string_from_bytes(value_bytes(&e.value)))
            .filter(|s| !s.is_empty())
    }

    /// Integer value of an IS-valued element.
    pub fn int_value(&self, tag: Tag) -> Option<i64> {
        self.str_value(tag).and_then(|s| s.trim().parse().ok())
    }

    /// Insert or replace a string element, keeping tag order. The value is
    /// padded to even length with a space, per the string VR rules.
    pub fn put_str(&mut self, tag: Tag, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 != 0 {
            bytes.push(b' ');
        }
        let element = Element {
            tag,
            vr: tags::implicit_vr(tag),
            value: Value::Bytes(bytes),
        };
        match self.elements.binary_search_by_key(&tag, |e| e.tag) {
            Ok(idx) => self.elements[idx] = element,
            Err(idx) => self.elements.insert(idx, element),
        }
    }

    /// Remove an element if present.
    pub fn remove(&mut self, tag: Tag) -> bool {
        match self.elements.binary_search_by_key(&tag, |e| e.tag) {
            Ok(idx) => {
                self.elements.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// Serialize the dataset back into Part-10 form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DicomError> {
        if self.truncated {
            return Err(DicomError::Truncated);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&[0u8; PREAMBLE_LEN]);
        out.extend_from_slice(MAGIC);
        for element in &self.meta {
            write_element(&mut out, element, Encoding::ExplicitLe)?;
        }
        for element in &self.elements {
            write_element(&mut out, element, self.encoding)?;
        }
        Ok(out)
    }

    /// Write the dataset over `path` atomically: temp file in the same
    /// directory, then rename. A crash mid-write never leaves a half-mutated
    /// file at the destination.
    pub fn save_atomic(&self, path: &Path) -> Result<(), DicomError> {
        let bytes = self.to_bytes()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(path).map_err(|e| DicomError::Io(e.error))?;
        Ok(())
    }

    /// Build an empty explicit-VR dataset with a minimal file meta group.
    /// Used by tests and tooling to synthesize instrument files.
    pub fn new_explicit() -> DataSet {
        let mut uid = TS_EXPLICIT_LE.as_bytes().to_vec();
        if uid.len() % 2 != 0 {
            uid.push(0);
        }
        DataSet {
            meta: vec![Element {
                tag: tags::TRANSFER_SYNTAX_UID,
                vr: *b"UI",
                value: Value::Bytes(uid),
            }],
            encoding: Encoding::ExplicitLe,
            elements: Vec::new(),
            truncated: false,
        }
    }
}

fn value_bytes(value: &Value) -> &[u8] {
    match value {
        Value::Bytes(b) => b,
        Value::Undefined(b) => b,
    }
}

fn string_from_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

/// File meta elements are always explicit VR little endian, group 0x0002.
fn read_meta_group(cur: &mut Cursor<&[u8]>) -> Result<Vec<Element>, DicomError> {
    let mut meta = Vec::new();
    loop {
        let buf = *cur.get_ref();
        let pos = cur.position() as usize;
        if pos + 2 > buf.len() {
            break;
        }
        let group = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        if group != 0x0002 {
            break;
        }
        meta.push(read_element(cur, Encoding::ExplicitLe)?);
    }
    if meta.is_empty() {
        return Err(DicomError::Parse("missing file meta group".to_string()));
    }
    Ok(meta)
}

fn read_element(cur: &mut Cursor<&[u8]>, encoding: Encoding) -> Result<Element, DicomError> {
    let group = cur.read_u16::<LittleEndian>()?;
    let elem = cur.read_u16::<LittleEndian>()?;
    let tag = Tag(group, elem);

    let (vr, len) = match encoding {
        Encoding::ExplicitLe => {
            let mut vr = [0u8; 2];
            vr[0] = cur.read_u8()?;
            vr[1] = cur.read_u8()?;
            if is_long_vr(&vr) {
                let _reserved = cur.read_u16::<LittleEndian>()?;
                (vr, cur.read_u32::<LittleEndian>()?)
            } else {
                (vr, cur.read_u16::<LittleEndian>()? as u32)
            }
        }
        Encoding::ImplicitLe => (tags::implicit_vr(tag), cur.read_u32::<LittleEndian>()?),
    };

    let value = if len == u32::MAX {
        Value::Undefined(read_undefined_body(cur, encoding)?)
    } else {
        let len = len as usize;
        let start = cur.position() as usize;
        let buf = *cur.get_ref();
        let end = start
            .checked_add(len)
            .filter(|&e| e <= buf.len())
            .ok_or_else(|| DicomError::Parse(format!("element {} overruns file", tag)))?;
        cur.set_position(end as u64);
        Value::Bytes(buf[start..end].to_vec())
    };

    Ok(Element { tag, vr, value })
}

/// Capture the raw body of an undefined-length value: items (with nested
/// undefined lengths skipped structurally) up to, but not including, the
/// sequence delimitation item.
fn read_undefined_body(cur: &mut Cursor<&[u8]>, encoding: Encoding) -> Result<Vec<u8>, DicomError> {
    let start = cur.position() as usize;
    loop {
        let group = cur.read_u16::<LittleEndian>()?;
        let elem = cur.read_u16::<LittleEndian>()?;
        let len = cur.read_u32::<LittleEndian>()?;
        match (group, elem) {
            SEQUENCE_DELIMITER => {
                let end = cur.position() as usize - 8;
                return Ok(cur.get_ref()[start..end].to_vec());
            }
            ITEM => {
                if len == u32::MAX {
                    skip_undefined_item(cur, encoding)?;
                } else {
                    let pos = cur.position() + len as u64;
                    if pos as usize > cur.get_ref().len() {
                        return Err(DicomError::Parse("item overruns file".to_string()));
                    }
                    cur.set_position(pos);
                }
            }
            _ => {
                return Err(DicomError::Parse(format!(
                    "unexpected tag {} inside undefined-length value",
                    Tag(group, elem)
                )))
            }
        }
    }
}

/// Skip the elements of an undefined-length item up to its delimiter.
fn skip_undefined_item(cur: &mut Cursor<&[u8]>, encoding: Encoding) -> Result<(), DicomError> {
    loop {
        let buf = *cur.get_ref();
        let pos = cur.position() as usize;
        if pos + 8 > buf.len() {
            return Err(DicomError::Parse("unterminated item".to_string()));
        }
        let group = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        let elem = u16::from_le_bytes([buf[pos + 2], buf[pos + 3]]);
        if (group, elem) == ITEM_DELIMITER {
            cur.set_position((pos + 8) as u64);
            return Ok(());
        }
        let _ = read_element(cur, encoding)?;
    }
}

fn write_element(out: &mut Vec<u8>, element: &Element, encoding: Encoding) -> Result<(), DicomError> {
    out.write_u16::<LittleEndian>(element.tag.0)?;
    out.write_u16::<LittleEndian>(element.tag.1)?;

    let len = match &element.value {
        Value::Bytes(b) => b.len() as u64,
        Value::Undefined(_) => u32::MAX as u64,
    };

    match encoding {
        Encoding::ExplicitLe => {
            out.extend_from_slice(&element.vr);
            if is_long_vr(&element.vr) {
                out.write_u16::<LittleEndian>(0)?;
                out.write_u32::<LittleEndian>(len as u32)?;
            } else {
                if len > u16::MAX as u64 {
                    return Err(DicomError::Parse(format!(
                        "value of {} too long for short VR",
                        element.tag
                    )));
                }
                out.write_u16::<LittleEndian>(len as u16)?;
            }
        }
        Encoding::ImplicitLe => {
            out.write_u32::<LittleEndian>(len as u32)?;
        }
    }

    match &element.value {
        Value::Bytes(b) => out.extend_from_slice(b),
        Value::Undefined(body) => {
            out.extend_from_slice(body);
            out.write_u16::<LittleEndian>(SEQUENCE_DELIMITER.0)?;
            out.write_u16::<LittleEndian>(SEQUENCE_DELIMITER.1)?;
            out.write_u32::<LittleEndian>(0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags;

    fn sample() -> DataSet {
        let mut ds = DataSet::new_explicit();
        ds.put_str(tags::PATIENT_NAME, "Doe^Jane");
        ds.put_str(tags::PATIENT_ID, "jdoe@lab/proj");
        ds.put_str(tags::STUDY_DATE, "20200101");
        ds.put_str(tags::SERIES_INSTANCE_UID, "1.2.3.4");
        ds
    }

    #[test]
    fn round_trip_explicit() {
        let ds = sample();
        let bytes = ds.to_bytes().unwrap();
        let back = DataSet::read_bytes(&bytes, ReadMode::Full).unwrap();
        assert_eq!(back.str_value(tags::PATIENT_NAME).as_deref(), Some("Doe^Jane"));
        assert_eq!(back.str_value(tags::PATIENT_ID).as_deref(), Some("jdoe@lab/proj"));
        assert_eq!(back.encoding(), Encoding::ExplicitLe);
    }

    #[test]
    fn header_only_stops_before_pixel_data() {
        let mut ds = sample();
        // Pixel data is a long VR; give it a recognizable payload.
        ds.elements.push(Element {
            tag: tags::PIXEL_DATA,
            vr: *b"OW",
            value: Value::Bytes(vec![0u8; 64]),
        });
        let bytes = ds.to_bytes().unwrap();
        let back = DataSet::read_bytes(&bytes, ReadMode::HeaderOnly).unwrap();
        assert!(back.is_truncated());
        assert!(back.str_value(tags::PATIENT_NAME).is_some());
        assert!(back.to_bytes().is_err());
    }

    #[test]
    fn put_replaces_and_remove_deletes() {
        let mut ds = sample();
        ds.put_str(tags::PATIENT_NAME, "Roe^Richard");
        assert_eq!(ds.str_value(tags::PATIENT_NAME).as_deref(), Some("Roe^Richard"));
        assert!(ds.remove(tags::PATIENT_NAME));
        assert!(!ds.remove(tags::PATIENT_NAME));
        assert!(ds.str_value(tags::PATIENT_NAME).is_none());
    }

    #[test]
    fn insert_keeps_tag_order() {
        let mut ds = DataSet::new_explicit();
        ds.put_str(tags::SERIES_INSTANCE_UID, "1.2");
        ds.put_str(tags::PATIENT_ID, "p");
        ds.put_str(tags::STUDY_DATE, "20200101");
        let bytes = ds.to_bytes().unwrap();
        let back = DataSet::read_bytes(&bytes, ReadMode::Full).unwrap();
        let tags_seen: Vec<Tag> = back.elements.iter().map(|e| e.tag).collect();
        let mut sorted = tags_seen.clone();
        sorted.sort();
        assert_eq!(tags_seen, sorted);
    }

    #[test]
    fn rejects_non_dicom() {
        assert!(matches!(
            DataSet::read_bytes(b"not a dicom file", ReadMode::Full),
            Err(DicomError::NotDicom)
        ));
        let mut junk = vec![0u8; 200];
        junk[128..132].copy_from_slice(b"JUNK");
        assert!(matches!(
            DataSet::read_bytes(&junk, ReadMode::Full),
            Err(DicomError::NotDicom)
        ));
    }

    #[test]
    fn odd_length_values_are_padded() {
        let mut ds = DataSet::new_explicit();
        ds.put_str(tags::PATIENT_ID, "abc");
        let bytes = ds.to_bytes().unwrap();
        let back = DataSet::read_bytes(&bytes, ReadMode::Full).unwrap();
        assert_eq!(back.str_value(tags::PATIENT_ID).as_deref(), Some("abc"));
    }

    #[test]
    fn save_atomic_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        let mut ds = sample();
        ds.save_atomic(&path).unwrap();
        ds.put_str(tags::PATIENT_ID, "other");
        ds.save_atomic(&path).unwrap();
        let back = DataSet::read_file(&path, ReadMode::Full).unwrap();
        assert_eq!(back.str_value(tags::PATIENT_ID).as_deref(), Some("other"));
    }
}
