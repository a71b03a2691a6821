//! Tag constants and the implicit-VR lookup table.
//!
//! Only the tags the reaper actually reads or rewrites are listed. Anything
//! else is carried through the codec as opaque bytes.

use std::fmt;

/// A DICOM data element tag: (group, element).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16, pub u16);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

pub const IMAGE_TYPE: Tag = Tag(0x0008, 0x0008);
pub const STUDY_DATE: Tag = Tag(0x0008, 0x0020);
pub const SERIES_DATE: Tag = Tag(0x0008, 0x0021);
pub const ACQUISITION_DATE: Tag = Tag(0x0008, 0x0022);
pub const STUDY_TIME: Tag = Tag(0x0008, 0x0030);
pub const SERIES_TIME: Tag = Tag(0x0008, 0x0031);
pub const ACQUISITION_TIME: Tag = Tag(0x0008, 0x0032);
pub const ACCESSION_NUMBER: Tag = Tag(0x0008, 0x0050);
pub const MANUFACTURER: Tag = Tag(0x0008, 0x0070);
pub const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
pub const OPERATORS_NAME: Tag = Tag(0x0008, 0x1070);
pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
pub const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
pub const PATIENT_AGE: Tag = Tag(0x0010, 0x1010);
pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
pub const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
pub const STUDY_ID: Tag = Tag(0x0020, 0x0010);
pub const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
pub const ACQUISITION_NUMBER: Tag = Tag(0x0020, 0x0012);
pub const SERIES_RELATED_INSTANCES: Tag = Tag(0x0020, 0x1209);
pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// File meta group tags (always explicit VR little endian).
pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);

/// Look up the value representation for a tag in an implicit-VR dataset.
///
/// Unknown tags fall back to `UN`, which the codec treats as raw bytes with a
/// 32-bit length. That is enough to carry unrecognized elements through a
/// read/mutate/write cycle untouched.
pub fn implicit_vr(tag: Tag) -> [u8; 2] {
    let vr: &[u8; 2] = match tag {
        IMAGE_TYPE => b"CS",
        STUDY_DATE | SERIES_DATE | ACQUISITION_DATE | PATIENT_BIRTH_DATE => b"DA",
        STUDY_TIME | SERIES_TIME | ACQUISITION_TIME => b"TM",
        ACCESSION_NUMBER | STUDY_ID => b"SH",
        MANUFACTURER | SERIES_DESCRIPTION | PATIENT_ID => b"LO",
        OPERATORS_NAME | PATIENT_NAME => b"PN",
        PATIENT_AGE => b"AS",
        STUDY_INSTANCE_UID | SERIES_INSTANCE_UID | TRANSFER_SYNTAX_UID => b"UI",
        SERIES_NUMBER | ACQUISITION_NUMBER | SERIES_RELATED_INSTANCES => b"IS",
        PIXEL_DATA => b"OW",
        _ => b"UN",
    };
    *vr
}
