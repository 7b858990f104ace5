// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! On-disk layouts of MFT entries and the attributes stored inside them.
//!
//! Nothing here trusts an offset or length read from disk: every field is
//! fetched through [`field`], which checks the slice bounds first.

use crate::error::{NtfsError, Result};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};
use core::convert::TryFrom;
use log::debug;
use serde::{Deserialize, Serialize};

pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

/// MFT entry flags.
pub const MFT_IN_USE: u16 = 0x0001;
pub const MFT_DIRECTORY: u16 = 0x0002;

/// Stride of the update-sequence markers, whatever the sector size.
pub const UPDATE_SEQ_STRIDE: usize = 512;

/// Length of the fixed part of a `$FILE_NAME` attribute.
pub const FILE_NAME_HEADER_LEN: usize = 66;

pub const MAGIC_FILE: &[u8; 4] = b"FILE";
pub const MAGIC_BAAD: &[u8; 4] = b"BAAD";
pub const MAGIC_INDX: &[u8; 4] = b"INDX";

/// Mask for the 48-bit record number part of a file reference.
pub const FILE_REF_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Bounds-checked sub-slice of an on-disk structure.
pub fn field<'a>(buf: &'a [u8], off: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    off.checked_add(len)
        .and_then(|end| buf.get(off..end))
        .ok_or_else(|| {
            NtfsError::Corrupt(format!(
                "{} at offset {} (+{}) lies outside its {}-byte structure",
                what,
                off,
                len,
                buf.len()
            ))
        })
}

pub fn u8_at(buf: &[u8], off: usize, what: &str) -> Result<u8> {
    Ok(field(buf, off, 1, what)?[0])
}

pub fn u16_at(buf: &[u8], off: usize, what: &str) -> Result<u16> {
    Ok(LittleEndian::read_u16(field(buf, off, 2, what)?))
}

pub fn u32_at(buf: &[u8], off: usize, what: &str) -> Result<u32> {
    Ok(LittleEndian::read_u32(field(buf, off, 4, what)?))
}

pub fn u48_at(buf: &[u8], off: usize, what: &str) -> Result<u64> {
    Ok(LittleEndian::read_u48(field(buf, off, 6, what)?))
}

pub fn u64_at(buf: &[u8], off: usize, what: &str) -> Result<u64> {
    Ok(LittleEndian::read_u64(field(buf, off, 8, what)?))
}

/// Decode `chars` UTF-16LE code units, replacing anything unpaired.
pub fn utf16_name(buf: &[u8], off: usize, chars: usize, what: &str) -> Result<String> {
    let raw = field(buf, off, chars * 2, what)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// NT FILETIME (100 ns ticks since 1601-01-01) to UTC.
pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    const EPOCH_DELTA_SECS: i64 = 11_644_473_600;
    let secs = (ft / 10_000_000) as i64 - EPOCH_DELTA_SECS;
    let nanos = ((ft % 10_000_000) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub usa_offset: u16,
    pub usa_count: u16,
    pub lsn: u64,
    pub sequence: u16,
    pub link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_ref: u64,
    pub base_seq: u16,
    pub next_attr_id: u16,
}

impl RecordHeader {
    pub const LEN: usize = 0x2A;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(field(buf, 0, 4, "record magic")?);
        Ok(Self {
            magic,
            usa_offset: u16_at(buf, 4, "update sequence offset")?,
            usa_count: u16_at(buf, 6, "update sequence count")?,
            lsn: u64_at(buf, 8, "lsn")?,
            sequence: u16_at(buf, 16, "sequence")?,
            link_count: u16_at(buf, 18, "link count")?,
            attrs_offset: u16_at(buf, 20, "attribute offset")?,
            flags: u16_at(buf, 22, "record flags")?,
            bytes_in_use: u32_at(buf, 24, "bytes in use")?,
            bytes_allocated: u32_at(buf, 28, "bytes allocated")?,
            base_ref: u48_at(buf, 32, "base reference")?,
            base_seq: u16_at(buf, 38, "base sequence")?,
            next_attr_id: u16_at(buf, 40, "next attribute id")?,
        })
    }

    pub fn in_use(&self) -> bool {
        self.flags & MFT_IN_USE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.flags & MFT_DIRECTORY != 0
    }

    pub fn is_file_magic(&self) -> bool {
        &self.magic == MAGIC_FILE
    }

    /// Magic values an MFT slot may legitimately carry.
    pub fn has_known_magic(&self) -> bool {
        self.is_file_magic() || &self.magic == MAGIC_BAAD || self.magic == [0u8; 4]
    }
}

// At the end of every 512-byte block NTFS overwrites the last two bytes with
// the update sequence number; the original bytes live in the array at
// usa_offset.
pub fn apply_fixups(
    buf: &mut [u8],
    usa_offset: usize,
    usa_count: usize,
) -> std::result::Result<(), String> {
    if usa_count < 1 {
        return Ok(());
    }
    if (usa_count - 1) * UPDATE_SEQ_STRIDE > buf.len() {
        return Err(format!(
            "{} update sequence entries cover more than the {}-byte buffer",
            usa_count - 1,
            buf.len()
        ));
    }
    if usa_offset + 2 * usa_count > buf.len() {
        return Err("update sequence array lies outside the buffer".into());
    }

    let usn = [buf[usa_offset], buf[usa_offset + 1]];
    for i in 1..usa_count {
        let sector_end = i * UPDATE_SEQ_STRIDE - 2;
        if buf[sector_end] != usn[0] || buf[sector_end + 1] != usn[1] {
            return Err(format!(
                "update sequence mismatch in sector {}: found {:02X}{:02X}, expected {:02X}{:02X}",
                i - 1,
                buf[sector_end + 1],
                buf[sector_end],
                usn[1],
                usn[0]
            ));
        }
        let fix = usa_offset + 2 * i;
        buf[sector_end] = buf[fix];
        buf[sector_end + 1] = buf[fix + 1];
    }
    debug!("update sequence verified over {} sectors", usa_count - 1);
    Ok(())
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    PropertySet = 0xF0,
    LoggedUtilityStream = 0x100,
}

impl TryFrom<u32> for AttributeType {
    type Error = String;
    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        use AttributeType::*;
        Ok(match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            _ => return Err(format!("unknown attribute type 0x{:X}", value)),
        })
    }
}

impl AttributeType {
    /// `$DATA`-style label, or the hex code for types we don't know.
    pub fn label(code: u32) -> String {
        match AttributeType::try_from(code) {
            Ok(AttributeType::StandardInformation) => "$STANDARD_INFORMATION".into(),
            Ok(AttributeType::AttributeList) => "$ATTRIBUTE_LIST".into(),
            Ok(AttributeType::FileName) => "$FILE_NAME".into(),
            Ok(AttributeType::ObjectId) => "$OBJECT_ID".into(),
            Ok(AttributeType::SecurityDescriptor) => "$SECURITY_DESCRIPTOR".into(),
            Ok(AttributeType::VolumeName) => "$VOLUME_NAME".into(),
            Ok(AttributeType::VolumeInformation) => "$VOLUME_INFORMATION".into(),
            Ok(AttributeType::Data) => "$DATA".into(),
            Ok(AttributeType::IndexRoot) => "$INDEX_ROOT".into(),
            Ok(AttributeType::IndexAllocation) => "$INDEX_ALLOCATION".into(),
            Ok(AttributeType::Bitmap) => "$BITMAP".into(),
            Ok(AttributeType::ReparsePoint) => "$REPARSE_POINT".into(),
            Ok(AttributeType::EaInformation) => "$EA_INFORMATION".into(),
            Ok(AttributeType::Ea) => "$EA".into(),
            Ok(AttributeType::PropertySet) => "$PROPERTY_SET".into(),
            Ok(AttributeType::LoggedUtilityStream) => "$LOGGED_UTILITY_STREAM".into(),
            Err(_) => format!("0x{:X}", code),
        }
    }
}

/// Resident / non-resident part of an attribute header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttrForm {
    Resident {
        value_length: u32,
        value_offset: u16,
    },
    NonResident {
        start_vcn: u64,
        last_vcn: u64,
        runlist_offset: u16,
        compression_unit: u16,
        allocated_size: u64,
        real_size: u64,
        initialized_size: u64,
    },
}

/// One attribute header, located at `offset` inside its MFT entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttrHeader {
    pub offset: usize,
    pub attr_type: u32,
    pub length: u32,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub form: AttrForm,
}

impl AttrHeader {
    pub fn parse(rec: &[u8], offset: usize) -> Result<Self> {
        let attr_type = u32_at(rec, offset, "attribute type")?;
        let length = u32_at(rec, offset + 4, "attribute length")?;
        let non_resident = u8_at(rec, offset + 8, "resident flag")? != 0;
        let form = if non_resident {
            AttrForm::NonResident {
                start_vcn: u64_at(rec, offset + 16, "start vcn")?,
                last_vcn: u64_at(rec, offset + 24, "last vcn")?,
                runlist_offset: u16_at(rec, offset + 32, "run list offset")?,
                compression_unit: u16_at(rec, offset + 34, "compression unit")?,
                allocated_size: u64_at(rec, offset + 40, "allocated size")?,
                real_size: u64_at(rec, offset + 48, "real size")?,
                initialized_size: u64_at(rec, offset + 56, "initialized size")?,
            }
        } else {
            AttrForm::Resident {
                value_length: u32_at(rec, offset + 16, "content length")?,
                value_offset: u16_at(rec, offset + 20, "content offset")?,
            }
        };
        let hdr = Self {
            offset,
            attr_type,
            length,
            name_length: u8_at(rec, offset + 9, "name length")?,
            name_offset: u16_at(rec, offset + 10, "name offset")?,
            flags: u16_at(rec, offset + 12, "attribute flags")?,
            id: u16_at(rec, offset + 14, "attribute id")?,
            form,
        };
        // the whole attribute has to fit in the record
        field(rec, offset, length as usize, "attribute")?;
        Ok(hdr)
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.form, AttrForm::Resident { .. })
    }

    /// The attribute as a slice of its record.
    pub fn body<'a>(&self, rec: &'a [u8]) -> Result<&'a [u8]> {
        field(rec, self.offset, self.length as usize, "attribute")
    }

    pub fn name(&self, rec: &[u8]) -> Result<String> {
        if self.name_length == 0 {
            return Ok(String::new());
        }
        utf16_name(
            self.body(rec)?,
            self.name_offset as usize,
            self.name_length as usize,
            "attribute name",
        )
    }

    /// Content of a resident attribute.
    pub fn value<'a>(&self, rec: &'a [u8]) -> Result<&'a [u8]> {
        match self.form {
            AttrForm::Resident {
                value_length,
                value_offset,
            } => field(
                self.body(rec)?,
                value_offset as usize,
                value_length as usize,
                "resident content",
            ),
            AttrForm::NonResident { .. } => Err(NtfsError::Corrupt(format!(
                "attribute 0x{:X} is not resident",
                self.attr_type
            ))),
        }
    }

    /// Raw mapping pairs of a non-resident attribute.
    pub fn run_list<'a>(&self, rec: &'a [u8]) -> Result<&'a [u8]> {
        match self.form {
            AttrForm::NonResident { runlist_offset, .. } => {
                let body = self.body(rec)?;
                let start = runlist_offset as usize;
                body.get(start..).ok_or_else(|| {
                    NtfsError::Corrupt(format!(
                        "run list offset {} beyond attribute length {}",
                        start,
                        body.len()
                    ))
                })
            }
            AttrForm::Resident { .. } => Err(NtfsError::Corrupt(format!(
                "attribute 0x{:X} has no run list",
                self.attr_type
            ))),
        }
    }
}

/// Iterates over the attribute sequence of an MFT entry. Stops at the end
/// marker, a zero length, or when too few bytes remain for another header.
pub struct AttrIter<'a> {
    rec: &'a [u8],
    off: usize,
    done: bool,
}

impl<'a> AttrIter<'a> {
    pub fn new(rec: &'a [u8], first: usize) -> Self {
        Self {
            rec,
            off: first,
            done: false,
        }
    }
}

impl Iterator for AttrIter<'_> {
    type Item = Result<AttrHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.off + 16 > self.rec.len() {
            return None;
        }
        let attr_type = LittleEndian::read_u32(&self.rec[self.off..]);
        let length = LittleEndian::read_u32(&self.rec[self.off + 4..]);
        if attr_type == ATTR_END || length == 0 {
            return None;
        }
        match AttrHeader::parse(self.rec, self.off) {
            Ok(hdr) => {
                self.off += length as usize;
                Some(Ok(hdr))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Parsed `$STANDARD_INFORMATION` (v1 layout, v3 fields when present).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandardInformation {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub dos_flags: u32,
    pub owner_id: Option<u32>,
    pub security_id: Option<u32>,
    pub usn: Option<u64>,
}

/// Read-only DOS attribute.
pub const SI_READ_ONLY: u32 = 0x0001;

impl StandardInformation {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let opt32 = |off: usize| (raw.len() >= off + 4).then(|| LittleEndian::read_u32(&raw[off..]));
        Ok(Self {
            created: filetime_to_datetime(u64_at(raw, 0, "creation time")?),
            modified: filetime_to_datetime(u64_at(raw, 8, "modification time")?),
            mft_modified: filetime_to_datetime(u64_at(raw, 16, "entry change time")?),
            accessed: filetime_to_datetime(u64_at(raw, 24, "access time")?),
            dos_flags: u32_at(raw, 32, "dos flags")?,
            owner_id: opt32(48),
            security_id: opt32(52),
            usn: (raw.len() >= 72).then(|| LittleEndian::read_u64(&raw[64..])),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NameSpace {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

impl NameSpace {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Posix),
            1 => Some(Self::Win32),
            2 => Some(Self::Dos),
            3 => Some(Self::Win32AndDos),
            _ => None,
        }
    }
}

/// Parsed `$FILE_NAME` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNameAttr {
    pub parent_ref: u64,
    pub parent_seq: u16,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    /// Raw FILETIME values, kept for plausibility checks on slack entries.
    #[serde(skip)]
    pub raw_times: [u64; 4],
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u64,
    pub name_length: u8,
    pub namespace: u8,
    pub name: String,
}

/// Directory bit of the `$FILE_NAME` flags.
pub const FN_DIRECTORY: u64 = 0x1000_0000;

impl FileNameAttr {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let raw_times = [
            u64_at(raw, 8, "creation time")?,
            u64_at(raw, 16, "modification time")?,
            u64_at(raw, 24, "entry change time")?,
            u64_at(raw, 32, "access time")?,
        ];
        let name_length = u8_at(raw, 64, "name length")?;
        Ok(Self {
            parent_ref: u48_at(raw, 0, "parent reference")?,
            parent_seq: u16_at(raw, 6, "parent sequence")?,
            created: filetime_to_datetime(raw_times[0]),
            modified: filetime_to_datetime(raw_times[1]),
            mft_modified: filetime_to_datetime(raw_times[2]),
            accessed: filetime_to_datetime(raw_times[3]),
            raw_times,
            allocated_size: u64_at(raw, 40, "allocated size")?,
            real_size: u64_at(raw, 48, "real size")?,
            flags: u64_at(raw, 56, "file name flags")?,
            name_length,
            namespace: u8_at(raw, 65, "name space")?,
            name: utf16_name(raw, FILE_NAME_HEADER_LEN, name_length as usize, "file name")?,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.flags & FN_DIRECTORY != 0
    }

    pub fn is_dos_name(&self) -> bool {
        NameSpace::from_raw(self.namespace) == Some(NameSpace::Dos)
    }
}

/// One entry of an `$ATTRIBUTE_LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttrListEntry {
    pub attr_type: u32,
    pub length: u16,
    pub start_vcn: u64,
    pub file_ref: u64,
    pub seq: u16,
    pub id: u16,
    pub name: String,
}

impl AttrListEntry {
    /// Smallest possible entry, used to bound list scans.
    pub const MIN_LEN: usize = 26;

    pub fn parse(buf: &[u8], off: usize) -> Result<Self> {
        let name_length = u8_at(buf, off + 6, "attribute list name length")?;
        let name_offset = u8_at(buf, off + 7, "attribute list name offset")?;
        let name = if name_length > 0 {
            let at = if name_offset == 0 {
                off + Self::MIN_LEN
            } else {
                off + name_offset as usize
            };
            utf16_name(buf, at, name_length as usize, "attribute list name")?
        } else {
            String::new()
        };
        Ok(Self {
            attr_type: u32_at(buf, off, "attribute list type")?,
            length: u16_at(buf, off + 4, "attribute list entry length")?,
            start_vcn: u64_at(buf, off + 8, "attribute list start vcn")?,
            file_ref: u48_at(buf, off + 16, "attribute list reference")?,
            seq: u16_at(buf, off + 22, "attribute list sequence")?,
            id: u16_at(buf, off + 24, "attribute list id")?,
            name,
        })
    }
}

/// Version fields of `$VOLUME_INFORMATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeInformation {
    pub major: u8,
    pub minor: u8,
    pub flags: u16,
}

impl VolumeInformation {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            major: u8_at(raw, 8, "major version")?,
            minor: u8_at(raw, 9, "minor version")?,
            flags: u16_at(raw, 10, "volume flags")?,
        })
    }
}

/// Decode DOS flags of `$STANDARD_INFORMATION`.
pub fn si_flags_to_string(flags: u32) -> String {
    const NAMES: [(u32, &str); 13] = [
        (0x0001, "READONLY"),
        (0x0002, "HIDDEN"),
        (0x0004, "SYSTEM"),
        (0x0020, "ARCHIVE"),
        (0x0040, "DEVICE"),
        (0x0080, "NORMAL"),
        (0x0100, "TEMPORARY"),
        (0x0200, "SPARSE_FILE"),
        (0x0400, "REPARSE_POINT"),
        (0x0800, "COMPRESSED"),
        (0x1000, "OFFLINE"),
        (0x2000, "NOT_CONTENT_INDEXED"),
        (0x4000, "ENCRYPTED"),
    ];
    let v: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, n)| *n)
        .collect();
    if v.is_empty() {
        "None".to_string()
    } else {
        v.join(" | ")
    }
}
