//! Generic file record built from one base MFT entry and any extension
//! entries its `$ATTRIBUTE_LIST` points to.

use crate::attr::{AttrFlags, AttrStore};
use crate::error::{ErrorContext, NtfsError, Result};
use crate::mft::{
    ATTR_ATTRIBUTE_LIST, ATTR_DATA, ATTR_FILE_NAME, ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT,
    ATTR_STANDARD_INFORMATION, AttrForm, AttrIter, AttrListEntry, AttributeType, FileNameAttr,
    RecordHeader, SI_READ_ONLY, StandardInformation, si_flags_to_string,
};
use crate::{BOOT_RECORD, MFT_RECORD, NTFS};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use prettytable::{Table, row};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::io::{Read, Seek};

/// Most distinct extension entries one attribute list may pull in.
pub const MAX_EXTENSION_RECORDS: usize = 4096;

pub const MODE_DIR: u32 = 0o040000;
pub const MODE_REG: u32 = 0o100000;

bitflags! {
    /// Allocation state of an MFT entry, also used as the record walk filter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct MetaFlags: u8 {
        const ALLOC   = 0x01;
        const UNALLOC = 0x02;
        const USED    = 0x04;
        const UNUSED  = 0x08;
        const LINK    = 0x10;
        const UNLINK  = 0x20;
    }
}

/// One hard-link name of a file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsName {
    pub name: String,
    pub parent_ref: u64,
    pub parent_seq: u16,
    pub namespace: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub addr: u64,
    pub seq: u16,
    pub flags: MetaFlags,
    pub is_dir: bool,
    pub link_count: u16,
    /// Non-zero for extension entries.
    pub base_ref: u64,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub dos_flags: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub names: Vec<FsName>,
    pub attrs: AttrStore,
}

impl FileRecord {
    fn from_header(addr: u64, hdr: &RecordHeader) -> Self {
        let mut flags = MetaFlags::USED;
        flags |= if hdr.in_use() {
            MetaFlags::ALLOC
        } else {
            MetaFlags::UNALLOC
        };
        flags |= if hdr.link_count > 0 {
            MetaFlags::LINK
        } else {
            MetaFlags::UNLINK
        };
        Self {
            addr,
            seq: hdr.sequence,
            flags,
            is_dir: hdr.is_dir(),
            link_count: hdr.link_count,
            base_ref: hdr.base_ref,
            size: 0,
            mode: if hdr.is_dir() { MODE_DIR } else { MODE_REG },
            uid: 0,
            dos_flags: 0,
            created: None,
            modified: None,
            changed: None,
            accessed: None,
            names: Vec::new(),
            attrs: AttrStore::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.flags.contains(MetaFlags::ALLOC)
    }

    fn apply_standard_information(&mut self, si: &StandardInformation) {
        self.created = si.created;
        self.modified = si.modified;
        self.changed = si.mft_modified;
        self.accessed = si.accessed;
        self.dos_flags = si.dos_flags;
        self.uid = si.owner_id.unwrap_or(0);
        self.mode |= 0o555;
        if si.dos_flags & SI_READ_ONLY == 0 {
            self.mode |= 0o222;
        }
    }

    /// Sum of every `$DATA` and directory index attribute.
    fn recompute_size(&mut self) {
        self.size = self
            .attrs
            .iter()
            .filter(|a| {
                matches!(
                    a.attr_type,
                    ATTR_DATA | ATTR_INDEX_ROOT | ATTR_INDEX_ALLOCATION
                )
            })
            .fold(0u64, |acc, a| acc.saturating_add(a.size));
    }

    /// istat-style tables.
    pub fn to_string(&self) -> String {
        let fmt_time = |t: &Option<DateTime<Utc>>| t.map_or("-".to_string(), |d| d.to_rfc3339());
        let mut out = String::new();

        let mut hdr = Table::new();
        hdr.add_row(row!["MFT Entry Header Values"]);
        hdr.add_row(row![b -> "Entry", self.addr]);
        hdr.add_row(row![b -> "Sequence", self.seq]);
        hdr.add_row(row![b -> "Flags", format!("{:?}", self.flags)]);
        hdr.add_row(row![b -> "Type", if self.is_dir { "Directory" } else { "File" }]);
        hdr.add_row(row![b -> "Links", self.link_count]);
        hdr.add_row(row![b -> "Size", self.size]);
        hdr.add_row(row![b -> "Mode", format!("{:o}", self.mode)]);
        out.push_str(&hdr.to_string());

        let mut si = Table::new();
        si.add_row(row!["$STANDARD_INFORMATION"]);
        si.add_row(row![b -> "Flags", si_flags_to_string(self.dos_flags)]);
        si.add_row(row![b -> "Owner ID", self.uid]);
        si.add_row(row![b -> "Created", fmt_time(&self.created)]);
        si.add_row(row![b -> "File Modified", fmt_time(&self.modified)]);
        si.add_row(row![b -> "MFT Modified", fmt_time(&self.changed)]);
        si.add_row(row![b -> "Accessed", fmt_time(&self.accessed)]);
        out.push('\n');
        out.push_str(&si.to_string());

        if !self.names.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["$FILE_NAME", "Parent", "Name space"]);
            for n in &self.names {
                t.add_row(row![
                    n.name,
                    format!("{} (seq {})", n.parent_ref, n.parent_seq),
                    n.namespace
                ]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        let mut attrs = Table::new();
        attrs.add_row(row!["Attributes", "Name", "Status", "Size", "Runs"]);
        for a in self.attrs.iter() {
            let runs = a
                .runs()
                .iter()
                .map(|r| {
                    if r.is_sparse() {
                        format!("sparse x{}", r.len)
                    } else if r.is_filler() {
                        format!("filler x{}", r.len)
                    } else {
                        format!("{}+{}", r.addr, r.len)
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            attrs.add_row(row![
                format!("{} (0x{:X}-#{})", AttributeType::label(a.attr_type), a.attr_type, a.id),
                if a.name.is_empty() { "N/A" } else { a.name.as_str() },
                if a.is_resident() { "Resident" } else { "Non-resident" },
                a.size,
                runs
            ]);
        }
        out.push('\n');
        out.push_str(&attrs.to_string());
        out
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

impl<T: Read + Seek> NTFS<T> {
    /// Build the file record for MFT entry `inum`.
    pub fn inode_lookup(&mut self, inum: u64) -> Result<FileRecord> {
        let r = self.build_record(inum);
        self.track(r)
    }

    pub(crate) fn build_record(&mut self, inum: u64) -> Result<FileRecord> {
        let buf = self.read_record(inum)?;
        let hdr = RecordHeader::parse(&buf)?;
        let mut rec = FileRecord::from_header(inum, &hdr);
        if !hdr.is_file_magic() {
            debug!(
                "MFT entry {} has magic {:?}, no attributes",
                inum,
                String::from_utf8_lossy(&hdr.magic)
            );
            return Ok(rec);
        }

        let list = self
            .proc_attrseq(&mut rec, inum, &buf, false)
            .context("proc_attrseq")?;
        if let Some(list_id) = list {
            self.proc_attrlist(&mut rec, list_id)
                .context("proc_attrlist")?;
        }
        rec.recompute_size();
        Ok(rec)
    }

    /// Add the attributes of MFT entry `mnum` (the base entry or one of its
    /// extensions) to `rec`. Returns the id of an attribute list found in a
    /// base entry, which the caller resolves once the whole sequence is in.
    fn proc_attrseq(
        &mut self,
        rec: &mut FileRecord,
        mnum: u64,
        buf: &[u8],
        extension: bool,
    ) -> Result<Option<u16>> {
        let hdr = RecordHeader::parse(buf)?;
        let mut list_id = None;
        debug!("processing attributes of MFT entry {}", mnum);

        for attr in AttrIter::new(buf, hdr.attrs_offset as usize) {
            let attr = attr.map_err(|e| NtfsError::CorruptRecord {
                record: mnum,
                reason: e.to_string(),
            })?;
            let name = attr.name(buf).unwrap_or_else(|e| {
                warn!("MFT entry {}: unreadable attribute name ({})", mnum, e);
                String::new()
            });
            let flags = AttrFlags::from_header(attr.flags);

            match attr.form {
                AttrForm::Resident { .. } => {
                    let value = attr.value(buf)?;
                    debug!(
                        "MFT entry {}: resident {} id {} name {:?} ({} bytes)",
                        mnum,
                        AttributeType::label(attr.attr_type),
                        attr.id,
                        name,
                        value.len()
                    );
                    rec.attrs
                        .put_resident(attr.attr_type, attr.id, &name, value.to_vec(), flags);
                }
                AttrForm::NonResident {
                    start_vcn,
                    real_size,
                    ..
                } => {
                    let (runs, run_len) = self
                        .run_decoder()
                        .decode(attr.run_list(buf)?, rec.addr == BOOT_RECORD)?;
                    let mut id = attr.id;
                    if extension && id == 0 {
                        if let Some(existing) = rec.attrs.find_id(attr.attr_type, &name) {
                            debug!("MFT entry {}: id 0 continues id {}", mnum, existing);
                            id = existing;
                        }
                    }
                    debug!(
                        "MFT entry {}: non-resident {} id {} name {:?} start VCN {}",
                        mnum,
                        AttributeType::label(attr.attr_type),
                        id,
                        name,
                        start_vcn
                    );
                    rec.attrs.put_run(
                        attr.attr_type,
                        id,
                        &name,
                        start_vcn,
                        runs,
                        run_len,
                        real_size,
                        flags,
                    )?;
                }
            }

            match attr.attr_type {
                ATTR_STANDARD_INFORMATION => {
                    if !attr.is_resident() {
                        return Err(NtfsError::CorruptRecord {
                            record: mnum,
                            reason: "$STANDARD_INFORMATION is not resident".into(),
                        });
                    }
                    let si = StandardInformation::parse(attr.value(buf)?)?;
                    rec.apply_standard_information(&si);
                }
                ATTR_FILE_NAME => {
                    if !attr.is_resident() {
                        return Err(NtfsError::CorruptRecord {
                            record: mnum,
                            reason: "$FILE_NAME is not resident".into(),
                        });
                    }
                    let fname = FileNameAttr::parse(attr.value(buf)?)?;
                    if fname.is_dos_name() {
                        continue;
                    }
                    rec.names.push(FsName {
                        name: fname.name,
                        parent_ref: fname.parent_ref,
                        parent_seq: fname.parent_seq,
                        namespace: fname.namespace,
                    });
                }
                ATTR_ATTRIBUTE_LIST => {
                    if extension {
                        warn!(
                            "extension MFT entry {} carries its own attribute list, ignored",
                            mnum
                        );
                    } else if list_id.is_some() {
                        return Err(NtfsError::CorruptRecord {
                            record: mnum,
                            reason: "more than one attribute list".into(),
                        });
                    } else {
                        list_id = Some(attr.id);
                    }
                }
                _ => {}
            }
        }

        rec.recompute_size();
        if self.loading_mft && rec.addr == MFT_RECORD {
            self.refresh_mft_bounds(rec)?;
        }
        Ok(list_id)
    }

    /// Merge the attributes stored in the extension entries named by the
    /// attribute list `list_id` of `rec`.
    fn proc_attrlist(&mut self, rec: &mut FileRecord, list_id: u16) -> Result<()> {
        let content = self.collect_attr(rec, ATTR_ATTRIBUTE_LIST, Some(list_id), false)?;
        let base_in_use = rec.is_allocated();
        let mut visited = HashSet::from([rec.addr]);

        let mut off = 0usize;
        while off + AttrListEntry::MIN_LEN <= content.len() {
            let entry = AttrListEntry::parse(&content, off)?;
            if entry.length == 0 {
                break;
            }
            off += entry.length as usize;

            let target = entry.file_ref;
            if visited.contains(&target) {
                continue;
            }
            debug!(
                "attribute list of {}: {} id {} at VCN {} lives in entry {}",
                rec.addr,
                AttributeType::label(entry.attr_type),
                entry.id,
                entry.start_vcn,
                target
            );

            if target < self.first_record || target > self.last_record {
                if !base_in_use {
                    warn!(
                        "unallocated entry {} lists out-of-range extension {}, skipped",
                        rec.addr, target
                    );
                    continue;
                }
                return Err(NtfsError::OutOfRange {
                    record: target,
                    first: self.first_record,
                    last: self.last_record,
                });
            }
            if visited.len() >= MAX_EXTENSION_RECORDS {
                return Err(NtfsError::CorruptRecord {
                    record: rec.addr,
                    reason: format!(
                        "attribute list names more than {} extension entries",
                        MAX_EXTENSION_RECORDS
                    ),
                });
            }
            visited.insert(target);

            let ext = self.read_record(target)?;
            let ext_hdr = RecordHeader::parse(&ext)?;
            if ext_hdr.base_ref != rec.addr {
                if !base_in_use {
                    warn!(
                        "extension {} belongs to {} rather than unallocated entry {}, skipped",
                        target, ext_hdr.base_ref, rec.addr
                    );
                    continue;
                }
                return Err(NtfsError::CorruptRecord {
                    record: target,
                    reason: format!(
                        "extension entry points at base {}, not {}",
                        ext_hdr.base_ref, rec.addr
                    ),
                });
            }
            self.proc_attrseq(rec, target, &ext, true)?;
        }
        Ok(())
    }
}
