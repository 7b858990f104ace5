// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf (Index Root, Index Allocation)

//! Directory index walker.
//!
//! Entries are read from `$INDEX_ROOT` and from every `INDX` node found in
//! `$INDEX_ALLOCATION`. Liveness comes from position alone: an entry that
//! lies inside the node's declared in-use range is live, anything past it
//! is slack left behind by deletions and is surfaced as unallocated once
//! it passes a few plausibility checks.

use crate::error::{NtfsError, Result};
use crate::inode::FileRecord;
use crate::mft::{
    ATTR_FILE_NAME, ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT, FILE_NAME_HEADER_LEN, FileNameAttr,
    MAGIC_INDX, apply_fixups, u16_at, u32_at, u48_at,
};
use crate::{Flow, NTFS, ROOT_RECORD, WalkControl};
use bitflags::bitflags;
use log::{debug, warn};
use serde::Serialize;
use std::io::{Read, Seek};

/// Deepest directory nesting a recursive walk descends into.
pub const MAX_DIR_DEPTH: usize = 64;

/// Fixed part of an index entry before its `$FILE_NAME` key.
const ENTRY_HEADER_LEN: usize = 16;
/// Offset of the node header list inside an `INDX` record.
const INDX_LIST_OFFSET: usize = 0x18;
/// Offset of the node header list inside `$INDEX_ROOT`.
const ROOT_LIST_OFFSET: usize = 16;
/// Node header flag: child nodes live in `$INDEX_ALLOCATION`.
const NODE_HAS_CHILDREN: u32 = 0x01;

// 1970-01-01 and 2100-01-01 as FILETIME seconds
const PLAUSIBLE_FIRST_SECS: u64 = 11_644_473_600;
const PLAUSIBLE_LAST_SECS: u64 = 15_746_918_400;

bitflags! {
    /// Directory walk filter and per-entry allocation state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct NameFlags: u8 {
        const ALLOC   = 0x01;
        const UNALLOC = 0x02;
        const RECURSE = 0x04;
    }
}

/// One name found in a directory index.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    /// Directory path relative to the walk start, `a/b/` style.
    pub path: String,
    pub depth: usize,
    pub name: String,
    pub inum: u64,
    pub seq: u16,
    /// Directory bit of the indexed `$FILE_NAME`.
    pub is_dir: bool,
    /// `ALLOC` or `UNALLOC`.
    pub flags: NameFlags,
    /// Record the entry points to; `None` when it could not be loaded.
    pub record: Option<FileRecord>,
}

/// An index entry accepted by the scanner.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub offset: usize,
    pub inum: u64,
    pub seq: u16,
    pub live: bool,
    pub fname: FileNameAttr,
}

/// Node list header shared by `$INDEX_ROOT` and `INDX` records; offsets are
/// relative to the header itself.
#[derive(Debug, Clone, Copy)]
struct NodeHeader {
    begin: usize,
    end: usize,
    alloc: usize,
    flags: u32,
}

impl NodeHeader {
    fn parse(buf: &[u8], off: usize) -> Result<Self> {
        Ok(Self {
            begin: u32_at(buf, off, "index begin offset")? as usize,
            end: u32_at(buf, off + 4, "index end offset")? as usize,
            alloc: u32_at(buf, off + 8, "index buffer offset")? as usize,
            flags: u32_at(buf, off + 12, "index flags")?,
        })
    }
}

/// Live when the entry has content and ends inside the valid range.
pub fn classify_entry(entry_off: usize, entry_len: usize, content_len: usize, valid_end: usize) -> bool {
    content_len != 0 && entry_off + entry_len <= valid_end
}

fn plausible_time(ft: u64) -> bool {
    (PLAUSIBLE_FIRST_SECS..=PLAUSIBLE_LAST_SECS).contains(&(ft / 10_000_000))
}

/// Slack entries only count when they still look like a file name.
fn plausible_slack(buf: &[u8], fname_off: usize, fname: &FileNameAttr) -> bool {
    fname.namespace <= 3
        && fname.allocated_size >= fname.real_size
        && fname.name_length > 0
        && buf.get(fname_off + FILE_NAME_HEADER_LEN).is_some_and(|b| *b != 0)
        && plausible_time(fname.raw_times[0])
        && plausible_time(fname.raw_times[1])
        && plausible_time(fname.raw_times[3])
}

/// Scan the entries in `buf[start..end]`; entries ending past `valid_end`
/// are slack. Entries that fail the sanity gate are stepped over four
/// bytes at a time.
pub fn scan_entries(
    buf: &[u8],
    start: usize,
    end: usize,
    valid_end: usize,
    records: (u64, u64),
) -> Vec<IndexEntry> {
    let end = end.min(buf.len());
    let mut out = Vec::new();
    let mut off = start;

    while off + ENTRY_HEADER_LEN + FILE_NAME_HEADER_LEN < end {
        let (Ok(inum), Ok(seq), Ok(entry_len), Ok(content_len)) = (
            u48_at(buf, off, "entry reference"),
            u16_at(buf, off + 6, "entry sequence"),
            u16_at(buf, off + 8, "entry length"),
            u16_at(buf, off + 10, "content length"),
        ) else {
            break;
        };
        let (entry_len, content_len) = (entry_len as usize, content_len as usize);

        if inum < records.0
            || inum > records.1
            || entry_len == 0
            || content_len > entry_len
            || entry_len % 4 != 0
            || entry_len > end - off
        {
            off += 4;
            continue;
        }

        let fname_off = off + ENTRY_HEADER_LEN;
        let Ok(fname) = FileNameAttr::parse(&buf[fname_off..end]) else {
            off += 4;
            continue;
        };
        let live = classify_entry(off, entry_len, content_len, valid_end);
        if !live && !plausible_slack(buf, fname_off, &fname) {
            off += 4;
            continue;
        }

        let next = if content_len == 0 {
            (fname_off + FILE_NAME_HEADER_LEN + 2 * fname.name_length as usize + 3) & !3
        } else {
            off + entry_len
        };
        if !fname.is_dos_name() {
            out.push(IndexEntry {
                offset: off,
                inum,
                seq,
                live,
                fname,
            });
        }
        off = next;
    }
    out
}

/// Offsets of the `INDX` headers found at cluster boundaries of `buf`.
fn find_nodes(buf: &[u8], cluster_size: usize) -> Vec<usize> {
    (0..buf.len())
        .step_by(cluster_size.max(1))
        .filter(|off| buf[*off..].starts_with(MAGIC_INDX))
        .collect()
}

fn dir_path(stack: &[String]) -> String {
    stack.iter().map(|s| format!("{}/", s)).collect()
}

type DirAction<'a> = dyn FnMut(&DirEntry) -> WalkControl + 'a;

impl<T: Read + Seek> NTFS<T> {
    /// Walk the index of directory `inum`.
    pub fn dir_walk<F>(&mut self, inum: u64, flags: NameFlags, mut action: F) -> Result<()>
    where
        F: FnMut(&DirEntry) -> WalkControl,
    {
        let mut flags = flags;
        if !flags.intersects(NameFlags::ALLOC | NameFlags::UNALLOC) {
            flags |= NameFlags::ALLOC | NameFlags::UNALLOC;
        }
        let mut stack = Vec::new();
        let r = self
            .walk_dir(inum, flags, &mut stack, &mut action)
            .map(|_| ());
        self.track(r)
    }

    fn walk_dir(
        &mut self,
        inum: u64,
        flags: NameFlags,
        stack: &mut Vec<String>,
        action: &mut DirAction,
    ) -> Result<Flow> {
        if inum < self.first_record || inum > self.last_record {
            return Err(NtfsError::OutOfRange {
                record: inum,
                first: self.first_record,
                last: self.last_record,
            });
        }
        let rec = self.build_record(inum)?;
        debug!("walking directory {} at depth {}", inum, stack.len());

        let root = rec
            .attrs
            .lookup_default(ATTR_INDEX_ROOT)
            .ok_or_else(|| NtfsError::Corrupt(format!("$INDEX_ROOT not found in entry {}", inum)))?;
        let root = root.resident_bytes().ok_or_else(|| {
            NtfsError::Corrupt(format!("$INDEX_ROOT of entry {} is not resident", inum))
        })?;
        match u32_at(root, 0, "index root type")? {
            0 => {
                return Err(NtfsError::Corrupt(format!(
                    "index root of entry {} has no attribute type",
                    inum
                )));
            }
            ATTR_FILE_NAME => {}
            other => {
                return Err(NtfsError::Unsupported(format!(
                    "index of entry {} is sorted by attribute 0x{:X}",
                    inum, other
                )));
            }
        }
        let head = NodeHeader::parse(root, ROOT_LIST_OFFSET)?;

        if inum != ROOT_RECORD && flags.contains(NameFlags::ALLOC) {
            if self.emit_dot_entries(&rec, stack, action)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        let entries = scan_entries(
            root,
            ROOT_LIST_OFFSET + head.begin,
            ROOT_LIST_OFFSET + head.alloc,
            ROOT_LIST_OFFSET + head.end,
            (self.first_record, self.last_record),
        );
        for entry in &entries {
            if self.visit_entry(entry, flags, stack, action)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        let Some(alloc) = rec.attrs.lookup_default(ATTR_INDEX_ALLOCATION) else {
            if head.flags & NODE_HAS_CHILDREN != 0 {
                return Err(NtfsError::Corrupt(format!(
                    "index root of entry {} has children but no $INDEX_ALLOCATION",
                    inum
                )));
            }
            return Ok(Flow::Continue);
        };
        if alloc.is_resident() {
            return Err(NtfsError::Corrupt(format!(
                "$INDEX_ALLOCATION of entry {} is resident",
                inum
            )));
        }
        let alloc_id = alloc.id;
        let buf = self.collect_attr(&rec, ATTR_INDEX_ALLOCATION, Some(alloc_id), true)?;

        let nodes = find_nodes(&buf, self.cluster_size as usize);
        debug!("directory {}: {} index nodes", inum, nodes.len());
        for (i, start) in nodes.iter().enumerate() {
            let stop = nodes.get(i + 1).copied().unwrap_or(buf.len());
            let mut node = buf[*start..stop].to_vec();
            let usa_offset = u16_at(&node, 4, "index update sequence offset")? as usize;
            let usa_count = u16_at(&node, 6, "index update sequence count")? as usize;
            apply_fixups(&mut node, usa_offset, usa_count).map_err(|reason| {
                NtfsError::Corrupt(format!(
                    "index node at offset {} of entry {}: {}",
                    start, inum, reason
                ))
            })?;

            let head = NodeHeader::parse(&node, INDX_LIST_OFFSET)?;
            let entries = scan_entries(
                &node,
                INDX_LIST_OFFSET + head.begin,
                node.len(),
                INDX_LIST_OFFSET + head.end,
                (self.first_record, self.last_record),
            );
            for entry in &entries {
                if self.visit_entry(entry, flags, stack, action)? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// `.` for the directory itself and `..` for each of its parents.
    fn emit_dot_entries(
        &mut self,
        dir: &FileRecord,
        stack: &[String],
        action: &mut DirAction,
    ) -> Result<Flow> {
        let path = dir_path(stack);
        let dot = DirEntry {
            path: path.clone(),
            depth: stack.len(),
            name: ".".into(),
            inum: dir.addr,
            seq: dir.seq,
            is_dir: true,
            flags: NameFlags::ALLOC,
            record: Some(dir.clone()),
        };
        if action(&dot).flow()? == Flow::Stop {
            return Ok(Flow::Stop);
        }

        for name in &dir.names {
            let parent = match self.build_record(name.parent_ref) {
                Ok(r) => r,
                Err(e) => {
                    debug!("no '..' for parent {}: {}", name.parent_ref, e);
                    continue;
                }
            };
            let dotdot = DirEntry {
                path: path.clone(),
                depth: stack.len(),
                name: "..".into(),
                inum: name.parent_ref,
                seq: name.parent_seq,
                is_dir: true,
                flags: NameFlags::ALLOC,
                record: Some(parent),
            };
            if action(&dotdot).flow()? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn visit_entry(
        &mut self,
        entry: &IndexEntry,
        flags: NameFlags,
        stack: &mut Vec<String>,
        action: &mut DirAction,
    ) -> Result<Flow> {
        let state = if entry.live {
            NameFlags::ALLOC
        } else {
            NameFlags::UNALLOC
        };
        let mut record = match self.build_record(entry.inum) {
            Ok(r) => Some(r),
            Err(e) => {
                debug!("entry {:?} -> {}: {}", entry.fname.name, entry.inum, e);
                None
            }
        };
        if !entry.live && entry.inum == 0 {
            record = None;
        }

        let target_is_dir = record.as_ref().is_some_and(|r| r.is_dir);
        if flags.contains(state) {
            let de = DirEntry {
                path: dir_path(stack),
                depth: stack.len(),
                name: entry.fname.name.clone(),
                inum: entry.inum,
                seq: entry.seq,
                is_dir: entry.fname.is_dir(),
                flags: state,
                record,
            };
            if action(&de).flow()? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        let name = entry.fname.name.as_str();
        if !entry.live
            || !flags.contains(NameFlags::RECURSE)
            || name == "."
            || name == ".."
            || !target_is_dir
            || entry.inum == 0
        {
            return Ok(Flow::Continue);
        }
        if stack.len() >= MAX_DIR_DEPTH {
            warn!(
                "not descending into {}{}: depth limit {} reached",
                dir_path(stack),
                name,
                MAX_DIR_DEPTH
            );
            return Ok(Flow::Continue);
        }

        stack.push(name.to_string());
        let r = self.walk_dir(entry.inum, flags, stack, action);
        stack.pop();
        match r {
            Ok(flow) => Ok(flow),
            Err(e @ NtfsError::Callback(_)) => Err(e),
            Err(e) => {
                warn!(
                    "error walking directory {} ({}), continuing: {}",
                    entry.inum, name, e
                );
                Ok(Flow::Continue)
            }
        }
    }
}
