//! Full paths of a record, rebuilt by following `$FILE_NAME` parent
//! references up to the root directory.

use crate::error::{NtfsError, Result};
use crate::inode::FsName;
use crate::{NTFS, ROOT_RECORD};
use log::debug;
use serde::Serialize;
use std::io::{Read, Seek};

/// Segment standing in for a parent that no longer matches.
pub const ORPHAN_SEGMENT: &str = "-ORPHAN_FILE-";

/// Deepest parent chain followed before the path is cut short.
pub const MAX_PATH_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamePath {
    pub path: String,
    /// Allocation state of the record the path leads to.
    pub allocated: bool,
    pub orphan: bool,
    /// The parent chain was longer than [`MAX_PATH_DEPTH`].
    pub truncated: bool,
}

impl<T: Read + Seek> NTFS<T> {
    /// Every path leading to record `inum`, one per hard link. With an
    /// attribute other than the unnamed `$DATA`, the last segment carries
    /// the stream name.
    pub fn find_path(&mut self, inum: u64, attr: Option<(u32, u16)>) -> Result<Vec<NamePath>> {
        let r = self.find_path_inner(inum, attr);
        self.track(r)
    }

    fn find_path_inner(&mut self, inum: u64, attr: Option<(u32, u16)>) -> Result<Vec<NamePath>> {
        let rec = self.build_record(inum)?;
        let allocated = rec.is_allocated();
        if inum == ROOT_RECORD {
            return Ok(vec![NamePath {
                path: "/".into(),
                allocated,
                orphan: false,
                truncated: false,
            }]);
        }

        let stream = match attr {
            Some((t, id)) => {
                let a = rec.attrs.lookup(t, id).ok_or_else(|| {
                    NtfsError::InvalidArgument(format!(
                        "entry {} has no attribute 0x{:X}-{}",
                        inum, t, id
                    ))
                })?;
                Some(a.name.clone()).filter(|n| !n.is_empty())
            }
            None => None,
        };

        let mut out = Vec::new();
        for name in &rec.names {
            let leaf = match &stream {
                Some(s) => format!("{}:{}", name.name, s),
                None => name.name.clone(),
            };
            let mut segments = vec![leaf];
            self.resolve_parent(name, &mut segments, allocated, &mut out)?;
        }
        Ok(out)
    }

    /// Extend `segments` (leaf first) through the parent named by `name`.
    fn resolve_parent(
        &mut self,
        name: &FsName,
        segments: &mut Vec<String>,
        allocated: bool,
        out: &mut Vec<NamePath>,
    ) -> Result<()> {
        let emit = |segments: &[String], orphan: bool, truncated: bool| {
            let mut parts: Vec<&str> = Vec::with_capacity(segments.len() + 1);
            if orphan {
                parts.push(ORPHAN_SEGMENT);
            }
            parts.extend(segments.iter().rev().map(String::as_str));
            NamePath {
                path: format!("/{}", parts.join("/")),
                allocated,
                orphan,
                truncated,
            }
        };

        if name.parent_ref == ROOT_RECORD {
            out.push(emit(segments, false, false));
            return Ok(());
        }
        if segments.len() > MAX_PATH_DEPTH {
            debug!("path through {} cut at depth {}", name.parent_ref, MAX_PATH_DEPTH);
            out.push(emit(segments, false, true));
            return Ok(());
        }

        let parent = self.build_record(name.parent_ref)?;
        if !parent.is_dir || parent.seq != name.parent_seq || parent.names.is_empty() {
            debug!(
                "parent {} no longer matches (dir {}, seq {} vs {})",
                name.parent_ref, parent.is_dir, parent.seq, name.parent_seq
            );
            out.push(emit(segments, true, false));
            return Ok(());
        }

        for pname in &parent.names {
            segments.push(pname.name.clone());
            let r = self.resolve_parent(pname, segments, allocated, out);
            segments.pop();
            r?;
        }
        Ok(())
    }
}
