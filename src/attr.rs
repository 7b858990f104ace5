//! In-memory attribute store for one file record.
//!
//! Attributes are kept in insertion order and keyed by `(type, id)`.
//! Non-resident attributes whose runs are spread over several MFT entries
//! are stitched together here: a continuation that arrives before the runs
//! preceding it leaves a filler placeholder that is replaced once the
//! missing VCN range shows up.

use crate::error::{NtfsError, Result};
use crate::runlist::DataRun;
use bitflags::bitflags;
use log::{debug, warn};
use serde::Serialize;

bitflags! {
    /// State bits of a stored attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct AttrFlags: u16 {
        const RESIDENT   = 0x0001;
        const NON_RESIDENT = 0x0002;
        const COMPRESSED = 0x0004;
        const ENCRYPTED  = 0x0008;
        const SPARSE     = 0x0010;
    }
}

impl AttrFlags {
    /// Translate the on-disk attribute header flags.
    pub fn from_header(raw: u16) -> Self {
        let mut f = AttrFlags::empty();
        if raw & 0x0001 != 0 {
            f |= AttrFlags::COMPRESSED;
        }
        if raw & 0x4000 != 0 {
            f |= AttrFlags::ENCRYPTED;
        }
        if raw & 0x8000 != 0 {
            f |= AttrFlags::SPARSE;
        }
        f
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttrContent {
    Resident(Vec<u8>),
    NonResident {
        runs: Vec<DataRun>,
        /// Bytes covered by the real (non-filler) runs stored so far.
        run_len: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttrData {
    pub attr_type: u32,
    pub id: u16,
    pub name: String,
    pub flags: AttrFlags,
    /// Logical content size in bytes.
    pub size: u64,
    pub content: AttrContent,
}

impl AttrData {
    pub fn is_resident(&self) -> bool {
        matches!(self.content, AttrContent::Resident(_))
    }

    pub fn runs(&self) -> &[DataRun] {
        match &self.content {
            AttrContent::NonResident { runs, .. } => runs,
            AttrContent::Resident(_) => &[],
        }
    }

    /// Allocated length of a non-resident attribute, the logical size otherwise.
    pub fn run_len(&self) -> u64 {
        match &self.content {
            AttrContent::NonResident { run_len, .. } => *run_len,
            AttrContent::Resident(_) => self.size,
        }
    }

    pub fn resident_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            AttrContent::Resident(b) => Some(b),
            AttrContent::NonResident { .. } => None,
        }
    }
}

/// Ordered list of attributes belonging to one file record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttrStore {
    attrs: Vec<AttrData>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttrData> {
        self.attrs.iter()
    }

    pub fn lookup(&self, attr_type: u32, id: u16) -> Option<&AttrData> {
        self.attrs
            .iter()
            .find(|a| a.attr_type == attr_type && a.id == id)
    }

    /// First stored attribute of `attr_type`, in insertion order.
    pub fn lookup_first(&self, attr_type: u32) -> Option<&AttrData> {
        self.attrs.iter().find(|a| a.attr_type == attr_type)
    }

    /// Default instance of `attr_type` when the caller has no id: the
    /// unnamed `$DATA` stream if there is one, otherwise the lowest id.
    pub fn lookup_default(&self, attr_type: u32) -> Option<&AttrData> {
        let mut best: Option<&AttrData> = None;
        for a in self.attrs.iter().filter(|a| a.attr_type == attr_type) {
            if attr_type == crate::mft::ATTR_DATA && a.name.is_empty() {
                return Some(a);
            }
            if best.is_none_or(|b| a.id < b.id) {
                best = Some(a);
            }
        }
        best
    }

    /// Id of an already stored attribute with the same type and name.
    pub fn find_id(&self, attr_type: u32, name: &str) -> Option<u16> {
        self.attrs
            .iter()
            .find(|a| a.attr_type == attr_type && a.name == name)
            .map(|a| a.id)
    }

    pub fn put_resident(
        &mut self,
        attr_type: u32,
        id: u16,
        name: &str,
        bytes: Vec<u8>,
        flags: AttrFlags,
    ) {
        let data = AttrData {
            attr_type,
            id,
            name: name.to_string(),
            flags: flags | AttrFlags::RESIDENT,
            size: bytes.len() as u64,
            content: AttrContent::Resident(bytes),
        };
        if let Some(slot) = self
            .attrs
            .iter_mut()
            .find(|a| a.attr_type == attr_type && a.id == id)
        {
            warn!(
                "attribute 0x{:X}-{} stored twice, keeping the later copy",
                attr_type, id
            );
            *slot = data;
        } else {
            self.attrs.push(data);
        }
    }

    /// Add runs covering VCNs `start_vcn..` of attribute `(attr_type, id)`.
    ///
    /// `run_len` is the byte length of `runs` and `size` the logical size
    /// of the whole attribute (only used when the entry is created).
    #[allow(clippy::too_many_arguments)]
    pub fn put_run(
        &mut self,
        attr_type: u32,
        id: u16,
        name: &str,
        start_vcn: u64,
        mut runs: Vec<DataRun>,
        run_len: u64,
        size: u64,
        flags: AttrFlags,
    ) -> Result<()> {
        let Some(existing) = self
            .attrs
            .iter_mut()
            .find(|a| a.attr_type == attr_type && a.id == id)
        else {
            if start_vcn != 0 {
                runs.insert(0, DataRun::filler(start_vcn));
            }
            self.attrs.push(AttrData {
                attr_type,
                id,
                name: name.to_string(),
                flags: flags | AttrFlags::NON_RESIDENT,
                size,
                content: AttrContent::NonResident { runs, run_len },
            });
            return Ok(());
        };

        let AttrContent::NonResident {
            runs: stored,
            run_len: stored_len,
        } = &mut existing.content
        else {
            return Err(NtfsError::Corrupt(format!(
                "attribute 0x{:X}-{} is both resident and non-resident",
                attr_type, id
            )));
        };

        let mut incoming = 0u64;
        for r in &runs {
            incoming = vcn_add(incoming, r.len)?;
        }
        let incoming_end = vcn_add(start_vcn, incoming)?;
        let mut cur_vcn = 0u64;

        for i in 0..stored.len() {
            let run = stored[i];
            let run_end = vcn_add(cur_vcn, run.len)?;
            if run.is_filler() && run_end > start_vcn {
                if cur_vcn > start_vcn {
                    return Err(NtfsError::Corrupt(format!(
                        "filler at VCN {} lies past the insert point {}",
                        cur_vcn, start_vcn
                    )));
                }
                let filler_end = run_end;
                if incoming_end > filler_end && i + 1 < stored.len() {
                    return Err(NtfsError::Corrupt(format!(
                        "runs at VCN {}..{} overlap stored runs from VCN {}",
                        start_vcn, incoming_end, filler_end
                    )));
                }

                let mut replacement = Vec::with_capacity(runs.len() + 2);
                if start_vcn > cur_vcn {
                    replacement.push(DataRun::filler(start_vcn - cur_vcn));
                }
                replacement.extend(runs);
                if filler_end > incoming_end {
                    replacement.push(DataRun::filler(filler_end - incoming_end));
                }
                debug!(
                    "0x{:X}-{}: runs at VCN {} fill placeholder {}..{}",
                    attr_type, id, start_vcn, cur_vcn, filler_end
                );
                stored.splice(i..=i, replacement);
                *stored_len = stored_len.saturating_add(run_len);
                return Ok(());
            }
            cur_vcn = run_end;
        }

        if cur_vcn > start_vcn {
            if let (Some(last), Some(first)) = (stored.last(), runs.first()) {
                if last == first {
                    debug!(
                        "0x{:X}-{}: ignoring duplicate runs at VCN {}",
                        attr_type, id, start_vcn
                    );
                    return Ok(());
                }
            }
            return Err(NtfsError::Corrupt(format!(
                "runs for 0x{:X}-{} start at VCN {} but VCNs up to {} are already mapped",
                attr_type, id, start_vcn, cur_vcn
            )));
        }

        if cur_vcn < start_vcn {
            stored.push(DataRun::filler(start_vcn - cur_vcn));
        }
        stored.extend(runs);
        *stored_len = stored_len.saturating_add(run_len);
        Ok(())
    }
}

fn vcn_add(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or_else(|| {
        NtfsError::Corrupt(format!("run lengths overflow past VCN {}", a))
    })
}
