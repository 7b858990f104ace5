//! Attribute content streaming: resident bytes in one piece, non-resident
//! content one cluster at a time.

use crate::attr::{AttrData, AttrFlags};
use crate::error::{NtfsError, Result};
use crate::inode::FileRecord;
use crate::mft::{ATTR_DATA, ATTR_INDEX_ROOT};
use crate::{Flow, NTFS, WalkControl};
use bitflags::bitflags;
use log::debug;
use std::io::{Read, Seek};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileWalkFlags: u8 {
        /// Report addresses only, read nothing.
        const ADDRESS_ONLY = 0x01;
        /// Walk the whole allocated run length, not just the logical size.
        const SLACK        = 0x02;
        /// Skip sparse clusters instead of handing out zeroes.
        const NO_SPARSE    = 0x04;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        const ALLOC    = 0x01;
        const UNALLOC  = 0x02;
        const RESIDENT = 0x04;
        const SPARSE   = 0x08;
        const CONTENT  = 0x10;
    }
}

/// One piece of attribute content handed to a [`NTFS::file_walk`] callback.
#[derive(Debug)]
pub struct DataChunk<'a> {
    /// Byte offset of this chunk within the attribute.
    pub offset: u64,
    /// Cluster the chunk was read from; `None` for resident and sparse data.
    pub addr: Option<u64>,
    /// `None` when walking with [`FileWalkFlags::ADDRESS_ONLY`].
    pub data: Option<&'a [u8]>,
    pub len: usize,
    pub flags: ChunkFlags,
}

impl<T: Read + Seek> NTFS<T> {
    /// Stream attribute `(attr_type, attr_id)` of `rec` through `action`.
    ///
    /// Without a type, directories walk `$INDEX_ROOT` and files `$DATA`;
    /// without an id the default instance of that type is used.
    pub fn file_walk<F>(
        &mut self,
        rec: &FileRecord,
        attr_type: Option<u32>,
        attr_id: Option<u16>,
        flags: FileWalkFlags,
        mut action: F,
    ) -> Result<()>
    where
        F: FnMut(&DataChunk) -> WalkControl,
    {
        let r = select_attr(rec, attr_type, attr_id)
            .and_then(|attr| self.walk_attr(attr, flags, &mut action))
            .map(|_| ());
        self.track(r)
    }

    /// Whole content of an attribute in one buffer.
    pub fn read_attribute(
        &mut self,
        rec: &FileRecord,
        attr_type: u32,
        attr_id: Option<u16>,
        slack: bool,
    ) -> Result<Vec<u8>> {
        let r = self.collect_attr(rec, attr_type, attr_id, slack);
        self.track(r)
    }

    pub(crate) fn collect_attr(
        &mut self,
        rec: &FileRecord,
        attr_type: u32,
        attr_id: Option<u16>,
        slack: bool,
    ) -> Result<Vec<u8>> {
        let attr = select_attr(rec, Some(attr_type), attr_id)?;
        if let Some(bytes) = attr.resident_bytes() {
            return Ok(bytes.to_vec());
        }

        check_compression(attr)?;
        let expected = if slack { attr.run_len() } else { attr.size };
        let volume = (self.last_cluster + 1).saturating_mul(self.cluster_size);
        if expected > volume || (!slack && expected > attr.run_len()) {
            return Err(NtfsError::Corrupt(format!(
                "attribute 0x{:X}-{} of entry {}: size {} exceeds its runs ({} bytes) or the volume ({} bytes)",
                attr.attr_type,
                attr.id,
                rec.addr,
                expected,
                attr.run_len(),
                volume
            )));
        }
        let mut buf = vec![0u8; expected as usize];
        let mut copied = 0u64;
        let flags = if slack {
            FileWalkFlags::SLACK
        } else {
            FileWalkFlags::empty()
        };
        self.walk_attr(attr, flags, &mut |chunk: &DataChunk| {
            let start = chunk.offset as usize;
            if let Some(data) = chunk.data {
                if let Some(dst) = buf.get_mut(start..start + data.len()) {
                    dst.copy_from_slice(data);
                    copied += data.len() as u64;
                }
            }
            WalkControl::Continue
        })?;

        if copied < expected {
            return Err(NtfsError::Corrupt(format!(
                "attribute 0x{:X}-{} of entry {}: read {} of {} bytes",
                attr.attr_type, attr.id, rec.addr, copied, expected
            )));
        }
        Ok(buf)
    }

    pub(crate) fn walk_attr(
        &mut self,
        attr: &AttrData,
        flags: FileWalkFlags,
        action: &mut dyn FnMut(&DataChunk) -> WalkControl,
    ) -> Result<Flow> {
        if let Some(bytes) = attr.resident_bytes() {
            let chunk = DataChunk {
                offset: 0,
                addr: None,
                data: (!flags.contains(FileWalkFlags::ADDRESS_ONLY)).then_some(bytes),
                len: bytes.len(),
                flags: ChunkFlags::ALLOC | ChunkFlags::RESIDENT | ChunkFlags::CONTENT,
            };
            return action(&chunk).flow();
        }
        check_compression(attr)?;
        self.data_walk(attr, flags, action)
    }

    fn data_walk(
        &mut self,
        attr: &AttrData,
        flags: FileWalkFlags,
        action: &mut dyn FnMut(&DataChunk) -> WalkControl,
    ) -> Result<Flow> {
        let cs = self.cluster_size;
        let mut remaining = if flags.contains(FileWalkFlags::SLACK) {
            attr.run_len()
        } else {
            attr.size
        };
        let mut offset = 0u64;
        let zeroes = vec![0u8; cs as usize];
        debug!(
            "walking 0x{:X}-{}: {} bytes over {} runs",
            attr.attr_type,
            attr.id,
            remaining,
            attr.runs().len()
        );

        for run in attr.runs() {
            if remaining == 0 {
                break;
            }
            if run.is_filler() {
                if run.addr != 0 {
                    return Err(NtfsError::Corrupt(format!(
                        "filler run of 0x{:X}-{} has address {}",
                        attr.attr_type, attr.id, run.addr
                    )));
                }
                debug!("skipping {} unmapped clusters", run.len);
                let skip = run.len.saturating_mul(cs).min(remaining);
                offset += skip;
                remaining -= skip;
                continue;
            }

            for i in 0..run.len {
                if remaining == 0 {
                    break;
                }
                let len = cs.min(remaining) as usize;

                let control = if run.is_sparse() {
                    if flags.contains(FileWalkFlags::NO_SPARSE) {
                        WalkControl::Continue
                    } else {
                        action(&DataChunk {
                            offset,
                            addr: None,
                            data: (!flags.contains(FileWalkFlags::ADDRESS_ONLY))
                                .then(|| &zeroes[..len]),
                            len,
                            flags: ChunkFlags::SPARSE,
                        })
                    }
                } else {
                    let addr = match run.addr.checked_add(i) {
                        Some(a) if a <= self.last_cluster => a,
                        _ => {
                            return Err(NtfsError::Corrupt(format!(
                                "run of 0x{:X}-{} at cluster {} reaches beyond the volume",
                                attr.attr_type, attr.id, run.addr
                            )));
                        }
                    };
                    let mut chunk_flags = ChunkFlags::CONTENT;
                    chunk_flags |= if self.cluster_state(addr)? {
                        ChunkFlags::ALLOC
                    } else {
                        ChunkFlags::UNALLOC
                    };
                    let buf = if flags.contains(FileWalkFlags::ADDRESS_ONLY) {
                        None
                    } else {
                        Some(self.read_cluster(addr)?)
                    };
                    action(&DataChunk {
                        offset,
                        addr: Some(addr),
                        data: buf.as_deref().map(|b| &b[..len]),
                        len,
                        flags: chunk_flags,
                    })
                };

                if control.flow()? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
                offset += len as u64;
                remaining -= len as u64;
            }
        }
        Ok(Flow::Continue)
    }

    /// Allocation state for content walks; clusters count as allocated
    /// until `$Bitmap` has been loaded.
    fn cluster_state(&mut self, addr: u64) -> Result<bool> {
        if self.bitmap.is_none() {
            return Ok(true);
        }
        self.is_cluster_allocated(addr)
    }
}

fn check_compression(attr: &AttrData) -> Result<()> {
    if !attr.is_resident() && attr.flags.contains(AttrFlags::COMPRESSED) {
        return Err(NtfsError::Unsupported(format!(
            "attribute 0x{:X}-{} is compressed",
            attr.attr_type, attr.id
        )));
    }
    Ok(())
}

fn select_attr(
    rec: &FileRecord,
    attr_type: Option<u32>,
    attr_id: Option<u16>,
) -> Result<&AttrData> {
    let attr_type = attr_type.unwrap_or(if rec.is_dir {
        ATTR_INDEX_ROOT
    } else {
        ATTR_DATA
    });
    let found = match attr_id {
        Some(id) => rec.attrs.lookup(attr_type, id),
        None => rec.attrs.lookup_default(attr_type),
    };
    found.ok_or_else(|| {
        NtfsError::InvalidArgument(format!(
            "entry {} has no attribute 0x{:X}{}",
            rec.addr,
            attr_type,
            attr_id.map(|i| format!("-{}", i)).unwrap_or_default()
        ))
    })
}
