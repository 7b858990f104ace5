//! Record and cluster walks over a range of the volume.

use crate::error::{ErrorContext, NtfsError, Result};
use crate::inode::{FileRecord, MetaFlags};
use crate::{Flow, NTFS, WalkControl};
use bitflags::bitflags;
use log::debug;
use std::io::{Read, Seek};

bitflags! {
    /// Classification of a cluster, also used as the cluster walk filter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        const ALLOC   = 0x01;
        const UNALLOC = 0x02;
        /// Cluster belongs to `$MFT`.
        const META    = 0x04;
        const CONTENT = 0x08;
    }
}

/// A filter naming neither side of a pair accepts both.
fn widen<F: bitflags::Flags + Copy>(mut flags: F, a: F, b: F) -> F {
    if !flags.contains(a) && !flags.contains(b) {
        flags.insert(a);
        flags.insert(b);
    }
    flags
}

impl<T: Read + Seek> NTFS<T> {
    /// Visit the base MFT entries `start..=end` whose classification is
    /// entirely contained in `flags`.
    pub fn inode_walk<F>(&mut self, start: u64, end: u64, flags: MetaFlags, mut action: F) -> Result<()>
    where
        F: FnMut(&FileRecord, MetaFlags) -> WalkControl,
    {
        let r = self.inode_walk_inner(start, end, flags, &mut action);
        self.track(r)
    }

    fn inode_walk_inner(
        &mut self,
        start: u64,
        end: u64,
        flags: MetaFlags,
        action: &mut dyn FnMut(&FileRecord, MetaFlags) -> WalkControl,
    ) -> Result<()> {
        for inum in [start, end] {
            if inum < self.first_record || inum > self.last_record {
                return Err(NtfsError::OutOfRange {
                    record: inum,
                    first: self.first_record,
                    last: self.last_record,
                });
            }
        }
        if end < start {
            return Err(NtfsError::InvalidArgument(format!(
                "record walk ends at {} before its start {}",
                end, start
            )));
        }
        let mut flags = widen(flags, MetaFlags::ALLOC, MetaFlags::UNALLOC);
        flags = widen(flags, MetaFlags::LINK, MetaFlags::UNLINK);
        flags = widen(flags, MetaFlags::USED, MetaFlags::UNUSED);
        debug!("record walk {}..={} with {:?}", start, end, flags);

        for inum in start..=end {
            let rec = self
                .build_record(inum)
                .context(format!("inode_walk: entry {}", inum))?;
            if rec.base_ref != 0 {
                continue;
            }
            if !flags.contains(rec.flags) {
                continue;
            }
            if action(&rec, rec.flags).flow()? == Flow::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Visit clusters `start..=end` whose allocation state and kind match
    /// `flags`, with their content.
    pub fn block_walk<F>(&mut self, start: u64, end: u64, flags: BlockFlags, mut action: F) -> Result<()>
    where
        F: FnMut(u64, &[u8], BlockFlags) -> WalkControl,
    {
        let r = self.block_walk_inner(start, end, flags, &mut action);
        self.track(r)
    }

    fn block_walk_inner(
        &mut self,
        start: u64,
        end: u64,
        flags: BlockFlags,
        action: &mut dyn FnMut(u64, &[u8], BlockFlags) -> WalkControl,
    ) -> Result<()> {
        for addr in [start, end] {
            if addr > self.last_cluster {
                return Err(NtfsError::ClusterOutOfRange {
                    cluster: addr,
                    last: self.last_cluster,
                });
            }
        }
        if end < start {
            return Err(NtfsError::InvalidArgument(format!(
                "cluster walk ends at {} before its start {}",
                end, start
            )));
        }
        let mut flags = widen(flags, BlockFlags::ALLOC, BlockFlags::UNALLOC);
        flags = widen(flags, BlockFlags::META, BlockFlags::CONTENT);
        debug!("cluster walk {}..={} with {:?}", start, end, flags);

        for addr in start..=end {
            let mut class = if self.is_cluster_allocated(addr)? {
                BlockFlags::ALLOC
            } else {
                BlockFlags::UNALLOC
            };
            class |= if self.is_mft_cluster(addr) {
                BlockFlags::META
            } else {
                BlockFlags::CONTENT
            };
            if !flags.contains(class) {
                continue;
            }
            let buf = self
                .read_cluster(addr)
                .context(format!("block_walk: cluster {}", addr))?;
            if action(addr, &buf, class).flow()? == Flow::Stop {
                break;
            }
        }
        Ok(())
    }

    fn is_mft_cluster(&self, addr: u64) -> bool {
        self.mft_runs().is_some_and(|runs| {
            runs.iter().any(|r| {
                !r.is_sparse()
                    && !r.is_filler()
                    && addr >= r.addr
                    && addr < r.addr.saturating_add(r.len)
            })
        })
    }
}
