//! MFT entry loader: locate a record on disk, read it and repair its
//! update sequence.

use crate::error::{ErrorContext, NtfsError, Result};
use crate::mft::{RecordHeader, apply_fixups};
use crate::{NTFS, BOOTSTRAP_LAST_RECORD};
use log::debug;
use std::io::{Read, Seek};

impl<T: Read + Seek> NTFS<T> {
    /// Raw bytes of MFT entry `inum`, with the update sequence repaired.
    pub fn load_record(&mut self, inum: u64) -> Result<Vec<u8>> {
        let r = self.read_record(inum);
        self.track(r)
    }

    /// Drop the hot record so the next lookup goes back to the image.
    pub fn forget_hot_record(&mut self) {
        self.hot_record = None;
    }

    pub(crate) fn read_record(&mut self, inum: u64) -> Result<Vec<u8>> {
        if inum < self.first_record || inum > self.last_record {
            return Err(NtfsError::OutOfRange {
                record: inum,
                first: self.first_record,
                last: self.last_record,
            });
        }
        if let Some((cached, buf)) = &self.hot_record {
            if *cached == inum {
                return Ok(buf.clone());
            }
        }

        let mut buf = Vec::with_capacity(self.record_size as usize);
        for (addr, len) in self.record_extents(inum)? {
            debug!("MFT entry {}: reading {} bytes at 0x{:X}", inum, len, addr);
            let part = self
                .read_at(addr, len)
                .context(format!("reading MFT entry {}", inum))?;
            buf.extend_from_slice(&part);
        }

        let hdr = RecordHeader::parse(&buf).map_err(|e| NtfsError::CorruptRecord {
            record: inum,
            reason: e.to_string(),
        })?;
        if !hdr.has_known_magic() {
            return Err(NtfsError::CorruptRecord {
                record: inum,
                reason: format!(
                    "unknown magic {:?}",
                    String::from_utf8_lossy(&hdr.magic)
                ),
            });
        }
        if hdr.is_file_magic() {
            apply_fixups(&mut buf, hdr.usa_offset as usize, hdr.usa_count as usize)
                .map_err(|reason| NtfsError::CorruptRecord {
                    record: inum,
                    reason,
                })?;
        }

        self.hot_record = Some((inum, buf.clone()));
        Ok(buf)
    }

    /// Byte extents holding entry `inum`: one normally, two when the entry
    /// straddles two runs of `$MFT`.
    fn record_extents(&self, inum: u64) -> Result<Vec<(u64, usize)>> {
        let rsize = self.record_size;
        let Some(runs) = self.mft_runs() else {
            if inum > BOOTSTRAP_LAST_RECORD {
                return Err(NtfsError::InvalidArgument(format!(
                    "MFT entry {} requested before $MFT is loaded",
                    inum
                )));
            }
            let addr = inum
                .checked_mul(rsize)
                .and_then(|o| o.checked_add(self.pbs.mft_address()))
                .ok_or_else(|| extent_overflow(inum))?;
            return Ok(vec![(addr, rsize as usize)]);
        };

        let cs = self.cluster_size;
        let mut offset = inum.checked_mul(rsize).ok_or_else(|| extent_overflow(inum))?;
        let mut wanted = rsize;
        let mut extents = Vec::new();
        for run in runs {
            let run_bytes = run.len.saturating_mul(cs);
            if offset >= run_bytes {
                offset -= run_bytes;
                continue;
            }
            if run.is_sparse() || run.is_filler() {
                return Err(NtfsError::CorruptRecord {
                    record: inum,
                    reason: "entry lies in an unmapped part of $MFT".into(),
                });
            }
            let take = wanted.min(run_bytes - offset);
            let addr = run
                .addr
                .checked_mul(cs)
                .and_then(|a| a.checked_add(offset))
                .ok_or_else(|| extent_overflow(inum))?;
            extents.push((addr, take as usize));
            wanted -= take;
            offset = 0;
            if wanted == 0 {
                return Ok(extents);
            }
        }
        Err(NtfsError::OutOfRange {
            record: inum,
            first: self.first_record,
            last: self.last_record,
        })
    }
}

fn extent_overflow(inum: u64) -> NtfsError {
    NtfsError::CorruptRecord {
        record: inum,
        reason: "$MFT run address overflows".into(),
    }
}
