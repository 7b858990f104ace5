// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! Decoder for the mapping-pairs ("run list") of non-resident attributes.

use crate::error::{NtfsError, Result};
use log::debug;
use serde::Serialize;

/// How a run should be interpreted when the content is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunKind {
    /// Clusters stored at `addr..addr + len`.
    Normal,
    /// A hole: reads as zeros, nothing on disk.
    Sparse,
    /// Placeholder for VCNs described by another (not yet seen) MFT entry.
    Filler,
}

/// One extent of an attribute, in clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataRun {
    pub addr: u64,
    pub len: u64,
    pub kind: RunKind,
}

impl DataRun {
    pub fn new(addr: u64, len: u64) -> Self {
        Self {
            addr,
            len,
            kind: RunKind::Normal,
        }
    }

    pub fn sparse(len: u64) -> Self {
        Self {
            addr: 0,
            len,
            kind: RunKind::Sparse,
        }
    }

    pub fn filler(len: u64) -> Self {
        Self {
            addr: 0,
            len,
            kind: RunKind::Filler,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.kind == RunKind::Sparse
    }

    pub fn is_filler(&self) -> bool {
        self.kind == RunKind::Filler
    }
}

/// Per-volume knobs the decoder needs.
#[derive(Debug, Clone, Copy)]
pub struct RunDecoder {
    pub cluster_size: u64,
    /// NT4 volumes mark every hole with an address delta of -1.
    pub nt4_holes: bool,
}

impl RunDecoder {
    /// Decode `raw` into runs plus the total run length in bytes.
    ///
    /// `boot_record` must be set when decoding for `$Boot`, whose single run
    /// legitimately starts at cluster 0.
    pub fn decode(&self, raw: &[u8], boot_record: bool) -> Result<(Vec<DataRun>, u64)> {
        let mut runs = Vec::new();
        let mut total = 0u64;
        let mut prev_addr: i64 = 0;
        let mut pos = 0usize;

        while pos < raw.len() && raw[pos] & 0x0F != 0 {
            let hdr = raw[pos];
            pos += 1;
            let len_sz = (hdr & 0x0F) as usize;
            let ofs_sz = (hdr >> 4) as usize;

            if len_sz > 8 || ofs_sz > 8 {
                return Err(NtfsError::Corrupt(format!(
                    "run header 0x{:02X} has field widths {}/{}",
                    hdr, len_sz, ofs_sz
                )));
            }
            if pos + len_sz + ofs_sz > raw.len() {
                return Err(NtfsError::Corrupt(format!(
                    "run at byte {} extends past the run list ({} bytes)",
                    pos - 1,
                    raw.len()
                )));
            }

            let mut run_len = 0u64;
            for i in 0..len_sz {
                run_len |= (raw[pos + i] as u64) << (8 * i);
            }
            pos += len_sz;

            let mut ofs = 0i64;
            for i in 0..ofs_sz {
                ofs |= (raw[pos + i] as i64) << (8 * i);
            }
            // sign-extend negative deltas
            if ofs_sz > 0 && ofs_sz < 8 && (raw[pos + ofs_sz - 1] & 0x80) != 0 {
                ofs |= !0i64 << (ofs_sz * 8);
            }
            pos += ofs_sz;

            total = total.saturating_add(run_len.saturating_mul(self.cluster_size));

            let run = if ofs == -1 && (prev_addr == 0 || self.nt4_holes) {
                debug!("run of {} clusters is a -1 hole", run_len);
                DataRun::sparse(run_len)
            } else if ofs != 0 || boot_record {
                let addr = prev_addr.checked_add(ofs).filter(|a| *a >= 0).ok_or_else(|| {
                    NtfsError::Corrupt(format!(
                        "run address delta {} from {} goes below cluster 0",
                        ofs, prev_addr
                    ))
                })?;
                prev_addr = addr;
                DataRun::new(addr as u64, run_len)
            } else {
                // the delta base carries over a hole unchanged
                DataRun::sparse(run_len)
            };

            debug!(
                "decoded run: addr {} len {} {:?} (delta {})",
                run.addr, run.len, run.kind, ofs
            );
            runs.push(run);
        }

        // $BadClus is one sparse run the size of the volume when no cluster
        // is bad.
        if runs.len() == 1 && runs[0].is_sparse() {
            runs.clear();
        }

        Ok((runs, total))
    }
}
