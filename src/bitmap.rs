//! Cluster allocation lookups against `$Bitmap`, one cached cluster of the
//! bitmap at a time.

use crate::error::{ErrorContext, NtfsError, Result};
use crate::mft::ATTR_DATA;
use crate::runlist::DataRun;
use crate::{BITMAP_RECORD, NTFS};
use log::debug;
use std::io::{Read, Seek};

/// Run list of `$Bitmap` plus the bitmap cluster currently held in memory.
#[derive(Debug, Clone)]
pub(crate) struct BitmapCache {
    runs: Vec<DataRun>,
    /// Index of the cached cluster within the bitmap stream.
    window: Option<u64>,
    buf: Vec<u8>,
}

impl<T: Read + Seek> NTFS<T> {
    pub(crate) fn load_bitmap(&mut self) -> Result<()> {
        let rec = self.build_record(BITMAP_RECORD)?;
        let data = rec
            .attrs
            .lookup_default(ATTR_DATA)
            .ok_or_else(|| NtfsError::Corrupt("$Bitmap has no $DATA attribute".into()))?;
        if data.is_resident() {
            return Err(NtfsError::Corrupt("$Bitmap $DATA is resident".into()));
        }
        self.bitmap = Some(BitmapCache {
            runs: data.runs().to_vec(),
            window: None,
            buf: Vec::new(),
        });
        self.load_bitmap_window(0)
    }

    /// Bring bitmap cluster `window` (relative to the bitmap stream) into
    /// the cache.
    fn load_bitmap_window(&mut self, window: u64) -> Result<()> {
        let cache = self
            .bitmap
            .as_ref()
            .ok_or_else(|| NtfsError::InvalidArgument("cluster bitmap is not loaded".into()))?;
        let mut vcn = window;
        let mut lcn = None;
        for run in &cache.runs {
            if vcn < run.len {
                if run.is_sparse() || run.is_filler() {
                    return Err(NtfsError::Corrupt(format!(
                        "bitmap cluster {} is not mapped to disk",
                        window
                    )));
                }
                lcn = run.addr.checked_add(vcn);
                break;
            }
            vcn -= run.len;
        }
        let lcn = lcn.ok_or_else(|| {
            NtfsError::Corrupt(format!("bitmap cluster {} is beyond $Bitmap", window))
        })?;

        debug!("loading bitmap cluster {} from cluster {}", window, lcn);
        let buf = self
            .read_cluster(lcn)
            .context(format!("reading bitmap cluster {}", lcn))?;
        if let Some(cache) = self.bitmap.as_mut() {
            cache.window = Some(window);
            cache.buf = buf;
        }
        Ok(())
    }

    /// Whether cluster `addr` is marked in use in `$Bitmap`.
    pub fn is_cluster_allocated(&mut self, addr: u64) -> Result<bool> {
        if self.loading_mft {
            return Ok(true);
        }
        if addr > self.last_cluster {
            return Err(NtfsError::ClusterOutOfRange {
                cluster: addr,
                last: self.last_cluster,
            });
        }
        let bits_per_cluster = 8 * self.cluster_size;
        let window = addr / bits_per_cluster;
        let bit = addr % bits_per_cluster;

        let cached = match &self.bitmap {
            None => {
                return Err(NtfsError::InvalidArgument(
                    "cluster bitmap is not loaded".into(),
                ));
            }
            Some(c) => c.window == Some(window),
        };
        if !cached {
            self.load_bitmap_window(window)?;
        }
        let buf = self
            .bitmap
            .as_ref()
            .map(|c| c.buf.as_slice())
            .unwrap_or_default();
        let byte = buf.get((bit / 8) as usize).copied().unwrap_or(0);
        Ok(byte & (1 << (bit % 8)) != 0)
    }
}
