// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! Forensic NTFS metadata engine.
//!
//! [`NTFS`] wraps any `Read + Seek` image and exposes walks over MFT
//! entries, clusters, attribute streams and directory indexes, including
//! deleted directory entries recovered from index slack.

use std::io::{Read, Seek, SeekFrom};

use log::{debug, info, warn};
use serde::Serialize;

pub mod attr;
pub mod bitmap;
pub mod dent;
pub mod error;
pub mod inode;
pub mod loader;
pub mod mft;
pub mod path;
pub mod pbs;
pub mod runlist;
pub mod stream;
pub mod walk;

#[cfg(test)]
mod testimg;

use bitmap::BitmapCache;
use error::{ErrorContext, NtfsError, Result};
use mft::{ATTR_DATA, ATTR_VOLUME_INFORMATION, VolumeInformation};
use pbs::PartitionBootSector;
use runlist::{DataRun, RunDecoder};

/// `$MFT` itself.
pub const MFT_RECORD: u64 = 0;
/// `$Volume`.
pub const VOLUME_RECORD: u64 = 3;
/// Root directory.
pub const ROOT_RECORD: u64 = 5;
/// `$Bitmap`.
pub const BITMAP_RECORD: u64 = 6;
/// `$Boot`, whose data run legitimately starts at cluster 0.
pub const BOOT_RECORD: u64 = 7;
/// Highest record loadable before the `$MFT` run list is known.
pub const BOOTSTRAP_LAST_RECORD: u64 = 16;

/// What a walk callback wants the walk to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// End the walk early; the walk still reports success.
    Stop,
    /// Abort the walk with [`NtfsError::Callback`].
    Error(String),
}

/// Internal outcome of a (possibly nested) walk that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

impl WalkControl {
    pub(crate) fn flow(self) -> Result<Flow> {
        match self {
            WalkControl::Continue => Ok(Flow::Continue),
            WalkControl::Stop => Ok(Flow::Stop),
            WalkControl::Error(msg) => Err(NtfsError::Callback(msg)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NtfsVersion {
    Nt4,
    Win2000,
    XpOrLater,
}

impl NtfsVersion {
    fn from_info(vi: &VolumeInformation) -> Self {
        match (vi.major, vi.minor) {
            (1, 2) => NtfsVersion::Nt4,
            (3, 0) => NtfsVersion::Win2000,
            (3, 1) => NtfsVersion::XpOrLater,
            (maj, min) => {
                warn!("unknown NTFS version {}.{}, assuming XP or later", maj, min);
                NtfsVersion::XpOrLater
            }
        }
    }
}

/// One open volume. All caches live here, so independent contexts can be
/// used from different threads.
pub struct NTFS<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    body: T,
    image_size: u64,
    pub cluster_size: u64,
    pub record_size: u64,
    pub index_record_size: u64,
    pub last_cluster: u64,
    pub first_record: u64,
    pub last_record: u64,
    pub version: NtfsVersion,
    /// Set while `$MFT` itself is being loaded.
    loading_mft: bool,
    /// Run list of the `$MFT` `$DATA` attribute, once known.
    mft_runs: Option<Vec<DataRun>>,
    bitmap: Option<BitmapCache>,
    /// Most recently loaded record, already repaired.
    hot_record: Option<(u64, Vec<u8>)>,
    last_error: Option<String>,
}

impl<T: Read + Seek> NTFS<T> {
    /// Open the volume at the start of `body` and load `$MFT`, `$Volume`
    /// and `$Bitmap`.
    pub fn new(mut body: T) -> Result<Self> {
        let image_size = body.seek(SeekFrom::End(0))?;
        body.seek(SeekFrom::Start(0))?;
        let mut sector = vec![0u8; 512];
        body.read_exact(&mut sector)
            .map_err(|_| NtfsError::NotNtfs("image is smaller than a boot sector".into()))?;
        let pbs = PartitionBootSector::from_bytes(&sector)?;
        pbs.validate()?;

        let mut fs = Self {
            cluster_size: pbs.cluster_size(),
            record_size: pbs.file_record_size(),
            index_record_size: pbs.index_record_size(),
            last_cluster: pbs.last_cluster(),
            first_record: 0,
            last_record: BOOTSTRAP_LAST_RECORD,
            version: NtfsVersion::XpOrLater,
            pbs,
            body,
            image_size,
            loading_mft: true,
            mft_runs: None,
            bitmap: None,
            hot_record: None,
            last_error: None,
        };
        debug!(
            "cluster size {} record size {} index record size {} last cluster {}",
            fs.cluster_size, fs.record_size, fs.index_record_size, fs.last_cluster
        );

        fs.load_mft().context("loading $MFT")?;
        fs.load_version().context("loading $Volume")?;
        fs.load_bitmap().context("loading $Bitmap")?;
        info!(
            "opened NTFS volume: {:?}, {} MFT entries, {} clusters",
            fs.version,
            fs.last_record + 1,
            fs.last_cluster + 1
        );
        Ok(fs)
    }

    fn load_mft(&mut self) -> Result<()> {
        let rec = self.build_record(MFT_RECORD)?;
        self.loading_mft = false;
        if self.mft_runs.is_none() || rec.attrs.lookup_default(ATTR_DATA).is_none() {
            return Err(NtfsError::Corrupt("$MFT has no $DATA attribute".into()));
        }
        info!("$MFT loaded, last record {}", self.last_record);
        Ok(())
    }

    fn load_version(&mut self) -> Result<()> {
        let rec = self.build_record(VOLUME_RECORD)?;
        let attr = rec
            .attrs
            .lookup_first(ATTR_VOLUME_INFORMATION)
            .ok_or_else(|| NtfsError::Corrupt("$VOLUME_INFORMATION not found".into()))?;
        let raw = attr.resident_bytes().ok_or_else(|| {
            NtfsError::Corrupt("$VOLUME_INFORMATION is not resident".into())
        })?;
        self.version = NtfsVersion::from_info(&VolumeInformation::parse(raw)?);
        Ok(())
    }

    /// Called after every attribute pass over `$MFT` while it is loading.
    pub(crate) fn refresh_mft_bounds(&mut self, rec: &inode::FileRecord) -> Result<()> {
        let Some(data) = rec.attrs.lookup_default(ATTR_DATA) else {
            return Err(NtfsError::Corrupt(
                "$DATA not found while loading the MFT".into(),
            ));
        };
        self.mft_runs = Some(data.runs().to_vec());
        let count = data.size / self.record_size;
        self.last_record = count.saturating_sub(1);
        debug!("$MFT now spans {} records", count);
        Ok(())
    }

    pub(crate) fn run_decoder(&self) -> RunDecoder {
        RunDecoder {
            cluster_size: self.cluster_size,
            nt4_holes: self.version == NtfsVersion::Nt4,
        }
    }

    pub(crate) fn mft_runs(&self) -> Option<&[DataRun]> {
        self.mft_runs.as_deref()
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.image_size {
            return Err(NtfsError::ReadOutOfRange {
                offset,
                image_size: self.image_size,
            });
        }
        self.body.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        Read::by_ref(&mut self.body)
            .take(len as u64)
            .read_to_end(&mut buf)?;
        if buf.len() < len {
            return Err(NtfsError::ReadError {
                offset,
                wanted: len,
                got: buf.len(),
            });
        }
        Ok(buf)
    }

    /// Read one whole cluster.
    pub fn read_cluster(&mut self, addr: u64) -> Result<Vec<u8>> {
        if addr > self.last_cluster {
            return Err(NtfsError::ClusterOutOfRange {
                cluster: addr,
                last: self.last_cluster,
            });
        }
        let cs = self.cluster_size;
        self.read_at(addr * cs, cs as usize)
    }

    /// Display string of the last error returned by a public entry point.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Remember a failed result for [`NTFS::last_error`].
    pub(crate) fn track<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }
}
