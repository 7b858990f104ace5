// Sources:
// - https://en.wikipedia.org/wiki/NTFS

//! Parse an NTFS Partition-Boot-Sector with std::io::Cursor and derive the
//! volume geometry the rest of the engine works with.

use crate::error::{NtfsError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;
use prettytable::{Table, row};
use serde::Serialize;
use serde_json::{Value, json};
use std::io::{Cursor, Read};

#[derive(Debug, Clone, Serialize)]
pub struct PartitionBootSector {
    /* -- 0x00-0x0A ------------------------------------------ */
    pub jump_instruction: [u8; 3], // x86 JMP + NOP
    pub oem_id: [u8; 8],           // "NTFS    "

    /* -- BIOS Parameter Block (BPB) – 0x0B-0x23 ------------- */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D
    pub reserved_sectors: u16,   // 0x0E
    pub media_descriptor: u8,    // 0x15 (0xF8 = hard disk)
    pub sectors_per_track: u16,  // 0x18
    pub number_of_heads: u16,    // 0x1A
    pub hidden_sectors: u32,     // 0x1C

    /* -- Extended BPB – 0x28-0x53 ---------------------------- */
    pub total_sectors: u64,           // 0x28
    pub mft_cluster: u64,             // 0x30
    pub mft_mirror_cluster: u64,      // 0x38
    pub clusters_per_file_record: i8, // 0x40  (may be negative)
    pub clusters_per_index_buffer: i8, // 0x44
    pub volume_serial_number: u64, // 0x48

    /* -- Signature – 0x1FE ---------------------------------- */
    pub end_of_sector_marker: u16, // 0x1FE (0xAA55)
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
    pub const END_MARKER: u16 = 0xAA55;

    /// Parse the 512-byte sector into `PartitionBootSector`
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(NtfsError::NotNtfs(format!(
                "boot sector must be 512 bytes, got {}",
                buf.len()
            )));
        }
        let mut c = Cursor::new(buf);

        /* helper macros to reduce boilerplate */
        macro_rules! read_array {
            ($len:expr) => {{
                let mut tmp = [0u8; $len];
                c.read_exact(&mut tmp)?;
                tmp
            }};
        }
        macro_rules! skip {
            ($len:expr) => {{
                c.set_position(c.position() + $len);
            }};
        }
        macro_rules! read_u8 {
            () => {
                c.read_u8()?
            };
        }
        macro_rules! read_u16 {
            () => {
                c.read_u16::<LittleEndian>()?
            };
        }
        macro_rules! read_u32 {
            () => {
                c.read_u32::<LittleEndian>()?
            };
        }
        macro_rules! read_u64 {
            () => {
                c.read_u64::<LittleEndian>()?
            };
        }
        macro_rules! read_i8 {
            () => {
                c.read_i8()?
            };
        }

        let mut pbs = Self {
            jump_instruction: read_array!(3),
            oem_id: read_array!(8),
            bytes_per_sector: read_u16!(),
            sectors_per_cluster: read_u8!(),
            reserved_sectors: read_u16!(),
            media_descriptor: {
                skip!(5);
                read_u8!()
            },
            sectors_per_track: {
                skip!(2);
                read_u16!()
            },
            number_of_heads: read_u16!(),
            hidden_sectors: read_u32!(),
            total_sectors: {
                skip!(8);
                read_u64!()
            },
            mft_cluster: read_u64!(),
            mft_mirror_cluster: read_u64!(),
            clusters_per_file_record: read_i8!(),
            clusters_per_index_buffer: {
                skip!(3);
                read_i8!()
            },
            volume_serial_number: {
                skip!(3);
                read_u64!()
            },
            end_of_sector_marker: 0,
        };
        c.set_position(0x1FE);
        pbs.end_of_sector_marker = read_u16!();
        Ok(pbs)
    }

    /// Check if the oem_id is valid
    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    /// Reject boot sectors whose geometry the engine can't work with.
    pub fn validate(&self) -> Result<()> {
        if self.end_of_sector_marker != Self::END_MARKER {
            return Err(NtfsError::NotNtfs(format!(
                "boot sector marker is 0x{:04X}, expected 0xAA55",
                self.end_of_sector_marker
            )));
        }
        if !self.oem_id_is_valid() {
            warn!(
                "OEM id is {:?} rather than \"NTFS    \"",
                String::from_utf8_lossy(&self.oem_id)
            );
        }
        if self.bytes_per_sector == 0 || self.bytes_per_sector % 512 != 0 {
            return Err(NtfsError::NotNtfs(format!(
                "sector size {} is not a multiple of 512",
                self.bytes_per_sector
            )));
        }
        let spc = self.sectors_per_cluster;
        if spc == 0 || spc > 0x80 || !spc.is_power_of_two() {
            return Err(NtfsError::NotNtfs(format!(
                "{} sectors per cluster is not a power of two up to 128",
                spc
            )));
        }
        let rsize = self.file_record_size();
        if rsize == 0 || rsize % 512 != 0 {
            return Err(NtfsError::NotNtfs(format!(
                "MFT record size {} is not a multiple of 512",
                rsize
            )));
        }
        let idx_size = self.index_record_size();
        if idx_size == 0 || idx_size % 512 != 0 {
            return Err(NtfsError::NotNtfs(format!(
                "index record size {} is not a multiple of 512",
                idx_size
            )));
        }
        if self.total_sectors < spc as u64 {
            return Err(NtfsError::NotNtfs("volume is smaller than one cluster".into()));
        }
        if self.mft_cluster > self.last_cluster() {
            return Err(NtfsError::NotNtfs(format!(
                "$MFT starts at cluster {} beyond the last cluster {}",
                self.mft_cluster,
                self.last_cluster()
            )));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
    }

    pub fn last_cluster(&self) -> u64 {
        (self.total_sectors / self.sectors_per_cluster.max(1) as u64).saturating_sub(1)
    }

    /// Byte offset of the first `$MFT` cluster.
    pub fn mft_address(&self) -> u64 {
        self.mft_cluster * self.cluster_size()
    }

    fn encoded_size(&self, raw: i8) -> u64 {
        if raw > 0 {
            raw as u64 * self.cluster_size()
        } else if raw > -32 {
            1u64 << (-(raw as i32)) as u32
        } else {
            0
        }
    }

    /// Compute actual bytes per file-record segment
    pub fn file_record_size(&self) -> u64 {
        self.encoded_size(self.clusters_per_file_record)
    }

    pub fn index_record_size(&self) -> u64 {
        self.encoded_size(self.clusters_per_index_buffer)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(row!["Partition Boot Sector"]);
        t.add_row(row![b -> "OEM ID", String::from_utf8_lossy(&self.oem_id)]);
        t.add_row(row![b -> "Bytes per sector", self.bytes_per_sector]);
        t.add_row(row![b -> "Sectors per cluster", self.sectors_per_cluster]);
        t.add_row(row![b -> "Cluster size", self.cluster_size()]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "Last cluster", self.last_cluster()]);
        t.add_row(row![b -> "$MFT cluster", self.mft_cluster]);
        t.add_row(row![b -> "$MFTMirr cluster", self.mft_mirror_cluster]);
        t.add_row(row![b -> "MFT record size", self.file_record_size()]);
        t.add_row(row![b -> "Index record size", self.index_record_size()]);
        t.add_row(row![b -> "Serial number", format!("{:016X}", self.volume_serial_number)]);
        t.to_string()
    }
}
