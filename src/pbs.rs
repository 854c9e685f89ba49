// Sources:
// - https://en.wikipedia.org/wiki/NTFS

//! NTFS Partition-Boot-Sector and the volume geometry derived from it.

use byteorder::{LittleEndian, ReadBytesExt};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{Cursor, Read};

use crate::error::{NtfsError, Result};

/// Sizes every offset computation on the volume is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeGeometry {
    pub sector_size: u64,
    pub cluster_size: u64,
    pub record_size: u64,
    pub index_record_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionBootSector {
    /* -- 0x00-0x0A ------------------------------------------ */
    pub jump_instruction: Vec<u8>, // x86 JMP + NOP
    pub oem_id: [u8; 8],           // "NTFS    "

    /* -- BIOS Parameter Block (BPB) 0x0B-0x23 --------------- */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D
    pub reserved_sectors: u16,   // 0x0E
    pub media_descriptor: u8,    // 0x15 (0xF8 = hard disk)
    pub sectors_per_track: u16,  // 0x18
    pub number_of_heads: u16,    // 0x1A
    pub hidden_sectors: u32,     // 0x1C

    /* -- Extended BPB 0x28-0x53 ------------------------------ */
    pub total_sectors: u64,           // 0x28
    pub mft_cluster: u64,             // 0x30
    pub mft_mirror_cluster: u64,      // 0x38
    pub clusters_per_file_record: i8, // 0x40  (may be negative)
    pub clusters_per_index_buffer: i8, // 0x44
    pub volume_serial_number: u64,    // 0x48
    pub checksum: u32,                // 0x50

    pub end_of_sector_marker: u16, // 0x1FE (0xAA55)
}

impl PartitionBootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";
    pub const END_MARKER: u16 = 0xAA55;

    /// Parse the 512-byte sector into `PartitionBootSector`
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(NtfsError::InvalidBootSector(format!(
                "boot sector must be 512 bytes, got {}",
                buf.len()
            )));
        }
        let mut c = Cursor::new(buf);

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

        let jump_instruction = read_array!(3).to_vec();
        let oem_id = read_array!(8);
        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;
        let reserved_sectors = c.read_u16::<LittleEndian>()?;
        skip!(5);
        let media_descriptor = c.read_u8()?;
        skip!(2);
        let sectors_per_track = c.read_u16::<LittleEndian>()?;
        let number_of_heads = c.read_u16::<LittleEndian>()?;
        let hidden_sectors = c.read_u32::<LittleEndian>()?;
        skip!(8);
        let total_sectors = c.read_u64::<LittleEndian>()?;
        let mft_cluster = c.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = c.read_u64::<LittleEndian>()?;
        let clusters_per_file_record = c.read_i8()?;
        skip!(3);
        let clusters_per_index_buffer = c.read_i8()?;
        skip!(3);
        let volume_serial_number = c.read_u64::<LittleEndian>()?;
        let checksum = c.read_u32::<LittleEndian>()?;
        c.set_position(0x1FE);
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;

        Ok(Self {
            jump_instruction,
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            media_descriptor,
            sectors_per_track,
            number_of_heads,
            hidden_sectors,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_file_record,
            clusters_per_index_buffer,
            volume_serial_number,
            checksum,
            end_of_sector_marker,
        })
    }

    /// Check if the oem_id is valid
    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    /// OEM id, end marker and the sizes the rest of the crate divides by.
    pub fn validate(&self) -> Result<()> {
        if !self.oem_id_is_valid() {
            return Err(NtfsError::InvalidBootSector(format!(
                "OEM identifier {:?} is not NTFS",
                String::from_utf8_lossy(&self.oem_id)
            )));
        }
        if self.end_of_sector_marker != Self::END_MARKER {
            return Err(NtfsError::InvalidBootSector(format!(
                "end marker 0x{:04X}",
                self.end_of_sector_marker
            )));
        }
        if self.bytes_per_sector == 0 || self.sectors_per_cluster == 0 {
            return Err(NtfsError::InvalidBootSector(
                "zero sector or cluster size".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Byte offset of the $MFT inside the volume.
    pub fn mft_address(&self) -> u64 {
        self.mft_cluster * self.cluster_size()
    }

    /// Compute actual bytes per file-record segment
    pub fn file_record_size(&self) -> u64 {
        self.signed_cluster_count(self.clusters_per_file_record)
    }

    pub fn index_record_size(&self) -> u64 {
        self.signed_cluster_count(self.clusters_per_index_buffer)
    }

    pub fn geometry(&self) -> VolumeGeometry {
        VolumeGeometry {
            sector_size: self.bytes_per_sector as u64,
            cluster_size: self.cluster_size(),
            record_size: self.file_record_size(),
            index_record_size: self.index_record_size(),
        }
    }

    /// Positive values count clusters, negative ones are a power of two in bytes.
    fn signed_cluster_count(&self, v: i8) -> u64 {
        if v > 0 {
            v as u64 * self.cluster_size()
        } else {
            1u64 << (-(v as i32)).min(63)
        }
    }

    pub fn to_json(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        v["geometry"] = serde_json::to_value(self.geometry()).unwrap_or_else(|_| json!({}));
        v
    }

    pub fn to_string(&self) -> String {
        let g = self.geometry();
        let mut t = Table::new();
        t.add_row(row!["Partition Boot Sector"]);
        t.add_row(row![b -> "OEM ID", String::from_utf8_lossy(&self.oem_id)]);
        t.add_row(row![b -> "Bytes per sector", g.sector_size]);
        t.add_row(row![b -> "Cluster size", g.cluster_size]);
        t.add_row(row![b -> "File record size", g.record_size]);
        t.add_row(row![b -> "Index record size", g.index_record_size]);
        t.add_row(row![b -> "Total sectors", self.total_sectors]);
        t.add_row(row![b -> "$MFT cluster", self.mft_cluster]);
        t.add_row(row![b -> "$MFTMirr cluster", self.mft_mirror_cluster]);
        t.add_row(row![b -> "Serial number", format!("{:016X}", self.volume_serial_number)]);
        t.to_string()
    }
}
