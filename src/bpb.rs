//! Boot sector parsing: the BIOS Parameter Block and the derived geometry
//! every other module needs to turn a cluster number into a byte offset.
//!
//! Generalizes the teacher's `BiosParameterBlock`/`BootRecord` pair, folded
//! into one immutable `BootParameters` value instead of two nested structs,
//! since nothing here is ever serialized back out — a defragmenter never
//! needs to reformat a volume, only to read its geometry once at open.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FatError, Result};

/// `FatType` values are based on the size of a File Allocation Table entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    fn from_total_clusters(total_clusters: u32) -> FatType {
        if total_clusters < 4085 {
            FatType::Fat12
        } else if total_clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }
}

/// Geometry and identity of a FAT volume, extracted once from sector 0 and
/// immutable for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct BootParameters {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub fat_type: FatType,
    /// FAT32 only; 0 on FAT12/16 where the root directory is a fixed region.
    pub root_cluster: u32,
    /// FAT32 only; 0xFFFF when absent.
    pub fs_info_sector: u16,
    pub oem_name: [u8; 8],
    pub volume_label: [u8; 11],

    // Derived, computed once here so every consumer agrees on geometry.
    pub first_fat_sector: u32,
    pub first_data_sector: u32,
    pub root_dir_sectors: u32,
    pub total_clusters: u32,
    pub first_data_cluster: u32,
    pub last_data_cluster: u32,
}

impl BootParameters {
    /// Byte offset of the start of FAT copy `index` (0 or 1).
    pub fn fat_offset(&self, index: u32) -> u64 {
        let sector = self.first_fat_sector + index * self.sectors_per_fat;
        sector as u64 * self.bytes_per_sector as u64
    }

    pub fn fat_len_bytes(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset of the start of cluster `cluster` (must be >= 2).
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2, "cluster {cluster} is reserved, not a data cluster");
        let sector = self.first_data_sector + (cluster - 2) * self.sectors_per_cluster as u32;
        sector as u64 * self.bytes_per_sector as u64
    }

    pub fn cluster_len_bytes(&self) -> u64 {
        self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset and length of the fixed-region root directory (FAT12/16 only).
    pub fn root_dir_region(&self) -> (u64, u64) {
        debug_assert!(self.fat_type != FatType::Fat32, "FAT32 root directory is a cluster chain");
        let first_sector = self.first_fat_sector + self.num_fats as u32 * self.sectors_per_fat;
        let offset = first_sector as u64 * self.bytes_per_sector as u64;
        let len = self.root_dir_sectors as u64 * self.bytes_per_sector as u64;
        (offset, len)
    }

    pub fn is_valid_data_cluster(&self, cluster: u32) -> bool {
        cluster >= self.first_data_cluster && cluster <= self.last_data_cluster
    }
}

/// Parses the 512-byte boot sector at the start of the image.
///
/// Validates the 0x55AA signature, cross-checks the FAT variant against the
/// derived cluster count (rather than trusting the `fs_type_label` string,
/// which is cosmetic and unreliable on real-world images).
pub fn parse_boot(sector0: &[u8]) -> Result<BootParameters> {
    crate::codec::check_boot_signature(sector0)?;
    if sector0.len() < 512 {
        return Err(FatError::Format("boot sector shorter than 512 bytes".into()));
    }

    let mut oem_name = [0u8; 8];
    oem_name.copy_from_slice(&sector0[3..11]);

    let bytes_per_sector = LittleEndian::read_u16(&sector0[11..13]);
    let sectors_per_cluster = sector0[13];
    let reserved_sectors = LittleEndian::read_u16(&sector0[14..16]);
    let num_fats = sector0[16];
    let root_entries = LittleEndian::read_u16(&sector0[17..19]);
    let total_sectors_16 = LittleEndian::read_u16(&sector0[19..21]);
    let sectors_per_fat_16 = LittleEndian::read_u16(&sector0[22..24]);
    let total_sectors_32 = LittleEndian::read_u32(&sector0[32..36]);

    if bytes_per_sector < 512 {
        return Err(FatError::Format("bytes_per_sector below 512".into()));
    }
    if sectors_per_cluster == 0 {
        return Err(FatError::Format("sectors_per_cluster is zero".into()));
    }
    if reserved_sectors == 0 {
        return Err(FatError::Format("reserved_sectors is zero".into()));
    }
    if num_fats == 0 {
        return Err(FatError::Format("number of FATs is zero".into()));
    }

    let (sectors_per_fat, root_cluster, fs_info_sector, volume_label) = if sectors_per_fat_16 == 0 {
        // FAT32 extended BPB starts at offset 36.
        if sector0.len() < 90 {
            return Err(FatError::Format("FAT32 extended BPB truncated".into()));
        }
        let sectors_per_fat_32 = LittleEndian::read_u32(&sector0[36..40]);
        let root_cluster = LittleEndian::read_u32(&sector0[44..48]);
        let fs_info_sector = LittleEndian::read_u16(&sector0[48..50]);
        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&sector0[71..82]);
        (sectors_per_fat_32, root_cluster, fs_info_sector, volume_label)
    } else {
        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&sector0[43..54]);
        (sectors_per_fat_16 as u32, 0, 0xFFFF, volume_label)
    };

    let total_sectors = if total_sectors_16 != 0 { total_sectors_16 as u32 } else { total_sectors_32 };
    if total_sectors == 0 {
        return Err(FatError::Format("total_sectors is zero".into()));
    }
    if sectors_per_fat == 0 {
        return Err(FatError::Format("sectors_per_fat is zero".into()));
    }

    let first_fat_sector = reserved_sectors as u32;
    let root_dir_sectors =
        ((root_entries as u32 * 32) + (bytes_per_sector as u32 - 1)) / bytes_per_sector as u32;
    let first_data_sector = first_fat_sector + num_fats as u32 * sectors_per_fat + root_dir_sectors;

    if first_data_sector > total_sectors {
        return Err(FatError::Format("data region starts past the end of the volume".into()));
    }
    let data_sectors = total_sectors - first_data_sector;
    let total_clusters = data_sectors / sectors_per_cluster as u32;
    let fat_type = FatType::from_total_clusters(total_clusters);

    if fat_type == FatType::Fat32 && root_cluster < 2 {
        return Err(FatError::Format("FAT32 volume has no valid root cluster".into()));
    }
    if fat_type != FatType::Fat32 && root_entries == 0 {
        return Err(FatError::Format("FAT12/16 volume has an empty root directory region".into()));
    }

    Ok(BootParameters {
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        root_entries,
        total_sectors,
        sectors_per_fat,
        fat_type,
        root_cluster,
        fs_info_sector,
        oem_name,
        volume_label,
        first_fat_sector,
        first_data_sector,
        root_dir_sectors,
        total_clusters,
        first_data_cluster: 2,
        last_data_cluster: total_clusters + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_fat16_boot_sector() -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[3..11].copy_from_slice(b"MSDOS5.0");
        LittleEndian::write_u16(&mut s[11..13], 512);
        s[13] = 4; // sectors_per_cluster
        LittleEndian::write_u16(&mut s[14..16], 1); // reserved_sectors
        s[16] = 2; // num_fats
        LittleEndian::write_u16(&mut s[17..19], 512); // root_entries
        LittleEndian::write_u16(&mut s[19..21], 20000); // total_sectors_16
        s[21] = 0xF8;
        LittleEndian::write_u16(&mut s[22..24], 32); // sectors_per_fat_16
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn parses_fat16_geometry() {
        let sector0 = make_fat16_boot_sector();
        let bpb = parse_boot(&sector0).unwrap();
        assert_eq!(bpb.fat_type, FatType::Fat16);
        assert_eq!(bpb.first_fat_sector, 1);
        assert_eq!(bpb.root_dir_sectors, 32);
        assert_eq!(bpb.first_data_sector, 1 + 2 * 32 + 32);
        assert!(bpb.total_clusters >= 4085);
    }

    #[test]
    fn rejects_missing_signature() {
        let mut sector0 = make_fat16_boot_sector();
        sector0[510] = 0;
        assert!(parse_boot(&sector0).is_err());
    }

    #[test]
    fn rejects_zero_sectors_per_cluster() {
        let mut sector0 = make_fat16_boot_sector();
        sector0[13] = 0;
        assert!(parse_boot(&sector0).is_err());
    }
}
