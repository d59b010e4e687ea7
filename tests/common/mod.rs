//! Synthesizes minimal, valid FAT images in-process for the integration
//! tests below. No `resources/*.img` fixtures are checked into this repo
//! (see `SPEC_FULL.md` §8), so tests build their own.
//!
//! The FAT variant (12/16/32) is never chosen by the caller: it falls out of
//! `total_clusters` the same way `bpb::parse_boot` derives it from on-disk
//! geometry, and the table itself is written with the crate's own
//! `codec::write_fat_entry` so the bytes always match what that variant
//! implies. Every scenario in this file lands well under the FAT12 ceiling
//! (4085 clusters), so in practice these are FAT12 images despite the name.

use std::io::Write as _;

use byteorder::{ByteOrder, LittleEndian};

use fatdefrag::bpb::FatType;
use fatdefrag::codec::{fat_table_byte_len, write_fat_entry, FatEntry};

pub const BYTES_PER_SECTOR: u32 = 512;
pub const SECTORS_PER_CLUSTER: u32 = 1;
pub const CLUSTER_SIZE: u32 = BYTES_PER_SECTOR * SECTORS_PER_CLUSTER;
pub const ROOT_ENTRIES: u32 = 32;
pub const RESERVED_SECTORS: u32 = 1;
pub const NUM_FATS: u32 = 2;

/// One short-name directory entry to place in the root (or a subdirectory).
pub struct EntrySpec {
    pub name: [u8; 11],
    pub attrs: u8,
    pub first_cluster: u32,
    pub size: u32,
}

fn fat_type_for(total_clusters: u32) -> FatType {
    if total_clusters < 4085 {
        FatType::Fat12
    } else if total_clusters < 65525 {
        FatType::Fat16
    } else {
        FatType::Fat32
    }
}

fn root_dir_sectors() -> u32 {
    (ROOT_ENTRIES * 32 + BYTES_PER_SECTOR - 1) / BYTES_PER_SECTOR
}

fn sectors_per_fat(total_clusters: u32) -> u32 {
    let bytes = fat_table_byte_len(total_clusters, fat_type_for(total_clusters)) as u32;
    (bytes + BYTES_PER_SECTOR - 1) / BYTES_PER_SECTOR
}

fn first_data_sector(total_clusters: u32) -> u32 {
    RESERVED_SECTORS + NUM_FATS * sectors_per_fat(total_clusters) + root_dir_sectors()
}

pub fn cluster_offset(total_clusters: u32, cluster: u32) -> u64 {
    let sector = first_data_sector(total_clusters) + (cluster - 2) * SECTORS_PER_CLUSTER;
    sector as u64 * BYTES_PER_SECTOR as u64
}

fn fat_offset(index: u32, total_clusters: u32) -> u64 {
    let sector = RESERVED_SECTORS + index * sectors_per_fat(total_clusters);
    sector as u64 * BYTES_PER_SECTOR as u64
}

fn root_dir_offset(total_clusters: u32) -> u64 {
    let sector = RESERVED_SECTORS + NUM_FATS * sectors_per_fat(total_clusters);
    sector as u64 * BYTES_PER_SECTOR as u64
}

/// Encodes a raw 8.3 name like `b"FOO     BAR"` into an `EntrySpec` with
/// sensible non-zero timestamps (so report rendering has something to show).
pub fn entry(name: &[u8; 11], attrs: u8, first_cluster: u32, size: u32) -> EntrySpec {
    EntrySpec { name: *name, attrs, first_cluster, size }
}

fn write_dir_entry(buf: &mut [u8], spec: &EntrySpec) {
    buf[0..11].copy_from_slice(&spec.name);
    buf[11] = spec.attrs;
    // A fixed, plausible DOS timestamp: 2020-01-01 00:00:00.
    let date = ((2020u16 - 1980) << 9) | (1 << 5) | 1;
    LittleEndian::write_u16(&mut buf[16..18], date);
    LittleEndian::write_u16(&mut buf[24..26], date);
    LittleEndian::write_u16(&mut buf[20..22], (spec.first_cluster >> 16) as u16);
    LittleEndian::write_u16(&mut buf[26..28], (spec.first_cluster & 0xFFFF) as u16);
    LittleEndian::write_u32(&mut buf[28..32], spec.size);
}

/// Flattens directory entries into a byte buffer usable as a subdirectory's
/// own cluster content (as opposed to the image's fixed root dir region).
pub fn build_dir_entries(entries: &[EntrySpec]) -> Vec<u8> {
    let mut buf = vec![0u8; entries.len() * 32];
    for (i, spec) in entries.iter().enumerate() {
        write_dir_entry(&mut buf[i * 32..(i + 1) * 32], spec);
    }
    buf
}

/// One file's on-disk placement: the clusters its chain occupies (in chain
/// order) and the bytes to place in them (will be zero-padded to a whole
/// number of clusters).
pub struct FileLayout {
    pub clusters: Vec<u32>,
    pub content: Vec<u8>,
}

/// Builds a complete FAT image: boot sector, two identical FATs reflecting
/// `files`' chains, a root directory listing `root_entries`, and cluster
/// data from `files`. Returns the raw image bytes.
pub fn build_fat16_image(total_clusters: u32, root_entries: &[EntrySpec], files: &[FileLayout]) -> Vec<u8> {
    let fat_type = fat_type_for(total_clusters);
    let data_sectors = total_clusters * SECTORS_PER_CLUSTER;
    let total_sectors = first_data_sector(total_clusters) + data_sectors;
    let mut image = vec![0u8; (total_sectors * BYTES_PER_SECTOR) as usize];

    // Boot sector.
    image[0] = 0xEB;
    image[1] = 0x3C;
    image[2] = 0x90;
    image[3..11].copy_from_slice(b"MSWIN4.1");
    LittleEndian::write_u16(&mut image[11..13], BYTES_PER_SECTOR as u16);
    image[13] = SECTORS_PER_CLUSTER as u8;
    LittleEndian::write_u16(&mut image[14..16], RESERVED_SECTORS as u16);
    image[16] = NUM_FATS as u8;
    LittleEndian::write_u16(&mut image[17..19], ROOT_ENTRIES as u16);
    LittleEndian::write_u16(&mut image[19..21], total_sectors as u16);
    image[21] = 0xF8;
    LittleEndian::write_u16(&mut image[22..24], sectors_per_fat(total_clusters) as u16);
    image[510] = 0x55;
    image[511] = 0xAA;

    // Both FAT copies, identical: chain links per file, EOC at the tail.
    let fat_len = sectors_per_fat(total_clusters) as usize * BYTES_PER_SECTOR as usize;
    for fat_index in 0..NUM_FATS {
        let base = fat_offset(fat_index, total_clusters) as usize;
        let table = &mut image[base..base + fat_len];
        for file in files {
            for w in file.clusters.windows(2) {
                write_fat_entry(table, w[0], fat_type, FatEntry::Allocated(w[1]));
            }
            if let Some(&tail) = file.clusters.last() {
                write_fat_entry(table, tail, fat_type, FatEntry::EndOfChain);
            }
        }
    }

    // Root directory.
    let root_base = root_dir_offset(total_clusters) as usize;
    for (i, spec) in root_entries.iter().enumerate() {
        write_dir_entry(&mut image[root_base + i * 32..root_base + (i + 1) * 32], spec);
    }

    // Cluster data.
    for file in files {
        let mut remaining = &file.content[..];
        for &cluster in &file.clusters {
            let off = cluster_offset(total_clusters, cluster) as usize;
            let take = remaining.len().min(CLUSTER_SIZE as usize);
            image[off..off + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
        }
    }

    image
}

pub fn write_image_to_temp(image: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.img");
    let mut f = std::fs::File::create(&path).expect("create temp image");
    f.write_all(image).expect("write temp image");
    (dir, path)
}
