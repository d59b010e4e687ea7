//! Deliberate injection of known structural defects, as test fixtures for
//! recovery/repair tooling.
//!
//! Built directly on `Volume`'s public allocator/writer primitives rather
//! than a separate ad-hoc code path — the same discipline as
//! `other_examples/.../rimfs-src-fs-exfat-injector.rs`, which constructs its
//! deliberately-broken fixtures by driving the filesystem's own chain/bitmap
//! writers instead of poking bytes in a bespoke routine.

use log::info;

use crate::codec::{FatEntry, DIR_ENTRY_SIZE};
use crate::error::{FatError, Result};
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectKind {
    BrokenChain,
    LostCluster,
    CrossLinkedChain,
    BadDirEntry,
}

impl std::str::FromStr for DefectKind {
    type Err = FatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broken-chain" => Ok(DefectKind::BrokenChain),
            "lost-cluster" => Ok(DefectKind::LostCluster),
            "cross-linked" => Ok(DefectKind::CrossLinkedChain),
            "bad-dir-entry" => Ok(DefectKind::BadDirEntry),
            other => Err(FatError::Format(format!("unknown defect kind: {other}"))),
        }
    }
}

/// Injects one defect of `kind` into `volume`, picking the first file
/// encountered that the defect needs (a chain of >= 2 clusters for
/// broken-chain/cross-linked, any file at all for the other two kinds).
pub fn inject(volume: &mut Volume, kind: DefectKind) -> Result<()> {
    match kind {
        DefectKind::BrokenChain => inject_broken_chain(volume),
        DefectKind::LostCluster => inject_lost_cluster(volume),
        DefectKind::CrossLinkedChain => inject_cross_linked_chain(volume),
        DefectKind::BadDirEntry => inject_bad_dir_entry(volume),
    }
}

/// Overwrites a mid-chain FAT entry with `Free`, orphaning everything after
/// it — the tail becomes unreachable from the file's directory entry but
/// remains marked allocated in the FAT.
fn inject_broken_chain(volume: &mut Volume) -> Result<()> {
    let files = volume.walk_directory()?;
    let target = files
        .into_iter()
        .find(|f| f.chain.len() >= 2)
        .ok_or_else(|| FatError::Format("no file with a multi-cluster chain to break".into()))?;

    let mid = target.chain.len() / 2;
    let broken_cluster = target.chain[mid];
    info!("injecting broken-chain at cluster {broken_cluster} (file {})", target.name);
    volume.write_raw_fat_entry(broken_cluster, FatEntry::Free)
}

/// Marks a currently-free cluster as allocated (`EndOfChain`) with no
/// directory entry's chain reaching it — a lost cluster that a scan of the
/// FAT will find but a directory walk never will.
fn inject_lost_cluster(volume: &mut Volume) -> Result<()> {
    let cluster = volume
        .allocate_contiguous(1)
        .ok_or_else(|| FatError::NoSpace { needed: 1 })?;
    info!("injecting lost-cluster at {cluster}");
    volume.write_raw_fat_entry(cluster, FatEntry::EndOfChain)
}

/// Makes two distinct files' chains share a tail cluster by repointing the
/// second file's penultimate entry at the first file's last cluster.
fn inject_cross_linked_chain(volume: &mut Volume) -> Result<()> {
    let files = volume.walk_directory()?;
    let mut candidates = files.into_iter().filter(|f| f.chain.len() >= 2);
    let a = candidates.next().ok_or_else(|| FatError::Format("need two multi-cluster files to cross-link".into()))?;
    let b = candidates.next().ok_or_else(|| FatError::Format("need two multi-cluster files to cross-link".into()))?;

    let shared_tail = *a.chain.last().unwrap();
    let b_penultimate = b.chain[b.chain.len() - 2];
    info!("cross-linking {} and {} at cluster {shared_tail}", a.name, b.name);
    volume.write_raw_fat_entry(b_penultimate, FatEntry::Allocated(shared_tail))
}

/// Corrupts a short-name directory entry's first byte to a value that is
/// neither a valid short-name lead byte, the deletion marker (0xE5), nor the
/// end-of-directory marker (0x00) — structurally confusing, not just a
/// cosmetic rename.
fn inject_bad_dir_entry(volume: &mut Volume) -> Result<()> {
    let files = volume.walk_directory()?;
    let target = files.into_iter().next().ok_or_else(|| FatError::Format("volume has no files to corrupt".into()))?;

    info!("injecting bad-dir-entry at offset {} (file {})", target.pos.offset, target.name);
    let mut buf = volume.read_bytes(target.pos.offset, DIR_ENTRY_SIZE)?;
    buf[0] = 0xFF; // not <= 0x7F, not 0x05/0xE5 (deleted), not 0x00 (end): structurally invalid
    buf[11] &= !0x0F; // keep attrs but ensure this isn't mistaken for an LFN fragment
    volume.write_raw_bytes(target.pos.offset, &buf)
}
