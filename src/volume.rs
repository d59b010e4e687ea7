//! The filesystem abstraction: cluster chains, free-map, directory
//! traversal, allocation and relocation primitives.
//!
//! Generalizes the teacher's `FileSystem<T>` (BPB load, FAT slice access,
//! `alloc_cluster`) and `table.rs`'s `ClusterIterator`, but replaces the
//! teacher's direct single-copy-on-write disk model with the
//! journal-mediated one this tool requires, and exposes raw cluster
//! *positions* (not file streams) since the relocator addresses clusters
//! directly rather than through a `Read`/`Write` view of one file.

use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::bpb::{parse_boot, BootParameters, FatType};
use crate::codec::{self, parse_dir_entry, FatEntry, FileAttributes, LfnFragment, RawDirEntry, ShortDirEntry, DIR_ENTRY_SIZE};
use crate::error::{FatError, Result};
use crate::image_io::ImageIO;
use crate::journal::Journal;

/// Position of a directory entry: which directory region it lives in and
/// its byte offset from the start of that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryPos {
    /// Absolute byte offset of the 32-byte slot in the image.
    pub offset: u64,
}

/// Maps a byte position within a directory region's concatenated bytes
/// (as produced by `read_root_dir_region`/`read_cluster_chain_bytes`) back
/// to its absolute offset in the image.
///
/// A FAT12/16 root directory is one contiguous extent, so `pos` maps
/// linearly onto it. A FAT32 root, or any subdirectory, is instead the
/// concatenation of a cluster *chain* — and an unfragmented tool's entire
/// reason to exist is that those clusters are routinely non-contiguous on
/// disk, so `pos` must be mapped cluster-by-cluster, not with a flat add.
enum DirRegion {
    Flat { base: u64 },
    Chain { cluster_offsets: Vec<u64>, cluster_len: usize },
}

impl DirRegion {
    fn flat(base: u64) -> Self {
        DirRegion::Flat { base }
    }

    fn chain(bpb: &BootParameters, chain: &[u32]) -> Self {
        let cluster_offsets = chain.iter().map(|&c| bpb.cluster_offset(c)).collect();
        DirRegion::Chain { cluster_offsets, cluster_len: bpb.cluster_len_bytes() as usize }
    }

    fn offset_at(&self, pos: usize) -> u64 {
        match self {
            DirRegion::Flat { base } => base + pos as u64,
            DirRegion::Chain { cluster_offsets, cluster_len } => {
                let cluster_index = pos / cluster_len;
                let in_cluster = pos % cluster_len;
                cluster_offsets[cluster_index] + in_cluster as u64
            }
        }
    }
}

/// One file (or subdirectory) discovered while walking a directory: its
/// short-name entry, position on disk, long name if any, and cluster chain.
#[derive(Debug, Clone)]
pub struct VolumeFile {
    pub name: String,
    pub entry: ShortDirEntry,
    pub pos: DirEntryPos,
    pub chain: Vec<u32>,
    pub depth: u32,
    pub parent_dir_cluster: u32,
}

impl VolumeFile {
    pub fn is_dir(&self) -> bool {
        self.entry.is_dir()
    }

    pub fn size(&self) -> u32 {
        self.entry.size
    }

    pub fn is_contiguous(&self) -> bool {
        self.chain.windows(2).all(|w| w[1] == w[0] + 1)
    }
}

/// The in-memory model of an open FAT volume. Exclusively owns the image
/// handle, the journal, and the two in-memory FAT copies.
pub struct Volume {
    image_path: PathBuf,
    io: ImageIO,
    journal: Journal,
    bpb: BootParameters,
    fat0: Vec<u8>,
    fat1: Vec<u8>,
    free_map: Vec<bool>,
    poisoned: bool,
}

impl Volume {
    /// Opens `path`: loads `BootParameters`, both FAT copies (preferring
    /// FAT#0 on disagreement and staging a rewrite of FAT#1), builds the
    /// `FreeMap`, and replays any pending journal transaction.
    pub fn open(path: &Path) -> Result<Self> {
        let mut io = ImageIO::open(path)?;
        let journal = Journal::open_and_replay(path, &mut io)?;

        let sector0 = io.read(0, 512)?;
        let bpb = parse_boot(&sector0)?;
        debug!("opened {:?}: {:?}, {} clusters", path, bpb.fat_type, bpb.total_clusters);

        let fat_len = bpb.fat_len_bytes() as usize;
        let fat0 = io.read(bpb.fat_offset(0), fat_len)?;
        let fat1 = if bpb.num_fats > 1 { io.read(bpb.fat_offset(1), fat_len)? } else { fat0.clone() };

        let mut volume = Volume {
            image_path: path.to_path_buf(),
            io,
            journal,
            bpb,
            fat0,
            fat1,
            free_map: Vec::new(),
            poisoned: false,
        };

        if volume.fat0 != volume.fat1 {
            warn!("FAT#0 and FAT#1 disagree at open; preferring FAT#0 and rewriting FAT#1");
            volume.stage_fat1_rewrite()?;
        }
        volume.rebuild_free_map();
        Ok(volume)
    }

    pub fn bpb(&self) -> &BootParameters {
        &self.bpb
    }

    pub fn free_cluster_count(&self) -> usize {
        self.free_map.iter().filter(|&&free| free).count()
    }

    fn stage_fat1_rewrite(&mut self) -> Result<()> {
        let tx = self.journal.begin();
        let offset = self.bpb.fat_offset(1);
        self.journal.stage(tx, &mut self.io, offset, &self.fat0)?;
        self.journal.commit(tx, &mut self.io)?;
        self.fat1 = self.fat0.clone();
        Ok(())
    }

    fn rebuild_free_map(&mut self) {
        let n = (self.bpb.last_data_cluster - self.bpb.first_data_cluster + 1) as usize;
        let mut map = vec![false; n];
        for i in 0..n {
            let cluster = self.bpb.first_data_cluster + i as u32;
            map[i] = codec::read_fat_entry(&self.fat0, cluster, self.bpb.fat_type).is_free();
        }
        self.free_map = map;
    }

    fn free_map_index(&self, cluster: u32) -> usize {
        (cluster - self.bpb.first_data_cluster) as usize
    }

    fn entry_at(&self, cluster: u32) -> FatEntry {
        codec::read_fat_entry(&self.fat0, cluster, self.bpb.fat_type)
    }

    /// Walks the FAT from `head` until `EOC`. A chain longer than the total
    /// cluster count is a cycle and is reported as `CorruptChain`.
    pub fn read_chain(&self, head: u32) -> Result<Vec<u32>> {
        self.check_poisoned()?;
        if head == 0 {
            return Ok(Vec::new());
        }
        let mut chain = Vec::new();
        let mut cluster = head;
        let limit = self.bpb.total_clusters as usize + 1;
        loop {
            if !self.bpb.is_valid_data_cluster(cluster) {
                return Err(FatError::CorruptChain {
                    head,
                    reason: format!("cluster {cluster} is outside the data region"),
                });
            }
            chain.push(cluster);
            if chain.len() > limit {
                return Err(FatError::CorruptChain { head, reason: "chain longer than total clusters".into() });
            }
            match self.entry_at(cluster) {
                FatEntry::Allocated(next) => cluster = next,
                FatEntry::EndOfChain => break,
                other => {
                    return Err(FatError::CorruptChain {
                        head,
                        reason: format!("chain hit an unexpected entry {other:?} before EOC"),
                    })
                }
            }
        }
        Ok(chain)
    }

    /// Reads the root directory's bytes along with a region map that can
    /// translate a byte position back to an absolute image offset. For
    /// FAT12/16 this is the one flat, contiguous root extent; for FAT32 the
    /// root is itself a cluster chain like any subdirectory.
    fn read_root_dir_region(&mut self) -> Result<(Vec<u8>, DirRegion)> {
        if self.bpb.fat_type == FatType::Fat32 {
            let chain = self.read_chain(self.bpb.root_cluster)?;
            let bytes = self.read_cluster_chain_bytes(&chain)?;
            let region = DirRegion::chain(&self.bpb, &chain);
            Ok((bytes, region))
        } else {
            let (offset, len) = self.bpb.root_dir_region();
            let bytes = self.io.read(offset, len as usize)?;
            Ok((bytes, DirRegion::flat(offset)))
        }
    }

    fn read_cluster_chain_bytes(&mut self, chain: &[u32]) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(chain.len() * self.bpb.cluster_len_bytes() as usize);
        for &cluster in chain {
            buf.extend(self.io.read(self.bpb.cluster_offset(cluster), self.bpb.cluster_len_bytes() as usize)?);
        }
        Ok(buf)
    }

    /// Parses one directory region's bytes into `VolumeFile`s, grouping
    /// preceding LFN fragments with the short entry they describe.
    fn parse_dir_region(&self, bytes: &[u8], region: &DirRegion, dir_cluster: u32, depth: u32) -> Vec<VolumeFile> {
        let mut files = Vec::new();
        let mut pending_lfn: Vec<LfnFragment> = Vec::new();
        let mut pos = 0usize;
        while pos + DIR_ENTRY_SIZE <= bytes.len() {
            let mut raw = [0u8; DIR_ENTRY_SIZE];
            raw.copy_from_slice(&bytes[pos..pos + DIR_ENTRY_SIZE]);
            match parse_dir_entry(&raw) {
                RawDirEntry::EndOfDir => break,
                RawDirEntry::Deleted => pending_lfn.clear(),
                RawDirEntry::Lfn(frag) => {
                    if !frag.is_deleted() {
                        pending_lfn.push(frag);
                    } else {
                        pending_lfn.clear();
                    }
                }
                RawDirEntry::Short(entry) => {
                    if entry.is_volume_label() {
                        pending_lfn.clear();
                        pos += DIR_ENTRY_SIZE;
                        continue;
                    }
                    let name = if !pending_lfn.is_empty()
                        && pending_lfn.iter().all(|f| f.checksum == entry.short_name_checksum())
                    {
                        decode_lfn_name(&pending_lfn)
                    } else {
                        if !pending_lfn.is_empty() {
                            trace!("orphaned LFN fragment(s) preceding {}, leaving in place", entry.short_name_string());
                        }
                        entry.short_name_string()
                    };
                    pending_lfn.clear();

                    if name != "." && name != ".." {
                        let chain = self.read_chain(entry.first_cluster(self.bpb.fat_type)).unwrap_or_default();
                        files.push(VolumeFile {
                            name,
                            pos: DirEntryPos { offset: region.offset_at(pos) },
                            chain,
                            depth,
                            parent_dir_cluster: dir_cluster,
                            entry,
                        });
                    }
                }
            }
            pos += DIR_ENTRY_SIZE;
        }
        files
    }

    /// Yields every file reachable from the root by depth-first traversal.
    /// `.` and `..` entries are consumed internally for chain resolution and
    /// never appear in the returned list.
    pub fn walk_directory(&mut self) -> Result<Vec<VolumeFile>> {
        self.check_poisoned()?;
        let result = self.walk_directory_impl();
        self.track_io(result)
    }

    fn walk_directory_impl(&mut self) -> Result<Vec<VolumeFile>> {
        let mut out = Vec::new();
        let (root_bytes, root_region) = self.read_root_dir_region()?;
        let root_files = self.parse_dir_region(&root_bytes, &root_region, self.bpb.root_cluster, 0);
        self.walk_recursive(root_files, &mut out)?;
        Ok(out)
    }

    fn walk_recursive(&mut self, files: Vec<VolumeFile>, out: &mut Vec<VolumeFile>) -> Result<()> {
        for file in files {
            let is_dir = file.is_dir();
            let chain = file.chain.clone();
            let depth = file.depth;
            out.push(file);
            if is_dir && !chain.is_empty() {
                let bytes = self.read_cluster_chain_bytes(&chain)?;
                let region = DirRegion::chain(&self.bpb, &chain);
                let children = self.parse_dir_region(&bytes, &region, chain[0], depth + 1);
                self.walk_recursive(children, out)?;
            }
        }
        Ok(())
    }

    /// Scans the `FreeMap` for the lowest run of >= `n` free clusters.
    pub fn allocate_contiguous(&self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        let n = n as usize;
        let mut run_start = None;
        let mut run_len = 0usize;
        for (i, &free) in self.free_map.iter().enumerate() {
            if free {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len >= n {
                    return run_start.map(|s| self.bpb.first_data_cluster + s as u32);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.free_map.get(self.free_map_index(cluster)).copied().unwrap_or(false)
    }

    /// Finds the cluster in `chain` that precedes `target`, if any.
    fn predecessor_in_chain(chain: &[u32], target: u32) -> Option<u32> {
        chain.iter().position(|&c| c == target).and_then(|i| if i == 0 { None } else { Some(chain[i - 1]) })
    }

    /// Moves the data of cluster `src` to the free cluster `dst`, relinking
    /// FAT entries on both sides and updating the free map. Both FAT copies
    /// and the data copy live in one journal transaction.
    ///
    /// `chain` is the full, up-to-date chain `src` belongs to (relocation
    /// callers keep their own copy up to date as they move cluster-by-cluster).
    pub fn move_cluster(&mut self, chain: &mut [u32], index: usize, dst: u32) -> Result<()> {
        self.check_poisoned()?;
        let result = self.move_cluster_impl(chain, index, dst);
        self.track_io(result)
    }

    fn move_cluster_impl(&mut self, chain: &mut [u32], index: usize, dst: u32) -> Result<()> {
        let src = chain[index];
        if src == dst {
            return Ok(());
        }
        debug_assert!(self.is_free(dst), "move_cluster target {dst} is not free");
        trace!("move_cluster {src} -> {dst}");

        let data = self.io.read(self.bpb.cluster_offset(src), self.bpb.cluster_len_bytes() as usize)?;
        let src_entry = self.entry_at(src);
        let next = src_entry.next_cluster();

        let tx = self.journal.begin();
        self.journal.stage(tx, &mut self.io, self.bpb.cluster_offset(dst), &data)?;

        self.set_fat_entry_staged(tx, dst, match next {
            Some(n) => FatEntry::Allocated(n),
            None => FatEntry::EndOfChain,
        })?;
        self.set_fat_entry_staged(tx, src, FatEntry::Free)?;

        if let Some(pred) = Self::predecessor_in_chain(chain, src) {
            self.set_fat_entry_staged(tx, pred, FatEntry::Allocated(dst))?;
        }

        self.journal.commit(tx, &mut self.io)?;

        self.free_map[self.free_map_index(src)] = true;
        self.free_map[self.free_map_index(dst)] = false;
        chain[index] = dst;
        Ok(())
    }

    /// Stages a FAT entry write into both FAT copies of the currently open
    /// transaction, updating the in-memory copies once committed bytes land.
    fn set_fat_entry_staged(&mut self, tx: crate::journal::TxId, cluster: u32, value: FatEntry) -> Result<()> {
        let mut patched0 = self.fat0.clone();
        codec::write_fat_entry(&mut patched0, cluster, self.bpb.fat_type, value);
        let mut patched1 = self.fat1.clone();
        codec::write_fat_entry(&mut patched1, cluster, self.bpb.fat_type, value);

        let len = self.bpb.fat_len_bytes() as usize;
        self.journal.stage(tx, &mut self.io, self.bpb.fat_offset(0), &patched0[..len])?;
        self.journal.stage(tx, &mut self.io, self.bpb.fat_offset(1), &patched1[..len])?;
        self.fat0 = patched0;
        self.fat1 = patched1;
        Ok(())
    }

    /// Directly pokes a single FAT entry for test-fixture purposes
    /// (error injection, fragmentation), bypassing `move_cluster`'s
    /// relinking since the whole point there is to break the structure.
    pub fn write_raw_fat_entry(&mut self, cluster: u32, value: FatEntry) -> Result<()> {
        self.check_poisoned()?;
        let result = self.write_raw_fat_entry_impl(cluster, value);
        self.track_io(result)
    }

    fn write_raw_fat_entry_impl(&mut self, cluster: u32, value: FatEntry) -> Result<()> {
        let tx = self.journal.begin();
        self.set_fat_entry_staged(tx, cluster, value)?;
        self.journal.commit(tx, &mut self.io)?;
        if matches!(value, FatEntry::Free) {
            self.free_map[self.free_map_index(cluster)] = true;
        } else {
            self.free_map[self.free_map_index(cluster)] = false;
        }
        Ok(())
    }

    /// Patches a short-name entry's starting cluster (and, transitively, a
    /// directory's own `.`/`..` entries) in place.
    pub fn update_dir_entry(&mut self, pos: DirEntryPos, new_entry: &ShortDirEntry) -> Result<()> {
        self.check_poisoned()?;
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        new_entry.encode(&mut buf);
        let result = self.update_dir_entry_impl(pos.offset, &buf);
        self.track_io(result)
    }

    fn update_dir_entry_impl(&mut self, offset: u64, buf: &[u8; DIR_ENTRY_SIZE]) -> Result<()> {
        let tx = self.journal.begin();
        self.journal.stage(tx, &mut self.io, offset, buf)?;
        self.journal.commit(tx, &mut self.io)
    }

    /// Overwrites raw bytes at `offset` in one transaction. Used by
    /// `ErrorCreator` to write structurally-broken directory entries that
    /// `update_dir_entry`'s typed interface cannot express.
    pub fn write_raw_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_poisoned()?;
        let result = self.write_raw_bytes_impl(offset, bytes);
        self.track_io(result)
    }

    fn write_raw_bytes_impl(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let tx = self.journal.begin();
        self.journal.stage(tx, &mut self.io, offset, bytes)?;
        self.journal.commit(tx, &mut self.io)
    }

    pub fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_poisoned()?;
        let result = self.io.read(offset, len);
        self.track_io(result)
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Returns an error without performing any further work if a prior
    /// operation already poisoned this volume. Per the propagation policy,
    /// an `IoError` leaves the volume permanently unusable for the rest of
    /// the run rather than risking further reads/writes against an image in
    /// an unknown state.
    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(FatError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "volume is poisoned by a prior I/O error and can no longer be used",
            )));
        }
        Ok(())
    }

    /// Marks the volume poisoned if `result` is an `IoError`, then returns
    /// it unchanged. Every public method that touches the image or the
    /// journal routes its outcome through this.
    fn track_io<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(FatError::Io(_))) {
            self.poisoned = true;
        }
        result
    }

    /// Rewrites a short entry's starting cluster in place and, if the entry
    /// is a directory, fixes up its own `.` entry and every immediate
    /// child's `..` entry to match. Shared by the relocator and the
    /// fragmentator: both move a file's head cluster and must keep all
    /// directory-entry references to that cluster in sync.
    pub fn rewrite_entry_head(&mut self, pos: DirEntryPos, is_dir: bool, new_head: u32) -> Result<()> {
        let entry_bytes = self.read_bytes(pos.offset, DIR_ENTRY_SIZE)?;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&entry_bytes);
        let mut entry = match parse_dir_entry(&raw) {
            RawDirEntry::Short(e) => e,
            _ => return Err(FatError::Format("directory entry vanished mid-relocation".into())),
        };
        entry.set_first_cluster(new_head, self.bpb.fat_type);
        self.update_dir_entry(pos, &entry)?;

        if is_dir {
            self.fixup_dot_entry(new_head)?;
            self.fixup_children_dotdot(new_head)?;
        }
        Ok(())
    }

    /// Patches the `.` entry inside a moved directory's own first cluster to
    /// point at its new location.
    fn fixup_dot_entry(&mut self, dir_head: u32) -> Result<()> {
        let offset = self.bpb.cluster_offset(dir_head);
        let bytes = self.read_bytes(offset, DIR_ENTRY_SIZE)?;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&bytes);
        if let RawDirEntry::Short(mut dot) = parse_dir_entry(&raw) {
            if dot.short_name_string() == "." {
                dot.set_first_cluster(dir_head, self.bpb.fat_type);
                self.update_dir_entry(DirEntryPos { offset }, &dot)?;
            }
        }
        Ok(())
    }

    /// Every immediate child subdirectory of a moved directory has its `..`
    /// entry pointing at the parent's old location; rewrite it to the new
    /// one. Re-walks the volume rather than reusing a caller-held list,
    /// since the moved directory's own entry has already been rewritten to
    /// `new_parent_cluster` by the time this runs — walking down from the
    /// root finds this directory's children under their real, current
    /// parent cluster.
    fn fixup_children_dotdot(&mut self, new_parent_cluster: u32) -> Result<()> {
        let files = self.walk_directory()?;
        for file in files {
            if !file.is_dir() || file.chain.is_empty() || file.parent_dir_cluster != new_parent_cluster {
                continue;
            }
            let offset = self.bpb.cluster_offset(file.chain[0]) + DIR_ENTRY_SIZE as u64;
            let bytes = self.read_bytes(offset, DIR_ENTRY_SIZE)?;
            let mut raw = [0u8; DIR_ENTRY_SIZE];
            raw.copy_from_slice(&bytes);
            if let RawDirEntry::Short(mut dotdot) = parse_dir_entry(&raw) {
                if dotdot.short_name_string() == ".." {
                    dotdot.set_first_cluster(new_parent_cluster, self.bpb.fat_type);
                    self.update_dir_entry(DirEntryPos { offset }, &dotdot)?;
                }
            }
        }
        Ok(())
    }

    /// Flushes the journal and closes the image handle.
    pub fn close(self) -> Result<()> {
        self.journal.close()?;
        Ok(())
    }
}

fn decode_lfn_name(fragments: &[LfnFragment]) -> String {
    let mut ordered: Vec<&LfnFragment> = fragments.iter().collect();
    ordered.sort_by_key(|f| f.sequence());
    let mut units: Vec<u16> = Vec::new();
    for frag in ordered {
        for &u in frag.chars().iter() {
            if u == 0x0000 || u == 0xFFFF {
                break;
            }
            units.push(u);
        }
    }
    String::from_utf16_lossy(&units)
}
