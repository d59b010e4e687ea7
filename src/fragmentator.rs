//! Inverse of the relocator: deliberately fragments already-contiguous
//! files, to synthesize a realistic `DEFRAG` test input.
//!
//! Reuses nothing but `Volume::move_cluster` and `Volume::allocate_contiguous`
//! — per `spec.md` §4.6, "no new on-disk logic" — so this module is mostly
//! policy: pick a scattered destination for each cluster instead of a
//! contiguous one.

use log::info;

use crate::error::Result;
use crate::volume::Volume;

pub struct FragmentationReport {
    pub files_examined: usize,
    pub files_fragmented: usize,
}

/// Deterministic xorshift, seeded by the caller, so a `frag --seed N` run is
/// reproducible without pulling in a full `rand` dependency for one shuffle.
struct Xorshift32(u32);

impl Xorshift32 {
    fn new(seed: u32) -> Self {
        Xorshift32(if seed == 0 { 0x9E37_79B9 } else { seed })
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn shuffle<T>(&mut self, slice: &mut [T]) {
        for i in (1..slice.len()).rev() {
            let j = (self.next_u32() as usize) % (i + 1);
            slice.swap(i, j);
        }
    }
}

/// Fragments every file with 2 or more clusters by reassigning its clusters
/// to the highest available free clusters in reverse order, maximizing
/// non-adjacency, then shuffling the assignment with `seed`.
pub fn fragment(volume: &mut Volume, seed: u32) -> Result<FragmentationReport> {
    let files = volume.walk_directory()?;
    let mut report = FragmentationReport { files_examined: 0, files_fragmented: 0 };
    let mut rng = Xorshift32::new(seed);

    for file in files {
        if file.chain.len() < 2 {
            continue;
        }
        report.files_examined += 1;

        let mut targets = scattered_free_clusters(volume, file.chain.len());
        if targets.len() < file.chain.len() {
            continue;
        }
        rng.shuffle(&mut targets);

        let mut working_chain = file.chain.clone();
        for (i, &dst) in targets.iter().enumerate().take(working_chain.len()) {
            if working_chain[i] != dst && volume.is_free(dst) {
                volume.move_cluster(&mut working_chain, i, dst)?;
            }
        }
        if working_chain[0] != file.chain[0] {
            volume.rewrite_entry_head(file.pos, file.is_dir(), working_chain[0])?;
        }
        report.files_fragmented += 1;
    }

    info!("frag: {}/{} files fragmented (seed {seed})", report.files_fragmented, report.files_examined);
    Ok(report)
}

/// Picks `n` free clusters spread across the data region rather than a
/// contiguous run, by walking from the highest valid cluster downward.
fn scattered_free_clusters(volume: &Volume, n: usize) -> Vec<u32> {
    let mut out = Vec::with_capacity(n);
    let mut cluster = volume.bpb().last_data_cluster;
    while cluster >= volume.bpb().first_data_cluster && out.len() < n {
        if volume.is_free(cluster) {
            out.push(cluster);
        }
        if cluster == volume.bpb().first_data_cluster {
            break;
        }
        cluster -= 1;
    }
    out
}
