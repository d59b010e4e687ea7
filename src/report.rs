//! Human-readable rendering of volume statistics and fragmentation state,
//! for the `info`/`defrag`/`frag` CLI commands.
//!
//! Format style follows the teacher's own `examples/ls.rs` (fixed-width
//! columns, a small size-unit helper, one line per entry).

use std::fmt::Write as _;

use chrono::{DateTime, Local};

use crate::bpb::FatType;
use crate::fragmentator::FragmentationReport;
use crate::relocator::RelocationReport;
use crate::volume::Volume;

fn format_size(size: u32) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    let size = size as u64;
    if size < KB {
        format!("{size}B")
    } else if size < MB {
        format!("{}KB", size / KB)
    } else {
        format!("{}MB", size / MB)
    }
}

fn fat_type_label(t: FatType) -> &'static str {
    match t {
        FatType::Fat12 => "FAT12",
        FatType::Fat16 => "FAT16",
        FatType::Fat32 => "FAT32",
    }
}

/// Renders the `info` command's output: geometry, free space, per-file
/// fragmentation state.
pub fn render_info(volume: &mut Volume) -> crate::error::Result<String> {
    let bpb = volume.bpb().clone();
    let free = volume.free_cluster_count();
    let files = volume.walk_directory()?;

    let mut out = String::new();
    writeln!(out, "volume: {:?}", volume.image_path()).unwrap();
    writeln!(out, "type: {}", fat_type_label(bpb.fat_type)).unwrap();
    writeln!(
        out,
        "clusters: {} total, {} free ({} bytes/cluster)",
        bpb.total_clusters,
        free,
        bpb.cluster_len_bytes()
    )
    .unwrap();
    writeln!(out, "files: {}", files.len()).unwrap();
    writeln!(out).unwrap();

    let mut fragmented = 0usize;
    for f in &files {
        if f.chain.is_empty() {
            continue;
        }
        let state = if f.is_contiguous() { "contiguous" } else { "fragmented" };
        if state == "fragmented" {
            fragmented += 1;
        }
        let modified: DateTime<Local> = f.entry.modified().into();
        writeln!(
            out,
            "{:>8}  {}  {:>4} clusters  {:<10}  {}",
            format_size(f.size()),
            modified.format("%Y-%m-%d %H:%M:%S"),
            f.chain.len(),
            state,
            f.name
        )
        .unwrap();
    }
    writeln!(out).unwrap();
    writeln!(out, "{fragmented} of {} non-empty files are fragmented", files.iter().filter(|f| !f.chain.is_empty()).count()).unwrap();
    Ok(out)
}

pub fn render_relocation_report(report: &RelocationReport) -> String {
    let mut out = String::new();
    writeln!(out, "examined {} files", report.files_examined).unwrap();
    writeln!(out, "moved {} files", report.files_moved).unwrap();
    writeln!(out, "{} files were already contiguous", report.files_already_contiguous).unwrap();
    if !report.no_space.is_empty() {
        writeln!(out, "{} files could not be relocated (no contiguous space):", report.no_space.len()).unwrap();
        for name in &report.no_space {
            writeln!(out, "  {name}").unwrap();
        }
    }
    out
}

pub fn render_fragmentation_report(report: &FragmentationReport) -> String {
    format!("fragmented {}/{} eligible files", report.files_fragmented, report.files_examined)
}
