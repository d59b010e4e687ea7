use thiserror::Error;

/// Error enum with all errors that can be returned by this crate.
///
/// Lower layers never swallow an error, they attach context and propagate it
/// upward; `Volume` treats any `Io` error as fatal for the rest of a run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FatError {
    /// Underlying read/write failure. The volume is no longer usable.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image is not a valid FAT volume.
    #[error("not a valid FAT volume: {0}")]
    Format(String),

    /// The FAT contains a cycle or points outside the data region.
    #[error("corrupt cluster chain starting at cluster {head}: {reason}")]
    CorruptChain { head: u32, reason: String },

    /// Journal replay failed its checksum; the image was not touched further.
    #[error("journal is corrupt at sequence {sequence}, manual inspection required")]
    CorruptJournal { sequence: u64 },

    /// No contiguous allocation was possible for a file of `needed` clusters.
    #[error("no space for a run of {needed} contiguous clusters")]
    NoSpace { needed: u32 },

    /// Another process holds the image lock.
    #[error("image is locked by another process")]
    Busy,
}

pub type Result<T> = std::result::Result<T, FatError>;
