//! Write-ahead log of pending byte-range writes.
//!
//! Ordering is the entire point of this module: log write -> log flush ->
//! data write -> data flush -> log truncate. A crash at any point along that
//! chain leaves the image either fully pre- or fully post-transaction, never
//! in between. Grounded in the checkpoint/replay discipline of
//! `other_examples/.../fat32expander`'s crash-safe resize executor (CRC32'd
//! records, a `replay`-on-open pass) and in the phase vocabulary of
//! `other_examples/.../keos-project5-src-ffs-journal.rs` (begin/commit
//! markers, recovery on mount).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FatError, Result};
use crate::image_io::ImageIO;

const FLAG_STAGED: u8 = 0;
const FLAG_COMMIT: u8 = 1;

/// Identifies the currently open transaction. Only one can be open at a time
/// since `Volume` is single-threaded and owns the one `Journal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxId(u64);

struct StagedWrite {
    offset: u64,
    old_bytes: Vec<u8>,
    new_bytes: Vec<u8>,
}

/// Append-only log of pending writes, stored in a sibling `<image>.jrnl` file.
pub struct Journal {
    log_path: PathBuf,
    log: File,
    next_seq: u64,
    open_tx: Option<Vec<StagedWrite>>,
}

fn record_checksum(seq: u64, offset: u64, new_bytes: &[u8], old_bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(&offset.to_le_bytes());
    hasher.update(&(new_bytes.len() as u32).to_le_bytes());
    hasher.update(old_bytes);
    hasher.update(new_bytes);
    hasher.finalize()
}

fn write_record(log: &mut File, seq: u64, offset: u64, old_bytes: &[u8], new_bytes: &[u8]) -> Result<()> {
    debug_assert_eq!(old_bytes.len(), new_bytes.len());
    let checksum = record_checksum(seq, offset, new_bytes, old_bytes);
    let mut header = [0u8; 20];
    LittleEndian::write_u64(&mut header[0..8], seq);
    LittleEndian::write_u64(&mut header[8..16], offset);
    LittleEndian::write_u32(&mut header[16..20], new_bytes.len() as u32);
    log.write_all(&header)?;
    log.write_all(old_bytes)?;
    log.write_all(new_bytes)?;
    log.write_all(&checksum.to_le_bytes())?;
    log.write_all(&[FLAG_STAGED])?;
    Ok(())
}

fn write_commit_marker(log: &mut File, seq: u64) -> Result<()> {
    let checksum = record_checksum(seq, 0, &[], &[]);
    let mut header = [0u8; 20];
    LittleEndian::write_u64(&mut header[0..8], seq);
    // offset and length both zero for a commit marker.
    log.write_all(&header)?;
    log.write_all(&checksum.to_le_bytes())?;
    log.write_all(&[FLAG_COMMIT])?;
    Ok(())
}

struct ParsedRecord {
    #[allow(dead_code)]
    seq: u64,
    offset: u64,
    old_bytes: Vec<u8>,
    new_bytes: Vec<u8>,
    is_commit: bool,
}

/// Reads every well-formed record from `log`, validating checksums.
/// Stops (without error) at the first truncated or malformed trailing
/// record — that is an uncommitted tail left by a crash during `stage`.
fn read_all_records(log: &mut File) -> Result<Vec<ParsedRecord>> {
    log.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    log.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        if pos + 20 > buf.len() {
            break;
        }
        let seq = LittleEndian::read_u64(&buf[pos..pos + 8]);
        let offset = LittleEndian::read_u64(&buf[pos + 8..pos + 16]);
        let length = LittleEndian::read_u32(&buf[pos + 16..pos + 20]) as usize;
        let body_start = pos + 20;
        let body_len = if length == 0 { 0 } else { 2 * length };
        let tail_start = body_start + body_len;
        if tail_start + 5 > buf.len() {
            break;
        }
        let old_bytes = buf[body_start..body_start + length].to_vec();
        let new_bytes = buf[body_start + length..body_start + 2 * length].to_vec();
        let stored_checksum = LittleEndian::read_u32(&buf[tail_start..tail_start + 4]);
        let flag = buf[tail_start + 4];

        let computed = record_checksum(seq, offset, &new_bytes, &old_bytes);
        if computed != stored_checksum {
            return Err(FatError::CorruptJournal { sequence: seq });
        }

        records.push(ParsedRecord {
            seq,
            offset,
            old_bytes,
            new_bytes,
            is_commit: flag == FLAG_COMMIT,
        });
        pos = tail_start + 5;
    }
    Ok(records)
}

impl Journal {
    /// Opens (creating if absent) the journal sibling of `image_path` and
    /// replays any committed-but-unapplied transaction found in it. Must be
    /// called before any `begin`/`stage`/`commit` on this image.
    pub fn open_and_replay(image_path: &Path, image: &mut ImageIO) -> Result<Self> {
        let log_path = sibling_journal_path(image_path);
        let log = OpenOptions::new().read(true).write(true).create(true).open(&log_path)?;

        let mut journal = Journal { log_path, log, next_seq: 1, open_tx: None };
        journal.replay(image)?;
        journal.truncate_log()?;
        Ok(journal)
    }

    fn replay(&mut self, image: &mut ImageIO) -> Result<()> {
        let records = read_all_records(&mut self.log)?;
        // A committed transaction is a run of staged records terminated by a
        // commit marker. Only fully committed runs are replayed; any trailing
        // staged records with no following commit marker are a crash mid-`stage`
        // and must be discarded, not applied.
        let mut pending: Vec<&ParsedRecord> = Vec::new();
        let mut max_seq = 0u64;
        for record in &records {
            max_seq = max_seq.max(record.seq);
            if record.is_commit {
                for staged in pending.drain(..) {
                    image.write(staged.offset, &staged.new_bytes)?;
                }
            } else {
                pending.push(record);
            }
        }
        if !records.is_empty() {
            image.flush()?;
        }
        self.next_seq = max_seq + 1;
        Ok(())
    }

    fn truncate_log(&mut self) -> Result<()> {
        self.log.set_len(0)?;
        self.log.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Opens a transaction. The caller must `commit` or `abort` it before
    /// starting another.
    pub fn begin(&mut self) -> TxId {
        debug_assert!(self.open_tx.is_none(), "nested transactions are not supported");
        let id = TxId(self.next_seq);
        self.open_tx = Some(Vec::new());
        id
    }

    /// Stages a write of `new_bytes` at `offset`. `old_bytes` is captured
    /// now, from `image`, so replay/rollback always has the pre-image.
    pub fn stage(&mut self, tx: TxId, image: &mut ImageIO, offset: u64, new_bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(tx.0, self.next_seq, "stage called on a stale TxId");
        let old_bytes = image.read(offset, new_bytes.len())?;
        write_record(&mut self.log, self.next_seq, offset, &old_bytes, new_bytes)?;
        self.log.flush()?;
        let staged = self.open_tx.as_mut().expect("stage called without an open transaction");
        staged.push(StagedWrite { offset, old_bytes, new_bytes: new_bytes.to_vec() });
        Ok(())
    }

    /// Commits the transaction: commit marker -> log flush -> apply writes
    /// to the image -> image flush -> log truncate.
    pub fn commit(&mut self, tx: TxId, image: &mut ImageIO) -> Result<()> {
        debug_assert_eq!(tx.0, self.next_seq, "commit called on a stale TxId");
        let staged = self.open_tx.take().expect("commit called without an open transaction");
        write_commit_marker(&mut self.log, self.next_seq)?;
        self.log.flush()?;
        self.log.sync_data()?;
        for write in &staged {
            image.write(write.offset, &write.new_bytes)?;
        }
        image.flush()?;
        self.truncate_log()?;
        self.next_seq += 1;
        Ok(())
    }

    /// Discards the open transaction; nothing staged in it is applied.
    pub fn abort(&mut self, tx: TxId) -> Result<()> {
        debug_assert_eq!(tx.0, self.next_seq, "abort called on a stale TxId");
        self.open_tx = None;
        self.truncate_log()?;
        Ok(())
    }

    /// Flushes and closes out the journal at a clean shutdown; the log is
    /// empty since every transaction is committed or aborted before this runs.
    pub fn close(mut self) -> Result<()> {
        self.truncate_log()?;
        self.log.sync_all()?;
        Ok(())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn sibling_journal_path(image_path: &Path) -> PathBuf {
    let mut name = image_path.file_name().expect("image path has a file name").to_os_string();
    name.push(".jrnl");
    image_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_image(bytes: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = File::create(dir.path().join("vol.img")).unwrap();
        f.write_all(bytes).unwrap();
        dir
    }

    #[test]
    fn commit_applies_staged_writes_and_truncates_log() {
        let dir = temp_image(&[0u8; 16]);
        let image_path = dir.path().join("vol.img");
        let mut image = ImageIO::open(&image_path).unwrap();
        let mut journal = Journal::open_and_replay(&image_path, &mut image).unwrap();

        let tx = journal.begin();
        journal.stage(tx, &mut image, 4, b"beef").unwrap();
        journal.commit(tx, &mut image).unwrap();

        assert_eq!(image.read(4, 4).unwrap(), b"beef");
        assert_eq!(std::fs::metadata(journal.log_path()).unwrap().len(), 0);
    }

    #[test]
    fn replay_applies_a_committed_but_untruncated_transaction() {
        let dir = temp_image(&[0u8; 16]);
        let image_path = dir.path().join("vol.img");

        {
            let mut image = ImageIO::open(&image_path).unwrap();
            let mut log = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(sibling_journal_path(&image_path))
                .unwrap();
            let old = image.read(0, 4).unwrap();
            write_record(&mut log, 1, 0, &old, b"dead").unwrap();
            write_commit_marker(&mut log, 1).unwrap();
            // Simulate a crash: the commit marker made it to disk, but the log
            // was never truncated, and the data write never reached the image.
        }

        let mut image = ImageIO::open(&image_path).unwrap();
        let _journal = Journal::open_and_replay(&image_path, &mut image).unwrap();
        assert_eq!(image.read(0, 4).unwrap(), b"dead");
    }

    #[test]
    fn abort_discards_staged_writes() {
        let dir = temp_image(&[0u8; 16]);
        let image_path = dir.path().join("vol.img");
        let mut image = ImageIO::open(&image_path).unwrap();
        let mut journal = Journal::open_and_replay(&image_path, &mut image).unwrap();

        let tx = journal.begin();
        journal.stage(tx, &mut image, 4, b"beef").unwrap();
        journal.abort(tx).unwrap();

        assert_eq!(image.read(4, 4).unwrap(), [0u8; 4]);
    }
}
