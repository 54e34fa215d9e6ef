//! Append-only entry log.
//!
//! Each entry is one frame:
//!
//! ```text
//! magic(4) | version(1) | len(4, LE) | MessagePack body(len) | crc32(4, LE)
//! ```
//!
//! The log assigns ids and arrival times itself, under its write lock, so
//! file order, id order and arrival order always agree.

use crate::error::{FeedError, Result};
use crate::types::{Entry, EntryId, EntryInput, Timestamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for entry frames.
const FRAME_MAGIC: &[u8; 4] = b"ENT\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// Fixed bytes around the body: magic + version + len + crc.
const FRAME_OVERHEAD: u64 = 4 + 1 + 4 + 4;

/// Upper bound on a single encoded entry.
const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

/// Mutable write-side state, guarded by one lock.
struct WriteState {
    file: File,
    /// Offset where the next frame goes.
    size: u64,
    next_id: u64,
    last_arrived: Timestamp,
    writes_since_sync: u64,
}

/// Append-only entry log.
pub struct EntryLog {
    path: PathBuf,

    writer: Mutex<WriteState>,

    /// Separate handle so reads never wait on appends.
    reader: Mutex<File>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl EntryLog {
    /// Entries are the system of record, so by default every append is synced.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a log with the default sync interval.
    ///
    /// Returns the log plus every entry recovered from it, in write order.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<(u64, Entry)>)> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log with a custom sync interval
    /// (0 or 1 = sync every write).
    ///
    /// A torn or corrupt tail left by a crash mid-append is cut off so new
    /// frames start on a clean boundary.
    pub fn open_with_sync_interval(
        path: impl AsRef<Path>,
        sync_interval: u64,
    ) -> Result<(Self, Vec<(u64, Entry)>)> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (entries, valid_len) = Self::scan(&file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn tail of entry log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let next_id = entries.iter().map(|(_, e)| e.id.0).max().unwrap_or(0) + 1;
        let last_arrived = entries
            .iter()
            .map(|(_, e)| e.arrived)
            .max()
            .unwrap_or_default();

        let reader = File::open(&path)?;

        let log = Self {
            path,
            writer: Mutex::new(WriteState {
                file,
                size: valid_len,
                next_id,
                last_arrived,
                writes_since_sync: 0,
            }),
            reader: Mutex::new(reader),
            sync_interval: sync_interval.max(1),
        };

        Ok((log, entries))
    }

    /// Append an entry, assigning its id and arrival time.
    ///
    /// Arrival times are strictly increasing: if the clock has not moved past
    /// the previous arrival (same tick, or stepped backwards), the new entry
    /// arrives one microsecond after it.
    ///
    /// Returns the entry and the offset where it was written.
    pub fn append(&self, input: EntryInput) -> Result<(Entry, u64)> {
        let mut state = self.writer.lock();

        let now = Timestamp::now();
        let arrived = if now > state.last_arrived {
            now
        } else {
            state.last_arrived.next()
        };

        let entry = Entry {
            id: EntryId(state.next_id),
            feed_name: input.feed_name,
            type_name: input.type_name,
            subject_id: input.subject_id,
            title: input.title,
            author_uri: input.author_uri,
            observed: input.observed,
            arrived,
            content: input.content,
            origin: input.origin,
        };

        let frame = encode_frame(&entry)?;
        let offset = state.size;

        if let Err(e) = Self::write_frame(&mut state.file, offset, &frame) {
            // Leave no partial frame behind for the next append to trip on.
            let _ = state.file.set_len(offset);
            return Err(e);
        }

        state.size = offset + frame.len() as u64;
        state.next_id += 1;
        state.last_arrived = arrived;

        state.writes_since_sync += 1;
        if state.writes_since_sync >= self.sync_interval {
            state.file.sync_data()?;
            state.writes_since_sync = 0;
        }

        Ok((entry, offset))
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.writer.lock();
        state.file.sync_all()?;
        state.writes_since_sync = 0;
        Ok(())
    }

    /// Read the entry at a given offset.
    pub fn read_at(&self, offset: u64) -> Result<Entry> {
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let (entry, _) = read_frame(&mut *file)?;
        Ok(entry)
    }

    /// Get current file size.
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(file: &mut File, offset: u64, frame: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(frame)?;
        Ok(())
    }

    /// Read frames from the start until the end of the file or the first
    /// frame that fails to decode. Returns the decoded entries and the length
    /// of the valid prefix.
    fn scan(file: &File) -> Result<(Vec<(u64, Entry)>, u64)> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut offset = 0u64;

        while offset < file_len {
            match read_frame(&mut reader) {
                Ok((entry, frame_len)) => {
                    entries.push((offset, entry));
                    offset += frame_len;
                }
                Err(e) => {
                    tracing::warn!(offset, error = %e, "stopping entry log scan");
                    break;
                }
            }
        }

        Ok((entries, offset))
    }
}

fn encode_frame(entry: &Entry) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(entry)?;
    if body.len() > MAX_FRAME_BODY {
        return Err(FeedError::InvalidEntry(format!(
            "encoded entry is {} bytes, limit is {}",
            body.len(),
            MAX_FRAME_BODY
        )));
    }

    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Read one frame, returning the entry and the frame's total length.
fn read_frame(reader: &mut impl Read) -> Result<(Entry, u64)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != FRAME_MAGIC {
        return Err(FeedError::InvalidFormat("Invalid entry frame magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != FRAME_VERSION {
        return Err(FeedError::InvalidFormat(format!(
            "Unsupported entry frame version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BODY {
        return Err(FeedError::Corruption("entry frame too large".into()));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(FeedError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let entry = rmp_serde::from_slice(&body)?;
    Ok((entry, FRAME_OVERHEAD + len as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn input(subject: &str) -> EntryInput {
        EntryInput::new(
            "delta",
            "report",
            subject,
            "mailto:editor@example.com",
            Timestamp::from_secs(1_262_304_000),
            "<report><status>open</status></report>",
        )
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let (log, recovered) = EntryLog::open(dir.path().join("entries.log")).unwrap();
        assert!(recovered.is_empty());

        let (entry, offset) = log.append(input("fac/1")).unwrap();
        assert_eq!(entry.id, EntryId(1));
        assert_eq!(offset, 0);

        let read = log.read_at(offset).unwrap();
        assert_eq!(read, entry);
    }

    #[test]
    fn test_arrival_strictly_increasing() {
        let dir = TempDir::new().unwrap();
        let (log, _) = EntryLog::open(dir.path().join("entries.log")).unwrap();

        let mut last = Timestamp::default();
        for i in 0..50 {
            let (entry, _) = log.append(input(&format!("fac/{i}"))).unwrap();
            assert!(entry.arrived > last);
            last = entry.arrived;
        }
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.log");

        let last_arrived = {
            let (log, _) = EntryLog::open(&path).unwrap();
            let mut last = Timestamp::default();
            for i in 1..=5 {
                last = log.append(input(&format!("fac/{i}"))).unwrap().0.arrived;
            }
            last
        };

        let (log, recovered) = EntryLog::open(&path).unwrap();
        assert_eq!(recovered.len(), 5);
        assert_eq!(recovered[4].1.subject_id, "fac/5");

        // Ids and arrival times continue from what was on disk.
        let (entry, _) = log.append(input("fac/6")).unwrap();
        assert_eq!(entry.id, EntryId(6));
        assert!(entry.arrived > last_arrived);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.log");

        let good_len = {
            let (log, _) = EntryLog::open(&path).unwrap();
            log.append(input("fac/1")).unwrap();
            log.append(input("fac/2")).unwrap();
            log.size()
        };

        // Simulate a crash halfway through a third frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"ENT\0\x01\xff\x00").unwrap();
        }

        let (log, recovered) = EntryLog::open(&path).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(log.size(), good_len);

        let (entry, offset) = log.append(input("fac/3")).unwrap();
        assert_eq!(offset, good_len);
        assert_eq!(log.read_at(offset).unwrap(), entry);
    }

    #[test]
    fn test_corrupt_frame_stops_recovery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.log");

        let second_offset = {
            let (log, _) = EntryLog::open(&path).unwrap();
            log.append(input("fac/1")).unwrap();
            let (_, offset) = log.append(input("fac/2")).unwrap();
            offset
        };

        // Flip a byte inside the second frame's body.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(second_offset + 12)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::Start(second_offset + 12)).unwrap();
            file.write_all(&[byte[0] ^ 0xff]).unwrap();
        }

        let (_, recovered) = EntryLog::open(&path).unwrap();
        assert_eq!(recovered.len(), 1);
    }
}
