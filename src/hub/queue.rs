//! Durable queue of hub notifications.
//!
//! Write-ahead style: enqueueing appends a `Pending` record, delivery appends
//! a `Delivered` marker for the same sequence number. Whatever is pending
//! when the process stops is pending again after restart. Once nothing is
//! pending the file is reset to just its header.
//!
//! A task handed to the hub is in flight until completed or released; new
//! notifications never coalesce into it.

use crate::error::{FeedError, Result};
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for queue file.
const QUEUE_MAGIC: &[u8; 4] = b"NTQ\0";

/// Current queue format version.
const QUEUE_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Sanity bound on a single record.
const MAX_RECORD_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum RecordStatus {
    Pending,
    Delivered,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueueRecord {
    seq: u64,
    status: RecordStatus,
    /// Empty on `Delivered` markers.
    feed_uri: String,
    created: Timestamp,
}

/// A notification waiting for delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyTask {
    pub seq: u64,
    pub feed_uri: String,
    pub created: Timestamp,
}

struct QueueState {
    file: File,
    next_seq: u64,
    pending: BTreeMap<u64, NotifyTask>,
    /// Not persisted; after a restart nothing is in flight.
    in_flight: BTreeSet<u64>,
}

/// Durable, checksummed notification queue.
pub struct NotifyQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
}

impl NotifyQueue {
    /// Create or open a queue file, recovering pending tasks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (pending, next_seq) = if file.metadata()?.len() == 0 {
            write_header(&mut file)?;
            (BTreeMap::new(), 1)
        } else {
            Self::recover(&path, &mut file)?
        };

        if !pending.is_empty() {
            tracing::info!(pending = pending.len(), "recovered hub notifications");
        }

        Ok(Self {
            path,
            state: Mutex::new(QueueState {
                file,
                next_seq,
                pending,
                in_flight: BTreeSet::new(),
            }),
        })
    }

    fn recover(path: &Path, file: &mut File) -> Result<(BTreeMap<u64, NotifyTask>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != QUEUE_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid queue magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != QUEUE_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported queue version: {}",
                version[0]
            )));
        }

        let mut pending = BTreeMap::new();
        let mut max_seq = 0u64;
        let mut valid_len = HEADER_LEN;

        while let Ok((record, len)) = read_record(&mut reader) {
            valid_len += len;
            max_seq = max_seq.max(record.seq);
            match record.status {
                RecordStatus::Pending => {
                    pending.insert(
                        record.seq,
                        NotifyTask {
                            seq: record.seq,
                            feed_uri: record.feed_uri,
                            created: record.created,
                        },
                    );
                }
                RecordStatus::Delivered => {
                    pending.remove(&record.seq);
                }
            }
        }
        drop(reader);

        if valid_len < file.metadata()?.len() {
            tracing::warn!(path = %path.display(), valid_len, "truncating torn tail of notify queue");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok((pending, max_seq + 1))
    }

    /// Queue a notification for `feed_uri`.
    ///
    /// If one for the same feed is already pending and not in flight, no new
    /// task is added and the pending task's sequence number is returned.
    pub fn enqueue(&self, feed_uri: &str) -> Result<u64> {
        let mut state = self.state.lock();

        if let Some(task) = state
            .pending
            .values()
            .find(|t| t.feed_uri == feed_uri && !state.in_flight.contains(&t.seq))
        {
            return Ok(task.seq);
        }

        let record = QueueRecord {
            seq: state.next_seq,
            status: RecordStatus::Pending,
            feed_uri: feed_uri.to_string(),
            created: Timestamp::now(),
        };
        append_record(&mut state.file, &record)?;

        state.next_seq += 1;
        state.pending.insert(
            record.seq,
            NotifyTask {
                seq: record.seq,
                feed_uri: record.feed_uri,
                created: record.created,
            },
        );
        Ok(record.seq)
    }

    /// Mark a task delivered (or abandoned). Unknown sequence numbers are
    /// ignored.
    pub fn complete(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.pending.contains_key(&seq) {
            return Ok(());
        }

        if state.pending.len() == 1 {
            // Last one out: reset the file instead of appending a marker.
            state.file.set_len(0)?;
            write_header(&mut state.file)?;
        } else {
            append_record(
                &mut state.file,
                &QueueRecord {
                    seq,
                    status: RecordStatus::Delivered,
                    feed_uri: String::new(),
                    created: Timestamp::now(),
                },
            )?;
        }

        state.pending.remove(&seq);
        state.in_flight.remove(&seq);
        Ok(())
    }

    /// Claim a pending task for delivery. False if it is no longer pending
    /// or another delivery already holds it.
    pub fn begin(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        state.pending.contains_key(&seq) && state.in_flight.insert(seq)
    }

    /// Hand an undelivered task back; it coalesces new notifications again.
    pub fn release(&self, seq: u64) {
        self.state.lock().in_flight.remove(&seq);
    }

    /// Pending tasks, oldest first.
    pub fn pending(&self) -> Vec<NotifyTask> {
        self.state.lock().pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(QUEUE_MAGIC)?;
    file.write_all(&[QUEUE_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn append_record(file: &mut File, record: &QueueRecord) -> Result<()> {
    let encoded = rmp_serde::to_vec(record)?;

    let mut frame = Vec::with_capacity(encoded.len() + 8);
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

    let end = file.seek(SeekFrom::End(0))?;
    if let Err(e) = file.write_all(&frame).and_then(|_| file.sync_data()) {
        let _ = file.set_len(end);
        return Err(e.into());
    }
    Ok(())
}

fn read_record(reader: &mut impl Read) -> Result<(QueueRecord, u64)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_RECORD_LEN {
        return Err(FeedError::Corruption("queue record too large".into()));
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&encoded);
    if stored != computed {
        return Err(FeedError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let record = rmp_serde::from_slice(&encoded)?;
    Ok((record, (len + 8) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_enqueue_and_complete() {
        let dir = TempDir::new().unwrap();
        let queue = NotifyQueue::open(dir.path().join("notify.queue")).unwrap();

        let a = queue.enqueue("http://a/feeds/delta").unwrap();
        let b = queue.enqueue("http://a/feeds/other").unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.len(), 2);

        queue.complete(a).unwrap();
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].feed_uri, "http://a/feeds/other");

        queue.complete(b).unwrap();
        assert!(queue.is_empty());
        // Compacted down to the header.
        assert_eq!(std::fs::metadata(queue.path()).unwrap().len(), HEADER_LEN);
    }

    #[test]
    fn test_duplicate_feed_coalesced() {
        let dir = TempDir::new().unwrap();
        let queue = NotifyQueue::open(dir.path().join("notify.queue")).unwrap();

        let first = queue.enqueue("http://a/feeds/delta").unwrap();
        assert_eq!(queue.enqueue("http://a/feeds/delta").unwrap(), first);
        assert_eq!(queue.len(), 1);

        queue.complete(first).unwrap();
        assert_ne!(queue.enqueue("http://a/feeds/delta").unwrap(), first);
    }

    #[test]
    fn test_in_flight_task_not_coalesced() {
        let dir = TempDir::new().unwrap();
        let queue = NotifyQueue::open(dir.path().join("notify.queue")).unwrap();
        let uri = "http://a/feeds/delta";

        let first = queue.enqueue(uri).unwrap();
        assert!(queue.begin(first));
        assert!(!queue.begin(first));

        // Content changed after the hub was handed `first`.
        let second = queue.enqueue(uri).unwrap();
        assert_ne!(second, first);
        assert_eq!(queue.enqueue(uri).unwrap(), second);
        assert_eq!(queue.len(), 2);

        queue.complete(first).unwrap();
        let pending: Vec<u64> = queue.pending().into_iter().map(|t| t.seq).collect();
        assert_eq!(pending, vec![second]);

        assert!(queue.begin(second));
        queue.release(second);
        assert_eq!(queue.enqueue(uri).unwrap(), second);
        assert!(!queue.begin(first));
    }

    #[test]
    fn test_pending_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.queue");

        {
            let queue = NotifyQueue::open(&path).unwrap();
            let a = queue.enqueue("http://a/feeds/one").unwrap();
            queue.enqueue("http://a/feeds/two").unwrap();
            queue.enqueue("http://a/feeds/three").unwrap();
            queue.complete(a).unwrap();
        }

        let queue = NotifyQueue::open(&path).unwrap();
        let uris: Vec<String> = queue.pending().into_iter().map(|t| t.feed_uri).collect();
        assert_eq!(uris, vec!["http://a/feeds/two", "http://a/feeds/three"]);

        let next = queue.enqueue("http://a/feeds/four").unwrap();
        assert_eq!(next, 4);
    }

    #[test]
    fn test_torn_tail_recovered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.queue");

        {
            let queue = NotifyQueue::open(&path).unwrap();
            queue.enqueue("http://a/feeds/one").unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        let queue = NotifyQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        queue.enqueue("http://a/feeds/two").unwrap();
        drop(queue);
        assert_eq!(NotifyQueue::open(&path).unwrap().len(), 2);
    }
}
