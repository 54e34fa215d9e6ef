//! Entry store tying the log and its indices together.

use crate::codec::xml;
use crate::entries::{EntryIndex, EntryLog};
use crate::error::{FeedError, Result};
use crate::types::{Entry, EntryId, EntryInput, Hash, Origin, Timestamp};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Entry cache size (number of entries).
    pub entry_cache_size: usize,

    /// Sync the log every N appends.
    pub sync_interval: u64,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./feedsync-data"),
            entry_cache_size: 1000,
            sync_interval: EntryLog::DEFAULT_SYNC_INTERVAL,
            create_if_missing: true,
        }
    }
}

/// Hard cap on entries returned by one range query.
pub const MAX_PAGE: usize = 100;

/// Number of lock stripes for clone identities.
const CLONE_LOCK_STRIPES: usize = 64;

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FSY\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Result of storing a clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Appended {
    /// A new entry was written.
    Created(Entry),
    /// The identity was already stored; nothing was written.
    Existing(Entry),
}

impl Appended {
    pub fn entry(&self) -> &Entry {
        match self {
            Appended::Created(e) | Appended::Existing(e) => e,
        }
    }

    pub fn into_entry(self) -> Entry {
        match self {
            Appended::Created(e) | Appended::Existing(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Appended::Created(_))
    }
}

/// Durable, append-only store of feed entries.
///
/// Writes are visible to every read that starts after the write returns.
/// Arrival order and visibility order are the same: an entry never becomes
/// readable before one that arrived earlier, so a reader that saw arrival
/// time `T` has seen everything at or before `T`.
pub struct EntryStore {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: EntryLog,

    index: EntryIndex,

    /// Recently read entries.
    cache: Mutex<LruCache<EntryId, Entry>>,

    /// Held across log append + index publish.
    write_lock: Mutex<()>,

    /// Held across the dedup check and write of one clone identity.
    clone_locks: Vec<Mutex<()>>,
}

impl EntryStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(FeedError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::open(config)
    }

    /// Open an existing store, rebuilding indices from the log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (log, recovered) =
            EntryLog::open_with_sync_interval(config.path.join("entries.log"), config.sync_interval)?;

        let index = EntryIndex::new();
        for (offset, entry) in &recovered {
            index.add(entry, *offset);
        }

        tracing::info!(
            path = %config.path.display(),
            entries = recovered.len(),
            "opened entry store"
        );

        let cache_size = NonZeroUsize::new(config.entry_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index,
            cache: Mutex::new(LruCache::new(cache_size)),
            write_lock: Mutex::new(()),
            clone_locks: (0..CLONE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Writes ---

    /// Append an entry, assigning its id and arrival time.
    ///
    /// Clone inputs go through the same dedup path as `append_clone`.
    pub fn append(&self, input: EntryInput) -> Result<Entry> {
        Ok(self.insert(input)?.into_entry())
    }

    /// Like `append`, but reports whether anything was written. Originals
    /// are always written.
    pub fn insert(&self, input: EntryInput) -> Result<Appended> {
        match input.origin.dedup_key(&input.feed_name) {
            Some(key) => self.insert_clone(key, input),
            None => Ok(Appended::Created(self.write(input)?)),
        }
    }

    /// Store a copy of a remote entry. If the same remote entry was already
    /// stored in this feed, the existing entry is returned unchanged.
    pub fn append_clone(
        &self,
        external_feed_id: &str,
        external_entry_id: &str,
        input: EntryInput,
    ) -> Result<Entry> {
        Ok(self
            .ingest_clone(external_feed_id, external_entry_id, input)?
            .into_entry())
    }

    /// Like `append_clone`, but reports whether anything was written.
    pub fn ingest_clone(
        &self,
        external_feed_id: &str,
        external_entry_id: &str,
        input: EntryInput,
    ) -> Result<Appended> {
        let input = input.cloned_from(external_feed_id, external_entry_id);
        let key = input
            .origin
            .dedup_key(&input.feed_name)
            .ok_or_else(|| FeedError::InvalidOperation("clone without identity".into()))?;
        self.insert_clone(key, input)
    }

    /// Insert-if-absent for one clone identity. Only writers of the same
    /// identity (or one sharing its stripe) wait on each other.
    fn insert_clone(&self, key: Hash, input: EntryInput) -> Result<Appended> {
        let _guard = self.clone_lock(&key).lock();

        if let Some(id) = self.index.clone_of(&key) {
            tracing::debug!(feed = %input.feed_name, entry_id = %id, "duplicate clone ignored");
            let existing = self.get(id)?.ok_or_else(|| FeedError::EntryNotFound(id.to_string()))?;
            return Ok(Appended::Existing(existing));
        }

        Ok(Appended::Created(self.write(input)?))
    }

    fn clone_lock(&self, key: &Hash) -> &Mutex<()> {
        let stripe = u64::from_le_bytes([
            key.0[0], key.0[1], key.0[2], key.0[3], key.0[4], key.0[5], key.0[6], key.0[7],
        ]);
        &self.clone_locks[(stripe % self.clone_locks.len() as u64) as usize]
    }

    fn write(&self, input: EntryInput) -> Result<Entry> {
        validate(&input)?;

        let _lock = self.write_lock.lock();
        let (entry, offset) = self.log.append(input)?;
        self.index.add(&entry, offset);
        self.cache.lock().put(entry.id, entry.clone());

        tracing::debug!(
            feed = %entry.feed_name,
            entry_id = %entry.id,
            arrived = %entry.arrived,
            clone = entry.origin.is_clone(),
            "stored entry"
        );

        Ok(entry)
    }

    // --- Reads ---

    /// Get an entry by ID.
    pub fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        if let Some(entry) = self.cache.lock().get(&id).cloned() {
            return Ok(Some(entry));
        }

        let Some(offset) = self.index.offset_of(id) else {
            return Ok(None);
        };
        let entry = self.log.read_at(offset)?;
        self.cache.lock().put(id, entry.clone());
        Ok(Some(entry))
    }

    /// Get an entry by ID, only if it belongs to `feed_name`.
    pub fn get_in_feed(&self, feed_name: &str, id: EntryId) -> Result<Option<Entry>> {
        if self.index.feed_of(id).as_deref() != Some(feed_name) {
            return Ok(None);
        }
        self.get(id)
    }

    /// Most recently observed entry about a subject.
    pub fn latest_observed(
        &self,
        feed_name: &str,
        type_name: &str,
        subject_id: &str,
    ) -> Result<Option<Entry>> {
        match self.index.latest_observed(feed_name, type_name, subject_id) {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    /// Entries of a feed in decreasing arrival order, optionally only those
    /// cloned from `external_feed_id` and only those that arrived strictly
    /// after `after_arrival`. At most `limit` (default and cap `MAX_PAGE`)
    /// entries are returned.
    pub fn latest_arrived(
        &self,
        feed_name: &str,
        external_feed_id: Option<&str>,
        after_arrival: Option<Timestamp>,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let limit = limit.unwrap_or(MAX_PAGE).min(MAX_PAGE);
        let slots = self
            .index
            .newest(feed_name, external_feed_id, after_arrival, limit);
        self.load(slots)
    }

    /// The oldest entries of a feed that arrived strictly after
    /// `after_arrival`, returned in decreasing arrival order.
    ///
    /// Unlike `latest_arrived`, a capped result never skips anything: every
    /// entry newer than the cursor but not returned arrived after all the
    /// returned ones.
    pub fn arrived_after(
        &self,
        feed_name: &str,
        after_arrival: Option<Timestamp>,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let limit = limit.unwrap_or(MAX_PAGE).min(MAX_PAGE);
        let mut slots = self.index.oldest_after(feed_name, after_arrival, limit);
        slots.reverse();
        self.load(slots)
    }

    fn load(&self, slots: Vec<(EntryId, u64)>) -> Result<Vec<Entry>> {
        slots
            .into_iter()
            .map(|(id, offset)| {
                if let Some(entry) = self.cache.lock().get(&id).cloned() {
                    return Ok(entry);
                }
                let entry = self.log.read_at(offset)?;
                self.cache.lock().put(id, entry.clone());
                Ok(entry)
            })
            .collect()
    }

    /// Number of entries in one feed.
    pub fn feed_len(&self, feed_name: &str) -> usize {
        self.index.feed_len(feed_name)
    }

    /// Total number of entries.
    pub fn count(&self) -> usize {
        self.index.count()
    }

    /// Flush the log to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    // --- Manifest and locking ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(FeedError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for EntryStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Reject inputs the store would refuse, without writing anything.
pub fn validate(input: &EntryInput) -> Result<()> {
    let required = [
        ("feed_name", &input.feed_name),
        ("type_name", &input.type_name),
        ("subject_id", &input.subject_id),
        ("author_uri", &input.author_uri),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(FeedError::InvalidEntry(format!("{field} must not be empty")));
        }
    }

    // Content is embedded in feed documents as-is; it must be one element of
    // the declared type and nothing else.
    let payload = xml::parse_fragment(&input.content)
        .map_err(|e| FeedError::InvalidEntry(format!("content is not a single element: {e}")))?;
    if payload.clark_name() != input.type_name {
        return Err(FeedError::InvalidEntry(format!(
            "content is {}, not {}",
            payload.clark_name(),
            input.type_name
        )));
    }
    if let Origin::Clone {
        external_feed_id,
        external_entry_id,
    } = &input.origin
    {
        if external_feed_id.is_empty() || external_entry_id.is_empty() {
            return Err(FeedError::InvalidEntry(
                "clone must name its external feed and entry".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> EntryStore {
        EntryStore::create(StoreConfig {
            path: dir.path().join("store"),
            entry_cache_size: 16,
            ..Default::default()
        })
        .unwrap()
    }

    fn report(subject: &str, observed: i64) -> EntryInput {
        EntryInput::new(
            "delta",
            "report",
            subject,
            "mailto:editor@example.com",
            Timestamp::from_secs(observed),
            "<report><status>open</status></report>",
        )
    }

    #[test]
    fn test_append_assigns_id_and_arrival() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let before = Timestamp::now();
        let entry = store.append(report("fac/1", 0)).unwrap();
        assert_eq!(entry.id, EntryId(1));
        assert!(entry.arrived >= before);
        assert_eq!(store.get(entry.id).unwrap(), Some(entry));
    }

    #[test]
    fn test_append_rejects_empty_subject() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let result = store.append(report("", 0));
        assert!(matches!(result, Err(FeedError::InvalidEntry(_))));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_append_rejects_content_that_is_not_its_type() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        for content in [
            "AT&T < 5",
            "",
            "<report/><report/>",
            "<report/></report:content></entry><entry><id>forged</id>",
            r#"<?xml version="1.0"?><report/>"#,
            r#"<report xmlns="urn:other"/>"#,
            "<status>open</status>",
        ] {
            let mut input = report("fac/1", 0);
            input.content = content.into();
            assert!(
                matches!(store.append(input), Err(FeedError::InvalidEntry(_))),
                "{content:?} should be rejected"
            );
        }
        assert_eq!(store.count(), 0);

        let mut input = report("fac/1", 0);
        input.type_name = "{urn:relief}report".into();
        input.content = r#"<r:report xmlns:r="urn:relief"/>"#.into();
        assert!(store.append(input).is_ok());
    }

    #[test]
    fn test_clone_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let first = store
            .ingest_clone("http://remote/feeds/delta", "http://remote/feeds/delta/1", report("fac/1", 0))
            .unwrap();
        assert!(first.is_created());

        let second = store
            .ingest_clone("http://remote/feeds/delta", "http://remote/feeds/delta/1", report("fac/1", 5))
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.entry(), first.entry());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_append_routes_clones_through_dedup() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let input = report("fac/1", 0).cloned_from("feed", "urn:entry:1");
        let a = store.append(input.clone()).unwrap();
        let b = store.append(input).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_same_remote_id_in_different_feeds() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut other = report("fac/1", 0);
        other.feed_name = "mirror".into();

        store.append_clone("feed", "urn:entry:1", report("fac/1", 0)).unwrap();
        store.append_clone("feed", "urn:entry:1", other).unwrap();
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_get_in_feed_checks_feed() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let entry = store.append(report("fac/1", 0)).unwrap();
        assert!(store.get_in_feed("delta", entry.id).unwrap().is_some());
        assert!(store.get_in_feed("other", entry.id).unwrap().is_none());
        assert!(store.get_in_feed("delta", EntryId(99)).unwrap().is_none());
    }

    #[test]
    fn test_latest_arrived_caps_page() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        for i in 0..120 {
            store.append(report(&format!("fac/{i}"), 0)).unwrap();
        }

        assert_eq!(store.latest_arrived("delta", None, None, None).unwrap().len(), MAX_PAGE);
        assert_eq!(store.latest_arrived("delta", None, None, Some(500)).unwrap().len(), MAX_PAGE);
        assert_eq!(store.latest_arrived("delta", None, None, Some(20)).unwrap().len(), 20);
    }

    #[test]
    fn test_arrived_after_pages_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let entries: Vec<Entry> = (0..5)
            .map(|i| store.append(report(&format!("fac/{i}"), 0)).unwrap())
            .collect();

        let page = store.arrived_after("delta", Some(entries[0].arrived), Some(2)).unwrap();
        let subjects: Vec<&str> = page.iter().map(|e| e.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["fac/2", "fac/1"]);
    }

    #[test]
    fn test_latest_observed() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.append(report("fac/1", 200)).unwrap();
        store.append(report("fac/1", 100)).unwrap();

        let latest = store.latest_observed("delta", "report", "fac/1").unwrap().unwrap();
        assert_eq!(latest.observed, Timestamp::from_secs(200));
    }

    #[test]
    fn test_reopen_rebuilds_indices() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        };

        let clone_id = {
            let store = EntryStore::create(config.clone()).unwrap();
            store.append(report("fac/1", 0)).unwrap();
            store.append_clone("feed", "urn:entry:1", report("fac/2", 0)).unwrap().id
        };

        let store = EntryStore::open(config).unwrap();
        assert_eq!(store.count(), 2);
        let again = store.append_clone("feed", "urn:entry:1", report("fac/2", 0)).unwrap();
        assert_eq!(again.id, clone_id);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_store_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let _store = test_store(&dir);

        let second = EntryStore::open(StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        });
        assert!(matches!(second, Err(FeedError::Locked)));
    }
}
