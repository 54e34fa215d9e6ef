//! In-memory entry indices, rebuilt from the log on open.

use crate::types::{Entry, EntryId, Hash, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Where an entry lives, plus the fields range queries filter on.
#[derive(Clone, Debug)]
struct Slot {
    offset: u64,
    feed_name: String,
    external_feed_id: Option<String>,
}

/// (feed_name, type_name, subject_id)
type SubjectKey = (String, String, String);

/// Latest observation known for a subject: (observed, arrived, id).
type Observation = (Timestamp, Timestamp, EntryId);

/// Indices over the entry log.
pub struct EntryIndex {
    /// Entry ID to location.
    slots: RwLock<HashMap<EntryId, Slot>>,

    /// Per feed: arrival time to entry. Arrival times are unique per store.
    by_arrival: RwLock<HashMap<String, BTreeMap<Timestamp, EntryId>>>,

    /// Clone identity to entry.
    clones: RwLock<HashMap<Hash, EntryId>>,

    /// Per subject: the entry with the latest observed time.
    latest_observed: RwLock<HashMap<SubjectKey, Observation>>,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            by_arrival: RwLock::new(HashMap::new()),
            clones: RwLock::new(HashMap::new()),
            latest_observed: RwLock::new(HashMap::new()),
        }
    }

    /// Add an entry to every index.
    ///
    /// The slot goes in first so an id found through any other index can
    /// always be resolved.
    pub fn add(&self, entry: &Entry, offset: u64) {
        self.slots.write().insert(
            entry.id,
            Slot {
                offset,
                feed_name: entry.feed_name.clone(),
                external_feed_id: entry.origin.external_feed_id().map(str::to_string),
            },
        );

        if let Some(key) = entry.origin.dedup_key(&entry.feed_name) {
            self.clones.write().entry(key).or_insert(entry.id);
        }

        let subject = (
            entry.feed_name.clone(),
            entry.type_name.clone(),
            entry.subject_id.clone(),
        );
        let candidate = (entry.observed, entry.arrived, entry.id);
        self.latest_observed
            .write()
            .entry(subject)
            .and_modify(|best| {
                if (candidate.0, candidate.1) > (best.0, best.1) {
                    *best = candidate;
                }
            })
            .or_insert(candidate);

        self.by_arrival
            .write()
            .entry(entry.feed_name.clone())
            .or_default()
            .insert(entry.arrived, entry.id);
    }

    /// Get offset for an entry ID.
    pub fn offset_of(&self, id: EntryId) -> Option<u64> {
        self.slots.read().get(&id).map(|s| s.offset)
    }

    /// Feed an entry belongs to.
    pub fn feed_of(&self, id: EntryId) -> Option<String> {
        self.slots.read().get(&id).map(|s| s.feed_name.clone())
    }

    /// Entry holding a clone identity, if one was stored.
    pub fn clone_of(&self, key: &Hash) -> Option<EntryId> {
        self.clones.read().get(key).copied()
    }

    /// Entry with the latest observed time for a subject.
    pub fn latest_observed(&self, feed_name: &str, type_name: &str, subject_id: &str) -> Option<EntryId> {
        let key = (
            feed_name.to_string(),
            type_name.to_string(),
            subject_id.to_string(),
        );
        self.latest_observed.read().get(&key).map(|(_, _, id)| *id)
    }

    /// Newest-first entries of a feed that arrived strictly after `after`,
    /// optionally restricted to one external feed.
    pub fn newest(
        &self,
        feed_name: &str,
        external_feed_id: Option<&str>,
        after: Option<Timestamp>,
        limit: usize,
    ) -> Vec<(EntryId, u64)> {
        let by_arrival = self.by_arrival.read();
        let Some(feed) = by_arrival.get(feed_name) else {
            return Vec::new();
        };
        let slots = self.slots.read();

        feed.range(lower_bound(after))
            .rev()
            .filter_map(|(_, id)| Some((*id, slots.get(id)?)))
            .filter(|(_, slot)| matches_external(slot, external_feed_id))
            .take(limit)
            .map(|(id, slot)| (id, slot.offset))
            .collect()
    }

    /// Oldest-first entries of a feed that arrived strictly after `after`.
    pub fn oldest_after(
        &self,
        feed_name: &str,
        after: Option<Timestamp>,
        limit: usize,
    ) -> Vec<(EntryId, u64)> {
        let by_arrival = self.by_arrival.read();
        let Some(feed) = by_arrival.get(feed_name) else {
            return Vec::new();
        };
        let slots = self.slots.read();

        feed.range(lower_bound(after))
            .filter_map(|(_, id)| Some((*id, slots.get(id)?.offset)))
            .take(limit)
            .collect()
    }

    /// Number of entries in a feed.
    pub fn feed_len(&self, feed_name: &str) -> usize {
        self.by_arrival
            .read()
            .get(feed_name)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Get count of entries.
    pub fn count(&self) -> usize {
        self.slots.read().len()
    }
}

impl Default for EntryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn lower_bound(after: Option<Timestamp>) -> (Bound<Timestamp>, Bound<Timestamp>) {
    match after {
        Some(t) => (Bound::Excluded(t), Bound::Unbounded),
        None => (Bound::Unbounded, Bound::Unbounded),
    }
}

fn matches_external(slot: &Slot, external_feed_id: Option<&str>) -> bool {
    match external_feed_id {
        None => true,
        Some(wanted) => slot.external_feed_id.as_deref() == Some(wanted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;

    fn entry(id: u64, feed: &str, subject: &str, observed: i64, arrived: i64) -> Entry {
        Entry {
            id: EntryId(id),
            feed_name: feed.into(),
            type_name: "report".into(),
            subject_id: subject.into(),
            title: String::new(),
            author_uri: "mailto:a@example.com".into(),
            observed: Timestamp::from_secs(observed),
            arrived: Timestamp::from_secs(arrived),
            content: String::new(),
            origin: Origin::Original,
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let index = EntryIndex::new();
        index.add(&entry(1, "delta", "fac/1", 10, 100), 0);

        assert_eq!(index.offset_of(EntryId(1)), Some(0));
        assert_eq!(index.feed_of(EntryId(1)).as_deref(), Some("delta"));
        assert_eq!(index.offset_of(EntryId(2)), None);
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_newest_is_descending_and_exclusive() {
        let index = EntryIndex::new();
        for i in 1..=5 {
            index.add(&entry(i, "delta", "fac/1", 0, 100 + i as i64), i * 10);
        }
        index.add(&entry(6, "other", "fac/1", 0, 200), 60);

        let all = index.newest("delta", None, None, 100);
        let ids: Vec<u64> = all.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);

        let after = index.newest("delta", None, Some(Timestamp::from_secs(103)), 100);
        let ids: Vec<u64> = after.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![5, 4]);

        let capped = index.newest("delta", None, None, 2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].0, EntryId(5));
    }

    #[test]
    fn test_oldest_after() {
        let index = EntryIndex::new();
        for i in 1..=5 {
            index.add(&entry(i, "delta", "fac/1", 0, 100 + i as i64), i * 10);
        }

        let page = index.oldest_after("delta", Some(Timestamp::from_secs(101)), 2);
        let ids: Vec<u64> = page.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_external_feed_filter() {
        let index = EntryIndex::new();
        index.add(&entry(1, "delta", "fac/1", 0, 101), 0);
        let mut clone = entry(2, "delta", "fac/1", 0, 102);
        clone.origin = Origin::Clone {
            external_feed_id: "http://remote/feeds/delta".into(),
            external_entry_id: "http://remote/feeds/delta/9".into(),
        };
        index.add(&clone, 10);

        let remote = index.newest("delta", Some("http://remote/feeds/delta"), None, 100);
        assert_eq!(remote, vec![(EntryId(2), 10)]);
        assert_eq!(index.clone_of(&clone.origin.dedup_key("delta").unwrap()), Some(EntryId(2)));
    }

    #[test]
    fn test_latest_observed_prefers_observed_then_arrival() {
        let index = EntryIndex::new();
        index.add(&entry(1, "delta", "fac/1", 50, 101), 0);
        index.add(&entry(2, "delta", "fac/1", 40, 102), 10);
        assert_eq!(index.latest_observed("delta", "report", "fac/1"), Some(EntryId(1)));

        // Same observed time: the later arrival wins.
        index.add(&entry(3, "delta", "fac/1", 50, 103), 20);
        assert_eq!(index.latest_observed("delta", "report", "fac/1"), Some(EntryId(3)));

        assert_eq!(index.latest_observed("delta", "report", "fac/2"), None);
    }
}
