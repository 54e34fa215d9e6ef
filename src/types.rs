//! Core types for feed replication.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Store-assigned identity of an entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 digest, used for clone identities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch, UTC.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_micros())
    }

    /// Whole seconds since the epoch.
    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    /// Parse an RFC 3339 timestamp. Offsets are normalized to UTC.
    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        let dt = DateTime::parse_from_rfc3339(s.trim())?;
        Ok(Timestamp(dt.with_timezone(&Utc).timestamp_micros()))
    }

    /// RFC 3339 with as much sub-second precision as the value carries.
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// RFC 3339 truncated to whole seconds.
    pub fn to_rfc3339_seconds(&self) -> String {
        self.truncate_to_secs()
            .to_datetime()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// RFC 1123 (HTTP date) form, e.g. `Fri, 01 Jan 2010 00:00:00 GMT`.
    pub fn to_rfc1123(&self) -> String {
        self.to_datetime()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }

    /// Drop sub-second precision.
    pub fn truncate_to_secs(&self) -> Self {
        Timestamp(self.0.div_euclid(1_000_000) * 1_000_000)
    }

    /// The next representable instant.
    pub fn next(self) -> Self {
        Timestamp(self.0 + 1)
    }

    fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.0).unwrap_or_default()
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// Where an entry was authored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Written on this instance.
    Original,
    /// Copied from a remote feed.
    Clone {
        external_feed_id: String,
        external_entry_id: String,
    },
}

impl Origin {
    /// Dedup identity of an entry in `feed_name` with this origin.
    /// Originals have none; every write of one is a new entry.
    pub fn dedup_key(&self, feed_name: &str) -> Option<Hash> {
        match self {
            Origin::Original => None,
            Origin::Clone {
                external_entry_id, ..
            } => Some(clone_key(feed_name, external_entry_id)),
        }
    }

    pub fn external_feed_id(&self) -> Option<&str> {
        match self {
            Origin::Original => None,
            Origin::Clone {
                external_feed_id, ..
            } => Some(external_feed_id),
        }
    }

    pub fn is_clone(&self) -> bool {
        matches!(self, Origin::Clone { .. })
    }
}

/// Identity of a cloned entry: a pure function of the local feed and the
/// remote entry id.
pub fn clone_key(feed_name: &str, external_entry_id: &str) -> Hash {
    let mut bytes = Vec::with_capacity(16 + feed_name.len() + external_entry_id.len());
    bytes.extend_from_slice(&(feed_name.len() as u64).to_le_bytes());
    bytes.extend_from_slice(feed_name.as_bytes());
    bytes.extend_from_slice(&(external_entry_id.len() as u64).to_le_bytes());
    bytes.extend_from_slice(external_entry_id.as_bytes());
    Hash::from_bytes(&bytes)
}

/// A single entry in a feed. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier (assigned by store).
    pub id: EntryId,

    /// Local feed this entry belongs to.
    pub feed_name: String,

    /// Payload type: the Clark name (`{namespace}local`) of the payload's
    /// root element.
    pub type_name: String,

    /// The thing this entry reports on.
    pub subject_id: String,

    pub title: String,

    /// Author identifier, typically a `mailto:` URI.
    pub author_uri: String,

    /// When the reported fact became true (author-supplied).
    pub observed: Timestamp,

    /// When the store wrote this entry (assigned by store).
    pub arrived: Timestamp,

    /// Serialized payload: exactly one XML element named by `type_name`.
    pub content: String,

    pub origin: Origin,
}

impl Entry {
    /// Atom id of this entry within the feed served at `feed_uri`.
    pub fn atom_id(&self, feed_uri: &str) -> String {
        match &self.origin {
            Origin::Original => format!("{}/{}", feed_uri, self.id),
            Origin::Clone {
                external_entry_id, ..
            } => external_entry_id.clone(),
        }
    }
}

/// Input for creating a new entry (before id/arrived assigned).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInput {
    pub feed_name: String,
    pub type_name: String,
    pub subject_id: String,
    pub title: String,
    pub author_uri: String,
    pub observed: Timestamp,
    pub content: String,
    pub origin: Origin,
}

impl EntryInput {
    /// Create an original entry input with an empty title.
    pub fn new(
        feed_name: impl Into<String>,
        type_name: impl Into<String>,
        subject_id: impl Into<String>,
        author_uri: impl Into<String>,
        observed: Timestamp,
        content: impl Into<String>,
    ) -> Self {
        Self {
            feed_name: feed_name.into(),
            type_name: type_name.into(),
            subject_id: subject_id.into(),
            title: String::new(),
            author_uri: author_uri.into(),
            observed,
            content: content.into(),
            origin: Origin::Original,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Mark this input as a copy of a remote entry.
    pub fn cloned_from(
        mut self,
        external_feed_id: impl Into<String>,
        external_entry_id: impl Into<String>,
    ) -> Self {
        self.origin = Origin::Clone {
            external_feed_id: external_feed_id.into(),
            external_entry_id: external_entry_id.into(),
        };
        self
    }
}

/// What a POST to a feed endpoint means for that feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRole {
    /// Accepts local writes and publishes them to the hub.
    Publisher,
    /// Receives hub pushes from subscribed remote feeds.
    Subscriber,
}

impl FromStr for FeedRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "publisher" => Ok(FeedRole::Publisher),
            "subscriber" => Ok(FeedRole::Subscriber),
            other => Err(format!("unknown feed role: {other}")),
        }
    }
}
