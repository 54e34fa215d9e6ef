//! Conditional feed reads with signed resume cursors.
//!
//! The ETag handed to a client is `"<arrival time>/<signature>"`: the arrival
//! time of the newest entry it was sent, signed so it cannot be advanced past
//! entries the client never saw. Presenting it in `If-None-Match` resumes the
//! feed after that point. The server keeps no per-client state.

use crate::codec::{encode_feed, FeedDocument};
use crate::error::Result;
use crate::signer::Signer;
use crate::store::EntryStore;
use crate::types::{Entry, Timestamp};
use std::sync::Arc;

/// Page size for clients without a valid cursor.
pub const FRESH_PAGE_LIMIT: usize = 20;

/// Secret name for ETag signatures.
pub const ETAG_KEY: &str = "etag";

/// Outcome of a conditional fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchResponse {
    /// 200 with a feed document. `etag` is absent only for an empty feed
    /// fetched without a cursor.
    Feed { body: String, etag: Option<String> },
    /// 304; nothing arrived after the presented cursor.
    NotModified { etag: String },
}

/// A verified resume cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub after: Timestamp,
    /// Normalized ETag header value, quotes included.
    pub etag: String,
}

/// Incremental fetch over one entry store.
pub struct IncrementalFetch {
    store: Arc<EntryStore>,
    signer: Signer,
    hub_url: Option<String>,
}

impl IncrementalFetch {
    pub fn new(store: Arc<EntryStore>, signer: Signer, hub_url: Option<String>) -> Self {
        Self {
            store,
            signer,
            hub_url,
        }
    }

    /// Answer a GET for `feed_name`, served at `feed_uri`.
    pub fn fetch(
        &self,
        feed_name: &str,
        feed_uri: &str,
        if_none_match: Option<&str>,
    ) -> Result<FetchResponse> {
        let cursor = if_none_match.and_then(|header| self.parse_etag(header));

        let entries = match &cursor {
            // Oldest first after the cursor, so a capped page never skips.
            Some(cursor) => self.store.arrived_after(feed_name, Some(cursor.after), None)?,
            None => self
                .store
                .latest_arrived(feed_name, None, None, Some(FRESH_PAGE_LIMIT))?,
        };

        tracing::debug!(
            feed = feed_name,
            resumed = cursor.is_some(),
            entries = entries.len(),
            "feed fetch"
        );

        if let Some(newest) = entries.iter().map(|e| e.arrived).max() {
            let body = self.encode(feed_uri, &entries)?;
            return Ok(FetchResponse::Feed {
                body,
                etag: Some(self.etag_for(newest)?),
            });
        }

        match cursor {
            Some(cursor) => Ok(FetchResponse::NotModified { etag: cursor.etag }),
            None => Ok(FetchResponse::Feed {
                body: self.encode(feed_uri, &[])?,
                etag: None,
            }),
        }
    }

    /// Verify an `If-None-Match` value. Anything that is not a valid cursor
    /// signed by this instance is ignored.
    pub fn parse_etag(&self, header: &str) -> Option<Cursor> {
        let value = header.trim();
        let value = value.strip_prefix("W/").unwrap_or(value);
        let value = value.trim_matches('"');

        let (timestamp, signature) = value.split_once('/')?;
        if !self.signer.verify(ETAG_KEY, timestamp, signature) {
            tracing::debug!("ignoring unverifiable etag");
            return None;
        }
        let after = Timestamp::from_rfc3339(timestamp).ok()?;

        Some(Cursor {
            after,
            etag: format!("\"{value}\""),
        })
    }

    /// Signed ETag naming `arrived` as the newest delivered entry.
    pub fn etag_for(&self, arrived: Timestamp) -> Result<String> {
        let timestamp = arrived.to_rfc3339();
        let signature = self.signer.sign(ETAG_KEY, &timestamp, None)?;
        Ok(format!("\"{timestamp}/{signature}\""))
    }

    fn encode(&self, feed_uri: &str, entries: &[Entry]) -> Result<String> {
        encode_feed(&FeedDocument {
            feed_uri,
            hub: self.hub_url.as_deref(),
            entries,
        })
    }
}
