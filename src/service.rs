//! The replication layer assembled: one store, one signer, one hub.

use crate::codec::{decode_feed, encode_entry};
use crate::config::Config;
use crate::error::{FeedError, Result};
use crate::fetch::{FetchResponse, IncrementalFetch};
use crate::hub::{
    HubClient, HubMode, HubNotifier, NotifyQueue, Subscription, SubscriptionManager,
    SubscriptionStore, VerifyRequest,
};
use crate::secrets::{SecretCache, SecretStore};
use crate::signer::Signer;
use crate::store::{self, EntryStore, StoreConfig};
use crate::types::{Entry, EntryId, EntryInput, FeedRole};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What storing a batch of decoded entries did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub stored: usize,
    /// Clones that were already present.
    pub duplicates: usize,
    /// Entries dropped as our own, echoed back.
    pub skipped: usize,
}

/// Result of a hub push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted(IngestReport),
    /// Signature did not match any subscription; body ignored.
    Unauthenticated,
}

/// A single entry rendered for the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryDocument {
    pub entry: Entry,
    pub body: String,
}

/// Feed replication for one instance.
pub struct FeedService {
    public_url: String,
    feeds: BTreeMap<String, FeedRole>,
    store: Arc<EntryStore>,
    fetch: IncrementalFetch,
    notifier: Arc<HubNotifier>,
    subscriptions: SubscriptionManager,
}

impl FeedService {
    /// Open every component under `config.data_dir`.
    pub fn open(config: &Config, client: Arc<dyn HubClient>) -> Result<Self> {
        let store = Arc::new(EntryStore::open_or_create(StoreConfig {
            path: config.data_dir.join("entries"),
            ..Default::default()
        })?);

        let secrets = SecretStore::new(config.data_dir.join("secrets"))?;
        let signer = Signer::new(Arc::new(SecretCache::new(secrets)));

        let queue = NotifyQueue::open(config.data_dir.join("notify.queue"))?;
        let notifier = Arc::new(HubNotifier::new(
            config.hub_url.clone(),
            Arc::clone(&client),
            queue,
        ));

        let subscriptions = SubscriptionManager::new(
            SubscriptionStore::open(config.data_dir.join("subscriptions"))?,
            signer.clone(),
            client,
            config.hub_url.clone(),
            config.public_url.clone(),
            config.hub_timeout,
        );

        let fetch = IncrementalFetch::new(Arc::clone(&store), signer, Some(config.hub_url.clone()));

        tracing::info!(feeds = config.feeds.len(), entries = store.count(), "feed service ready");

        Ok(Self {
            public_url: config.public_url.trim_end_matches('/').to_string(),
            feeds: config.feeds.clone(),
            store,
            fetch,
            notifier,
            subscriptions,
        })
    }

    /// Configured role of a feed; unknown feeds are not found.
    pub fn role(&self, feed_name: &str) -> Result<FeedRole> {
        self.feeds
            .get(feed_name)
            .copied()
            .ok_or_else(|| FeedError::FeedNotFound(feed_name.to_string()))
    }

    /// URL a feed is served at; also its Atom id and hub topic.
    pub fn feed_uri(&self, feed_name: &str) -> String {
        format!("{}/feeds/{}", self.public_url, feed_name)
    }

    /// Conditional read of a feed.
    pub fn fetch(&self, feed_name: &str, if_none_match: Option<&str>) -> Result<FetchResponse> {
        self.role(feed_name)?;
        self.fetch
            .fetch(feed_name, &self.feed_uri(feed_name), if_none_match)
    }

    /// One entry of a feed. `id` is the last path segment of the entry URL.
    pub fn entry(&self, feed_name: &str, id: &str) -> Result<EntryDocument> {
        self.role(feed_name)?;
        let entry = match id.parse::<u64>() {
            Ok(raw) => self.store.get_in_feed(feed_name, EntryId(raw))?,
            Err(_) => None,
        }
        .ok_or_else(|| FeedError::EntryNotFound(id.to_string()))?;

        let body = encode_entry(&entry, &self.feed_uri(feed_name))?;
        Ok(EntryDocument { entry, body })
    }

    /// Append a locally authored entry and tell the hub.
    pub fn publish(&self, input: EntryInput) -> Result<Entry> {
        self.role(&input.feed_name)?;
        let entry = self.store.append(input)?;
        tracing::info!(feed = %entry.feed_name, entry_id = %entry.id, subject = %entry.subject_id, "published entry");
        self.announce(&entry.feed_name);
        Ok(entry)
    }

    /// Store every entry of an inbound feed document.
    ///
    /// Publisher feeds keep entries as originals. Subscriber feeds keep them
    /// as clones of the document's feed, skipping any this instance authored.
    /// Nothing is stored unless the whole document is valid.
    pub fn ingest(&self, feed_name: &str, body: &str, role: FeedRole) -> Result<IngestReport> {
        let local_prefix = format!("{}/", self.public_url);
        let decoded = match role {
            FeedRole::Publisher => decode_feed(body, None)?,
            FeedRole::Subscriber => decode_feed(body, Some(&local_prefix))?,
        };

        let source_feed = decoded.id.clone();
        let inputs: Vec<EntryInput> = decoded
            .entries
            .into_iter()
            .map(|entry| match role {
                FeedRole::Publisher => entry.into_original(feed_name),
                FeedRole::Subscriber => entry.into_clone(feed_name, &source_feed),
            })
            .collect();
        for input in &inputs {
            store::validate(input)?;
        }

        let mut report = IngestReport {
            skipped: decoded.skipped,
            ..Default::default()
        };
        for input in inputs {
            if self.store.insert(input)?.is_created() {
                report.stored += 1;
            } else {
                report.duplicates += 1;
            }
        }

        tracing::info!(
            feed = feed_name,
            source = %source_feed,
            stored = report.stored,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "ingested feed document"
        );

        if report.stored > 0 {
            self.announce(feed_name);
        }
        Ok(report)
    }

    /// Handle a push from the hub into a subscriber feed.
    pub fn receive_push(
        &self,
        feed_name: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<PushOutcome> {
        self.role(feed_name)?;

        if !self.subscriptions.authenticate_push(feed_name, body, signature) {
            tracing::warn!(feed = feed_name, bytes = body.len(), "dropping unauthenticated push");
            return Ok(PushOutcome::Unauthenticated);
        }

        let body = std::str::from_utf8(body)
            .map_err(|e| FeedError::Malformed(format!("push body is not UTF-8: {e}")))?;
        let report = self.ingest(feed_name, body, FeedRole::Subscriber)?;
        Ok(PushOutcome::Accepted(report))
    }

    /// Answer a hub verification callback.
    pub fn verify_intent(&self, feed_name: &str, request: &VerifyRequest) -> Result<Option<String>> {
        self.role(feed_name)?;
        Ok(self.subscriptions.verify_intent(feed_name, request))
    }

    /// Subscribe (or unsubscribe) a local feed to a remote topic.
    pub async fn subscribe(&self, feed_name: &str, topic: &str, mode: HubMode) -> Result<()> {
        self.role(feed_name)?;
        self.subscriptions.subscribe(feed_name, topic, mode).await
    }

    pub fn subscriptions(&self, feed_name: &str) -> Result<Vec<Subscription>> {
        self.role(feed_name)?;
        Ok(self.subscriptions.list(feed_name))
    }

    pub fn notifier(&self) -> Arc<HubNotifier> {
        Arc::clone(&self.notifier)
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Queue a hub notification. Failure is logged, never returned: the
    /// write that triggered it has already succeeded.
    fn announce(&self, feed_name: &str) {
        let feed_uri = self.feed_uri(feed_name);
        if let Err(e) = self.notifier.notify(&feed_uri) {
            tracing::error!(feed = feed_name, error = %e, "failed to queue hub notification");
        }
    }
}
