//! Hub subscriptions: the handshake, its persistence, and push
//! authentication.

use super::client::HubClient;
use crate::error::{FeedError, Result};
use crate::signer::{verify_hub_signature, Signer};
use crate::types::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Magic bytes for subscription file.
const SUBSCRIPTIONS_MAGIC: &[u8; 4] = b"SUB\0";

/// Current subscription file format version.
const SUBSCRIPTIONS_VERSION: u8 = 1;

/// Secret name for verify tokens.
pub const VERIFY_KEY: &str = "hub_verify";

/// How long the hub has to call back with a verify token.
pub const VERIFY_TOKEN_LIFETIME: Duration = Duration::from_secs(600);

/// An intended hub subscription delivering `topic` into a local feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub feed_name: String,
    pub topic: String,
    pub created: Timestamp,
}

/// `hub.mode` of a subscription request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubMode::Subscribe => "subscribe",
            HubMode::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for HubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HubMode {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subscribe" => Ok(HubMode::Subscribe),
            "unsubscribe" => Ok(HubMode::Unsubscribe),
            other => Err(FeedError::InvalidOperation(format!("invalid hub mode: {other}"))),
        }
    }
}

/// A verification callback from the hub.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.topic")]
    pub topic: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
}

/// Persistent set of subscriptions, keyed by (feed, topic).
pub struct SubscriptionStore {
    path: PathBuf,
    subscriptions: RwLock<BTreeMap<(String, String), Subscription>>,
}

impl SubscriptionStore {
    /// Load from `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let subscriptions = if path.exists() {
            load(&path)?
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            subscriptions: RwLock::new(
                subscriptions
                    .into_iter()
                    .map(|s| ((s.feed_name.clone(), s.topic.clone()), s))
                    .collect(),
            ),
        })
    }

    /// Record a subscription. Re-subscribing keeps the original creation time.
    pub fn insert(&self, feed_name: &str, topic: &str) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions
            .entry((feed_name.to_string(), topic.to_string()))
            .or_insert_with(|| Subscription {
                feed_name: feed_name.to_string(),
                topic: topic.to_string(),
                created: Timestamp::now(),
            })
            .clone();
        self.save(&subscriptions)?;
        Ok(subscription)
    }

    /// Forget a subscription. Returns whether one existed.
    pub fn remove(&self, feed_name: &str, topic: &str) -> Result<bool> {
        let mut subscriptions = self.subscriptions.write();
        let removed = subscriptions
            .remove(&(feed_name.to_string(), topic.to_string()))
            .is_some();
        if removed {
            self.save(&subscriptions)?;
        }
        Ok(removed)
    }

    /// Subscriptions of one feed, ordered by topic.
    pub fn list(&self, feed_name: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .values()
            .filter(|s| s.feed_name == feed_name)
            .cloned()
            .collect()
    }

    /// Write to a temp file and rename over the old one.
    fn save(&self, subscriptions: &BTreeMap<(String, String), Subscription>) -> Result<()> {
        let all: Vec<&Subscription> = subscriptions.values().collect();
        let encoded = rmp_serde::to_vec(&all)?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(SUBSCRIPTIONS_MAGIC)?;
            file.write_all(&[SUBSCRIPTIONS_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn load(path: &Path) -> Result<Vec<Subscription>> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != SUBSCRIPTIONS_MAGIC {
        return Err(FeedError::InvalidFormat("Invalid subscriptions magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != SUBSCRIPTIONS_VERSION {
        return Err(FeedError::InvalidFormat(format!(
            "Unsupported subscriptions version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut encoded = Vec::new();
    file.read_to_end(&mut encoded)?;
    if encoded.len() != len + 4 {
        return Err(FeedError::Corruption("subscriptions file truncated".into()));
    }
    let checksum = encoded.split_off(len);
    let stored = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
    let computed = crc32fast::hash(&encoded);
    if stored != computed {
        return Err(FeedError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(rmp_serde::from_slice(&encoded)?)
}

/// Drives subscribe/unsubscribe handshakes with the hub.
pub struct SubscriptionManager {
    store: SubscriptionStore,
    signer: Signer,
    client: Arc<dyn HubClient>,
    hub_url: String,
    public_url: String,
    timeout: Duration,
}

impl SubscriptionManager {
    pub fn new(
        store: SubscriptionStore,
        signer: Signer,
        client: Arc<dyn HubClient>,
        hub_url: impl Into<String>,
        public_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            signer,
            client,
            hub_url: hub_url.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Where the hub should deliver pushes for `feed_name`.
    pub fn callback_url(&self, feed_name: &str) -> String {
        format!("{}/feeds/{}", self.public_url, feed_name)
    }

    /// Shared secret the hub signs pushes for `topic` with.
    pub fn topic_secret(&self, topic: &str) -> Result<String> {
        let secret = self
            .signer
            .secrets()
            .get_or_create(&format!("hub_secret:{topic}"))?;
        Ok(hex::encode(&secret[..]))
    }

    /// Ask the hub to (un)subscribe `feed_name` to `topic`.
    ///
    /// The hub verifies synchronously by calling back before it answers, so
    /// this waits for that round trip, up to the configured deadline. On a
    /// timeout nothing is recorded and the request can be repeated.
    pub async fn subscribe(&self, feed_name: &str, topic: &str, mode: HubMode) -> Result<()> {
        let callback = self.callback_url(feed_name);
        let verify_token = self
            .signer
            .sign(VERIFY_KEY, topic, Some(VERIFY_TOKEN_LIFETIME))?;
        let secret = self.topic_secret(topic)?;

        let mut params = vec![
            ("hub.callback", callback.as_str()),
            ("hub.mode", mode.as_str()),
            ("hub.topic", topic),
            ("hub.verify", "sync"),
            ("hub.verify_token", verify_token.as_str()),
        ];
        if mode == HubMode::Subscribe {
            params.push(("hub.secret", secret.as_str()));
        }

        let status = tokio::time::timeout(self.timeout, self.client.post_form(&self.hub_url, &params))
            .await
            .map_err(|_| FeedError::HubTimeout(self.timeout))??;

        if !(200..300).contains(&status) {
            tracing::warn!(feed = feed_name, topic, %mode, status, "hub refused subscription request");
            return Err(FeedError::HubRejected(status));
        }

        match mode {
            HubMode::Subscribe => {
                self.store.insert(feed_name, topic)?;
            }
            HubMode::Unsubscribe => {
                self.store.remove(feed_name, topic)?;
            }
        }
        tracing::info!(feed = feed_name, topic, %mode, "hub confirmed subscription change");
        Ok(())
    }

    /// Check a verification callback. Returns the challenge to echo, or
    /// `None` if the request was not one we asked for.
    pub fn verify_intent(&self, feed_name: &str, request: &VerifyRequest) -> Option<String> {
        let mode = request.mode.as_deref()?.parse::<HubMode>().ok()?;
        let topic = request.topic.as_deref()?;
        let token = request.verify_token.as_deref()?;
        let challenge = request.challenge.as_deref()?;

        if !self.signer.verify(VERIFY_KEY, topic, token) {
            tracing::warn!(feed = feed_name, topic, %mode, "rejected hub verification with bad token");
            return None;
        }

        tracing::info!(feed = feed_name, topic, %mode, "verified hub callback");
        Some(challenge.to_string())
    }

    /// Whether `signature` (the `X-Hub-Signature` header) authenticates a
    /// push body for any of the feed's subscriptions.
    pub fn authenticate_push(&self, feed_name: &str, body: &[u8], signature: Option<&str>) -> bool {
        let Some(signature) = signature else {
            return false;
        };

        self.store.list(feed_name).iter().any(|subscription| {
            match self.topic_secret(&subscription.topic) {
                Ok(secret) => verify_hub_signature(secret.as_bytes(), body, signature),
                Err(e) => {
                    tracing::warn!(topic = %subscription.topic, error = %e, "topic secret unavailable");
                    false
                }
            }
        })
    }

    /// Subscriptions of one feed, ordered by topic.
    pub fn list(&self, feed_name: &str) -> Vec<Subscription> {
        self.store.list(feed_name)
    }
}
