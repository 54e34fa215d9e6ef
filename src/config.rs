//! Server configuration.

use crate::types::FeedRole;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Hub used when none is configured.
pub const DEFAULT_HUB_URL: &str = "https://pubsubhubbub.appspot.com";

/// Configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_addr: String,

    /// Directory holding the entry store, secrets, queue and subscriptions.
    pub data_dir: PathBuf,

    /// Externally visible base URL of this instance, without trailing slash.
    pub public_url: String,

    pub hub_url: String,

    /// Feeds served here and what a POST to each means.
    pub feeds: BTreeMap<String, FeedRole>,

    /// Deadline for synchronous hub requests.
    pub hub_timeout: Duration,

    /// Bearer token for the subscription admin routes. Admin routes are
    /// disabled when unset.
    pub admin_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `FEEDSYNC_PUBLIC_URL`: Base URL this instance is reachable at
    /// - `FEEDSYNC_FEEDS`: Comma-separated `name=publisher|subscriber` list
    ///
    /// Optional environment variables:
    /// - `FEEDSYNC_BIND_ADDR`: Server bind address (default: "0.0.0.0:8080")
    /// - `FEEDSYNC_DATA_DIR`: Data directory (default: "./feedsync-data")
    /// - `FEEDSYNC_HUB_URL`: Hub URL (default: the public Google hub)
    /// - `FEEDSYNC_HUB_TIMEOUT_SECS`: Hub request deadline (default: 10)
    /// - `FEEDSYNC_ADMIN_TOKEN`: Enables `/pubsub/{feed}` admin routes
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("FEEDSYNC_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let data_dir = std::env::var("FEEDSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./feedsync-data"));

        let public_url = std::env::var("FEEDSYNC_PUBLIC_URL")
            .map_err(|_| anyhow::anyhow!("FEEDSYNC_PUBLIC_URL environment variable is required"))?;
        let public_url = public_url.trim().trim_end_matches('/').to_string();
        if !(public_url.starts_with("http://") || public_url.starts_with("https://")) {
            anyhow::bail!("FEEDSYNC_PUBLIC_URL must be an http(s) URL");
        }

        let hub_url =
            std::env::var("FEEDSYNC_HUB_URL").unwrap_or_else(|_| DEFAULT_HUB_URL.to_string());

        let feeds_str = std::env::var("FEEDSYNC_FEEDS")
            .map_err(|_| anyhow::anyhow!("FEEDSYNC_FEEDS environment variable is required"))?;
        let feeds = parse_feeds(&feeds_str)?;

        let hub_timeout = match std::env::var("FEEDSYNC_HUB_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("FEEDSYNC_HUB_TIMEOUT_SECS: {e}"))?,
            ),
            Err(_) => Duration::from_secs(10),
        };

        let admin_token = std::env::var("FEEDSYNC_ADMIN_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        tracing::info!(
            bind_addr = %bind_addr,
            data_dir = %data_dir.display(),
            public_url = %public_url,
            hub_url = %hub_url,
            feeds = feeds.len(),
            admin = admin_token.is_some(),
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            data_dir,
            public_url,
            hub_url,
            feeds,
            hub_timeout,
            admin_token,
        })
    }

    /// URL a feed is served at.
    pub fn feed_uri(&self, feed_name: &str) -> String {
        format!("{}/feeds/{}", self.public_url, feed_name)
    }
}

/// Parse `name=role,name=role`.
pub fn parse_feeds(s: &str) -> anyhow::Result<BTreeMap<String, FeedRole>> {
    let mut feeds = BTreeMap::new();
    for item in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, role) = item
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("feed {item:?} must be name=publisher|subscriber"))?;
        let name = name.trim();
        if name.is_empty() || name.contains('/') {
            anyhow::bail!("invalid feed name: {name:?}");
        }
        let role: FeedRole = role.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        if feeds.insert(name.to_string(), role).is_some() {
            anyhow::bail!("feed {name} configured twice");
        }
    }
    if feeds.is_empty() {
        anyhow::bail!("FEEDSYNC_FEEDS must name at least one feed");
    }
    Ok(feeds)
}
