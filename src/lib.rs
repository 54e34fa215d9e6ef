//! # feedsync
//!
//! Feed-based replication for facility-status trackers. Each instance keeps
//! its observations as entries in named feeds, serves those feeds as Atom,
//! and follows remote feeds through a PubSubHubbub hub.
//!
//! ## Core Concepts
//!
//! - **Entries**: Append-only log of observations, either authored here
//!   (originals) or copied from a remote feed (clones, deduplicated)
//! - **Incremental fetch**: Signed ETags let a client resume a feed where it
//!   left off, with no per-client state on the server
//! - **Hub**: Publish notifications from a durable queue; subscriptions
//!   verified synchronously; pushes authenticated per topic
//!
//! ## Example
//!
//! ```ignore
//! use feedsync::{EntryInput, EntryStore, StoreConfig, Timestamp};
//!
//! let store = EntryStore::open_or_create(StoreConfig {
//!     path: "./entries".into(),
//!     ..Default::default()
//! })?;
//!
//! let entry = store.append(EntryInput::new(
//!     "delta",
//!     "{urn:relief}status",
//!     "facility/hospital-7",
//!     "mailto:nurse@example.org",
//!     Timestamp::now(),
//!     r#"<status xmlns="urn:relief"><beds>12</beds></status>"#,
//! ))?;
//! ```

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod entries;
pub mod error;
pub mod fetch;
pub mod hub;
pub mod secrets;
pub mod service;
pub mod signer;
pub mod store;
pub mod types;

// Re-exports
pub use config::Config;
pub use endpoint::{router, AppState};
pub use error::{FeedError, Result};
pub use fetch::{FetchResponse, IncrementalFetch};
pub use hub::{HttpHubClient, HubClient, HubMode, HubNotifier, SubscriptionManager};
pub use secrets::{SecretCache, SecretStore};
pub use service::{FeedService, IngestReport, PushOutcome};
pub use signer::Signer;
pub use store::{Appended, EntryStore, StoreConfig};
pub use types::{Entry, EntryId, EntryInput, FeedRole, Origin, Timestamp};
