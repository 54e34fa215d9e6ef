//! PubSubHubbub integration.
//!
//! Outbound: publish notifications, delivered from a durable queue with
//! backoff, and subscription handshakes in the hub's synchronous
//! verification mode. Inbound: verification callbacks and signed pushes.

mod client;
mod notifier;
mod queue;
mod subscriptions;

pub use client::{HttpHubClient, HubClient};
pub use notifier::{backoff, DeliveryReport, HubNotifier, INITIAL_BACKOFF, MAX_BACKOFF};
pub use queue::{NotifyQueue, NotifyTask};
pub use subscriptions::{
    HubMode, Subscription, SubscriptionManager, SubscriptionStore, VerifyRequest, VERIFY_KEY,
    VERIFY_TOKEN_LIFETIME,
};
