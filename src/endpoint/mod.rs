//! HTTP surface.
//!
//! # Route Structure
//!
//! ## Public
//! - `GET /health` - Liveness probe
//! - `GET /feeds/{name}` - Conditional feed fetch, or hub verification when
//!   `hub.mode` is in the query
//! - `POST /feeds/{name}` - Hub push (subscriber feeds) or local append
//!   (publisher feeds; bearer token required when one is configured)
//! - `GET /feeds/{name}/{id}` - Single entry
//!
//! ## Admin (bearer token, only when configured)
//! - `GET /pubsub/{name}` - Subscriptions of a feed
//! - `POST /pubsub/{name}` - Subscribe or unsubscribe a feed to a topic

mod auth;
mod error;
mod feeds;
mod health;
mod pubsub;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::config::Config;
use crate::service::FeedService;

pub use self::auth::require_auth;
pub use self::error::ApiError;

/// Header carrying the hub's push signature.
pub const HUB_SIGNATURE: &str = "x-hub-signature";

/// Shared state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FeedService>,

    /// Token the admin routes require; `None` leaves them unrouted.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(service: Arc<FeedService>, config: &Config) -> Self {
        Self {
            service,
            admin_token: config.admin_token.as_deref().map(Arc::from),
        }
    }
}

/// Build the complete router.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/feeds/{name}", get(feeds::get_feed).post(feeds::post_feed))
        .route("/feeds/{name}/{id}", get(feeds::get_entry));

    if state.admin_token.is_some() {
        let admin = Router::new()
            .route(
                "/pubsub/{name}",
                get(pubsub::list_subscriptions).post(pubsub::change_subscription),
            )
            .layer(middleware::from_fn_with_state(state.clone(), require_auth));
        app = app.merge(admin);
    }

    app.with_state(state)
}
