//! Outbound requests to the hub.

use crate::error::{FeedError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Form POSTs to a hub. Returns the response status.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn post_form(&self, url: &str, params: &[(&str, &str)]) -> Result<u16>;
}

/// `HubClient` over HTTP.
pub struct HttpHubClient {
    client: Client,
    timeout: Duration,
}

impl HttpHubClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::Hub(format!("build http client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HubClient for HttpHubClient {
    async fn post_form(&self, url: &str, params: &[(&str, &str)]) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FeedError::HubTimeout(self.timeout)
                } else {
                    FeedError::Hub(e.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}
