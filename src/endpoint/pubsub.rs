//! Subscription administration.

use axum::extract::{Path, State};
use axum::{Form, Json};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::hub::{HubMode, Subscription};

#[derive(Debug, Deserialize)]
pub struct ChangeRequest {
    pub topic: String,
    #[serde(default = "default_mode")]
    pub mode: HubMode,
}

fn default_mode() -> HubMode {
    HubMode::Subscribe
}

#[derive(Debug, Serialize)]
pub struct ChangeResponse {
    feed: String,
    topic: String,
    mode: HubMode,
}

/// `GET /pubsub/{name}`.
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    Ok(Json(state.service.subscriptions(&name)?))
}

/// `POST /pubsub/{name}`: waits for the hub's synchronous verification.
pub async fn change_subscription(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Form(request): Form<ChangeRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    state
        .service
        .subscribe(&name, &request.topic, request.mode)
        .await?;

    Ok(Json(ChangeResponse {
        feed: name,
        topic: request.topic,
        mode: request.mode,
    }))
}
