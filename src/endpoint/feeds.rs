//! Feed endpoints.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use super::auth::authorize;
use super::error::ApiError;
use super::{AppState, HUB_SIGNATURE};
use crate::codec::ATOM_CONTENT_TYPE;
use crate::error::FeedError;
use crate::fetch::FetchResponse;
use crate::hub::VerifyRequest;
use crate::service::PushOutcome;
use crate::types::FeedRole;

/// `GET /feeds/{name}`.
///
/// With `hub.mode` in the query this is the hub confirming a subscription
/// change: the challenge is echoed if the verify token is ours, 404
/// otherwise. Without it, a conditional fetch keyed on `If-None-Match`.
pub async fn get_feed(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(verify): Query<VerifyRequest>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if verify.mode.is_some() {
        return Ok(match state.service.verify_intent(&name, &verify)? {
            Some(challenge) => (StatusCode::OK, challenge).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        });
    }

    let if_none_match = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());

    let response = match state.service.fetch(&name, if_none_match)? {
        FetchResponse::Feed { body, etag } => {
            let mut response = ([(CONTENT_TYPE, ATOM_CONTENT_TYPE)], body).into_response();
            if let Some(etag) = etag {
                response.headers_mut().insert(ETAG, header_value(&etag)?);
            }
            response
        }
        FetchResponse::NotModified { etag } => {
            (StatusCode::NOT_MODIFIED, [(ETAG, header_value(&etag)?)]).into_response()
        }
    };
    Ok(response)
}

/// `POST /feeds/{name}`, interpreted by the feed's role.
///
/// Pushes to subscriber feeds authenticate by hub signature. Appends to
/// publisher feeds need the admin bearer token when one is configured and
/// are open otherwise.
pub async fn post_feed(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let service = Arc::clone(&state.service);

    match service.role(&name)? {
        FeedRole::Subscriber => {
            let signature = headers
                .get(HUB_SIGNATURE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let outcome =
                blocking(move || service.receive_push(&name, &body, signature.as_deref())).await?;
            Ok(match outcome {
                PushOutcome::Accepted(report) => Json(report).into_response(),
                // Acknowledged so the hub does not redeliver.
                PushOutcome::Unauthenticated => StatusCode::OK.into_response(),
            })
        }
        FeedRole::Publisher => {
            if let Some(expected) = state.admin_token.as_deref() {
                authorize(expected, &headers)?;
            }
            let body = String::from_utf8(body.to_vec())
                .map_err(|e| FeedError::Malformed(format!("body is not UTF-8: {e}")))?;
            let report = blocking(move || service.ingest(&name, &body, FeedRole::Publisher)).await?;
            Ok(Json(report).into_response())
        }
    }
}

/// `GET /feeds/{name}/{id}`.
pub async fn get_entry(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let document = state.service.entry(&name, &id)?;
    let headers = [
        (CONTENT_TYPE, HeaderValue::from_static(ATOM_CONTENT_TYPE)),
        (LAST_MODIFIED, header_value(&document.entry.arrived.to_rfc1123())?),
    ];
    Ok((headers, document.body).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| ApiError::Internal(format!("header value: {e}")))
}

/// Run store writes off the async workers; they fsync.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}
