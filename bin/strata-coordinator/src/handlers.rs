//! Storage node queue API handlers
//!
//! Resolutions that hit a timestamp no longer in play answer `204 No Content`:
//! another storage node got there first, which is not an error.

use crate::AppState;
use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use strata_bucket::{MergedQueue, RequestInfo, Resolution};
use strata_common::{Error, Timestamp};
use tracing::{debug, error};

/// `?timestamp=`
#[derive(Debug, Deserialize)]
pub struct TimestampQuery {
    pub timestamp: u64,
}

/// `?timestamp=&start=&end=`
#[derive(Debug, Deserialize)]
pub struct CommitRangeQuery {
    pub timestamp: u64,
    pub start: u64,
    pub end: u64,
}

/// `?timestamp=&previousBytesTransferred=`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQuery {
    pub timestamp: u64,
    pub previous_bytes_transferred: u64,
}

/// Error response carrying the status of a [`strata_common::Error`]
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Queue API error: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

fn resolution_response(resolution: Resolution<()>) -> Response {
    match resolution {
        Resolution::Applied(()) => Json(json!({ "status": "ok" })).into_response(),
        Resolution::Stale => StatusCode::NO_CONTENT.into_response(),
    }
}

pub async fn health_check() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"healthy"}"#,
    )
        .into_response()
}

pub async fn default_redirect(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::to(&state.default_redirect)
}

/// GET /bucketqueue
pub async fn bucket_queue(State(state): State<Arc<AppState>>) -> Json<MergedQueue> {
    let merged = state.coordinator.merge().await;
    debug!("Serving bucket queue with {} items", merged.items.len());
    Json(merged)
}

/// GET /bucketqueue/resolvecommit
pub async fn resolve_commit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CommitRangeQuery>,
) -> Result<Response, ApiError> {
    let resolution = state
        .coordinator
        .resolve_commit(Timestamp(query.timestamp), query.start, query.end)
        .await?;

    Ok(match resolution {
        Resolution::Applied(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Resolution::Stale => StatusCode::NO_CONTENT.into_response(),
    })
}

/// GET /bucketqueue/resolvefoldercommit
pub async fn resolve_folder_commit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimestampQuery>,
) -> Response {
    resolution_response(
        state
            .coordinator
            .resolve_folder_commit(Timestamp(query.timestamp)),
    )
}

/// GET /bucketqueue/resolvedelete
pub async fn resolve_delete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimestampQuery>,
) -> Response {
    resolution_response(state.coordinator.resolve_delete(Timestamp(query.timestamp)))
}

/// GET /bucketqueue/resolvemove
pub async fn resolve_move(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimestampQuery>,
) -> Response {
    resolution_response(state.coordinator.resolve_move(Timestamp(query.timestamp)))
}

/// POST /bucketqueue/initrequest
pub async fn init_request(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimestampQuery>,
    Json(info): Json<RequestInfo>,
) -> Response {
    resolution_response(
        state
            .coordinator
            .init_request(Timestamp(query.timestamp), info),
    )
}

/// POST /bucketqueue/txrequestdata
pub async fn tx_request_data(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Response {
    let resolution = state.coordinator.tx_request_data(
        Timestamp(query.timestamp),
        &body,
        query.previous_bytes_transferred,
    );

    match resolution {
        Resolution::Applied(bytes_transferred) => {
            Json(json!({ "bytesTransferred": bytes_transferred })).into_response()
        }
        Resolution::Stale => StatusCode::NO_CONTENT.into_response(),
    }
}

/// POST /bucketqueue/txrequestmarknotfound
pub async fn tx_request_mark_not_found(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimestampQuery>,
) -> Response {
    resolution_response(state.coordinator.mark_not_found(Timestamp(query.timestamp)))
}
