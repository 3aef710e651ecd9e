//! Strata Coordinator - storage node queue API
//!
//! HTTP surface through which storage nodes pull the merged queue, confirm
//! commits, deletes and moves, and stream objects back for pull requests.

pub mod auth;
pub mod handlers;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    middleware,
    routing::{get, post},
};
use std::sync::Arc;
use strata_bucket::BucketCoordinator;
use strata_common::config::ServerConfig;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted request body (one transfer chunk)
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Shared handler state
pub struct AppState {
    pub coordinator: BucketCoordinator,
    /// Bearer secret storage nodes must present
    pub storage_node_secret: Option<String>,
    pub default_redirect: String,
}

impl AppState {
    pub fn new(coordinator: BucketCoordinator, server: &ServerConfig) -> Self {
        Self {
            coordinator,
            storage_node_secret: server.storage_node_secret.clone(),
            default_redirect: server.default_redirect.clone(),
        }
    }
}

/// Build the full router
pub fn router(state: Arc<AppState>) -> Router {
    let queue = Router::new()
        .route("/bucketqueue", get(handlers::bucket_queue))
        .route("/bucketqueue/resolvecommit", get(handlers::resolve_commit))
        .route(
            "/bucketqueue/resolvefoldercommit",
            get(handlers::resolve_folder_commit),
        )
        .route("/bucketqueue/resolvedelete", get(handlers::resolve_delete))
        .route("/bucketqueue/resolvemove", get(handlers::resolve_move))
        .route("/bucketqueue/initrequest", post(handlers::init_request))
        .route("/bucketqueue/txrequestdata", post(handlers::tx_request_data))
        .route(
            "/bucketqueue/txrequestmarknotfound",
            post(handlers::tx_request_mark_not_found),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_layer,
        ));

    Router::new()
        // Health and landing routes need no auth
        .route("/health", get(handlers::health_check))
        .route("/", get(handlers::default_redirect))
        .merge(queue)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-powered-by"),
            HeaderValue::from_static("Strata"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
