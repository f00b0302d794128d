//! The placeholder request handler and its middleware stack.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};

/// Body returned by `GET /`.
pub const OK_BODY: &str = "OK";

/// Build the router: `GET /` answers `OK`, everything else is 404.
#[allow(deprecated)]
pub fn build_router(config: &HttpConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            tracing::info_span!(
                "request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = request_id(request.headers()).unwrap_or("-")
            )
        }))
        .layer(set_request_id_layer())
}

async fn root(headers: HeaderMap) -> &'static str {
    tracing::info!(
        request_id = request_id(&headers).unwrap_or("-"),
        pid = std::process::id(),
        "handle request"
    );
    OK_BODY
}
