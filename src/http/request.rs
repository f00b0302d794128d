//! Request identification.
//!
//! # Responsibilities
//! - Generate a UUID request ID for every incoming request
//! - Echo the ID back on the response
//! - Read the ID back for logging inside handlers
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing (outermost layer)
//! - A client-supplied `x-request-id` is kept, not replaced

use axum::http::{HeaderMap, HeaderName};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Layer that assigns a UUID to requests without an `x-request-id`.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID), MakeRequestUuid)
}

/// Layer that copies the request's ID onto its response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID))
}

/// The request ID, if present and valid UTF-8.
pub fn request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok())
}
