//! Synthetic response for a static asset that is neither cached nor reachable.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use portal_net::Response;
use url::Url;

/// Body of the offline fallback.
pub const OFFLINE_BODY: &str = "Offline - resource not available";

/// Status text of the offline fallback.
pub const OFFLINE_STATUS_TEXT: &str = "Service Unavailable";

/// Marks a response as fabricated by the worker rather than relayed.
pub const OFFLINE_MARKER_HEADER: HeaderName = HeaderName::from_static("x-portal-offline");

/// Build the offline fallback for `url`.
pub fn offline_response(url: &Url) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(OFFLINE_MARKER_HEADER, HeaderValue::from_static("1"));

    Response::new(url.clone(), StatusCode::SERVICE_UNAVAILABLE, headers, OFFLINE_BODY)
        .with_status_text(OFFLINE_STATUS_TEXT)
}

/// True for responses produced by [`offline_response`], false for a real
/// upstream 503.
pub fn is_offline_fallback(response: &Response) -> bool {
    response.status == StatusCode::SERVICE_UNAVAILABLE
        && response.content_type() == Some(mime::TEXT_PLAIN)
        && response.headers.contains_key(OFFLINE_MARKER_HEADER)
}
