//! Per-request caching policy.
//!
//! [`classify`] decides what to do with a request and performs no I/O; the
//! worker carries the decision out.

use carniceria_net::{Request, Response, ResponseType, UrlPattern};
use http::StatusCode;

/// How the worker answers one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; the request goes to the network untouched.
    Passthrough,
    /// Network, falling back to the stored copy on failure.
    NetworkFirst,
    /// Stored copy, falling back to the network on a miss.
    CacheFirst,
}

/// Pick the strategy for a request.
///
/// Anything that is not a read-only request passes through. Backend data
/// traffic (matched by `api`) is network-first; everything else is
/// cache-first.
pub fn classify(request: &Request, api: &UrlPattern) -> Strategy {
    if !request.is_read_only() {
        Strategy::Passthrough
    } else if api.matches(&request.url) {
        Strategy::NetworkFirst
    } else {
        Strategy::CacheFirst
    }
}

/// Whether a cache-first network response may be stored: a 200 of basic
/// (same-origin, non-error) type.
pub fn is_storable(response: &Response) -> bool {
    response.status == StatusCode::OK && response.response_type == ResponseType::Basic
}
