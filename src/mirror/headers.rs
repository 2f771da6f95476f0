//! Header rewriting between the caller, the origin, and back.

use http::header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};

use super::cookies;
use crate::solver::Clearance;

/// Target origin for a mirrored request.
pub const HOSTNAME_HEADER: &str = "x-hostname";
/// Proxy to reach the origin through.
pub const PROXY_HEADER: &str = "x-proxy";
/// Forces a fresh solve when truthy.
pub const BYPASS_CACHE_HEADER: &str = "x-bypass-cache";

const ROUTING_HEADERS: [&str; 3] = [HOSTNAME_HEADER, PROXY_HEADER, BYPASS_CACHE_HEADER];

/// Connection-scoped headers never forwarded in either direction.
pub const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers a desktop Firefox sends on a top-level navigation.
pub const FIREFOX_BASELINE: [(&str, &str); 6] = [
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    ),
    ("accept-language", "en-US,en;q=0.5"),
    ("accept-encoding", "gzip, deflate, br"),
    ("connection", "keep-alive"),
    ("upgrade-insecure-requests", "1"),
    ("cache-control", "max-age=0"),
];

pub fn is_routing_header(name: &HeaderName) -> bool {
    ROUTING_HEADERS.contains(&name.as_str())
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Checks that a clearance can be sent as `User-Agent` and `Cookie` headers.
pub fn validate_clearance(clearance: &Clearance) -> Result<(), InvalidHeaderValue> {
    HeaderValue::from_str(&clearance.user_agent)?;
    let pairs = cookies::merge_cookies(Vec::new(), &clearance.cookies);
    HeaderValue::from_str(&cookies::serialize_cookies(&pairs))?;
    Ok(())
}

/// Builds the header set sent to the origin.
pub fn build_outbound_headers(
    inbound: &HeaderMap,
    clearance: &Clearance,
) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut outbound = HeaderMap::with_capacity(inbound.len() + FIREFOX_BASELINE.len());
    for (name, value) in inbound {
        if is_routing_header(name)
            || is_hop_by_hop(name)
            || name == header::HOST
            || name == header::COOKIE
            || name == header::USER_AGENT
        {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    outbound.insert(header::USER_AGENT, HeaderValue::from_str(&clearance.user_agent)?);

    let inbound_cookies = cookies::parse_cookie_header(
        inbound
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    );
    let merged = cookies::merge_cookies(inbound_cookies, &clearance.cookies);
    if !merged.is_empty() {
        outbound.insert(
            header::COOKIE,
            HeaderValue::from_str(&cookies::serialize_cookies(&merged))?,
        );
    }

    for (name, value) in FIREFOX_BASELINE {
        if !outbound.contains_key(name) {
            outbound.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
    }

    Ok(outbound)
}

/// Rewrites origin headers to describe the already-decoded body.
pub fn normalize_response_headers(headers: &mut HeaderMap, body_len: usize) {
    let encodings = headers.get_all(header::CONTENT_ENCODING).iter().count();
    if encodings > 0 {
        headers.remove(header::CONTENT_ENCODING);
        for _ in 0..encodings {
            headers.append(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
}
