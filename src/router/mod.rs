//! HTTP front door.
//!
//! Every inbound request lands in a single fallback handler which classifies
//! it as cache administration, a mirror call, or one of the legacy endpoints.
//! Mirror calls run in their own task so a client disconnect never aborts a
//! solve that is already underway.

mod control;
pub mod validate;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::PROTOCOL_VERSION;
use crate::mirror::headers::{BYPASS_CACHE_HEADER, HOSTNAME_HEADER, PROXY_HEADER, is_hop_by_hop};
use crate::mirror::{ConfigError, MirrorEngine, MirrorError, MirrorRequest, MirrorResult};

/// Largest request body forwarded to an origin.
pub const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MirrorEngine>,
}

impl AppState {
    pub fn new(engine: Arc<MirrorEngine>) -> Self {
        Self { engine }
    }
}

/// Where an inbound request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    CacheClear,
    CacheStats,
    /// Reserved `/cache/` path with no handler.
    CacheUnknown,
    Mirror,
    Cookies,
    Html,
    Health,
    Unrouted,
}

/// Decides the route from the path and headers alone.
///
/// The `/cache/` namespace is always local. Otherwise a non-blank
/// `x-hostname` wins over any path.
pub fn classify(path: &str, headers: &HeaderMap) -> Route {
    if let Some(rest) = path.strip_prefix("/cache/") {
        return match rest {
            "clear" => Route::CacheClear,
            "stats" => Route::CacheStats,
            _ => Route::CacheUnknown,
        };
    }

    if header_value(headers, HOSTNAME_HEADER).is_some() {
        return Route::Mirror;
    }

    match path {
        "/cookies" => Route::Cookies,
        "/html" => Route::Html,
        "/health" => Route::Health,
        _ => Route::Unrouted,
    }
}

/// Trimmed, non-empty UTF-8 header value.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Errors returned to HTTP clients as `{detail, error_code, timestamp}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Failed to bypass Cloudflare protection")]
    UpstreamAuth,
    #[error("Request mirroring failed")]
    Upstream,
    #[error("Internal server error")]
    Internal,
    #[error("Not Found")]
    NotFound,
    #[error("Method Not Allowed")]
    MethodNotAllowed,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Config(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UpstreamAuth | ApiError::Upstream | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Config(_) | ApiError::BadRequest(_) => "invalid_request",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::UpstreamAuth => "bypass_failed",
            ApiError::Upstream => "mirror_failed",
            ApiError::Internal => "internal_error",
            ApiError::NotFound => "not_found",
            ApiError::MethodNotAllowed => "method_not_allowed",
        }
    }
}

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::Config(config) => ApiError::Config(config),
            MirrorError::UpstreamAuth(cause) => {
                log::error!("clearance failed: {cause}");
                ApiError::UpstreamAuth
            }
            other => {
                log::error!("mirror call failed: {other}");
                ApiError::Upstream
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "detail": self.to_string(),
            "error_code": self.code(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the router until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("listening on http://{addr}");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let route = classify(request.uri().path(), request.headers());
    let method = request.method().clone();
    let uri = request.uri().clone();

    let result = match route {
        Route::CacheClear => match allow(&method, Method::POST) {
            Ok(()) => control::clear_cache(&state).await,
            Err(err) => Err(err),
        },
        Route::CacheStats => allow(&method, Method::GET).map(|()| control::cache_stats(&state)),
        Route::CacheUnknown => Err(ApiError::NotFound),
        Route::Mirror => mirror(state, request).await,
        Route::Cookies => match allow(&method, Method::GET) {
            Ok(()) => control::cookies(&state, &uri).await,
            Err(err) => Err(err),
        },
        Route::Html => match allow(&method, Method::GET) {
            Ok(()) => control::html(&state, &uri).await,
            Err(err) => Err(err),
        },
        Route::Health => allow(&method, Method::GET).map(|()| control::health()),
        Route::Unrouted => Err(ConfigError::MissingHostname.into()),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

fn allow(method: &Method, expected: Method) -> Result<(), ApiError> {
    if *method == expected {
        Ok(())
    } else {
        Err(ApiError::MethodNotAllowed)
    }
}

async fn mirror(state: AppState, request: Request) -> Result<Response, ApiError> {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    let hostname = header_value(&parts.headers, HOSTNAME_HEADER)
        .ok_or(ConfigError::MissingHostname)?
        .to_string();
    if !validate::is_safe_url(&validate::with_default_scheme(&hostname)) {
        return Err(ConfigError::UnsafeUrl.into());
    }

    let proxy = header_value(&parts.headers, PROXY_HEADER).map(str::to_string);
    if let Some(proxy) = proxy.as_deref() {
        validate::validate_proxy(proxy)?;
    }
    let bypass_cache = header_value(&parts.headers, BYPASS_CACHE_HEADER)
        .map(validate::parse_truthy)
        .unwrap_or(false);

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    let mut request = MirrorRequest::new(parts.method, hostname, parts.uri.path())
        .with_headers(parts.headers)
        .with_body(body)
        .bypass_cache(bypass_cache);
    if let Some(query) = parts.uri.query() {
        request = request.with_query(query);
    }
    if let Some(proxy) = proxy {
        request = request.with_proxy(proxy);
    }

    let engine = state.engine.clone();
    let result = tokio::spawn(async move { engine.mirror(request).await })
        .await
        .map_err(|err| {
            log::error!("mirror task failed: {err}");
            ApiError::Internal
        })??;

    Ok(mirror_response(result, started, bypass_cache))
}

fn mirror_response(result: MirrorResult, started: Instant, bypass_cache: bool) -> Response {
    let mut response = Response::new(Body::from(result.body));
    *response.status_mut() = result.status;

    let headers = response.headers_mut();
    for (name, value) in &result.headers {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(
        HeaderName::from_static("x-cf-bypasser-version"),
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    headers.insert(
        HeaderName::from_static("x-processing-time-ms"),
        HeaderValue::from(started.elapsed().as_millis() as u64),
    );
    headers.insert(
        HeaderName::from_static("x-cache-bypassed"),
        HeaderValue::from_static(if bypass_cache { "true" } else { "false" }),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_hostname(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-hostname", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn hostname_wins_over_legacy_paths() {
        let headers = with_hostname("target-site.com");
        assert_eq!(classify("/cookies", &headers), Route::Mirror);
        assert_eq!(classify("/html", &headers), Route::Mirror);
        assert_eq!(classify("/health", &headers), Route::Mirror);
        assert_eq!(classify("/api/v1/items", &headers), Route::Mirror);
    }

    #[test]
    fn cache_namespace_is_always_local() {
        let headers = with_hostname("target-site.com");
        assert_eq!(classify("/cache/stats", &headers), Route::CacheStats);
        assert_eq!(classify("/cache/clear", &headers), Route::CacheClear);
        assert_eq!(classify("/cache/other", &headers), Route::CacheUnknown);
    }

    #[test]
    fn legacy_paths_without_hostname() {
        let headers = HeaderMap::new();
        assert_eq!(classify("/cookies", &headers), Route::Cookies);
        assert_eq!(classify("/html", &headers), Route::Html);
        assert_eq!(classify("/health", &headers), Route::Health);
        assert_eq!(classify("/anything", &headers), Route::Unrouted);
    }

    #[test]
    fn blank_hostname_is_ignored() {
        assert_eq!(classify("/cookies", &with_hostname("   ")), Route::Cookies);
        assert_eq!(classify("/data", &with_hostname("")), Route::Unrouted);
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let result = MirrorResult {
            status: StatusCode::CREATED,
            headers,
            body: bytes::Bytes::from_static(b"{}"),
            attempts: 1,
        };

        let response = mirror_response(result, Instant::now(), true);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!response.headers().contains_key("connection"));
        assert!(!response.headers().contains_key("transfer-encoding"));
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(response.headers()["x-cf-bypasser-version"], PROTOCOL_VERSION);
        assert_eq!(response.headers()["x-cache-bypassed"], "true");
    }
}
