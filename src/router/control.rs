//! Locally handled endpoints: legacy credential/content fetch, cache
//! administration and liveness.

use std::time::Instant;

use axum::{
    Json,
    body::Body,
    extract::Query,
    http::{HeaderName, HeaderValue, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, AppState, validate};
use crate::VERSION;
use crate::mirror::ConfigError;

const DEFAULT_RETRIES: u32 = 5;
const MAX_RETRIES: u32 = 10;

const FEATURES: [&str; 6] = [
    "request_mirroring",
    "credential_cache",
    "cache_persistence",
    "proxy_support",
    "legacy_cookies",
    "legacy_html",
];

#[derive(Debug, Deserialize)]
struct LegacyQuery {
    url: Option<String>,
    retries: Option<String>,
    proxy: Option<String>,
    #[serde(rename = "bypassCookieCache")]
    bypass_cookie_cache: Option<String>,
}

/// Validated parameters shared by `/cookies` and `/html`.
#[derive(Debug)]
struct LegacyParams {
    url: String,
    retries: u32,
    proxy: Option<String>,
    bypass_cache: bool,
}

impl LegacyParams {
    fn from_uri(uri: &Uri) -> Result<Self, ApiError> {
        let Query(query) = Query::<LegacyQuery>::try_from_uri(uri)
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

        let url = query
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingParameter("url"))?
            .to_string();
        if !validate::is_safe_url(&validate::with_default_scheme(&url)) {
            return Err(ConfigError::UnsafeUrl.into());
        }

        let proxy = query
            .proxy
            .map(|proxy| proxy.trim().to_string())
            .filter(|proxy| !proxy.is_empty());
        if let Some(proxy) = proxy.as_deref() {
            validate::validate_proxy(proxy)?;
        }

        Ok(Self {
            url,
            retries: parse_retries(query.retries.as_deref())?,
            proxy,
            bypass_cache: query
                .bypass_cookie_cache
                .as_deref()
                .map(validate::parse_truthy)
                .unwrap_or(false),
        })
    }
}

fn parse_retries(raw: Option<&str>) -> Result<u32, ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(DEFAULT_RETRIES);
    };
    match raw.parse::<u32>() {
        Ok(retries) if (1..=MAX_RETRIES).contains(&retries) => Ok(retries),
        _ => Err(ConfigError::InvalidParameter("retries")),
    }
}

/// `GET /cookies`
pub(super) async fn cookies(state: &AppState, uri: &Uri) -> Result<Response, ApiError> {
    let params = LegacyParams::from_uri(uri)?;
    let started = Instant::now();
    log::info!(
        "getting cookies for {} (retries: {}, proxy: {})",
        params.url,
        params.retries,
        if params.proxy.is_some() { "yes" } else { "no" }
    );

    let engine = state.engine.clone();
    let clearance = tokio::spawn(async move {
        engine
            .credentials(&params.url, params.proxy.as_deref(), params.bypass_cache, params.retries)
            .await
    })
    .await
    .map_err(|err| {
        log::error!("credential task failed: {err}");
        ApiError::Internal
    })??;

    log::info!(
        "returned {} cookie(s) in {}ms, cloudflare cookies: {:?}",
        clearance.cookies.len(),
        started.elapsed().as_millis(),
        clearance.cloudflare_cookie_names()
    );

    Ok(Json(json!({
        "cookies": clearance.cookies,
        "user_agent": clearance.user_agent,
    }))
    .into_response())
}

/// `GET /html`
pub(super) async fn html(state: &AppState, uri: &Uri) -> Result<Response, ApiError> {
    let params = LegacyParams::from_uri(uri)?;
    let started = Instant::now();
    log::info!(
        "getting HTML content for {} (retries: {}, proxy: {})",
        params.url,
        params.retries,
        if params.proxy.is_some() { "yes" } else { "no" }
    );

    let engine = state.engine.clone();
    let page = tokio::spawn(async move {
        engine
            .fetch_content(&params.url, params.proxy.as_deref(), params.bypass_cache, params.retries)
            .await
    })
    .await
    .map_err(|err| {
        log::error!("content task failed: {err}");
        ApiError::Internal
    })??;

    let elapsed = started.elapsed().as_millis() as u64;
    log::info!(
        "fetched {} ({} bytes, status {}) in {elapsed}ms",
        page.final_url,
        page.body.len(),
        page.status
    );

    let content_type = page
        .headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/html"));

    let mut response = Response::new(Body::from(page.body));
    *response.status_mut() = page.status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        HeaderName::from_static("x-cf-bypasser-cookies"),
        HeaderValue::from(page.cookie_count),
    );
    if let Ok(user_agent) = HeaderValue::from_str(&page.user_agent) {
        headers.insert(HeaderName::from_static("x-cf-bypasser-user-agent"), user_agent);
    }
    if let Ok(final_url) = HeaderValue::from_str(page.final_url.as_str()) {
        headers.insert(HeaderName::from_static("x-cf-bypasser-final-url"), final_url);
    }
    headers.insert(
        HeaderName::from_static("x-processing-time-ms"),
        HeaderValue::from(elapsed),
    );
    Ok(response)
}

/// `POST /cache/clear`
pub(super) async fn clear_cache(state: &AppState) -> Result<Response, ApiError> {
    let cleared = state.engine.cache().clear_all();
    state.engine.sessions().clear().await;
    log::info!("cleared {cleared} cache entries and pooled sessions");

    Ok(Json(json!({
        "status": "success",
        "message": format!("Cache cleared successfully - {cleared} entries removed"),
        "cleared_entries": cleared,
    }))
    .into_response())
}

/// `GET /cache/stats`
pub(super) fn cache_stats(state: &AppState) -> Response {
    let stats = state.engine.cache().stats();
    log::info!(
        "cache stats: {} active, {} expired, {} total",
        stats.active,
        stats.total - stats.active,
        stats.total
    );

    Json(json!({
        "cached_entries": stats.active,
        "total_hostnames": stats.total,
        "hostnames": stats.keys,
    }))
    .into_response()
}

/// `GET /health`
pub(super) fn health() -> Response {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "features": FEATURES,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_default_and_bounds() {
        assert_eq!(parse_retries(None).unwrap(), DEFAULT_RETRIES);
        assert_eq!(parse_retries(Some("")).unwrap(), DEFAULT_RETRIES);
        assert_eq!(parse_retries(Some("1")).unwrap(), 1);
        assert_eq!(parse_retries(Some("10")).unwrap(), 10);
        assert!(parse_retries(Some("0")).is_err());
        assert!(parse_retries(Some("11")).is_err());
        assert!(parse_retries(Some("many")).is_err());
    }

    #[test]
    fn legacy_params_require_safe_url() {
        let uri: Uri = "/cookies?url=http%3A%2F%2F127.0.0.1%2F".parse().unwrap();
        assert!(matches!(
            LegacyParams::from_uri(&uri),
            Err(ApiError::Config(ConfigError::UnsafeUrl))
        ));

        let uri: Uri = "/cookies?retries=3".parse().unwrap();
        assert!(matches!(
            LegacyParams::from_uri(&uri),
            Err(ApiError::Config(ConfigError::MissingParameter("url")))
        ));
    }

    #[test]
    fn legacy_params_parse_flags() {
        let uri: Uri = "/html?url=https%3A%2F%2Fexample.com%2Fpage&retries=2&proxy=socks5%3A%2F%2F10.0.0.1%3A1080&bypassCookieCache=true"
            .parse()
            .unwrap();
        let params = LegacyParams::from_uri(&uri).unwrap();
        assert_eq!(params.url, "https://example.com/page");
        assert_eq!(params.retries, 2);
        assert_eq!(params.proxy.as_deref(), Some("socks5://10.0.0.1:1080"));
        assert!(params.bypass_cache);
    }

    #[test]
    fn legacy_params_reject_bad_proxy() {
        let uri: Uri = "/cookies?url=https%3A%2F%2Fexample.com&proxy=ftp%3A%2F%2Fproxy"
            .parse()
            .unwrap();
        assert!(matches!(
            LegacyParams::from_uri(&uri),
            Err(ApiError::Config(ConfigError::InvalidProxy))
        ));
    }
}
