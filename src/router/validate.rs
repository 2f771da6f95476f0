//! Input predicates for control-plane and mirror requests.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use crate::mirror::ConfigError;

const PROXY_SCHEMES: [&str; 4] = ["http://", "https://", "socks4://", "socks5://"];

static PRIVATE_HOST_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"^(127\.0\.0\.1|localhost|0\.0\.0\.0|::1|10\.\d+\.\d+\.\d+|172\.1[6-9]\.\d+\.\d+|172\.2[0-9]\.\d+\.\d+|172\.3[0-1]\.\d+\.\d+|192\.168\.\d+\.\d+)$",
    )
    .case_insensitive(true)
    .build()
    .expect("invalid private host regex")
});

/// False for `file:` URLs, unparsable input, and loopback or private hosts.
pub fn is_safe_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if url.scheme() == "file" {
        return false;
    }

    match url.host_str() {
        Some(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            !PRIVATE_HOST_RE.is_match(host)
        }
        None => true,
    }
}

/// Accepts `http`, `https`, `socks4` and `socks5` proxy URLs with a host.
pub fn validate_proxy(proxy: &str) -> Result<(), ConfigError> {
    let lowered = proxy.to_ascii_lowercase();
    if !PROXY_SCHEMES.iter().any(|scheme| lowered.starts_with(scheme)) {
        return Err(ConfigError::InvalidProxy);
    }

    match Url::parse(proxy) {
        Ok(url) if url.has_host() => Ok(()),
        _ => Err(ConfigError::InvalidProxy),
    }
}

/// `true`, `1`, `yes` and `on`, in any case.
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Prefixes `https://` when the caller gave a bare host.
pub fn with_default_scheme(origin: &str) -> String {
    let origin = origin.trim();
    if origin.contains("://") {
        origin.to_string()
    } else {
        format!("https://{origin}")
    }
}
