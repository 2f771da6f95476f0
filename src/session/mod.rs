//! Outbound HTTP sessions used to reach mirrored origins.
//!
//! A session is bound to one (host, proxy) pair and keeps its connection pool
//! between calls. Cookies are never stored on the session; callers send them
//! explicitly on every request. The [`SessionPool`] hands out shared sessions
//! and evicts the least recently used one once it reaches capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder, ZstdDecoder};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};
use reqwest::{Client, redirect::Policy};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use url::Url;

/// User-agent the Firefox profile announces before credentials override it.
pub const FIREFOX_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:142.0) Gecko/20100101 Firefox/142.0";

/// Default number of pooled sessions.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Request handed to an [`OutboundSession`].
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Fully buffered origin response.
///
/// `body` is always decoded; `headers` keep the `content-encoding` the origin
/// declared.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

/// Failures talking to the origin.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to build session: {0}")]
    Build(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::Body(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Persistent connection state bound to one destination and proxy.
#[async_trait]
pub trait OutboundSession: Send + Sync {
    /// Sends the request without following redirects.
    async fn send(&self, request: OutboundRequest) -> Result<OriginResponse, TransportError>;
}

/// Builds sessions for the pool.
pub trait SessionFactory: Send + Sync {
    fn create(&self, host: &str, proxy: Option<&str>) -> Result<Arc<dyn OutboundSession>, TransportError>;
}

/// Transport settings for [`ReqwestSessionFactory`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub http2: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: FIREFOX_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
            pool_idle_timeout: Duration::from_secs(90),
            http2: true,
        }
    }
}

/// Session factory producing reqwest clients with a Firefox profile.
#[derive(Debug, Clone, Default)]
pub struct ReqwestSessionFactory {
    config: SessionConfig,
}

impl ReqwestSessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl SessionFactory for ReqwestSessionFactory {
    fn create(&self, host: &str, proxy: Option<&str>) -> Result<Arc<dyn OutboundSession>, TransportError> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .user_agent(self.config.user_agent.as_str())
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout)
            .pool_idle_timeout(self.config.pool_idle_timeout);

        if !self.config.http2 {
            builder = builder.http1_only();
        }

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransportError::Build(format!("invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Build(err.to_string()))?;
        log::debug!(
            "created session for {host} ({})",
            if proxy.is_some() { "proxied" } else { "direct" }
        );
        Ok(Arc::new(ReqwestSession { client }))
    }
}

/// Reqwest-backed session. Redirects are returned to the caller untouched.
struct ReqwestSession {
    client: Client,
}

#[async_trait]
impl OutboundSession for ReqwestSession {
    async fn send(&self, request: OutboundRequest) -> Result<OriginResponse, TransportError> {
        let mut headers = request.headers;
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);

        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();
        let mut headers = response.headers().clone();
        let url = response.url().clone();
        let raw = response.bytes().await.map_err(TransportError::from_reqwest)?;

        let body = decode_body(&headers, raw).await?;
        headers.remove(header::CONTENT_LENGTH);

        Ok(OriginResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

/// Undoes every `content-encoding` the origin applied, last one first.
pub async fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, TransportError> {
    let codings: Vec<String> = headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|coding| coding.trim().to_ascii_lowercase())
        .filter(|coding| !coding.is_empty() && coding != "identity")
        .collect();

    let mut body = body;
    for coding in codings.iter().rev() {
        let input = &body[..];
        body = match coding.as_str() {
            "gzip" | "x-gzip" => read_all(GzipDecoder::new(input)).await?,
            "deflate" => read_all(ZlibDecoder::new(input)).await?,
            "br" => read_all(BrotliDecoder::new(input)).await?,
            "zstd" => read_all(ZstdDecoder::new(input)).await?,
            other => {
                return Err(TransportError::Body(format!(
                    "unsupported content-encoding: {other}"
                )));
            }
        };
    }
    Ok(body)
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Result<Bytes, TransportError> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .await
        .map_err(|err| TransportError::Body(err.to_string()))?;
    Ok(Bytes::from(decoded))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    host: String,
    proxy: Option<String>,
}

struct PooledSession {
    session: Arc<dyn OutboundSession>,
    last_used: u64,
}

struct PoolState {
    sessions: HashMap<SessionKey, PooledSession>,
    clock: u64,
}

/// LRU-bounded pool of outbound sessions keyed by (host, proxy).
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl SessionPool {
    /// Pool holding at most `capacity` sessions; `0` means unbounded.
    pub fn new(factory: Arc<dyn SessionFactory>, capacity: usize) -> Self {
        Self {
            factory,
            capacity,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Pool of reqwest sessions using the default Firefox profile.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(ReqwestSessionFactory::default()), DEFAULT_POOL_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the session for `(host, proxy)`, creating it on first use.
    pub async fn get_or_create(
        &self,
        host: &str,
        proxy: Option<&str>,
    ) -> Result<Arc<dyn OutboundSession>, TransportError> {
        let key = SessionKey {
            host: host.to_ascii_lowercase(),
            proxy: proxy.map(str::to_string),
        };

        let mut state = self.state.lock().await;
        state.clock += 1;
        let now = state.clock;

        if let Some(entry) = state.sessions.get_mut(&key) {
            entry.last_used = now;
            return Ok(entry.session.clone());
        }

        let session = self.factory.create(&key.host, proxy)?;
        if self.capacity > 0 && state.sessions.len() >= self.capacity {
            evict_least_recent(&mut state.sessions);
        }
        state.sessions.insert(
            key,
            PooledSession {
                session: session.clone(),
                last_used: now,
            },
        );
        Ok(session)
    }

    /// Drops every pooled session; returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.sessions.len();
        state.sessions.clear();
        if dropped > 0 {
            log::info!("dropped {dropped} pooled session(s)");
        }
        dropped
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn evict_least_recent(sessions: &mut HashMap<SessionKey, PooledSession>) {
    let oldest = sessions
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        log::debug!("evicting pooled session for {}", key.host);
        sessions.remove(&key);
    }
}
