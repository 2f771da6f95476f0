//! Mirror engine.
//!
//! Forwards arbitrary requests to an origin sitting behind a Cloudflare-style
//! interstitial. Clearance cookies come from the credential cache, or from the
//! challenge solver on a miss, and are injected into every outbound request.
//! An origin 403 is taken as a sign the clearance went stale: the record is
//! dropped and the request retried with a fresh one.

pub mod cookies;
pub mod headers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode, header::LOCATION};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::cache::{CacheKey, CredentialCache, DEFAULT_TTL};
use crate::events::{
	AttemptEvent, CompletedEvent, EventDispatcher, EventHandler, InvalidationReason, MirrorEvent,
	RetryEvent,
};
use crate::session::{OriginResponse, OutboundRequest, SessionPool, TransportError};
use crate::solver::{ChallengeSolver, Clearance, SolveError};

/// Invalid caller input. Always the caller's fault.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
	#[error("x-hostname header is required for request mirroring")]
	MissingHostname,
	#[error("invalid origin {0:?}")]
	InvalidOrigin(String),
	#[error("Invalid or unsafe URL - localhost and private IPs are not allowed")]
	UnsafeUrl,
	#[error("Proxy must start with http://, https://, socks4://, or socks5://")]
	InvalidProxy,
	#[error("invalid {0} parameter")]
	InvalidParameter(&'static str),
	#[error("missing {0} parameter")]
	MissingParameter(&'static str),
}

/// Failure of a mirror or legacy fetch call.
#[derive(Debug, Error)]
pub enum MirrorError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("failed to obtain clearance: {0}")]
	UpstreamAuth(#[source] SolveError),
	#[error("origin unreachable after {attempts} attempt(s): {source}")]
	Transport {
		attempts: u32,
		#[source]
		source: TransportError,
	},
	#[error("origin redirected more than {0} times")]
	TooManyRedirects(usize),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
	/// Extra attempts after the first one, on 403 or transport failure.
	pub max_retries: u32,
	pub retry_backoff: Duration,
	pub credential_ttl: Duration,
	pub solver_timeout: Duration,
	/// Solve attempts spent per cache miss on the mirror path.
	pub solve_attempts: u32,
	/// Merge concurrent misses on one key into a single solve.
	pub single_flight: bool,
	pub max_redirects: usize,
}

impl Default for MirrorConfig {
	fn default() -> Self {
		Self {
			max_retries: 2,
			retry_backoff: Duration::from_millis(500),
			credential_ttl: DEFAULT_TTL,
			solver_timeout: Duration::from_secs(60),
			solve_attempts: 1,
			single_flight: false,
			max_redirects: 10,
		}
	}
}

impl MirrorConfig {
	pub fn builder() -> MirrorConfigBuilder {
		MirrorConfigBuilder::new()
	}
}

/// Fluent builder for [`MirrorConfig`].
#[derive(Debug, Clone, Default)]
pub struct MirrorConfigBuilder {
	config: MirrorConfig,
}

impl MirrorConfigBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.config.max_retries = retries;
		self
	}

	pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
		self.config.retry_backoff = backoff;
		self
	}

	pub fn with_credential_ttl(mut self, ttl: Duration) -> Self {
		self.config.credential_ttl = ttl;
		self
	}

	pub fn with_solver_timeout(mut self, timeout: Duration) -> Self {
		self.config.solver_timeout = timeout;
		self
	}

	pub fn with_solve_attempts(mut self, attempts: u32) -> Self {
		self.config.solve_attempts = attempts.max(1);
		self
	}

	pub fn enable_single_flight(mut self) -> Self {
		self.config.single_flight = true;
		self
	}

	pub fn with_max_redirects(mut self, redirects: usize) -> Self {
		self.config.max_redirects = redirects;
		self
	}

	pub fn build(self) -> MirrorConfig {
		self.config
	}
}

/// A request to forward to the origin.
#[derive(Debug, Clone)]
pub struct MirrorRequest {
	pub method: Method,
	pub origin: String,
	pub path: String,
	pub query: Option<String>,
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
	pub proxy: Option<String>,
	pub bypass_cache: bool,
}

impl MirrorRequest {
	pub fn new(method: Method, origin: impl Into<String>, path: impl Into<String>) -> Self {
		Self {
			method,
			origin: origin.into(),
			path: path.into(),
			query: None,
			headers: HeaderMap::new(),
			body: None,
			proxy: None,
			bypass_cache: false,
		}
	}

	pub fn with_query(mut self, query: impl Into<String>) -> Self {
		let query = query.into();
		self.query = (!query.is_empty()).then_some(query);
		self
	}

	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		self.headers = headers;
		self
	}

	pub fn with_body(mut self, body: Bytes) -> Self {
		self.body = (!body.is_empty()).then_some(body);
		self
	}

	pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
		let proxy = proxy.into();
		self.proxy = (!proxy.trim().is_empty()).then_some(proxy);
		self
	}

	pub fn bypass_cache(mut self, bypass: bool) -> Self {
		self.bypass_cache = bypass;
		self
	}
}

/// Origin response after header normalisation.
#[derive(Debug, Clone)]
pub struct MirrorResult {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	/// Outbound attempts spent, including the successful one.
	pub attempts: u32,
}

/// Page fetched through the legacy content endpoint.
#[derive(Debug, Clone)]
pub struct ContentFetch {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub final_url: Url,
	pub cookie_count: usize,
	pub user_agent: String,
}

/// Resolved origin of a call.
#[derive(Debug, Clone)]
struct Target {
	/// `scheme://host[:port]/`
	root: Url,
	/// URL as given by the caller, normalised.
	requested: Url,
	/// `host[:port]`, the port only when not the scheme default.
	authority: String,
}

impl Target {
	fn resolve(raw: &str) -> Result<Self, ConfigError> {
		let raw = raw.trim();
		if raw.is_empty() {
			return Err(ConfigError::MissingHostname);
		}

		let candidate = if raw.contains("://") {
			raw.to_string()
		} else {
			format!("https://{raw}")
		};
		let requested =
			Url::parse(&candidate).map_err(|_| ConfigError::InvalidOrigin(raw.to_string()))?;
		if !requested.has_host() {
			return Err(ConfigError::InvalidOrigin(raw.to_string()));
		}
		let authority = authority_of(&requested);

		let mut root = requested.clone();
		root.set_path("/");
		root.set_query(None);
		root.set_fragment(None);

		Ok(Self {
			root,
			requested,
			authority,
		})
	}

	fn key(&self, proxy: Option<&str>) -> CacheKey {
		CacheKey::new(&self.authority, proxy)
	}

	/// Root with the path set verbatim, so `//host/x` stays a path.
	fn url_for(&self, path: &str, query: Option<&str>) -> Url {
		let mut url = self.root.clone();
		url.set_path(path);
		url.set_query(query.filter(|q| !q.is_empty()));
		url
	}
}

/// Cache key for an origin and proxy, as every component computes it.
pub fn cache_key_for(origin: &str, proxy: Option<&str>) -> Result<CacheKey, ConfigError> {
	Ok(Target::resolve(origin)?.key(proxy))
}

type Gate = Arc<Mutex<()>>;

/// Credential-injecting request forwarder.
pub struct MirrorEngine {
	config: MirrorConfig,
	cache: CredentialCache,
	sessions: Arc<SessionPool>,
	solver: Arc<dyn ChallengeSolver>,
	events: EventDispatcher,
	gates: StdMutex<HashMap<CacheKey, Weak<Mutex<()>>>>,
}

impl MirrorEngine {
	pub fn new(
		config: MirrorConfig,
		solver: Arc<dyn ChallengeSolver>,
		cache: CredentialCache,
		sessions: Arc<SessionPool>,
	) -> Self {
		Self {
			config,
			cache,
			sessions,
			solver,
			events: EventDispatcher::with_logging(),
			gates: StdMutex::new(HashMap::new()),
		}
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.events.register_handler(handler);
		self
	}

	pub fn cache(&self) -> &CredentialCache {
		&self.cache
	}

	pub fn sessions(&self) -> &SessionPool {
		&self.sessions
	}

	pub fn config(&self) -> &MirrorConfig {
		&self.config
	}

	/// Forwards `request` to its origin with clearance credentials injected.
	pub async fn mirror(&self, request: MirrorRequest) -> Result<MirrorResult, MirrorError> {
		let started = Instant::now();
		let target = Target::resolve(&request.origin)?;
		let proxy = request.proxy.as_deref();
		let key = target.key(proxy);
		let url = target.url_for(&request.path, request.query.as_deref());

		if request.bypass_cache {
			self.invalidate(&key, InvalidationReason::Bypass);
		}

		let max_attempts = self.config.max_retries.saturating_add(1);
		let mut attempt = 0u32;

		loop {
			attempt += 1;
			self.events.dispatch(MirrorEvent::Attempt(AttemptEvent {
				key: key.clone(),
				method: request.method.clone(),
				path: request.path.clone(),
				attempt,
				max_attempts,
				timestamp: Utc::now(),
			}));

			let clearance = self
				.clearance_for(&key, &target.root, proxy, self.config.solve_attempts)
				.await
				.map_err(MirrorError::UpstreamAuth)?;
			let outbound_headers = headers::build_outbound_headers(&request.headers, &clearance)
				.map_err(|err| {
					MirrorError::UpstreamAuth(SolveError::InvalidResponse(err.to_string()))
				})?;

			let outcome = self
				.send(
					&target.authority,
					proxy,
					OutboundRequest {
						method: request.method.clone(),
						url: url.clone(),
						headers: outbound_headers,
						body: request.body.clone(),
					},
				)
				.await;

			match outcome {
				Ok(response) if response.status == StatusCode::FORBIDDEN && attempt < max_attempts => {
					self.invalidate(&key, InvalidationReason::Forbidden);
					self.back_off(&key, attempt, "origin answered 403".into()).await;
				}
				Ok(response) => {
					let OriginResponse {
						status,
						headers: mut response_headers,
						body,
						..
					} = response;
					headers::normalize_response_headers(&mut response_headers, body.len());

					self.events.dispatch(MirrorEvent::Completed(CompletedEvent {
						key: key.clone(),
						status: status.as_u16(),
						attempts: attempt,
						latency: started.elapsed(),
						timestamp: Utc::now(),
					}));

					return Ok(MirrorResult {
						status,
						headers: response_headers,
						body,
						attempts: attempt,
					});
				}
				Err(err @ TransportError::Build(_)) => {
					return Err(MirrorError::Transport {
						attempts: attempt,
						source: err,
					});
				}
				Err(err) if attempt < max_attempts => {
					self.back_off(&key, attempt, err.to_string()).await;
				}
				Err(err) => {
					log::error!("mirroring {key} failed after {attempt} attempt(s): {err}");
					return Err(MirrorError::Transport {
						attempts: attempt,
						source: err,
					});
				}
			}
		}
	}

	/// Legacy credential fetch: returns the clearance for `url`'s origin.
	pub async fn credentials(
		&self,
		url: &str,
		proxy: Option<&str>,
		bypass_cache: bool,
		solve_attempts: u32,
	) -> Result<Clearance, MirrorError> {
		let target = Target::resolve(url)?;
		let key = target.key(proxy);
		if bypass_cache {
			self.invalidate(&key, InvalidationReason::Bypass);
		}

		self.clearance_for(&key, &target.requested, proxy, solve_attempts)
			.await
			.map_err(MirrorError::UpstreamAuth)
	}

	/// Legacy content fetch: GETs `url` with clearance, following redirects.
	pub async fn fetch_content(
		&self,
		url: &str,
		proxy: Option<&str>,
		force_fresh: bool,
		solve_attempts: u32,
	) -> Result<ContentFetch, MirrorError> {
		let target = Target::resolve(url)?;
		let key = target.key(proxy);
		if force_fresh {
			self.invalidate(&key, InvalidationReason::Bypass);
		}

		let clearance = self
			.clearance_for(&key, &target.requested, proxy, solve_attempts)
			.await
			.map_err(MirrorError::UpstreamAuth)?;
		let origin_headers = headers::build_outbound_headers(&HeaderMap::new(), &clearance)
			.map_err(|err| MirrorError::UpstreamAuth(SolveError::InvalidResponse(err.to_string())))?;

		let mut current = target.requested.clone();
		let mut hops = 0usize;

		loop {
			let mut outbound_headers = origin_headers.clone();
			let authority = authority_of(&current);
			if authority != target.authority {
				outbound_headers.remove(http::header::COOKIE);
			}

			let response = self
				.send(
					&authority,
					proxy,
					OutboundRequest {
						method: Method::GET,
						url: current.clone(),
						headers: outbound_headers,
						body: None,
					},
				)
				.await
				.map_err(|source| MirrorError::Transport {
					attempts: 1,
					source,
				})?;

			if response.status.is_redirection() && response.headers.contains_key(LOCATION) {
				if hops >= self.config.max_redirects {
					return Err(MirrorError::TooManyRedirects(self.config.max_redirects));
				}
				hops += 1;
				current = resolve_redirect(&response, &current);
				log::debug!("following redirect to {current}");
				continue;
			}

			if response.status == StatusCode::FORBIDDEN {
				self.invalidate(&key, InvalidationReason::Forbidden);
			}

			let OriginResponse {
				status,
				headers: mut response_headers,
				body,
				..
			} = response;
			headers::normalize_response_headers(&mut response_headers, body.len());

			return Ok(ContentFetch {
				status,
				headers: response_headers,
				body,
				final_url: current,
				cookie_count: clearance.cookies.len(),
				user_agent: clearance.user_agent,
			});
		}
	}

	async fn send(
		&self,
		authority: &str,
		proxy: Option<&str>,
		request: OutboundRequest,
	) -> Result<OriginResponse, TransportError> {
		let session = self.sessions.get_or_create(authority, proxy).await?;
		log::debug!("-> {} {}", request.method, request.url);
		let response = session.send(request).await?;
		log::debug!("<- {} from {authority}", response.status);
		Ok(response)
	}

	fn invalidate(&self, key: &CacheKey, reason: InvalidationReason) {
		self.cache.invalidate(key);
		self.events.dispatch(MirrorEvent::Invalidated {
			key: key.clone(),
			reason,
		});
	}

	async fn back_off(&self, key: &CacheKey, attempt: u32, reason: String) {
		self.events.dispatch(MirrorEvent::Retry(RetryEvent {
			key: key.clone(),
			attempt,
			reason,
			scheduled_after: self.config.retry_backoff,
			timestamp: Utc::now(),
		}));
		if !self.config.retry_backoff.is_zero() {
			sleep(self.config.retry_backoff).await;
		}
	}

	/// Cached clearance for `key`, solving on a miss.
	async fn clearance_for(
		&self,
		key: &CacheKey,
		solve_url: &Url,
		proxy: Option<&str>,
		solve_attempts: u32,
	) -> Result<Clearance, SolveError> {
		if let Some(clearance) = self.cached(key) {
			return Ok(clearance);
		}

		if !self.config.single_flight {
			return self.solve_and_store(key, solve_url, proxy, solve_attempts).await;
		}

		let gate = self.gate_for(key);
		let _turn = gate.lock().await;
		// another caller may have solved while we waited
		if let Some(clearance) = self.cached(key) {
			return Ok(clearance);
		}
		self.solve_and_store(key, solve_url, proxy, solve_attempts).await
	}

	fn cached(&self, key: &CacheKey) -> Option<Clearance> {
		let record = self.cache.get(key)?;
		self.events.dispatch(MirrorEvent::CacheHit { key: key.clone() });
		Some(record.clearance())
	}

	fn gate_for(&self, key: &CacheKey) -> Gate {
		let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		if let Some(gate) = gates.get(key).and_then(Weak::upgrade) {
			return gate;
		}

		gates.retain(|_, gate| gate.strong_count() > 0);
		let gate = Arc::new(Mutex::new(()));
		gates.insert(key.clone(), Arc::downgrade(&gate));
		gate
	}

	async fn solve_and_store(
		&self,
		key: &CacheKey,
		solve_url: &Url,
		proxy: Option<&str>,
		solve_attempts: u32,
	) -> Result<Clearance, SolveError> {
		let attempts = solve_attempts.max(1);
		let mut last_error = SolveError::Empty;

		for attempt in 1..=attempts {
			let started = Instant::now();
			let outcome = match timeout(self.config.solver_timeout, self.solver.solve(solve_url, proxy)).await {
				Ok(Ok(clearance)) if clearance.cookies.is_empty() => Err(SolveError::Empty),
				Ok(Ok(clearance)) => headers::validate_clearance(&clearance)
					.map(|()| clearance)
					.map_err(|err| SolveError::InvalidResponse(format!("clearance unusable as headers: {err}"))),
				Ok(Err(err)) => Err(err),
				Err(_) => Err(SolveError::Timeout(self.config.solver_timeout)),
			};

			match outcome {
				Ok(clearance) => {
					self.cache.set(
						key,
						clearance.cookies.clone(),
						clearance.user_agent.clone(),
						self.config.credential_ttl,
					);
					log::debug!("cloudflare cookies for {key}: {:?}", clearance.cloudflare_cookie_names());
					self.events.dispatch(MirrorEvent::Solved {
						key: key.clone(),
						solver: self.solver.name(),
						cookies: clearance.cookies.len(),
						elapsed: started.elapsed(),
					});
					return Ok(clearance);
				}
				Err(err) => {
					self.events.dispatch(MirrorEvent::SolveFailed {
						key: key.clone(),
						error: err.to_string(),
					});
					last_error = err;
					if attempt < attempts && !self.config.retry_backoff.is_zero() {
						sleep(self.config.retry_backoff).await;
					}
				}
			}
		}

		Err(last_error)
	}
}

fn authority_of(url: &Url) -> String {
	let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
	match url.port() {
		Some(port) => format!("{host}:{port}"),
		None => host,
	}
}

fn resolve_redirect(response: &OriginResponse, current: &Url) -> Url {
	if let Some(location) = response
		.headers
		.get(LOCATION)
		.and_then(|value| value.to_str().ok())
	{
		if let Ok(absolute) = Url::parse(location)
			&& absolute.has_host()
		{
			return absolute;
		}

		if let Ok(joined) = current.join(location) {
			return joined;
		}
	}

	current.clone()
}
