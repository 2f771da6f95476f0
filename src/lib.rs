//! # clearance-mirror
//!
//! Credential cache and mirroring proxy for origins protected by a
//! Cloudflare-style interstitial.
//!
//! Clearance cookies are obtained once from an external challenge solver,
//! cached per origin with an expiry, and injected into every request mirrored
//! to that origin. When the origin rejects a request with 403 the cached
//! clearance is dropped and the request retried with a fresh one.
//!
//! ## Features
//!
//! - Mirrors any method and path to the host named in `x-hostname`
//! - Persistent, TTL-bounded clearance cache keyed by origin and proxy
//! - Pooled outbound sessions with a Firefox header profile
//! - HTTP, HTTPS and SOCKS proxies
//! - Legacy `/cookies` and `/html` endpoints
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use clearance_mirror::{
//!     CredentialCache, MirrorConfig, MirrorEngine, MirrorRequest, RemoteSolver,
//!     RemoteSolverConfig, SessionPool,
//! };
//! use http::Method;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let solver = RemoteSolver::new(RemoteSolverConfig::new(Url::parse("http://127.0.0.1:8000/")?))?;
//!     let engine = MirrorEngine::new(
//!         MirrorConfig::default(),
//!         Arc::new(solver),
//!         CredentialCache::open("cf_cookie_cache.json")?,
//!         Arc::new(SessionPool::with_defaults()),
//!     );
//!
//!     let result = engine
//!         .mirror(MirrorRequest::new(Method::GET, "example.com", "/"))
//!         .await?;
//!     println!("{} ({} bytes)", result.status, result.body.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod events;
pub mod mirror;
pub mod router;
pub mod session;
pub mod solver;

pub use crate::cache::{
    CacheIoError,
    CacheKey,
    CacheOpenError,
    CacheStats,
    ClearanceRecord,
    CredentialCache,
    DEFAULT_TTL,
};

pub use crate::events::{
    EventDispatcher,
    EventHandler,
    InvalidationReason,
    LoggingHandler,
    MirrorEvent,
};

pub use crate::mirror::{
    ConfigError,
    ContentFetch,
    MirrorConfig,
    MirrorConfigBuilder,
    MirrorEngine,
    MirrorError,
    MirrorRequest,
    MirrorResult,
    cache_key_for,
};

pub use crate::router::{AppState, ApiError, Route, build_router, classify, serve};

pub use crate::session::{
    OriginResponse,
    OutboundRequest,
    OutboundSession,
    ReqwestSessionFactory,
    SessionConfig,
    SessionFactory,
    SessionPool,
    TransportError,
};

pub use crate::solver::{
    ChallengeSolver,
    Clearance,
    RemoteSolver,
    RemoteSolverConfig,
    SerializedSolver,
    SolveError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the mirror protocol announced in `x-cf-bypasser-version`.
pub const PROTOCOL_VERSION: &str = "2.0.0";
