//! Challenge solver integrations.
//!
//! The engine that actually defeats the interstitial (a real browser driven by
//! automation) lives outside this crate. It is reached through the
//! [`ChallengeSolver`] trait so the mirror stays agnostic of how the cookies
//! were obtained.

mod remote;

pub use remote::{RemoteSolver, RemoteSolverConfig};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

/// Cookies and user-agent proving a pass through the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clearance {
    pub cookies: BTreeMap<String, String>,
    pub user_agent: String,
}

impl Clearance {
    pub fn new(cookies: BTreeMap<String, String>, user_agent: impl Into<String>) -> Self {
        Self {
            cookies,
            user_agent: user_agent.into(),
        }
    }

    /// Names of the cookies Cloudflare itself issued (`cf_*`, `__cf*`).
    pub fn cloudflare_cookie_names(&self) -> Vec<&str> {
        self.cookies
            .keys()
            .map(String::as_str)
            .filter(|name| name.starts_with("cf_") || name.starts_with("__cf"))
            .collect()
    }
}

/// Errors surfaced by challenge solvers.
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    #[error("solver timed out after {0:?}")]
    Timeout(Duration),
    #[error("solver rejected the challenge: {0}")]
    Rejected(String),
    #[error("solver transport failed: {0}")]
    Transport(String),
    #[error("solver returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("solver returned no cookies")]
    Empty,
}

/// Shared interface implemented by challenge-solving backends.
///
/// Calls may take seconds and may fail transiently. Implementations are free
/// to queue concurrent callers internally.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, origin: &Url, proxy: Option<&str>) -> Result<Clearance, SolveError>;
}

/// Runs at most one solve at a time against the wrapped solver.
///
/// Use it in front of a backend that drives a single shared browser.
pub struct SerializedSolver<S> {
    inner: S,
    gate: Mutex<()>,
}

impl<S: ChallengeSolver> SerializedSolver<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ChallengeSolver> ChallengeSolver for SerializedSolver<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn solve(&self, origin: &Url, proxy: Option<&str>) -> Result<Clearance, SolveError> {
        let _turn = self.gate.lock().await;
        self.inner.solve(origin, proxy).await
    }
}

#[async_trait]
impl<S: ChallengeSolver + ?Sized> ChallengeSolver for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn solve(&self, origin: &Url, proxy: Option<&str>) -> Result<Clearance, SolveError> {
        (**self).solve(origin, proxy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OverlapTracker {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChallengeSolver for OverlapTracker {
        fn name(&self) -> &'static str {
            "overlap"
        }

        async fn solve(&self, _origin: &Url, _proxy: Option<&str>) -> Result<Clearance, SolveError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Clearance::new(
                BTreeMap::from([("cf_clearance".to_string(), "x".to_string())]),
                "UA",
            ))
        }
    }

    #[tokio::test]
    async fn serialized_solver_never_overlaps() {
        let solver = Arc::new(SerializedSolver::new(OverlapTracker {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }));
        let origin = Url::parse("https://example.com/").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let solver = solver.clone();
            let origin = origin.clone();
            handles.push(tokio::spawn(async move { solver.solve(&origin, None).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let solver = Arc::try_unwrap(solver).ok().unwrap().into_inner();
        assert_eq!(solver.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lists_cloudflare_cookies() {
        let clearance = Clearance::new(
            BTreeMap::from([
                ("__cf_bm".to_string(), "1".to_string()),
                ("cf_clearance".to_string(), "2".to_string()),
                ("session".to_string(), "3".to_string()),
            ]),
            "UA",
        );
        assert_eq!(clearance.cloudflare_cookie_names(), vec!["__cf_bm", "cf_clearance"]);
    }
}
